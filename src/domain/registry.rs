//! Protocol kind registry.
//!
//! Every protocol names a kind; the registry maps kinds to plugins that
//! declare the protocol's possible outputs and, for streaming kinds, supply
//! the [`StepSource`] feeding new steps. Plugin loaders that fail or panic
//! leave a disabled marker behind instead of taking the process down.

use std::collections::BTreeMap;
use std::panic::{self, UnwindSafe};
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use super::plugins::{FileStreamPlugin, StaticPlugin};
use crate::execution::StepSource;
use crate::protocol::{PossibleOutputs, Protocol};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Unknown protocol kind '{0}'")]
    UnknownKind(String),

    #[error("Protocol kind '{kind}' is disabled: {reason}")]
    Disabled { kind: String, reason: String },

    #[error("Invalid parameters for protocol kind '{kind}': {reason}")]
    InvalidParams { kind: String, reason: String },
}

/// Behavior attached to a protocol kind.
pub trait ProtocolPlugin: Send + Sync {
    fn kind(&self) -> &str;

    /// Outputs the protocol can produce, resolved when it is defined.
    fn possible_outputs(&self, protocol: &Protocol) -> Result<PossibleOutputs, DomainError>;

    /// Source of new steps for streaming protocols; `None` for fixed graphs.
    fn step_source(&self, protocol: &Protocol) -> Result<Option<Box<dyn StepSource>>, DomainError>;
}

/// Result of a plugin loader.
pub type PluginLoad = Result<Box<dyn ProtocolPlugin>, String>;

enum Entry {
    Loaded(Arc<dyn ProtocolPlugin>),
    Disabled(String),
}

/// Named set of registered protocol kinds.
pub struct Domain {
    name: String,
    entries: BTreeMap<String, Entry>,
}

impl Domain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Domain with the `static` and `stream.files` kinds registered.
    pub fn with_builtins() -> Self {
        let mut domain = Self::new("builtin");
        domain.register(StaticPlugin::KIND, || Ok(Box::new(StaticPlugin) as Box<dyn ProtocolPlugin>));
        domain.register(FileStreamPlugin::KIND, || {
            Ok(Box::new(FileStreamPlugin) as Box<dyn ProtocolPlugin>)
        });
        domain
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `loader` and registers its plugin under `kind`.
    ///
    /// An error or panic inside the loader registers `kind` as disabled with
    /// the reason and returns `false`.
    pub fn register<F>(&mut self, kind: &str, loader: F) -> bool
    where
        F: FnOnce() -> PluginLoad + UnwindSafe,
    {
        let entry = match panic::catch_unwind(loader) {
            Ok(Ok(plugin)) => {
                if plugin.kind() != kind {
                    debug!("Plugin '{}' registered under kind '{}'", plugin.kind(), kind);
                }
                Entry::Loaded(Arc::from(plugin))
            }
            Ok(Err(reason)) => Entry::Disabled(reason),
            Err(payload) => Entry::Disabled(panic_message(payload.as_ref())),
        };

        let loaded = matches!(entry, Entry::Loaded(_));
        match &entry {
            Entry::Loaded(_) => info!("Domain '{}': registered kind '{}'", self.name, kind),
            Entry::Disabled(reason) => {
                warn!("Domain '{}': kind '{}' disabled: {}", self.name, kind, reason)
            }
        }
        self.entries.insert(kind.to_string(), entry);
        loaded
    }

    pub fn plugin(&self, kind: &str) -> Result<Arc<dyn ProtocolPlugin>, DomainError> {
        match self.entries.get(kind) {
            Some(Entry::Loaded(plugin)) => Ok(Arc::clone(plugin)),
            Some(Entry::Disabled(reason)) => Err(DomainError::Disabled {
                kind: kind.to_string(),
                reason: reason.clone(),
            }),
            None => Err(DomainError::UnknownKind(kind.to_string())),
        }
    }

    /// Registered kinds that can be used.
    pub fn kinds(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Loaded(_)))
            .map(|(kind, _)| kind.as_str())
            .collect()
    }

    /// Disabled kinds with the reason their loader gave.
    pub fn disabled(&self) -> Vec<(&str, &str)> {
        self.entries
            .iter()
            .filter_map(|(kind, entry)| match entry {
                Entry::Disabled(reason) => Some((kind.as_str(), reason.as_str())),
                Entry::Loaded(_) => None,
            })
            .collect()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("loader panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("loader panicked: {}", message)
    } else {
        "loader panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let domain = Domain::with_builtins();
        assert_eq!(domain.kinds(), vec!["static", "stream.files"]);
        assert!(domain.disabled().is_empty());
        assert_eq!(domain.plugin("static").unwrap().kind(), "static");
    }

    #[test]
    fn test_unknown_kind() {
        let domain = Domain::with_builtins();
        assert_eq!(
            domain.plugin("motioncorr").err(),
            Some(DomainError::UnknownKind("motioncorr".to_string()))
        );
    }

    #[test]
    fn test_failing_loader_is_disabled() {
        let mut domain = Domain::new("test");
        assert!(!domain.register("gpu.only", || Err("no CUDA runtime found".to_string())));

        assert!(domain.kinds().is_empty());
        assert_eq!(domain.disabled(), vec![("gpu.only", "no CUDA runtime found")]);
        assert!(matches!(
            domain.plugin("gpu.only"),
            Err(DomainError::Disabled { ref reason, .. }) if reason == "no CUDA runtime found"
        ));
    }

    #[test]
    fn test_panicking_loader_is_disabled() {
        let mut domain = Domain::with_builtins();
        assert!(!domain.register("broken", || panic!("missing shared library")));

        let disabled = domain.disabled();
        assert_eq!(disabled.len(), 1);
        assert!(disabled[0].1.contains("missing shared library"));
        // Other kinds stay usable
        assert!(domain.plugin("static").is_ok());
    }
}
