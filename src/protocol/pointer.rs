//! Cross-Protocol Pointers
//!
//! A pointer is a weak reference from a protocol input to another
//! protocol's output. It only records identifiers; the referenced object is
//! looked up when the pointer is resolved, and a lookup failure is reported
//! as a [`PointerError`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::outputs::{SetItem, SetOutput};
use crate::persistence::PersistenceError;

/// Non-owning reference to an output of another protocol.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    /// Protocol that owns the referenced output
    pub protocol_id: String,

    /// Name of the set output
    pub output: String,

    /// Optional item key inside the set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<String>,

    /// Item kind the referencing input expects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expects: Option<String>,
}

impl Pointer {
    pub fn new(protocol_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            output: output.into(),
            extended: None,
            expects: None,
        }
    }

    /// Points at a single item of the set.
    pub fn with_extended(mut self, key: impl Into<String>) -> Self {
        self.extended = Some(key.into());
        self
    }

    pub fn expecting(mut self, item_kind: impl Into<String>) -> Self {
        self.expects = Some(item_kind.into());
        self
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.protocol_id, self.output)?;
        if let Some(ref extended) = self.extended {
            write!(f, "[{}]", extended)?;
        }
        Ok(())
    }
}

/// Target of a successfully resolved pointer.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Set(SetOutput),
    Item { set: SetOutput, item: SetItem },
}

impl Resolved {
    pub fn set(&self) -> &SetOutput {
        match self {
            Self::Set(set) | Self::Item { set, .. } => set,
        }
    }
}

/// Why a pointer could not be resolved.
#[derive(Error, Debug)]
pub enum PointerError {
    #[error("Pointer {pointer}: protocol '{}' no longer exists", pointer.protocol_id)]
    MissingProtocol { pointer: Pointer },

    #[error("Pointer {pointer}: protocol has no output '{}'", pointer.output)]
    MissingOutput { pointer: Pointer },

    #[error("Pointer {pointer}: output has no item '{key}'")]
    MissingItem { pointer: Pointer, key: String },

    #[error("Pointer {pointer}: expected '{expected}' items but output holds '{found}'")]
    TypeMismatch {
        pointer: Pointer,
        expected: String,
        found: String,
    },

    #[error("Pointer {pointer}: {source}")]
    Storage {
        pointer: Pointer,
        #[source]
        source: PersistenceError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_display() {
        let pointer = Pointer::new("import_01", "outputMovies");
        assert_eq!(pointer.to_string(), "import_01.outputMovies");

        let item = pointer.with_extended("movie_0005");
        assert_eq!(item.to_string(), "import_01.outputMovies[movie_0005]");
    }

    #[test]
    fn test_pointer_yaml() {
        let pointer: Pointer = serde_yaml::from_str(
            "protocol_id: import_01\noutput: outputMovies\nexpects: movie\n",
        )
        .unwrap();
        assert_eq!(pointer.expects.as_deref(), Some("movie"));
        assert!(pointer.extended.is_none());
    }
}
