//! Built-in protocol kinds.
//!
//! - `static`: the step graph is fixed by the definition
//! - `stream.files`: one new step per file matching a `{name}` pattern in a
//!   watched directory, until a sentinel file appears or `max_items` steps
//!   exist

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::patterns::{extract_wildcard_names, match_pattern, substitute_wildcard};
use super::registry::{DomainError, ProtocolPlugin};
use crate::execution::{InputUnavailableError, SourceUpdate, StepSource};
use crate::protocol::{PossibleOutputs, Protocol, Step, StepGraph};

/// Fixed step graph; outputs are the sets its steps write to.
pub struct StaticPlugin;

impl StaticPlugin {
    pub const KIND: &'static str = "static";
}

impl ProtocolPlugin for StaticPlugin {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn possible_outputs(&self, protocol: &Protocol) -> Result<PossibleOutputs, DomainError> {
        let names: BTreeSet<String> = protocol
            .graph
            .iter()
            .filter_map(|step| step.output_set.clone())
            .collect();
        Ok(PossibleOutputs::Enumerated(names.into_iter().collect()))
    }

    fn step_source(&self, _protocol: &Protocol) -> Result<Option<Box<dyn StepSource>>, DomainError> {
        Ok(None)
    }
}

fn default_pattern() -> String {
    "{name}".to_string()
}

fn default_step_prefix() -> String {
    "item".to_string()
}

fn default_output_set() -> String {
    "outputItems".to_string()
}

fn default_item_kind() -> String {
    "file".to_string()
}

/// Parameters of a `stream.files` protocol.
///
/// `command` and `outputs` may use `{name}` (the captured wildcard value)
/// and `{file}` (absolute path of the matched file).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileStreamSpec {
    /// Watched directory, relative to the protocol's working directory
    pub input_dir: PathBuf,

    #[serde(default = "default_pattern")]
    pub pattern: String,

    pub command: String,

    #[serde(default)]
    pub outputs: Vec<String>,

    /// Steps every streamed step depends on
    #[serde(default)]
    pub prerequisites: Vec<String>,

    #[serde(default = "default_step_prefix")]
    pub step_prefix: String,

    #[serde(default = "default_output_set")]
    pub output_set: String,

    #[serde(default = "default_item_kind")]
    pub item_kind: String,

    /// File whose presence in `input_dir` ends the stream
    #[serde(default)]
    pub end_marker: Option<String>,

    #[serde(default)]
    pub max_items: Option<usize>,

    /// Command of a final step depending on every streamed step
    #[serde(default)]
    pub summary_command: Option<String>,
}

impl FileStreamSpec {
    pub fn from_protocol(protocol: &Protocol) -> Result<Self, DomainError> {
        let invalid = |reason: String| DomainError::InvalidParams {
            kind: FileStreamPlugin::KIND.to_string(),
            reason,
        };
        let spec: Self = serde_json::from_value(protocol.params.clone()).map_err(|e| invalid(e.to_string()))?;
        if extract_wildcard_names(&spec.pattern).len() != 1 {
            return Err(invalid(format!(
                "pattern '{}' must contain exactly one wildcard",
                spec.pattern
            )));
        }
        if spec.step_prefix.trim().is_empty() {
            return Err(invalid("step_prefix is empty".to_string()));
        }
        Ok(spec)
    }

    fn wildcard(&self) -> String {
        extract_wildcard_names(&self.pattern)
            .into_iter()
            .next()
            .unwrap_or_else(|| "name".to_string())
    }

    fn step_id(&self, value: &str) -> String {
        format!("{}_{}", self.step_prefix, value)
    }

    fn summary_id(&self) -> String {
        format!("{}_summary", self.step_prefix)
    }
}

/// New step per matched file in a watched directory.
pub struct FileStreamPlugin;

impl FileStreamPlugin {
    pub const KIND: &'static str = "stream.files";
}

impl ProtocolPlugin for FileStreamPlugin {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn possible_outputs(&self, protocol: &Protocol) -> Result<PossibleOutputs, DomainError> {
        let spec = FileStreamSpec::from_protocol(protocol)?;
        let mut declared = BTreeMap::new();
        declared.insert(spec.output_set, spec.item_kind);
        Ok(PossibleOutputs::Mapping(declared))
    }

    fn step_source(&self, protocol: &Protocol) -> Result<Option<Box<dyn StepSource>>, DomainError> {
        let spec = FileStreamSpec::from_protocol(protocol)?;
        Ok(Some(Box::new(FileStreamSource::new(protocol, spec))))
    }
}

/// Scans the watched directory on every check.
pub struct FileStreamSource {
    protocol_id: String,
    input_dir: PathBuf,
    spec: FileStreamSpec,
    wildcard: String,
    /// Wildcard values that already have a step
    known: BTreeSet<String>,
}

impl FileStreamSource {
    pub fn new(protocol: &Protocol, spec: FileStreamSpec) -> Self {
        let input_dir = if spec.input_dir.is_absolute() {
            spec.input_dir.clone()
        } else {
            protocol.working_dir.join(&spec.input_dir)
        };
        Self {
            protocol_id: protocol.id.clone(),
            input_dir,
            wildcard: spec.wildcard(),
            spec,
            known: BTreeSet::new(),
        }
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    fn unavailable(&self, reason: impl Into<String>) -> InputUnavailableError {
        InputUnavailableError::new(&self.protocol_id, reason)
    }

    fn limit_reached(&self) -> bool {
        self.spec
            .max_items
            .map(|max| self.known.len() >= max)
            .unwrap_or(false)
    }

    fn build_step(&self, value: &str, file: &Path) -> Step {
        let file = file.display().to_string();
        let expand = |text: &str| substitute_wildcard(text, &self.wildcard, value).replace("{file}", &file);

        let mut step = Step::new(self.spec.step_id(value), expand(&self.spec.command))
            .with_outputs(self.spec.outputs.iter().map(|o| expand(o)).collect())
            .with_output_set(self.spec.output_set.clone());
        step.prerequisites = self.spec.prerequisites.clone();
        step
    }

    fn summary_step(&self, graph: &StepGraph, batch: &[Step]) -> Option<Step> {
        let command = self.spec.summary_command.as_ref()?;
        let id = self.spec.summary_id();
        if graph.contains(&id) {
            return None;
        }
        let prerequisites: Vec<String> = self
            .known
            .iter()
            .map(|value| self.spec.step_id(value))
            .filter(|step_id| graph.contains(step_id) || batch.iter().any(|s| &s.id == step_id))
            .collect();
        Some(Step::new(id, command.clone()).with_prerequisites(prerequisites))
    }
}

impl StepSource for FileStreamSource {
    fn check(&mut self, graph: &StepGraph) -> Result<SourceUpdate, InputUnavailableError> {
        if !self.input_dir.is_dir() {
            return Err(self.unavailable(format!(
                "directory '{}' not found",
                self.input_dir.display()
            )));
        }

        // Checked before listing so that every file written ahead of the
        // marker is seen by this scan
        let ended = self
            .spec
            .end_marker
            .as_ref()
            .map(|marker| self.input_dir.join(marker).exists())
            .unwrap_or(false);

        let entries = fs::read_dir(&self.input_dir)
            .map_err(|e| self.unavailable(format!("cannot list '{}': {}", self.input_dir.display(), e)))?;
        let mut files: Vec<(String, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                Some((name, entry.path()))
            })
            .collect();
        files.sort();

        let prefix = format!("{}_", self.spec.step_prefix);
        let summary_id = self.spec.summary_id();
        for step in graph.iter().filter(|step| step.id != summary_id) {
            if let Some(value) = step.id.strip_prefix(&prefix) {
                self.known.insert(value.to_string());
            }
        }

        let mut steps = Vec::new();
        for (name, path) in files {
            if self.spec.end_marker.as_deref() == Some(name.as_str()) {
                continue;
            }
            let Some(value) = match_pattern(&self.spec.pattern, &name) else {
                continue;
            };
            if self.known.contains(&value) {
                continue;
            }
            if self.limit_reached() {
                break;
            }
            debug!("Protocol '{}': new input '{}'", self.protocol_id, name);
            steps.push(self.build_step(&value, &path));
            self.known.insert(value);
        }

        let exhausted = ended || self.limit_reached();
        if exhausted {
            info!(
                "Protocol '{}': end of input after {} item(s)",
                self.protocol_id,
                self.known.len()
            );
            if let Some(summary) = self.summary_step(graph, &steps) {
                steps.push(summary);
            }
        }

        Ok(SourceUpdate { steps, exhausted })
    }
}
