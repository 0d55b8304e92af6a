//! Protocol Definition Parser
//!
//! Loads protocol definitions from YAML files. A definition lists the
//! protocol's initial steps; they are ordered so that prerequisites come
//! first and then appended to the step graph, which rejects unknown
//! prerequisites and cycles.
//!
//! # Example
//!
//! ```yaml
//! id: ctf_estimation
//! kind: static
//! possible_outputs:
//!   outputCTF: ctf
//! steps:
//!   - id: estimate
//!     command: ctffind4 micrographs/*.mrc
//!     outputs: ctf/results.star
//!     output_set: outputCTF
//!   - id: report
//!     command: summarize ctf/results.star
//!     prerequisites: estimate
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::graph::GraphError;
use super::model::{Protocol, RunMode, Step};
use super::outputs::PossibleOutputs;
use super::pointer::Pointer;

/// Errors raised while reading a protocol definition.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("Failed to read definition file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse definition YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Protocol has empty or whitespace-only ID")]
    EmptyProtocolId,

    #[error(transparent)]
    Graph(#[from] GraphError),
}

fn default_kind() -> String {
    "static".to_string()
}

/// A protocol as written by protocol-authoring code.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProtocolDefinition {
    pub id: String,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub comment: String,

    #[serde(default = "default_kind")]
    pub kind: String,

    #[serde(default)]
    pub streaming: bool,

    #[serde(default)]
    pub run_mode: RunMode,

    /// Defaults to a directory named after the protocol
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub params: Value,

    #[serde(default)]
    pub inputs: BTreeMap<String, Pointer>,

    /// Overrides the outputs declared by the kind's plugin
    #[serde(default)]
    pub possible_outputs: Option<PossibleOutputs>,

    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Loads a protocol definition from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use protoflow::protocol::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_definition("ctf.yaml")?;
///     println!("Loaded {} steps", definition.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: impl AsRef<Path>) -> Result<ProtocolDefinition, DefinitionError> {
    let path = path.as_ref();
    info!("Loading protocol definition from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|source| DefinitionError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    parse_definition(&yaml_content)
}

pub fn parse_definition(yaml: &str) -> Result<ProtocolDefinition, DefinitionError> {
    let definition: ProtocolDefinition = serde_yaml::from_str(yaml)?;
    if definition.id.trim().is_empty() {
        return Err(DefinitionError::EmptyProtocolId);
    }
    info!(
        "Parsed protocol '{}' ({}): {} steps",
        definition.id,
        definition.kind,
        definition.steps.len()
    );
    Ok(definition)
}

impl ProtocolDefinition {
    /// Builds the protocol and its step graph.
    ///
    /// `runs_dir` is the parent of the default working directory.
    pub fn into_protocol(self, runs_dir: &Path) -> Result<Protocol, DefinitionError> {
        let id = self.id.trim().to_string();
        let working_dir = self.working_dir.unwrap_or_else(|| runs_dir.join(&id));

        let mut protocol = Protocol::new(&id, self.kind, working_dir).with_params(self.params);
        if self.streaming {
            protocol = protocol.streaming();
        }
        if let Some(label) = self.label {
            protocol.label = label;
        }
        protocol.comment = self.comment;
        protocol.run_mode = self.run_mode;
        protocol.inputs = self.inputs;
        if let Some(outputs) = self.possible_outputs {
            protocol.possible_outputs = outputs;
        }

        for step in prerequisite_order(self.steps)? {
            protocol.graph.push(step)?;
        }
        Ok(protocol)
    }
}

/// Orders steps so that every prerequisite precedes its dependents.
///
/// Uses Kahn's algorithm; ties keep the order of the definition file.
fn prerequisite_order(steps: Vec<Step>) -> Result<Vec<Step>, GraphError> {
    let mut ids: HashSet<String> = HashSet::new();
    for step in &steps {
        if step.id.trim().is_empty() {
            return Err(GraphError::EmptyStepId);
        }
        if !ids.insert(step.id.clone()) {
            return Err(GraphError::DuplicateStep(step.id.clone()));
        }
    }
    for step in &steps {
        for prerequisite in &step.prerequisites {
            let prerequisite = prerequisite.trim();
            if !prerequisite.is_empty() && !ids.contains(prerequisite) {
                return Err(GraphError::UnknownPrerequisite {
                    step: step.id.clone(),
                    prerequisite: prerequisite.to_string(),
                });
            }
        }
    }

    let mut in_degree: HashMap<String, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for step in &steps {
        let unique: HashSet<&str> = step
            .prerequisites
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        in_degree.insert(step.id.clone(), unique.len());
        for prerequisite in unique {
            dependents
                .entry(prerequisite.to_string())
                .or_default()
                .push(step.id.clone());
        }
    }

    let mut queue: VecDeque<String> = steps
        .iter()
        .filter(|s| in_degree.get(&s.id) == Some(&0))
        .map(|s| s.id.clone())
        .collect();
    let mut sorted_order: Vec<String> = Vec::new();

    while let Some(current_id) = queue.pop_front() {
        sorted_order.push(current_id.clone());
        for successor_id in dependents.remove(&current_id).unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(&successor_id) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(successor_id);
                }
            }
        }
    }

    let mut step_map: HashMap<String, Step> =
        steps.into_iter().map(|s| (s.id.clone(), s)).collect();

    if sorted_order.len() != step_map.len() {
        let sorted: HashSet<&String> = sorted_order.iter().collect();
        let mut remaining: Vec<&String> = step_map.keys().filter(|id| !sorted.contains(id)).collect();
        remaining.sort();
        let step = remaining.first().map(|s| s.to_string()).unwrap_or_default();
        let prerequisite = step_map
            .get(&step)
            .and_then(|s| s.prerequisites.iter().find(|p| !sorted.contains(p)))
            .cloned()
            .unwrap_or_default();
        return Err(GraphError::Cycle {
            step,
            prerequisite,
            path: remaining.into_iter().cloned().collect(),
        });
    }

    debug!("Prerequisite order: {:?}", sorted_order);
    Ok(sorted_order
        .into_iter()
        .filter_map(|id| step_map.remove(&id))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_build_protocol() {
        let definition = parse_definition(
            r#"
id: ctf
possible_outputs:
  outputCTF: ctf
steps:
  - id: report
    command: summarize
    prerequisites: estimate
  - id: estimate
    command: ctffind4
    output_set: outputCTF
"#,
        )
        .unwrap();
        assert_eq!(definition.kind, "static");

        let protocol = definition.into_protocol(Path::new("/data/Runs")).unwrap();
        let order: Vec<&str> = protocol.graph.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["estimate", "report"]);
        assert_eq!(protocol.working_dir, PathBuf::from("/data/Runs/ctf"));
        assert!(protocol.possible_outputs.contains("outputCTF"));
    }

    #[test]
    fn test_streaming_definition() {
        let definition = parse_definition("id: watch\nkind: stream.files\nstreaming: true\n").unwrap();
        let protocol = definition.into_protocol(Path::new("/tmp")).unwrap();
        assert!(protocol.streaming);
        assert!(protocol.more_input);
        assert!(protocol.is_empty());
    }

    #[test]
    fn test_cycle_rejected() {
        let definition = parse_definition(
            r#"
id: loop
steps:
  - id: a
    command: echo a
    prerequisites: b
  - id: b
    command: echo b
    prerequisites: a
"#,
        )
        .unwrap();
        let result = definition.into_protocol(Path::new("/tmp"));
        assert!(matches!(
            result,
            Err(DefinitionError::Graph(GraphError::Cycle { .. }))
        ));
    }

    #[test]
    fn test_unknown_prerequisite_rejected() {
        let definition =
            parse_definition("id: p\nsteps:\n  - id: a\n    command: echo\n    prerequisites: ghost\n")
                .unwrap();
        let result = definition.into_protocol(Path::new("/tmp"));
        assert!(matches!(
            result,
            Err(DefinitionError::Graph(GraphError::UnknownPrerequisite { .. }))
        ));
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(matches!(
            parse_definition("id: '  '\n"),
            Err(DefinitionError::EmptyProtocolId)
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = load_definition("/nonexistent/definition.yaml");
        assert!(matches!(result, Err(DefinitionError::Read { .. })));
    }
}
