//! Set Outputs
//!
//! Protocol outputs are sets of items that may keep growing while a
//! streaming protocol runs. Plugins declare the outputs a protocol can
//! produce either as a name-to-kind mapping or as a plain list of names.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::ParseStatusError;

/// Item kind used for enumerated outputs that do not name one.
pub const DEFAULT_ITEM_KIND: &str = "item";

/// Whether a set may still receive items.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Open,
    #[default]
    Closed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamState {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(ParseStatusError::new("stream state", other)),
        }
    }
}

/// Outputs a protocol may produce, resolved when the protocol is defined.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum PossibleOutputs {
    /// Output name to item kind
    Mapping(BTreeMap<String, String>),
    /// Output names only; items get [`DEFAULT_ITEM_KIND`]
    Enumerated(Vec<String>),
}

impl Default for PossibleOutputs {
    fn default() -> Self {
        Self::Enumerated(Vec::new())
    }
}

impl PossibleOutputs {
    /// `(name, item_kind)` pairs, sorted by name.
    pub fn declarations(&self) -> Vec<(String, String)> {
        let mut declared: Vec<(String, String)> = match self {
            Self::Mapping(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Self::Enumerated(names) => names
                .iter()
                .map(|n| (n.clone(), DEFAULT_ITEM_KIND.to_string()))
                .collect(),
        };
        declared.sort();
        declared.dedup_by(|a, b| a.0 == b.0);
        declared
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::Mapping(map) => map.contains_key(name),
            Self::Enumerated(names) => names.iter().any(|n| n == name),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Mapping(map) => map.is_empty(),
            Self::Enumerated(names) => names.is_empty(),
        }
    }

    /// Combines two declarations; entries of `other` win on name clashes.
    pub fn merged(&self, other: &PossibleOutputs) -> PossibleOutputs {
        let mut map: BTreeMap<String, String> = self.declarations().into_iter().collect();
        map.extend(other.declarations());
        PossibleOutputs::Mapping(map)
    }
}

/// A single element of a set output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SetItem {
    pub key: String,
    pub payload: Value,
}

impl SetItem {
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// Persisted header of a set output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SetOutput {
    pub protocol_id: String,
    pub name: String,
    pub item_kind: String,
    pub stream_state: StreamState,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_and_enumerated_forms_from_yaml() {
        let mapping: PossibleOutputs =
            serde_yaml::from_str("outputMicrographs: micrograph\noutputCTF: ctf\n").unwrap();
        assert_eq!(
            mapping.declarations(),
            vec![
                ("outputCTF".to_string(), "ctf".to_string()),
                ("outputMicrographs".to_string(), "micrograph".to_string()),
            ]
        );

        let enumerated: PossibleOutputs = serde_yaml::from_str("[outputVolume]").unwrap();
        assert_eq!(
            enumerated.declarations(),
            vec![("outputVolume".to_string(), DEFAULT_ITEM_KIND.to_string())]
        );
        assert!(enumerated.contains("outputVolume"));
    }

    #[test]
    fn test_merged_prefers_other() {
        let base = PossibleOutputs::Enumerated(vec!["a".to_string(), "b".to_string()]);
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), "file".to_string());
        let merged = base.merged(&PossibleOutputs::Mapping(map));

        assert_eq!(
            merged.declarations(),
            vec![
                ("a".to_string(), DEFAULT_ITEM_KIND.to_string()),
                ("b".to_string(), "file".to_string()),
            ]
        );
    }

    #[test]
    fn test_stream_state_parse() {
        assert_eq!("open".parse::<StreamState>().unwrap(), StreamState::Open);
        assert_eq!("closed".parse::<StreamState>().unwrap(), StreamState::Closed);
        assert!("ajar".parse::<StreamState>().is_err());
    }
}
