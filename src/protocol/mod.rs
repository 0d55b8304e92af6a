//! Protocol Module
//!
//! Protocols, their step graphs, set outputs and cross-protocol pointers.

pub mod graph;
pub mod model;
pub mod outputs;
pub mod parser;
pub mod pointer;

pub use graph::{GraphError, Prerequisites, StatusCounts, StepGraph};
pub use model::{ParseStatusError, Protocol, ProtocolStatus, RunMode, Step, StepStatus};
pub use outputs::{PossibleOutputs, SetItem, SetOutput, StreamState, DEFAULT_ITEM_KIND};
pub use parser::{load_definition, parse_definition, DefinitionError, ProtocolDefinition};
pub use pointer::{Pointer, PointerError, Resolved};
