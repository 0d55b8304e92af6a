//! Protocol Domain
//!
//! Registry of protocol kinds and the built-in plugins.
//!
//! - [`registry`]: kind lookup with tolerant plugin loading
//! - [`plugins`]: `static` and `stream.files` kinds
//! - [`patterns`]: single-wildcard file name matching

pub mod patterns;
pub mod plugins;
pub mod registry;

pub use plugins::{FileStreamPlugin, FileStreamSource, FileStreamSpec, StaticPlugin};
pub use registry::{Domain, DomainError, PluginLoad, ProtocolPlugin};
