//! Persistence Module
//!
//! Shared SQLite store read and written by the GUI and scheduler processes.

pub mod error;
pub mod mapper;
pub mod retry;

pub use error::PersistenceError;
pub use mapper::Mapper;
pub use retry::{is_contention, RetryPolicy};
