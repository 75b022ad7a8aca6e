//! # HSU Common
//!
//! Common types shared across the HSU name server crates: the error
//! taxonomy used by the request loop and the registry key type.

pub mod errors;
pub mod types;

// Re-export commonly used items
pub use errors::{Error, Result, ResultExt};
pub use types::ServiceName;
