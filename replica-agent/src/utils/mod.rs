//! Utility modules for the replica agent.

pub mod errors;
pub mod logger;

pub use errors::{ErrorClass, ReplicationError, Result};
