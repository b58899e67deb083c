//! Replica Agent Library
//!
//! Master/slave replication of search index segment files: fingerprinted
//! session manifests, diffing, staged downloads and atomic commit.

pub mod api;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod replication;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{ErrorClass, ReplicationError};
pub type Result<T> = std::result::Result<T, ReplicationError>;
