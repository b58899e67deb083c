//! Daemon plumbing: scheduled rounds and graceful shutdown.

pub mod scheduler;
pub mod shutdown;
