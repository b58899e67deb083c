//! Moving file bytes from master to slave.

pub mod client;
pub mod progress;
pub mod progress_stream;

pub use client::{ByteStream, HttpMasterClient, MasterClient};
