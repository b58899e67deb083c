//! Filesystem helpers: fingerprints and directory listing.

pub mod fingerprint;
pub mod walker;
