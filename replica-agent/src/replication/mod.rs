//! The replication engine.
//!
//! Bottom-up: a [`Source`] is one logical file group of an index, a
//! [`ReplicationCatalog`] fingerprints its files, a [`ReplicationSession`] is
//! the master's manifest over all sources, [`diff`] turns a previous and a
//! current session into a [`ReplicationPlan`], and a [`ReplicationProcess`]
//! executes that plan against the slave's live directories.

pub mod catalog;
pub mod diff;
pub mod layout;
pub mod master;
pub mod process;
pub mod replicator;
pub mod session;
pub mod source;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::ReplicationCatalog;
pub use diff::{diff, ReplicationPlan, SourcePlan, Strategy};
pub use layout::IndexLayout;
pub use master::{MasterRegistry, ReplicationMaster};
pub use process::{ProcessOptions, ProcessState, ReplicationProcess};
pub use replicator::{IndexReplicator, ReplicaNode, ReplicationEvent, ReplicationStatus};
pub use session::ReplicationSession;
pub use source::Source;
pub use store::SessionStore;
