//! Replicated read coordination with read-repair.
//!
//! For a shard of a class whose object replicas live on N peer nodes, the
//! [`Finder`] fans a read out to the replica set, uses last-update
//! timestamps to decide which replica holds the freshest version, answers
//! the caller at the requested consistency level (ONE, QUORUM, ALL), and
//! lazily repairs the stale replicas that participated in the read.

pub mod client;
mod digest;
pub mod error;
mod fanout;
pub mod finder;
mod repair;
pub mod resolver;

pub use client::{ClientError, ReplicaClient};
pub use error::{FinderError, RepairError, MSG_CONSISTENCY_LEVEL};
pub use finder::Finder;
pub use resolver::{ResolveError, ShardResolver, StaticResolver};
