//! Error taxonomy of the read coordinator.
//!
//! Every consistency failure wraps two things: a kind callers can match
//! on, and the consistency-level sentence so string-level matching keeps
//! working across the API boundary.

use crate::client::ClientError;
use crate::resolver::ResolveError;
use repstore_common::ConsistencyLevel;

/// First words of every consistency failure, in errors and log lines.
pub const MSG_CONSISTENCY_LEVEL: &str = "cannot achieve consistency level";

#[derive(Debug, thiserror::Error)]
pub enum FinderError {
    /// Pre-flight failure: the resolver produced no peers. No I/O was
    /// attempted.
    #[error("cannot achieve consistency level {level}: {source}")]
    Replicas {
        level: ConsistencyLevel,
        #[source]
        source: ResolveError,
    },

    /// The fan-out could not reach the success target; `node` tags the
    /// most recent peer failure.
    #[error("cannot achieve consistency level {level}: read failed on replica {node:?}: {source}")]
    Read {
        level: ConsistencyLevel,
        node: String,
        #[source]
        source: ClientError,
    },

    /// The read reached its target but the divergence it found could not
    /// be resolved.
    #[error("cannot achieve consistency level {level}: {source}")]
    Repair {
        level: ConsistencyLevel,
        #[source]
        source: RepairError,
    },

    /// A single-node read named a node outside the shard's replica set.
    #[error("replica {node:?} does not host shard {shard:?}")]
    UnknownReplica { node: String, shard: String },

    /// A single-node read failed on the wire.
    #[error("fetch from replica {node:?} failed: {source}")]
    Client {
        node: String,
        #[source]
        source: ClientError,
    },
}

/// Failures of the repair sub-protocol.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    /// A winning replica no longer serves the update time its digest
    /// reported.
    #[error("object changed during repair: {node:?} reported update time {want}, served {got}")]
    ConflictObjectChanged { node: String, want: i64, got: i64 },

    /// Divergence between a deletion and a live object; never resolved by
    /// overwriting.
    #[error("conflict between deleted and live object")]
    ConflictExistOrDeleted,

    /// Fetching the winning body failed on the wire.
    #[error("repair read from {node:?} failed: {source}")]
    Read {
        node: String,
        #[source]
        source: ClientError,
    },

    /// Pushing an overwrite failed on the wire.
    #[error("overwrite on {node:?} failed: {source}")]
    Overwrite {
        node: String,
        #[source]
        source: ClientError,
    },

    /// A repair target refused an overwrite, typically because it drifted
    /// past the expected stale update time.
    #[error("overwrite rejected by {node:?}: {reason}")]
    Rejected { node: String, reason: String },
}

impl RepairError {
    /// The replica this failure is attributable to, when there is one.
    pub fn node(&self) -> Option<&str> {
        match self {
            RepairError::ConflictObjectChanged { node, .. }
            | RepairError::Read { node, .. }
            | RepairError::Overwrite { node, .. }
            | RepairError::Rejected { node, .. } => Some(node),
            RepairError::ConflictExistOrDeleted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistency_errors_start_with_level_sentence() {
        let errors = [
            FinderError::Replicas {
                level: ConsistencyLevel::One,
                source: ResolveError::NoReplicaFound {
                    class: "C1".into(),
                    shard: "S1".into(),
                },
            },
            FinderError::Read {
                level: ConsistencyLevel::Quorum,
                node: "A".into(),
                source: ClientError::Timeout,
            },
            FinderError::Repair {
                level: ConsistencyLevel::All,
                source: RepairError::ConflictExistOrDeleted,
            },
        ];
        for err in errors {
            let msg = err.to_string();
            assert!(
                msg.starts_with(MSG_CONSISTENCY_LEVEL),
                "unexpected message: {msg}"
            );
        }
    }

    #[test]
    fn test_errors_carry_their_sources() {
        let err = FinderError::Read {
            level: ConsistencyLevel::All,
            node: "B".into(),
            source: ClientError::Rpc("connection refused".into()),
        };
        assert!(err.to_string().contains("connection refused"));
        assert!(err.to_string().contains('B'));

        let err = FinderError::Repair {
            level: ConsistencyLevel::All,
            source: RepairError::Rejected {
                node: "C".into(),
                reason: "conflict".into(),
            },
        };
        assert!(err.to_string().contains("conflict"));
    }

    #[test]
    fn test_repair_error_node_attribution() {
        let err = RepairError::ConflictObjectChanged {
            node: "C".into(),
            want: 4,
            got: 3,
        };
        assert_eq!(err.node(), Some("C"));
        assert_eq!(RepairError::ConflictExistOrDeleted.node(), None);
    }
}
