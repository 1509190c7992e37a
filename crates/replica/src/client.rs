//! Abstraction over coordinator-to-replica RPCs.
//!
//! Same pattern as the other transport seams in the project: a trait in
//! the domain crate, with the wire implementation living behind it. Unit
//! tests substitute a recording fake.

use repstore_common::{AdditionalProps, ObjectId, Projection, RepairResponse, Replica, VObject};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("rpc failed: {0}")]
    Rpc(String),
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("malformed reply: expected {want} entries, got {got}")]
    BadReplyLength { want: usize, got: usize },
}

/// Transport for replica reads and repair overwrites.
///
/// Every reply vector is positional: one entry per requested id, in
/// request order, with the empty value standing in for ids the replica has
/// never seen.
#[async_trait::async_trait]
pub trait ReplicaClient: Send + Sync + 'static {
    /// Fetch one object body from `node`.
    async fn fetch_object(
        &self,
        node: &str,
        class: &str,
        shard: &str,
        id: ObjectId,
        projection: &Projection,
        additional: &AdditionalProps,
    ) -> Result<Replica, ClientError>;

    /// Fetch several object bodies from `node`.
    async fn fetch_objects(
        &self,
        node: &str,
        class: &str,
        shard: &str,
        ids: &[ObjectId],
    ) -> Result<Vec<Replica>, ClientError>;

    /// Fetch lightweight digests from `node`.
    async fn digest_objects(
        &self,
        node: &str,
        class: &str,
        shard: &str,
        ids: &[ObjectId],
    ) -> Result<Vec<RepairResponse>, ClientError>;

    /// Push guarded overwrites to `node`. Entries of the reply carrying a
    /// non-empty `err` were rejected by the target.
    async fn overwrite_objects(
        &self,
        node: &str,
        class: &str,
        shard: &str,
        vobjects: &[VObject],
    ) -> Result<Vec<RepairResponse>, ClientError>;
}
