//! Read-repair: resolves divergence found by the digest comparator.
//!
//! Fetches the winning body (unless the direct read already holds it),
//! then pushes guarded overwrites to every stale replica that took part in
//! the read. A target that drifted past the expected stale update time
//! rejects the overwrite, which fails the whole request; the coordinator
//! never retries on the caller's behalf.

use crate::client::{ClientError, ReplicaClient};
use crate::digest::{IdVotes, Observation};
use crate::error::RepairError;
use futures::future::join_all;
use repstore_common::{AdditionalProps, Object, ObjectId, Projection, Replica, VObject};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) struct Repairer<'a, C> {
    class: &'a str,
    shard: &'a str,
    client: &'a C,
    cancel: &'a CancellationToken,
    timeout: Duration,
}

impl<'a, C: ReplicaClient> Repairer<'a, C> {
    pub fn new(
        class: &'a str,
        shard: &'a str,
        client: &'a C,
        cancel: &'a CancellationToken,
        timeout: Duration,
    ) -> Self {
        Self {
            class,
            shard,
            client,
            cancel,
            timeout,
        }
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        tokio::select! {
            r = tokio::time::timeout(self.timeout, fut) => r.unwrap_or(Err(ClientError::Timeout)),
            _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
        }
    }

    /// Repair a single divergent id (the `get_one`/`exists` path).
    ///
    /// `content` is the direct reply when one is in hand; if its update
    /// time matches the winner the body is reused, otherwise the winning
    /// replica is asked for a fresh copy first. Returns the winning body.
    pub async fn repair_one(
        &self,
        votes: &IdVotes,
        content: Option<&Replica>,
        projection: &Projection,
        additional: &AdditionalProps,
    ) -> Result<Object, RepairError> {
        if let Some(o) = votes.rejected() {
            return Err(RepairError::Rejected {
                node: o.node.clone(),
                reason: o.err.clone(),
            });
        }
        if votes.has_exist_or_deleted_conflict() {
            return Err(RepairError::ConflictExistOrDeleted);
        }

        let winner = votes.winner();
        let body = match in_hand(content, winner) {
            Some(obj) => obj.clone(),
            None => {
                self.fetch_winner(votes.id, winner, projection, additional)
                    .await?
            }
        };

        let mut per_node: HashMap<String, Vec<VObject>> = HashMap::new();
        for o in votes.stale() {
            per_node.insert(o.node.clone(), vec![VObject::new(body.clone(), o.update_time)]);
        }
        self.push_overwrites(per_node).await?;
        Ok(body)
    }

    /// Repair a batch read (the `get_all` path); returns the winning
    /// bodies aligned with `ids`, `None` where no replica has the id.
    ///
    /// Conflicted ids fail the request; the remaining divergent ids are
    /// still repaired before the failure is reported.
    pub async fn repair_batch(
        &self,
        ids: &[ObjectId],
        votes: &[IdVotes],
        direct: Option<&[Replica]>,
    ) -> Result<Vec<Option<Object>>, RepairError> {
        let mut result: Vec<Option<Object>> = vec![None; ids.len()];
        let mut conflict: Option<RepairError> = None;
        let mut repairable: Vec<usize> = Vec::new();
        let mut refetch: HashMap<String, Vec<usize>> = HashMap::new();

        for (pos, v) in votes.iter().enumerate() {
            if let Some(o) = v.rejected() {
                conflict.get_or_insert(RepairError::Rejected {
                    node: o.node.clone(),
                    reason: o.err.clone(),
                });
                continue;
            }
            if v.has_exist_or_deleted_conflict() {
                conflict.get_or_insert(RepairError::ConflictExistOrDeleted);
                continue;
            }
            let winner = v.winner();
            if winner.update_time == 0 || winner.deleted {
                // absent everywhere, or a tombstone every responder agrees
                // on: nothing to serve, nothing to fix
                continue;
            }
            repairable.push(pos);
            match in_hand(direct.and_then(|d| d.get(pos)), winner) {
                Some(obj) => result[pos] = Some(obj.clone()),
                None => refetch.entry(winner.node.clone()).or_default().push(pos),
            }
        }

        // Fetch fresh bodies from the winning replicas, grouped per node.
        let fetches = refetch.into_iter().map(|(node, positions)| {
            let want: Vec<ObjectId> = positions.iter().map(|&p| ids[p]).collect();
            async move {
                let outcome = self
                    .call(self.client.fetch_objects(&node, self.class, self.shard, &want))
                    .await;
                (node, positions, outcome)
            }
        });
        for (node, positions, outcome) in join_all(fetches).await {
            let replies = outcome.map_err(|source| RepairError::Read {
                node: node.clone(),
                source,
            })?;
            if replies.len() != positions.len() {
                return Err(RepairError::Read {
                    node,
                    source: ClientError::BadReplyLength {
                        want: positions.len(),
                        got: replies.len(),
                    },
                });
            }
            for (&pos, reply) in positions.iter().zip(&replies) {
                let winner = votes[pos].winner();
                match &reply.object {
                    Some(obj)
                        if reply.update_time() == winner.update_time && !reply.deleted =>
                    {
                        result[pos] = Some(obj.clone());
                    }
                    _ => {
                        return Err(RepairError::ConflictObjectChanged {
                            node: node.clone(),
                            want: winner.update_time,
                            got: reply.update_time(),
                        });
                    }
                }
            }
        }

        // Guarded overwrites, one batch per stale replica.
        let mut per_node: HashMap<String, Vec<VObject>> = HashMap::new();
        for &pos in &repairable {
            let Some(body) = result[pos].as_ref() else {
                continue;
            };
            for o in votes[pos].stale() {
                per_node
                    .entry(o.node.clone())
                    .or_default()
                    .push(VObject::new(body.clone(), o.update_time));
            }
        }
        self.push_overwrites(per_node).await?;

        match conflict {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Fetch the winning body and make sure the replica still serves the
    /// update time its digest promised.
    async fn fetch_winner(
        &self,
        id: ObjectId,
        winner: &Observation,
        projection: &Projection,
        additional: &AdditionalProps,
    ) -> Result<Object, RepairError> {
        let reply = self
            .call(self.client.fetch_object(
                &winner.node,
                self.class,
                self.shard,
                id,
                projection,
                additional,
            ))
            .await
            .map_err(|source| RepairError::Read {
                node: winner.node.clone(),
                source,
            })?;
        let got = reply.update_time();
        match reply.object {
            Some(obj) if got == winner.update_time && !reply.deleted => Ok(obj),
            _ => Err(RepairError::ConflictObjectChanged {
                node: winner.node.clone(),
                want: winner.update_time,
                got,
            }),
        }
    }

    /// Push every per-node overwrite batch in parallel and validate the
    /// acknowledgements. Partial success is still failure.
    async fn push_overwrites(
        &self,
        per_node: HashMap<String, Vec<VObject>>,
    ) -> Result<(), RepairError> {
        let calls = per_node.into_iter().map(|(node, vobjects)| async move {
            let outcome = self
                .call(
                    self.client
                        .overwrite_objects(&node, self.class, self.shard, &vobjects),
                )
                .await;
            (node, outcome)
        });

        let mut failure: Option<RepairError> = None;
        for (node, outcome) in join_all(calls).await {
            match outcome {
                Ok(responses) => {
                    if let Some(bad) = responses.iter().find(|r| !r.err.is_empty()) {
                        tracing::error!(replica = %node, err = %bad.err, "repair overwrite rejected");
                        failure.get_or_insert(RepairError::Rejected {
                            reason: bad.err.clone(),
                            node,
                        });
                    }
                }
                Err(source) => {
                    tracing::error!(replica = %node, error = %source, "repair overwrite failed");
                    failure.get_or_insert(RepairError::Overwrite { node, source });
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// The direct reply's body, when it is live and already at the winning
/// update time.
fn in_hand<'r>(content: Option<&'r Replica>, winner: &Observation) -> Option<&'r Object> {
    content
        .and_then(|r| if r.deleted { None } else { r.object.as_ref() })
        .filter(|o| o.last_update_time_unix == winner.update_time)
}
