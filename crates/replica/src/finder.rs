//! Finder: the replicated read protocol driver.
//!
//! One finder serves one class. A read resolves the shard's replica set,
//! fans out a direct (full body) read to the first replica and digest
//! probes to the rest, waits for the consistency level's success target,
//! compares the observed update times, and hands any divergence to the
//! repairer. Per-call state is stack-local; the finder itself is
//! long-lived and safe for concurrent use.

use crate::client::{ClientError, ReplicaClient};
use crate::digest::{self, IdVotes, Observation};
use crate::error::{FinderError, RepairError};
use crate::fanout::{self, FanoutFailure};
use crate::repair::Repairer;
use crate::resolver::{ResolveError, ShardResolver};
use repstore_common::{
    AdditionalProps, ConsistencyLevel, Object, ObjectId, Projection, RepairResponse, Replica,
};
use repstore_config::ReplicationConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Replicated read coordinator for one class.
///
/// Generic over the transport and resolver for testability, the same way
/// the rest of the project keeps its wire seams behind traits.
pub struct Finder<C, R> {
    class: String,
    client: Arc<C>,
    resolver: Arc<R>,
    config: ReplicationConfig,
}

impl<C, R> fmt::Debug for Finder<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finder")
            .field("class", &self.class)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Reply of one replica to the single-object read fan-out.
enum OneReply {
    Full(Replica),
    Digest(RepairResponse),
}

/// Reply of one replica to the batch read fan-out.
enum BatchReply {
    Full(Vec<Replica>),
    Digest(Vec<RepairResponse>),
}

impl<C: ReplicaClient, R: ShardResolver> Finder<C, R> {
    pub fn new(
        class: impl Into<String>,
        resolver: Arc<R>,
        client: Arc<C>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            class: class.into(),
            client,
            resolver,
            config,
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Consistency level applied when the caller does not pick one.
    pub fn default_level(&self) -> ConsistencyLevel {
        self.config.default_level
    }

    // -----------------------------------------------------------------------
    // get_one
    // -----------------------------------------------------------------------

    /// Read a single object at the given consistency level.
    ///
    /// Returns `None` when the replica set agrees the id does not exist
    /// (absent everywhere, or an agreed tombstone).
    pub async fn get_one(
        &self,
        cancel: &CancellationToken,
        level: ConsistencyLevel,
        shard: &str,
        id: ObjectId,
        projection: &Projection,
        additional: &AdditionalProps,
    ) -> Result<Option<Object>, FinderError> {
        let m = repstore_metrics::metrics();
        m.reads.with_label_values(&["get_one"]).inc();
        let _timer = repstore_metrics::start_read_timer("get_one");

        let nodes = self.resolve(level, shard)?;
        let target = level.level(nodes.len());
        let deadline = self.read_deadline();

        let replies = {
            let client = Arc::clone(&self.client);
            let class = self.class.clone();
            let shard = shard.to_string();
            let projection = projection.clone();
            let additional = *additional;
            fanout::pull(&nodes, target, deadline, cancel, move |i, node| {
                let client = Arc::clone(&client);
                let class = class.clone();
                let shard = shard.clone();
                let projection = projection.clone();
                async move {
                    if i == 0 {
                        let replica = client
                            .fetch_object(&node, &class, &shard, id, &projection, &additional)
                            .await?;
                        Ok(OneReply::Full(replica))
                    } else {
                        let digests = client.digest_objects(&node, &class, &shard, &[id]).await?;
                        Ok(OneReply::Digest(expect_one(digests)?))
                    }
                }
            })
            .await
        };
        let replies = match replies {
            Ok(replies) => replies,
            Err(failure) => return Err(self.read_failed(level, shard, failure, "get_one")),
        };

        let (direct, votes) = one_votes(&nodes, id, &replies);
        if votes.is_consistent() {
            let winner = votes.winner();
            if winner.update_time == 0 || winner.deleted {
                return Ok(None);
            }
            if let Some(obj) = body_in_hand(direct.as_ref(), winner) {
                return Ok(Some(obj.clone()));
            }
            // consistent, but the body was not part of the read: the
            // winning replica is promoted to a direct source below
        } else {
            m.read_repairs.inc();
        }

        let repairer = self.repairer(shard, cancel);
        match repairer
            .repair_one(&votes, direct.as_ref(), projection, additional)
            .await
        {
            Ok(object) => Ok(Some(object)),
            Err(source) => Err(self.repair_failed(level, shard, &votes.describe(), source, "get_one")),
        }
    }

    // -----------------------------------------------------------------------
    // get_all
    // -----------------------------------------------------------------------

    /// Read several objects at once. The result mirrors `ids`: one slot
    /// per requested id, `None` where no replica has the id.
    pub async fn get_all(
        &self,
        cancel: &CancellationToken,
        level: ConsistencyLevel,
        shard: &str,
        ids: &[ObjectId],
    ) -> Result<Vec<Option<Object>>, FinderError> {
        let m = repstore_metrics::metrics();
        m.reads.with_label_values(&["get_all"]).inc();
        let _timer = repstore_metrics::start_read_timer("get_all");

        let nodes = self.resolve(level, shard)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let target = level.level(nodes.len());
        let deadline = self.read_deadline();
        let want = ids.len();

        let replies = {
            let client = Arc::clone(&self.client);
            let class = self.class.clone();
            let shard = shard.to_string();
            let ids: Arc<[ObjectId]> = Arc::from(ids);
            fanout::pull(&nodes, target, deadline, cancel, move |i, node| {
                let client = Arc::clone(&client);
                let class = class.clone();
                let shard = shard.clone();
                let ids = Arc::clone(&ids);
                async move {
                    if i == 0 {
                        let replicas =
                            client.fetch_objects(&node, &class, &shard, &ids).await?;
                        Ok(BatchReply::Full(expect_len(replicas, want)?))
                    } else {
                        let digests =
                            client.digest_objects(&node, &class, &shard, &ids).await?;
                        Ok(BatchReply::Digest(expect_len(digests, want)?))
                    }
                }
            })
            .await
        };
        let replies = match replies {
            Ok(replies) => replies,
            Err(failure) => return Err(self.read_failed(level, shard, failure, "get_all")),
        };

        let (direct, votes) = batch_votes(&nodes, ids, &replies);
        let all_consistent = votes.iter().all(|v| v.is_consistent());
        if all_consistent {
            if let Some(direct) = &direct {
                let result = votes
                    .iter()
                    .enumerate()
                    .map(|(pos, v)| {
                        let w = v.winner();
                        if w.update_time == 0 || w.deleted {
                            None
                        } else {
                            direct[pos].object.clone()
                        }
                    })
                    .collect();
                return Ok(result);
            }
        } else {
            m.read_repairs.inc();
        }

        let repairer = self.repairer(shard, cancel);
        match repairer.repair_batch(ids, &votes, direct.as_deref()).await {
            Ok(result) => Ok(result),
            Err(source) => {
                let observed = describe_batch(&votes);
                Err(self.repair_failed(level, shard, &observed, source, "get_all"))
            }
        }
    }

    // -----------------------------------------------------------------------
    // exists
    // -----------------------------------------------------------------------

    /// Probe for existence without shipping a body, unless divergence
    /// forces a repair.
    ///
    /// `true` iff the winning replica holds a live object.
    pub async fn exists(
        &self,
        cancel: &CancellationToken,
        level: ConsistencyLevel,
        shard: &str,
        id: ObjectId,
    ) -> Result<bool, FinderError> {
        let m = repstore_metrics::metrics();
        m.reads.with_label_values(&["exists"]).inc();
        let _timer = repstore_metrics::start_read_timer("exists");

        let nodes = self.resolve(level, shard)?;
        let target = level.level(nodes.len());
        let deadline = self.read_deadline();

        let replies = {
            let client = Arc::clone(&self.client);
            let class = self.class.clone();
            let shard = shard.to_string();
            fanout::pull(&nodes, target, deadline, cancel, move |_i, node| {
                let client = Arc::clone(&client);
                let class = class.clone();
                let shard = shard.clone();
                async move {
                    let digests = client.digest_objects(&node, &class, &shard, &[id]).await?;
                    expect_one(digests)
                }
            })
            .await
        };
        let replies = match replies {
            Ok(replies) => replies,
            Err(failure) => return Err(self.read_failed(level, shard, failure, "exists")),
        };

        let per_node: Vec<(String, RepairResponse)> = nodes
            .iter()
            .flat_map(|node| {
                replies
                    .iter()
                    .filter(move |(n, _)| n == node)
                    .map(|(n, d)| (n.clone(), d.clone()))
            })
            .collect();
        let votes = digest::tally_one(id, &per_node);
        if votes.is_consistent() {
            let w = votes.winner();
            return Ok(w.update_time > 0 && !w.deleted);
        }
        m.read_repairs.inc();

        let repairer = self.repairer(shard, cancel);
        match repairer
            .repair_one(&votes, None, &Projection::default(), &AdditionalProps::default())
            .await
        {
            Ok(object) => Ok(object.last_update_time_unix > 0),
            Err(source) => Err(self.repair_failed(level, shard, &votes.describe(), source, "exists")),
        }
    }

    // -----------------------------------------------------------------------
    // node_object
    // -----------------------------------------------------------------------

    /// Fetch an object body from one named replica, bypassing consistency:
    /// no digests, no repair.
    pub async fn node_object(
        &self,
        node: &str,
        shard: &str,
        id: ObjectId,
        projection: &Projection,
        additional: &AdditionalProps,
    ) -> Result<Option<Object>, FinderError> {
        let nodes = self.resolver.replicas_for(&self.class, shard);
        if !nodes.iter().any(|n| n == node) {
            return Err(FinderError::UnknownReplica {
                node: node.to_string(),
                shard: shard.to_string(),
            });
        }
        let reply = self
            .client
            .fetch_object(node, &self.class, shard, id, projection, additional)
            .await
            .map_err(|source| FinderError::Client {
                node: node.to_string(),
                source,
            })?;
        Ok(reply.object)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn resolve(&self, level: ConsistencyLevel, shard: &str) -> Result<Vec<String>, FinderError> {
        let nodes = self.resolver.replicas_for(&self.class, shard);
        if nodes.is_empty() {
            let source = ResolveError::NoReplicaFound {
                class: self.class.clone(),
                shard: shard.to_string(),
            };
            repstore_metrics::metrics()
                .read_failures
                .with_label_values(&["replicas"])
                .inc();
            tracing::error!(
                class = %self.class,
                shard = %shard,
                "cannot achieve consistency level {}: {}",
                level,
                source,
            );
            return Err(FinderError::Replicas { level, source });
        }
        Ok(nodes)
    }

    fn read_deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.config.read_timeout_ms)
    }

    fn repairer<'f>(&'f self, shard: &'f str, cancel: &'f CancellationToken) -> Repairer<'f, C> {
        Repairer::new(
            &self.class,
            shard,
            self.client.as_ref(),
            cancel,
            Duration::from_millis(self.config.repair_timeout_ms),
        )
    }

    fn read_failed(
        &self,
        level: ConsistencyLevel,
        shard: &str,
        failure: FanoutFailure,
        op: &str,
    ) -> FinderError {
        repstore_metrics::metrics()
            .read_failures
            .with_label_values(&["read"])
            .inc();
        tracing::error!(
            class = %self.class,
            shard = %shard,
            replica = %failure.node,
            op = %op,
            "cannot achieve consistency level {}: read failed: {}",
            level,
            failure.error,
        );
        FinderError::Read {
            level,
            node: failure.node,
            source: failure.error,
        }
    }

    fn repair_failed(
        &self,
        level: ConsistencyLevel,
        shard: &str,
        observed: &str,
        source: RepairError,
        op: &str,
    ) -> FinderError {
        let m = repstore_metrics::metrics();
        m.read_failures.with_label_values(&["repair"]).inc();
        m.repair_failures.inc();
        tracing::error!(
            class = %self.class,
            shard = %shard,
            replica = %source.node().unwrap_or_default(),
            op = %op,
            "cannot achieve consistency level {}: {}: observed {}",
            level,
            source,
            observed,
        );
        FinderError::Repair { level, source }
    }
}

/// Assemble the direct reply and the per-replica digest votes for one id,
/// in replica-set order.
fn one_votes(
    nodes: &[String],
    id: ObjectId,
    replies: &[(String, OneReply)],
) -> (Option<Replica>, IdVotes) {
    let mut direct = None;
    let mut per_node = Vec::with_capacity(replies.len());
    for node in nodes {
        for (reply_node, reply) in replies {
            if reply_node != node {
                continue;
            }
            match reply {
                OneReply::Full(r) => {
                    per_node.push((node.clone(), r.to_digest(id)));
                    direct = Some(r.clone());
                }
                OneReply::Digest(d) => per_node.push((node.clone(), d.clone())),
            }
        }
    }
    (direct, digest::tally_one(id, &per_node))
}

/// Assemble the direct batch and the per-replica digest votes for a batch
/// read, in replica-set order.
fn batch_votes(
    nodes: &[String],
    ids: &[ObjectId],
    replies: &[(String, BatchReply)],
) -> (Option<Vec<Replica>>, Vec<IdVotes>) {
    let mut direct = None;
    let mut per_node = Vec::with_capacity(replies.len());
    for node in nodes {
        for (reply_node, reply) in replies {
            if reply_node != node {
                continue;
            }
            match reply {
                BatchReply::Full(rs) => {
                    let digests = rs
                        .iter()
                        .enumerate()
                        .map(|(pos, r)| r.to_digest(ids[pos]))
                        .collect();
                    per_node.push((node.clone(), digests));
                    direct = Some(rs.clone());
                }
                BatchReply::Digest(ds) => per_node.push((node.clone(), ds.clone())),
            }
        }
    }
    (direct, digest::tally(ids, &per_node))
}

/// The direct reply's body, when it is live and already at the winning
/// update time.
fn body_in_hand<'r>(direct: Option<&'r Replica>, winner: &Observation) -> Option<&'r Object> {
    direct
        .and_then(|r| if r.deleted { None } else { r.object.as_ref() })
        .filter(|o| o.last_update_time_unix == winner.update_time)
}

/// The `id: node:update_time ...` rendering quoted when a batch read
/// fails; divergent ids only, or all of them when none diverged.
fn describe_batch(votes: &[IdVotes]) -> String {
    let divergent: Vec<String> = votes
        .iter()
        .filter(|v| !v.is_consistent())
        .map(|v| format!("{}: {}", v.id, v.describe()))
        .collect();
    if divergent.is_empty() {
        votes
            .iter()
            .map(|v| format!("{}: {}", v.id, v.describe()))
            .collect::<Vec<_>>()
            .join("; ")
    } else {
        divergent.join("; ")
    }
}

fn expect_len<T>(items: Vec<T>, want: usize) -> Result<Vec<T>, ClientError> {
    if items.len() == want {
        Ok(items)
    } else {
        Err(ClientError::BadReplyLength {
            want,
            got: items.len(),
        })
    }
}

fn expect_one(mut digests: Vec<RepairResponse>) -> Result<RepairResponse, ClientError> {
    if digests.len() != 1 {
        return Err(ClientError::BadReplyLength {
            want: 1,
            got: digests.len(),
        });
    }
    Ok(digests.remove(0))
}
