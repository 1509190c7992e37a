//! Digest comparator: reduces per-replica digests to a winning update
//! time per id and classifies the divergence the repairer has to resolve.

use repstore_common::{ObjectId, RepairResponse};

/// One replica's digest observation for a single id.
#[derive(Debug, Clone)]
pub(crate) struct Observation {
    pub node: String,
    pub update_time: i64,
    pub deleted: bool,
    pub err: String,
}

/// Aggregated observations for one id, with the winning replica resolved.
///
/// Observations are kept in replica-set order, which makes the winner
/// deterministic: the maximum update time, ties going to the node listed
/// first (the direct node, when it responded).
#[derive(Debug, Clone)]
pub(crate) struct IdVotes {
    pub id: ObjectId,
    observations: Vec<Observation>,
    winner: usize,
}

impl IdVotes {
    pub fn winner(&self) -> &Observation {
        &self.observations[self.winner]
    }

    /// True when every responder agrees with the winner on both update
    /// time and deletion status, and no reply carried a rejection.
    pub fn is_consistent(&self) -> bool {
        let w = self.winner();
        self.observations
            .iter()
            .all(|o| o.err.is_empty() && o.update_time == w.update_time && o.deleted == w.deleted)
    }

    /// Responders whose observation is older than the winner's, including
    /// replicas missing the id entirely (update time 0).
    pub fn stale(&self) -> impl Iterator<Item = &Observation> {
        let t = self.winner().update_time;
        self.observations.iter().filter(move |o| o.update_time < t)
    }

    /// A divergent id where any side reports a deletion cannot be repaired
    /// by overwriting: deletions are never raced against live objects.
    pub fn has_exist_or_deleted_conflict(&self) -> bool {
        !self.is_consistent() && self.observations.iter().any(|o| o.deleted)
    }

    /// First observation that carried a rejection string, if any.
    pub fn rejected(&self) -> Option<&Observation> {
        self.observations.iter().find(|o| !o.err.is_empty())
    }

    /// `node:update_time` pairs sorted by node name, the shape quoted in
    /// consistency failure logs.
    pub fn describe(&self) -> String {
        let mut parts: Vec<&Observation> = self.observations.iter().collect();
        parts.sort_by(|a, b| a.node.cmp(&b.node));
        parts
            .iter()
            .map(|o| format!("{}:{}", o.node, o.update_time))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Reduce per-node digest vectors to one vote set per id.
///
/// `replies` must be in replica-set order and each digest vector aligned
/// with `ids`; reply lengths are validated at the transport boundary.
pub(crate) fn tally(ids: &[ObjectId], replies: &[(String, Vec<RepairResponse>)]) -> Vec<IdVotes> {
    for (_, digests) in replies {
        debug_assert_eq!(digests.len(), ids.len());
    }
    ids.iter()
        .enumerate()
        .map(|(pos, &id)| {
            let observations: Vec<Observation> = replies
                .iter()
                .map(|(node, digests)| {
                    let d = &digests[pos];
                    Observation {
                        node: node.clone(),
                        update_time: d.update_time,
                        deleted: d.deleted,
                        err: d.err.clone(),
                    }
                })
                .collect();
            let mut winner = 0;
            for (i, o) in observations.iter().enumerate().skip(1) {
                if o.update_time > observations[winner].update_time {
                    winner = i;
                }
            }
            IdVotes {
                id,
                observations,
                winner,
            }
        })
        .collect()
}

/// Single-id convenience over [`tally`].
pub(crate) fn tally_one(id: ObjectId, replies: &[(String, RepairResponse)]) -> IdVotes {
    let replies: Vec<(String, Vec<RepairResponse>)> = replies
        .iter()
        .map(|(node, d)| (node.clone(), vec![d.clone()]))
        .collect();
    let mut votes = tally(&[id], &replies);
    votes.swap_remove(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id(n: u128) -> ObjectId {
        Uuid::from_u128(n)
    }

    fn digest(update_time: i64) -> RepairResponse {
        RepairResponse {
            id: id(1),
            update_time,
            deleted: false,
            err: String::new(),
        }
    }

    fn deleted_digest(update_time: i64) -> RepairResponse {
        RepairResponse {
            deleted: true,
            ..digest(update_time)
        }
    }

    fn one(replies: &[(&str, RepairResponse)]) -> IdVotes {
        let replies: Vec<(String, RepairResponse)> = replies
            .iter()
            .map(|(n, d)| (n.to_string(), d.clone()))
            .collect();
        tally_one(id(1), &replies)
    }

    #[test]
    fn test_winner_is_max_update_time() {
        let v = one(&[("A", digest(1)), ("B", digest(3)), ("C", digest(2))]);
        assert_eq!(v.winner().node, "B");
        assert_eq!(v.winner().update_time, 3);
        assert!(!v.is_consistent());
    }

    #[test]
    fn test_ties_prefer_the_first_listed_node() {
        let v = one(&[("A", digest(2)), ("B", digest(3)), ("C", digest(3))]);
        assert_eq!(v.winner().node, "B");
    }

    #[test]
    fn test_agreement_is_consistent() {
        let v = one(&[("A", digest(3)), ("B", digest(3)), ("C", digest(3))]);
        assert!(v.is_consistent());
        assert_eq!(v.stale().count(), 0);
    }

    #[test]
    fn test_stale_includes_missing_replicas() {
        let v = one(&[("A", digest(3)), ("B", digest(0)), ("C", digest(2))]);
        let stale: Vec<&str> = v.stale().map(|o| o.node.as_str()).collect();
        assert_eq!(stale, vec!["B", "C"]);
    }

    #[test]
    fn test_deleted_divergence_conflicts() {
        // zero-time tombstone against live copies still conflicts
        let v = one(&[("A", deleted_digest(0)), ("B", digest(3)), ("C", digest(3))]);
        assert!(v.has_exist_or_deleted_conflict());

        let v = one(&[("A", digest(1)), ("B", deleted_digest(5))]);
        assert!(v.has_exist_or_deleted_conflict());
    }

    #[test]
    fn test_agreed_tombstones_do_not_conflict() {
        let v = one(&[("A", deleted_digest(3)), ("B", deleted_digest(3))]);
        assert!(v.is_consistent());
        assert!(!v.has_exist_or_deleted_conflict());
    }

    #[test]
    fn test_rejection_marks_the_id() {
        let bad = RepairResponse {
            err: "conflict".into(),
            ..digest(4)
        };
        let v = one(&[("A", digest(4)), ("B", bad)]);
        let r = v.rejected().unwrap();
        assert_eq!(r.node, "B");
        assert_eq!(r.err, "conflict");
        assert!(!v.is_consistent());
    }

    #[test]
    fn test_describe_sorts_by_node_name() {
        let v = one(&[("C", digest(3)), ("A", digest(3)), ("B", digest(2))]);
        assert_eq!(v.describe(), "A:3 B:2 C:3");
    }

    #[test]
    fn test_tally_keeps_positions_aligned() {
        let ids = [id(1), id(2)];
        let replies = vec![
            ("A".to_string(), vec![digest(1), digest(5)]),
            ("B".to_string(), vec![digest(2), digest(4)]),
        ];
        let votes = tally(&ids, &replies);
        assert_eq!(votes.len(), 2);
        assert_eq!(votes[0].id, ids[0]);
        assert_eq!(votes[0].winner().node, "B");
        assert_eq!(votes[1].id, ids[1]);
        assert_eq!(votes[1].winner().node, "A");
    }
}
