//! repstore-common: shared types for the repstore project.
//!
//! Provides the records exchanged between the read coordinator and the
//! replicas of a shard: direct read replies, per-object digests, and the
//! guarded overwrite payload used by read-repair.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a stored object.
pub type ObjectId = Uuid;

// ---------------------------------------------------------------------------
// Object
// ---------------------------------------------------------------------------

/// A stored object as held by one replica.
///
/// `last_update_time_unix` is assigned by the writer and is monotonic per
/// id. The value `0` is reserved to mean "no object with this id".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub id: ObjectId,
    pub last_update_time_unix: i64,
    /// Domain payload; shape is owned by the caller.
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl Object {
    pub fn new(id: ObjectId, last_update_time_unix: i64) -> Self {
        Self {
            id,
            last_update_time_unix,
            properties: serde_json::Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Replica (direct read reply)
// ---------------------------------------------------------------------------

/// One replica's answer to a direct (full body) read of a single id.
///
/// Three states:
/// - live object: `object` set, `deleted == false`
/// - tombstone: `deleted == true`, `object` carries only the deletion time
/// - absent: the default value, the replica has never seen the id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    pub id: Option<ObjectId>,
    pub object: Option<Object>,
    #[serde(default)]
    pub deleted: bool,
}

impl Replica {
    /// A live reply wrapping `object`.
    pub fn from_object(object: Object) -> Self {
        Self {
            id: Some(object.id),
            object: Some(object),
            deleted: false,
        }
    }

    /// A deletion marker for `id`, stamped with the deletion time.
    pub fn tombstone(id: ObjectId, last_update_time_unix: i64) -> Self {
        Self {
            id: Some(id),
            object: Some(Object::new(id, last_update_time_unix)),
            deleted: true,
        }
    }

    /// The update time this replica observed for the id; 0 when absent.
    pub fn update_time(&self) -> i64 {
        self.object.as_ref().map_or(0, |o| o.last_update_time_unix)
    }

    /// True for the "never seen this id" state.
    pub fn is_absent(&self) -> bool {
        self.object.is_none() && !self.deleted
    }

    /// The digest equivalent of this reply, used to compare it against
    /// digest-only answers from other replicas.
    pub fn to_digest(&self, id: ObjectId) -> RepairResponse {
        RepairResponse {
            id,
            update_time: self.update_time(),
            deleted: self.deleted,
            err: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// RepairResponse (digest reply)
// ---------------------------------------------------------------------------

/// Digest of one object on one replica: enough to compare versions without
/// shipping bodies. The same shape acknowledges overwrites, where a
/// non-empty `err` means the target rejected the write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairResponse {
    pub id: ObjectId,
    pub update_time: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub err: String,
}

// ---------------------------------------------------------------------------
// VObject (overwrite payload)
// ---------------------------------------------------------------------------

/// Guarded overwrite pushed to a stale replica during read-repair.
///
/// The recipient must apply `latest_object` only while its own update time
/// for the id still equals `stale_update_time`, and reject otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VObject {
    pub latest_object: Object,
    pub stale_update_time: i64,
    /// MVCC version slot; always 0 until per-object versions are written.
    #[serde(default)]
    pub version: i64,
}

impl VObject {
    pub fn new(latest_object: Object, stale_update_time: i64) -> Self {
        Self {
            latest_object,
            stale_update_time,
            version: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Read options
// ---------------------------------------------------------------------------

/// Property selection forwarded to the replica on direct reads. Empty
/// means "all properties".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection(pub Vec<String>);

/// Extra retrieval flags forwarded untouched to the replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalProps {
    /// Return internal bookkeeping fields (timestamps) with the body.
    #[serde(default)]
    pub include_timestamps: bool,
}

// ---------------------------------------------------------------------------
// ConsistencyLevel
// ---------------------------------------------------------------------------

/// Client-chosen success target for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsistencyLevel {
    One,
    Quorum,
    All,
}

impl ConsistencyLevel {
    /// Number of successful replicas required out of `n`.
    ///
    /// `n` must be at least 1; an empty replica set is rejected before
    /// this arithmetic is reached.
    pub fn level(self, n: usize) -> usize {
        match self {
            ConsistencyLevel::One => 1,
            ConsistencyLevel::Quorum => n / 2 + 1,
            ConsistencyLevel::All => n,
        }
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsistencyLevel::One => "ONE",
            ConsistencyLevel::Quorum => "QUORUM",
            ConsistencyLevel::All => "ALL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown consistency level {0:?} (expected ONE, QUORUM or ALL)")]
pub struct ParseLevelError(String);

impl FromStr for ConsistencyLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONE" => Ok(ConsistencyLevel::One),
            "QUORUM" => Ok(ConsistencyLevel::Quorum),
            "ALL" => Ok(ConsistencyLevel::All),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> ObjectId {
        Uuid::from_u128(n)
    }

    #[test]
    fn test_level_arithmetic() {
        use ConsistencyLevel::*;
        let cases = [
            (One, 1, 1),
            (One, 3, 1),
            (Quorum, 1, 1),
            (Quorum, 2, 2),
            (Quorum, 3, 2),
            (Quorum, 4, 3),
            (Quorum, 5, 3),
            (All, 1, 1),
            (All, 3, 3),
            (All, 5, 5),
        ];
        for (l, n, want) in cases {
            assert_eq!(l.level(n), want, "{l} with n={n}");
        }
    }

    #[test]
    fn test_level_parse_and_display() {
        for l in [
            ConsistencyLevel::One,
            ConsistencyLevel::Quorum,
            ConsistencyLevel::All,
        ] {
            assert_eq!(l.to_string().parse::<ConsistencyLevel>().unwrap(), l);
        }
        let err = "quorum".parse::<ConsistencyLevel>().unwrap_err();
        assert!(err.to_string().contains("quorum"));
    }

    #[test]
    fn test_replica_states() {
        let live = Replica::from_object(Object::new(id(1), 7));
        assert_eq!(live.update_time(), 7);
        assert!(!live.is_absent());
        assert!(!live.deleted);

        let gone = Replica::tombstone(id(1), 9);
        assert_eq!(gone.update_time(), 9);
        assert!(!gone.is_absent());
        assert!(gone.deleted);

        let absent = Replica::default();
        assert_eq!(absent.update_time(), 0);
        assert!(absent.is_absent());
    }

    #[test]
    fn test_replica_to_digest() {
        let live = Replica::from_object(Object::new(id(2), 3));
        let d = live.to_digest(id(2));
        assert_eq!(d.update_time, 3);
        assert!(!d.deleted);
        assert!(d.err.is_empty());

        let d = Replica::default().to_digest(id(2));
        assert_eq!(d.update_time, 0);
        assert!(!d.deleted);

        let d = Replica::tombstone(id(2), 5).to_digest(id(2));
        assert_eq!(d.update_time, 5);
        assert!(d.deleted);
    }

    #[test]
    fn test_vobject_version_defaults_to_zero() {
        let v = VObject::new(Object::new(id(3), 4), 2);
        assert_eq!(v.version, 0);

        let json = serde_json::json!({
            "latest_object": {"id": id(3), "last_update_time_unix": 4},
            "stale_update_time": 2,
        });
        let parsed: VObject = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, v);
    }

    #[test]
    fn test_level_serde_uppercase() {
        let json = serde_json::to_string(&ConsistencyLevel::Quorum).unwrap();
        assert_eq!(json, "\"QUORUM\"");
        let back: ConsistencyLevel = serde_json::from_str("\"ALL\"").unwrap();
        assert_eq!(back, ConsistencyLevel::All);
    }

    #[test]
    fn test_digest_serde_roundtrip() {
        let d = RepairResponse {
            id: id(9),
            update_time: 12,
            deleted: true,
            err: String::new(),
        };
        let json = serde_json::to_string(&d).unwrap();
        let back: RepairResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }
}
