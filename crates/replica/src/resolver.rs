//! Shard-to-replica resolution.

use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no replica found for class {class} shard {shard}")]
    NoReplicaFound { class: String, shard: String },
}

/// Supplies the ordered replica set for a (class, shard) pair.
///
/// The first entry is the preferred node for direct (full body) reads;
/// implementations must be safe for concurrent use.
pub trait ShardResolver: Send + Sync + 'static {
    fn replicas_for(&self, class: &str, shard: &str) -> Vec<String>;
}

/// Map-backed resolver for embedding and tests. Built once, then shared;
/// the replica order given at construction is preserved.
#[derive(Debug, Default)]
pub struct StaticResolver {
    shards: HashMap<(String, String), Vec<String>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replicas(
        mut self,
        class: &str,
        shard: &str,
        nodes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.shards.insert(
            (class.to_string(), shard.to_string()),
            nodes.into_iter().map(Into::into).collect(),
        );
        self
    }
}

impl ShardResolver for StaticResolver {
    fn replicas_for(&self, class: &str, shard: &str) -> Vec<String> {
        self.shards
            .get(&(class.to_string(), shard.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resolver_preserves_order() {
        let r = StaticResolver::new().with_replicas("C1", "S1", ["A", "B", "C"]);
        assert_eq!(r.replicas_for("C1", "S1"), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_static_resolver_unknown_shard_is_empty() {
        let r = StaticResolver::new().with_replicas("C1", "S1", ["A"]);
        assert!(r.replicas_for("C1", "S2").is_empty());
        assert!(r.replicas_for("C2", "S1").is_empty());
    }
}
