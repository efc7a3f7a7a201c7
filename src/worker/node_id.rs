use crate::store::KvStore;
use tracing::info;

/// Hard ceiling on node ids created across the cluster's lifetime. Bounds
/// the number of `stream:<nodeId>` / `group:<nodeId>` key families that can
/// ever exist.
pub const MAX_NODE_IDS: i64 = 100;

const POOL_KEY: &str = "server:pool";
const COUNTER_KEY: &str = "server:counter";

/// Allocator for node identities, backed by a free pool (set) and a
/// monotone counter in the shared store.
///
/// Lifecycle:
/// 1. `acquire()` — pop a released id from the pool, else mint a fresh one
///    from the counter; fails once the counter would pass the ceiling
/// 2. `release()` — return the id to the pool on shutdown
#[derive(Clone)]
pub struct NodeIdAllocator {
    store: KvStore,
}

impl NodeIdAllocator {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub async fn acquire(&self) -> anyhow::Result<String> {
        if let Some(id) = self.store.spop(POOL_KEY).await? {
            info!("node_id: reusing released id, id={}", id);
            return Ok(id);
        }

        let n = self.store.incr(COUNTER_KEY).await?;
        if exceeds_ceiling(n) {
            anyhow::bail!("Maximum number of node IDs reached");
        }

        let id = format_node_id(n);
        info!("node_id: minted fresh id, id={}", id);
        Ok(id)
    }

    pub async fn release(&self, id: &str) -> anyhow::Result<()> {
        self.store.sadd(POOL_KEY, id).await?;
        info!("node_id: released, id={}", id);
        Ok(())
    }
}

fn format_node_id(n: i64) -> String {
    format!("node:{}", n)
}

fn exceeds_ceiling(counter: i64) -> bool {
    counter > MAX_NODE_IDS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_format() {
        assert_eq!(format_node_id(1), "node:1");
        assert_eq!(format_node_id(100), "node:100");
    }

    #[test]
    fn test_ceiling_is_inclusive_of_100() {
        assert!(!exceeds_ceiling(1));
        assert!(!exceeds_ceiling(100));
        // The 101st mint fails deterministically.
        assert!(exceeds_ceiling(101));
    }
}
