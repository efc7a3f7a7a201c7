use super::{now_ms, Decision};
use crate::error::GatewayError;
use crate::store::KvStore;

/// Fixed window counter.
///
/// The window flips abruptly at `window`-second boundaries, so a burst of
/// up to `2 * requests` across a boundary is possible — the strategy's
/// known trade-off in exchange for a single counter per window.
pub(super) async fn decide(
    store: &KvStore,
    app_id: &str,
    window: u64,
    requests: u64,
) -> Result<Decision, GatewayError> {
    let mut txn = store.txn().await?;

    loop {
        let key = key(app_id, bucket(now_ms() / 1000, window));

        txn.watch(&[&key]).await?;
        let count = txn.get_u64(&key).await?.unwrap_or(0);

        if count >= requests {
            txn.unwatch().await?;
            return Ok(Decision::Deny);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("INCR").arg(&key);
        if count == 0 {
            // TTL only on the window's first write.
            pipe.cmd("EXPIRE").arg(&key).arg(window as i64).ignore();
        }

        if txn.exec(&pipe).await? {
            return Ok(Decision::Admit);
        }
    }
}

/// Window index for a given wall-clock second.
fn bucket(now_secs: u64, window: u64) -> u64 {
    now_secs / window
}

fn key(app_id: &str, bucket: u64) -> String {
    format!("{{fixed:{}}}:{}", app_id, bucket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_is_stable_within_window() {
        assert_eq!(bucket(120, 60), bucket(179, 60));
        assert_ne!(bucket(179, 60), bucket(180, 60));
    }

    #[test]
    fn test_bucket_one_second_window() {
        assert_eq!(bucket(5, 1), 5);
        assert_eq!(bucket(6, 1), 6);
    }

    #[test]
    fn test_key_is_hash_tagged_per_app() {
        assert_eq!(key("app-1", 29), "{fixed:app-1}:29");
        // Different windows of the same app share the hash tag (one shard),
        // different apps do not.
        assert!(key("app-1", 30).starts_with("{fixed:app-1}"));
        assert_ne!(key("app-1", 29), key("app-2", 29));
    }
}
