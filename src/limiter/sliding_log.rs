use super::{now_ms, Decision};
use crate::error::GatewayError;
use crate::store::KvStore;

/// Sliding log.
///
/// A sorted set of admit timestamps (ms). Every call prunes entries older
/// than the window, then counts what remains — the most precise strategy,
/// with memory proportional to the observed rate. Score and member are both
/// `now`, so two admits in the same millisecond collapse into one member.
///
/// The prune runs before the WATCH: a watched key touched by its own
/// connection would abort the commit.
pub(super) async fn decide(
    store: &KvStore,
    app_id: &str,
    window: u64,
    requests: u64,
) -> Result<Decision, GatewayError> {
    let key = key(app_id);
    let mut txn = store.txn().await?;

    loop {
        let now = now_ms();

        txn.zrem_range_below(&key, window_floor(now, window)).await?;
        txn.watch(&[&key]).await?;
        let cardinality = txn.zcard(&key).await?;

        if cardinality >= requests {
            txn.unwatch().await?;
            return Ok(Decision::Deny);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("ZADD").arg(&key).arg(now).arg(now);
        pipe.cmd("EXPIRE").arg(&key).arg(window as i64).ignore();

        if txn.exec(&pipe).await? {
            return Ok(Decision::Admit);
        }
    }
}

/// Timestamps strictly below this score have left the window.
fn window_floor(now_ms: u64, window: u64) -> u64 {
    now_ms.saturating_sub(window * 1000)
}

fn key(app_id: &str) -> String {
    format!("{{log:{}}}", app_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_floor() {
        assert_eq!(window_floor(10_000, 2), 8_000);
        // Early clock values saturate instead of wrapping.
        assert_eq!(window_floor(500, 2), 0);
    }

    #[test]
    fn test_key_is_hash_tagged() {
        assert_eq!(key("app-1"), "{log:app-1}");
    }
}
