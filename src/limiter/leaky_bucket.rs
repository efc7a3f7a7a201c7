use super::{now_ms, Decision};
use crate::error::GatewayError;
use crate::store::KvStore;
use std::collections::HashMap;

/// Leaky bucket.
///
/// State is a hash `{count, lastLeak}`. The bucket drains at `leak_rate`
/// units per second (whole units only — `floor(elapsed_secs * leak_rate)`,
/// which under-leaks at sub-second granularity); each admit adds one unit.
/// A full bucket (`count >= requests`) denies.
pub(super) async fn decide(
    store: &KvStore,
    app_id: &str,
    requests: u64,
    leak_rate: f64,
) -> Result<Decision, GatewayError> {
    let key = key(app_id);
    let ttl = state_ttl_secs(requests, leak_rate);
    let mut txn = store.txn().await?;

    loop {
        let now = now_ms();

        txn.watch(&[&key]).await?;
        let fields = txn.hgetall(&key).await?;
        let state = BucketState::from_fields(&fields, now);

        let count = state.leaked(now, leak_rate);
        if count >= requests {
            txn.unwatch().await?;
            return Ok(Decision::Deny);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET")
            .arg(&key)
            .arg("count")
            .arg(count + 1)
            .arg("lastLeak")
            .arg(now);
        pipe.cmd("EXPIRE").arg(&key).arg(ttl).ignore();

        if txn.exec(&pipe).await? {
            return Ok(Decision::Admit);
        }
    }
}

#[derive(Debug, PartialEq)]
struct BucketState {
    count: u64,
    last_leak: u64,
}

impl BucketState {
    fn from_fields(fields: &HashMap<String, String>, now: u64) -> Self {
        let count = fields
            .get("count")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let last_leak = fields
            .get("lastLeak")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(now);
        Self { count, last_leak }
    }

    /// Bucket level after draining whole units for the elapsed time.
    fn leaked(&self, now: u64, leak_rate: f64) -> u64 {
        let elapsed_secs = now.saturating_sub(self.last_leak) as f64 / 1000.0;
        let drained = (elapsed_secs * leak_rate).floor() as u64;
        self.count.saturating_sub(drained)
    }
}

/// State expires after twice the time a full bucket needs to drain.
fn state_ttl_secs(requests: u64, leak_rate: f64) -> i64 {
    2 * (requests as f64 / leak_rate).ceil() as i64
}

fn key(app_id: &str) -> String {
    format!("{{leaky:{}}}", app_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(count: u64, last_leak: u64) -> HashMap<String, String> {
        HashMap::from([
            ("count".to_string(), count.to_string()),
            ("lastLeak".to_string(), last_leak.to_string()),
        ])
    }

    #[test]
    fn test_fresh_bucket_is_empty() {
        let state = BucketState::from_fields(&HashMap::new(), 42_000);
        assert_eq!(state.count, 0);
        assert_eq!(state.last_leak, 42_000);
        assert_eq!(state.leaked(42_000, 1.0), 0);
    }

    #[test]
    fn test_leak_drains_whole_units() {
        let state = BucketState::from_fields(&stored(10, 0), 0);
        // 2.5s at 1/s drains exactly 2 (floor).
        assert_eq!(state.leaked(2_500, 1.0), 8);
    }

    #[test]
    fn test_sub_second_elapsed_under_leaks() {
        let state = BucketState::from_fields(&stored(10, 0), 0);
        // 0.9s at 1/s drains nothing.
        assert_eq!(state.leaked(900, 1.0), 10);
    }

    #[test]
    fn test_leak_saturates_at_zero() {
        let state = BucketState::from_fields(&stored(3, 0), 0);
        assert_eq!(state.leaked(3_600_000, 2.0), 0);
    }

    #[test]
    fn test_state_ttl() {
        assert_eq!(state_ttl_secs(20, 0.5), 80);
        assert_eq!(state_ttl_secs(10, 1.0), 20);
    }

    #[test]
    fn test_key_is_hash_tagged() {
        assert_eq!(key("app-1"), "{leaky:app-1}");
    }
}
