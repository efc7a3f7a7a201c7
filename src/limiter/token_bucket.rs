use super::{now_ms, Decision};
use crate::error::GatewayError;
use crate::store::KvStore;
use std::collections::HashMap;

/// Token bucket.
///
/// State is a single hash `{tokens, lastRefill}`. Tokens refill
/// continuously at `refill_rate` per second, clamped to `burst`; each admit
/// costs one token. A bucket first observed full (`tokens = burst`) allows
/// the configured burst immediately.
pub(super) async fn decide(
    store: &KvStore,
    app_id: &str,
    burst: u64,
    refill_rate: f64,
) -> Result<Decision, GatewayError> {
    let key = key(app_id);
    let ttl = state_ttl_secs(burst, refill_rate);
    let mut txn = store.txn().await?;

    loop {
        let now = now_ms();

        txn.watch(&[&key]).await?;
        let fields = txn.hgetall(&key).await?;
        let state = BucketState::from_fields(&fields, burst, now);

        let tokens = state.refilled(now, burst, refill_rate);
        if tokens < 1.0 {
            txn.unwatch().await?;
            return Ok(Decision::Deny);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET")
            .arg(&key)
            .arg("tokens")
            .arg(tokens - 1.0)
            .arg("lastRefill")
            .arg(now);
        pipe.cmd("EXPIRE").arg(&key).arg(ttl).ignore();

        if txn.exec(&pipe).await? {
            return Ok(Decision::Admit);
        }
    }
}

#[derive(Debug, PartialEq)]
struct BucketState {
    tokens: f64,
    last_refill: u64,
}

impl BucketState {
    /// Parse the stored hash; an absent hash is a bucket first observed
    /// full right now.
    fn from_fields(fields: &HashMap<String, String>, burst: u64, now: u64) -> Self {
        let tokens = fields
            .get("tokens")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(burst as f64);
        let last_refill = fields
            .get("lastRefill")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(now);
        Self {
            tokens,
            last_refill,
        }
    }

    /// Token count after refilling for the time since `last_refill`.
    fn refilled(&self, now: u64, burst: u64, refill_rate: f64) -> f64 {
        let elapsed_secs = now.saturating_sub(self.last_refill) as f64 / 1000.0;
        (self.tokens + elapsed_secs * refill_rate).min(burst as f64)
    }
}

/// State expires after twice the time a drained bucket needs to fill back
/// up, so dormant apps shed their state.
fn state_ttl_secs(burst: u64, refill_rate: f64) -> i64 {
    2 * (burst as f64 / refill_rate).ceil() as i64
}

fn key(app_id: &str) -> String {
    format!("{{bucket:{}}}", app_id)
}
