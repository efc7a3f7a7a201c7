use super::{now_ms, Decision};
use crate::error::GatewayError;
use crate::store::KvStore;

/// Weighted sliding window.
///
/// Blends the previous window's count into the current one based on how far
/// the clock is into the current window, eliminating the fixed-window
/// boundary burst at the cost of a linear-decay approximation:
///
///   estimated = previous * (1 - elapsed_ratio) + current
///
/// Counters carry a TTL of `2 * window` so the previous bucket is still
/// readable for a full window after it closes.
pub(super) async fn decide(
    store: &KvStore,
    app_id: &str,
    window: u64,
    requests: u64,
) -> Result<Decision, GatewayError> {
    let mut txn = store.txn().await?;

    loop {
        let now = now_ms();
        let current_bucket = now / 1000 / window;
        let current_key = key(app_id, current_bucket);
        let previous_key = key(app_id, current_bucket.saturating_sub(1));

        txn.watch(&[&current_key, &previous_key]).await?;
        let current = txn.get_u64(&current_key).await?.unwrap_or(0);
        let previous = txn.get_u64(&previous_key).await?.unwrap_or(0);

        let estimated = estimate(previous, current, elapsed_ratio(now, window));
        if estimated >= requests as f64 {
            txn.unwatch().await?;
            return Ok(Decision::Deny);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("INCR").arg(&current_key);
        if current == 0 {
            pipe.cmd("EXPIRE")
                .arg(&current_key)
                .arg((2 * window) as i64)
                .ignore();
        }

        if txn.exec(&pipe).await? {
            return Ok(Decision::Admit);
        }
    }
}

/// Fraction of the current window already elapsed, in `[0, 1)`.
fn elapsed_ratio(now_ms: u64, window: u64) -> f64 {
    let window_ms = window * 1000;
    (now_ms % window_ms) as f64 / window_ms as f64
}

fn estimate(previous: u64, current: u64, elapsed_ratio: f64) -> f64 {
    previous as f64 * (1.0 - elapsed_ratio) + current as f64
}

fn key(app_id: &str, bucket: u64) -> String {
    format!("{{sliding:{}}}:{}", app_id, bucket)
}
