mod fixed_window;
mod leaky_bucket;
mod sliding_log;
mod sliding_window;
mod token_bucket;

use crate::config::RateLimitConfig;
use crate::error::GatewayError;
use crate::store::KvStore;
use std::time::{SystemTime, UNIX_EPOCH};

/// The two outputs of a rate-limit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Deny,
}

impl Decision {
    pub fn is_admit(self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// The rate-limit decision engine.
///
/// All strategies follow the same outer protocol: read the limiter state
/// under a WATCH, compute the decision, and commit the state update in an
/// atomic batch only when admitting. A commit that loses to a concurrent
/// writer retries immediately (progress of at least one contender is
/// guaranteed); a deny releases the watch and returns without mutating.
///
/// State keys are hash-tagged per (strategy, app) so a clustered store
/// routes them to one shard, which is what makes the multi-key commit
/// valid. Dormant apps shed their state through TTLs proportional to the
/// configured window.
#[derive(Clone)]
pub struct RateLimiter {
    store: KvStore,
}

impl RateLimiter {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Decide admit/deny for one request against `app_id`'s config. The
    /// config is immutable for the duration of the decision; callers reload
    /// it per request.
    pub async fn decide(
        &self,
        app_id: &str,
        config: &RateLimitConfig,
    ) -> Result<Decision, GatewayError> {
        let decision = match *config {
            RateLimitConfig::FixedWindow { window, requests } => {
                fixed_window::decide(&self.store, app_id, window, requests).await?
            }
            RateLimitConfig::SlidingWindow { window, requests } => {
                sliding_window::decide(&self.store, app_id, window, requests).await?
            }
            RateLimitConfig::TokenBucket {
                requests,
                burst,
                refill_rate,
                ..
            } => {
                token_bucket::decide(
                    &self.store,
                    app_id,
                    burst.unwrap_or(requests),
                    refill_rate.unwrap_or(1.0),
                )
                .await?
            }
            RateLimitConfig::LeakyBucket {
                requests,
                leak_rate,
                ..
            } => {
                leaky_bucket::decide(&self.store, app_id, requests, leak_rate.unwrap_or(1.0))
                    .await?
            }
            RateLimitConfig::SlidingLog { window, requests } => {
                sliding_log::decide(&self.store, app_id, window, requests).await?
            }
        };

        match decision {
            Decision::Admit => {
                metrics::counter!(
                    "gateway_rate_limit_admitted_total",
                    "strategy" => config.strategy(),
                )
                .increment(1);
            }
            Decision::Deny => {
                metrics::counter!(
                    "gateway_rate_limit_denied_total",
                    "strategy" => config.strategy(),
                )
                .increment(1);
            }
        }

        Ok(decision)
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
