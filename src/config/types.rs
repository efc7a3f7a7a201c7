use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
///
/// Business state (applications, their upstream base URLs and rate-limit
/// configs) lives in the shared KV store and is never read from this file;
/// only infrastructure settings are configured here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub limiter: LimiterConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub workers: WorkerPoolConfig,

    /// Key for the external session-token subsystem. Unused by the core.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}

/// KV store connection. When `url` is set it wins; otherwise the connection
/// is assembled from the individual parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
        }
    }
}

impl RedisConfig {
    /// Render the effective connection URL.
    pub fn connection_url(&self) -> String {
        if let Some(ref url) = self.url {
            return url.clone();
        }
        let auth = match self.password {
            Some(ref pw) => format!(":{}@", pw),
            None => String::new(),
        };
        format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.db)
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

/// Retry discipline for transient store errors (cluster redirects).
/// Optimistic-commit conflicts are retried immediately and are not bounded
/// by these settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Backpressure cap on the per-node stream. When exceeded, the pool
    /// manager trims idle surplus from the head (never past the oldest
    /// still-pending entry).
    #[serde(default = "default_max_stream_length")]
    pub max_stream_length: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_stream_length: default_max_stream_length(),
        }
    }
}

fn default_max_stream_length() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Backlog threshold `lo` for the scaling loop: spawn above it, retire
    /// below half of it.
    #[serde(default = "default_max_queued_requests")]
    pub max_queued_requests: u64,

    #[serde(default = "default_scale_interval")]
    pub scale_interval_secs: u64,

    /// Entries a worker pulls per read.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Block timeout of a worker's group read, in seconds.
    #[serde(default = "default_block_timeout")]
    pub block_timeout_secs: u64,

    /// Grace period between a worker's stop signal and consumer removal.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Pre-set node id (normally allocated from the shared pool).
    #[serde(default)]
    pub node_id: Option<String>,

    /// Pre-set consumer name for the first worker.
    #[serde(default)]
    pub consumer_id: Option<String>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_queued_requests: default_max_queued_requests(),
            scale_interval_secs: default_scale_interval(),
            batch_size: default_batch_size(),
            block_timeout_secs: default_block_timeout(),
            stop_grace_secs: default_stop_grace(),
            node_id: None,
            consumer_id: None,
        }
    }
}

fn default_max_workers() -> usize {
    10
}

fn default_max_queued_requests() -> u64 {
    100
}

fn default_scale_interval() -> u64 {
    5
}

fn default_batch_size() -> usize {
    3
}

fn default_block_timeout() -> u64 {
    5
}

fn default_stop_grace() -> u64 {
    1
}

/// Per-application rate-limit configuration, stored as a JSON string in the
/// application's KV hash. The `strategy` tag selects the limiter; unknown
/// tags are rejected at parse time and surface as a validation error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RateLimitConfig {
    FixedWindow {
        window: u64,
        requests: u64,
    },
    SlidingWindow {
        window: u64,
        requests: u64,
    },
    TokenBucket {
        window: u64,
        requests: u64,
        burst: Option<u64>,
        #[serde(rename = "refillRate")]
        refill_rate: Option<f64>,
    },
    LeakyBucket {
        window: u64,
        requests: u64,
        #[serde(rename = "leakRate")]
        leak_rate: Option<f64>,
    },
    SlidingLog {
        window: u64,
        requests: u64,
    },
}

impl RateLimitConfig {
    pub fn strategy(&self) -> &'static str {
        match self {
            RateLimitConfig::FixedWindow { .. } => "fixed_window",
            RateLimitConfig::SlidingWindow { .. } => "sliding_window",
            RateLimitConfig::TokenBucket { .. } => "token_bucket",
            RateLimitConfig::LeakyBucket { .. } => "leaky_bucket",
            RateLimitConfig::SlidingLog { .. } => "sliding_log",
        }
    }

    pub fn window(&self) -> u64 {
        match *self {
            RateLimitConfig::FixedWindow { window, .. }
            | RateLimitConfig::SlidingWindow { window, .. }
            | RateLimitConfig::TokenBucket { window, .. }
            | RateLimitConfig::LeakyBucket { window, .. }
            | RateLimitConfig::SlidingLog { window, .. } => window,
        }
    }

    pub fn requests(&self) -> u64 {
        match *self {
            RateLimitConfig::FixedWindow { requests, .. }
            | RateLimitConfig::SlidingWindow { requests, .. }
            | RateLimitConfig::TokenBucket { requests, .. }
            | RateLimitConfig::LeakyBucket { requests, .. }
            | RateLimitConfig::SlidingLog { requests, .. } => requests,
        }
    }

    /// Structural validation beyond what serde enforces. A config is always
    /// checked before a decision is made with it.
    pub fn validate(&self) -> Result<(), String> {
        if self.window() == 0 {
            return Err("window must be positive".to_string());
        }
        if self.requests() == 0 {
            return Err("requests must be positive".to_string());
        }
        match *self {
            RateLimitConfig::TokenBucket {
                burst, refill_rate, ..
            } => {
                if burst == Some(0) {
                    return Err("burst must be positive".to_string());
                }
                if refill_rate.is_some_and(|r| r <= 0.0) {
                    return Err("refillRate must be positive".to_string());
                }
            }
            RateLimitConfig::LeakyBucket { leak_rate, .. } => {
                if leak_rate.is_some_and(|r| r <= 0.0) {
                    return Err("leakRate must be positive".to_string());
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_window_parse() {
        let json = r#"{"strategy": "fixed_window", "window": 60, "requests": 100}"#;
        let cfg: RateLimitConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            cfg,
            RateLimitConfig::FixedWindow {
                window: 60,
                requests: 100
            }
        );
        assert_eq!(cfg.strategy(), "fixed_window");
        assert_eq!(cfg.window(), 60);
        assert_eq!(cfg.requests(), 100);
    }

    #[test]
    fn test_token_bucket_parse_camel_case_fields() {
        let json = r#"{
            "strategy": "token_bucket",
            "window": 60,
            "requests": 10,
            "burst": 5,
            "refillRate": 2.0
        }"#;
        let cfg: RateLimitConfig = serde_json::from_str(json).unwrap();
        match cfg {
            RateLimitConfig::TokenBucket {
                window,
                requests,
                burst,
                refill_rate,
            } => {
                assert_eq!(window, 60);
                assert_eq!(requests, 10);
                assert_eq!(burst, Some(5));
                assert_eq!(refill_rate, Some(2.0));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_token_bucket_optional_fields_absent() {
        let json = r#"{"strategy": "token_bucket", "window": 60, "requests": 10}"#;
        let cfg: RateLimitConfig = serde_json::from_str(json).unwrap();
        match cfg {
            RateLimitConfig::TokenBucket {
                burst, refill_rate, ..
            } => {
                assert_eq!(burst, None);
                assert_eq!(refill_rate, None);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_leaky_bucket_parse() {
        let json =
            r#"{"strategy": "leaky_bucket", "window": 30, "requests": 20, "leakRate": 0.5}"#;
        let cfg: RateLimitConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            cfg,
            RateLimitConfig::LeakyBucket {
                window: 30,
                requests: 20,
                leak_rate: Some(0.5)
            }
        );
    }

    #[test]
    fn test_sliding_variants_parse() {
        let sw: RateLimitConfig =
            serde_json::from_str(r#"{"strategy": "sliding_window", "window": 10, "requests": 5}"#)
                .unwrap();
        assert_eq!(sw.strategy(), "sliding_window");

        let sl: RateLimitConfig =
            serde_json::from_str(r#"{"strategy": "sliding_log", "window": 2, "requests": 2}"#)
                .unwrap();
        assert_eq!(sl.strategy(), "sliding_log");
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let json = r#"{"strategy": "random_drop", "window": 60, "requests": 100}"#;
        assert!(serde_json::from_str::<RateLimitConfig>(json).is_err());
    }

    #[test]
    fn test_missing_strategy_rejected() {
        let json = r#"{"window": 60, "requests": 100}"#;
        assert!(serde_json::from_str::<RateLimitConfig>(json).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let cfg = RateLimitConfig::FixedWindow {
            window: 0,
            requests: 5,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_requests() {
        let cfg = RateLimitConfig::SlidingLog {
            window: 5,
            requests: 0,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_rates() {
        let cfg = RateLimitConfig::TokenBucket {
            window: 60,
            requests: 10,
            burst: Some(0),
            refill_rate: None,
        };
        assert!(cfg.validate().is_err());

        let cfg = RateLimitConfig::TokenBucket {
            window: 60,
            requests: 10,
            burst: None,
            refill_rate: Some(-1.0),
        };
        assert!(cfg.validate().is_err());

        let cfg = RateLimitConfig::LeakyBucket {
            window: 60,
            requests: 10,
            leak_rate: Some(0.0),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rate_limit_roundtrip() {
        let cfg = RateLimitConfig::TokenBucket {
            window: 60,
            requests: 10,
            burst: Some(5),
            refill_rate: Some(2.0),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains(r#""strategy":"token_bucket""#));
        assert!(json.contains(r#""refillRate""#));
        let back: RateLimitConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_gateway_config_defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.server.listen, "0.0.0.0:8080");
        assert_eq!(cfg.server.admin_listen, "0.0.0.0:9091");
        assert_eq!(cfg.redis.host, "127.0.0.1");
        assert_eq!(cfg.redis.port, 6379);
        assert_eq!(cfg.redis.db, 0);
        assert!(cfg.redis.url.is_none());
        assert_eq!(cfg.limiter.max_retries, 3);
        assert_eq!(cfg.limiter.retry_delay_secs, 5);
        assert_eq!(cfg.queue.max_stream_length, 10_000);
        assert_eq!(cfg.workers.max_workers, 10);
        assert_eq!(cfg.workers.max_queued_requests, 100);
        assert_eq!(cfg.workers.scale_interval_secs, 5);
        assert_eq!(cfg.workers.batch_size, 3);
        assert_eq!(cfg.workers.block_timeout_secs, 5);
        assert_eq!(cfg.workers.stop_grace_secs, 1);
        assert!(cfg.workers.node_id.is_none());
        assert!(cfg.workers.consumer_id.is_none());
        assert!(cfg.jwt_secret.is_none());
    }

    #[test]
    fn test_redis_connection_url_from_parts() {
        let redis = RedisConfig {
            url: None,
            host: "kv.internal".to_string(),
            port: 6380,
            password: Some("hunter2".to_string()),
            db: 3,
        };
        assert_eq!(redis.connection_url(), "redis://:hunter2@kv.internal:6380/3");

        let plain = RedisConfig::default();
        assert_eq!(plain.connection_url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn test_redis_connection_url_prefers_explicit_url() {
        let redis = RedisConfig {
            url: Some("redis://cache:6379/1".to_string()),
            ..RedisConfig::default()
        };
        assert_eq!(redis.connection_url(), "redis://cache:6379/1");
    }
}
