pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — allowing the gateway to start with zero configuration for
    /// local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let ext = path.extension().and_then(|e| e.to_str());
            Self::parse(&content, ext)?
        } else {
            tracing::info!(
                "config: file not found at {}, using defaults",
                path.display()
            );
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str, ext: Option<&str>) -> Result<Self> {
        match ext {
            Some("toml") => Ok(toml::from_str(content)?),
            Some("json") => Ok(serde_json::from_str(content)?),
            Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
            None => anyhow::bail!("config file has no extension, use .toml or .json"),
        }
    }

    /// Apply environment variable overrides for connection and node
    /// identity settings. Application state (upstream base URLs, rate-limit
    /// configs) is managed exclusively through the KV store.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.redis.url = Some(v);
        }
        if let Ok(v) = std::env::var("REDIS_HOST") {
            self.redis.host = v;
        }
        if let Ok(v) = std::env::var("REDIS_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.redis.port = n;
            }
        }
        if let Ok(v) = std::env::var("REDIS_PASSWORD") {
            self.redis.password = Some(v);
        }
        if let Ok(v) = std::env::var("REDIS_DB") {
            if let Ok(n) = v.parse::<i64>() {
                self.redis.db = n;
            }
        }

        // PORT rewrites only the port of the listen address.
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(port) = v.parse::<u16>() {
                let host = self
                    .server
                    .listen
                    .rsplit_once(':')
                    .map(|(h, _)| h.to_string())
                    .unwrap_or_else(|| "0.0.0.0".to_string());
                self.server.listen = format!("{}:{}", host, port);
            }
        }

        if let Ok(v) = std::env::var("JWT_SECRET") {
            self.jwt_secret = Some(v);
        }

        // Node identity, normally allocated from the shared pool; the
        // manager hands CONSUMER_ID to the first worker it spawns.
        if let Ok(v) = std::env::var("SERVER_ID") {
            self.workers.node_id = Some(v);
        }
        if let Ok(v) = std::env::var("CONSUMER_ID") {
            self.workers.consumer_id = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("server.listen is not a valid socket address");
        }
        if self
            .server
            .admin_listen
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            anyhow::bail!("server.admin_listen is not a valid socket address");
        }
        if self.workers.max_workers == 0 {
            anyhow::bail!("workers.max_workers must be at least 1");
        }
        if self.workers.batch_size == 0 {
            anyhow::bail!("workers.batch_size must be at least 1");
        }
        if self.queue.max_stream_length == 0 {
            anyhow::bail!("queue.max_stream_length must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:3000"

            [redis]
            host = "kv.internal"
            port = 6380

            [workers]
            max_workers = 4
        "#;
        let cfg = GatewayConfig::parse(toml, Some("toml")).unwrap();
        assert_eq!(cfg.server.listen, "127.0.0.1:3000");
        assert_eq!(cfg.server.admin_listen, "0.0.0.0:9091");
        assert_eq!(cfg.redis.host, "kv.internal");
        assert_eq!(cfg.redis.port, 6380);
        assert_eq!(cfg.workers.max_workers, 4);
        assert_eq!(cfg.workers.max_queued_requests, 100);
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"queue": {"max_stream_length": 500}}"#;
        let cfg = GatewayConfig::parse(json, Some("json")).unwrap();
        assert_eq!(cfg.queue.max_stream_length, 500);
    }

    #[test]
    fn test_parse_rejects_unknown_extension() {
        assert!(GatewayConfig::parse("{}", Some("yaml")).is_err());
        assert!(GatewayConfig::parse("{}", None).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_listen() {
        let mut cfg = GatewayConfig::default();
        cfg.server.listen = "not-an-addr".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut cfg = GatewayConfig::default();
        cfg.workers.max_workers = 0;
        assert!(cfg.validate().is_err());
    }
}
