use crate::config::RateLimitConfig;
use crate::error::GatewayError;
use crate::store::KvStore;
use std::collections::HashMap;

/// A registered application: the unit of rate limiting and the routing
/// target for proxied requests. Managed by the external CRUD surface; the
/// gateway only ever reads it.
#[derive(Debug, Clone)]
pub struct App {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub rate_limit: RateLimitConfig,
    pub user_id: String,
}

impl App {
    /// Build an application from its KV hash fields. An empty hash means the
    /// app does not exist; a missing or malformed `rateLimit` field is a
    /// validation error (the management API should never have written it).
    pub fn from_fields(id: &str, fields: &HashMap<String, String>) -> Result<Self, GatewayError> {
        if fields.is_empty() {
            return Err(GatewayError::NotFound(format!("application {}", id)));
        }

        let base_url = fields
            .get("baseUrl")
            .ok_or_else(|| GatewayError::Validation("application has no baseUrl".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let rate_limit_raw = fields
            .get("rateLimit")
            .ok_or_else(|| GatewayError::Validation("application has no rateLimit".to_string()))?;
        let rate_limit: RateLimitConfig = serde_json::from_str(rate_limit_raw)
            .map_err(|e| GatewayError::Validation(format!("invalid rate limit config: {}", e)))?;
        rate_limit
            .validate()
            .map_err(GatewayError::Validation)?;

        Ok(Self {
            id: id.to_string(),
            name: fields.get("name").cloned().unwrap_or_default(),
            base_url,
            rate_limit,
            user_id: fields.get("userId").cloned().unwrap_or_default(),
        })
    }
}

/// Read-side repository over `app:<id>` hashes.
#[derive(Clone)]
pub struct AppStore {
    store: KvStore,
}

impl AppStore {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub fn key(app_id: &str) -> String {
        format!("app:{}", app_id)
    }

    /// Load an application by id. Always reads the store — workers rely on
    /// this to pick up config updates between a request being deferred and
    /// it being replayed.
    pub async fn load(&self, app_id: &str) -> Result<App, GatewayError> {
        let fields = self.store.hgetall(&Self::key(app_id)).await?;
        App::from_fields(app_id, &fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(base_url: &str, rate_limit: &str) -> HashMap<String, String> {
        HashMap::from([
            ("name".to_string(), "orders-api".to_string()),
            ("baseUrl".to_string(), base_url.to_string()),
            ("rateLimit".to_string(), rate_limit.to_string()),
            ("userId".to_string(), "u-1".to_string()),
        ])
    }

    #[test]
    fn test_from_fields_parses_app() {
        let app = App::from_fields(
            "app-1",
            &fields(
                "https://api.example.com",
                r#"{"strategy":"fixed_window","window":1,"requests":3}"#,
            ),
        )
        .unwrap();
        assert_eq!(app.id, "app-1");
        assert_eq!(app.name, "orders-api");
        assert_eq!(app.base_url, "https://api.example.com");
        assert_eq!(app.user_id, "u-1");
        assert_eq!(
            app.rate_limit,
            RateLimitConfig::FixedWindow {
                window: 1,
                requests: 3
            }
        );
    }

    #[test]
    fn test_from_fields_strips_trailing_slash() {
        let app = App::from_fields(
            "app-1",
            &fields(
                "https://api.example.com/",
                r#"{"strategy":"sliding_log","window":2,"requests":2}"#,
            ),
        )
        .unwrap();
        assert_eq!(app.base_url, "https://api.example.com");
    }

    #[test]
    fn test_from_fields_empty_hash_is_not_found() {
        let err = App::from_fields("ghost", &HashMap::new()).unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_from_fields_bad_rate_limit_is_validation() {
        let err = App::from_fields(
            "app-1",
            &fields("https://api.example.com", r#"{"strategy":"warp_drive"}"#),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_from_fields_rejects_invalid_values() {
        let err = App::from_fields(
            "app-1",
            &fields(
                "https://api.example.com",
                r#"{"strategy":"fixed_window","window":0,"requests":3}"#,
            ),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }
}
