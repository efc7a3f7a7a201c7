use std::fmt;

/// Error taxonomy for the gateway core.
///
/// Only `Store` errors are ever retried (bounded, inside the KV adapter);
/// everything else propagates to the caller immediately. The HTTP layer
/// maps variants to status codes via [`GatewayError::status_code`] and never
/// exposes store internals to clients.
#[derive(Debug)]
pub enum GatewayError {
    /// Malformed rate-limit config or request payload.
    Validation(String),
    /// Unknown application id or ticket.
    NotFound(String),
    /// KV store failure that survived the bounded retry.
    Store(redis::RedisError),
    /// Upstream call failed before a status code was produced.
    Upstream(reqwest::Error),
    /// Failure inside a worker while processing a deferred request.
    Worker(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Validation(msg) => write!(f, "validation error: {}", msg),
            GatewayError::NotFound(what) => write!(f, "not found: {}", what),
            GatewayError::Store(e) => write!(f, "store error: {}", e),
            GatewayError::Upstream(e) => write!(f, "upstream error: {}", e),
            GatewayError::Worker(msg) => write!(f, "worker error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Store(e) => Some(e),
            GatewayError::Upstream(e) => Some(e),
            _ => None,
        }
    }
}

impl GatewayError {
    /// Client-facing status code. Messages for 5xx classes are generic;
    /// the original cause only reaches the internal logs.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::NotFound(_) => 404,
            GatewayError::Store(_) => 500,
            GatewayError::Upstream(_) => 502,
            GatewayError::Worker(_) => 500,
        }
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(e: redis::RedisError) -> Self {
        GatewayError::Store(e)
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Upstream(e)
    }
}
