use crate::apps::{App, AppStore};
use crate::error::GatewayError;
use crate::limiter::RateLimiter;
use crate::outcome::{self, Outcome};
use crate::queue::{DeferredRequest, RequestStream};
use crate::store::{KvStore, StreamEntry};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// What became of one stream entry.
enum Processed {
    Completed(u16),
    Requeued,
}

/// One consumer in the node's group.
///
/// Cooperative loop: pull a small batch with a blocking read, and for each
/// entry re-consult the limiter with the app's current config (reloaded per
/// request, so config updates take effect between enqueue and replay).
/// Admitted entries are executed upstream and their outcome recorded;
/// re-denied entries go back to the tail of the stream with a refreshed
/// timestamp; anything that blows up is recorded as failed. Every path
/// acknowledges, so entries are either acked quickly or still pending under
/// this consumer's name. Upstream failures are never retried — the first
/// outcome is final.
pub struct Worker {
    store: KvStore,
    apps: AppStore,
    limiter: RateLimiter,
    stream: RequestStream,
    http: reqwest::Client,
    consumer: String,
    batch_size: usize,
    block_timeout: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: KvStore,
        apps: AppStore,
        limiter: RateLimiter,
        stream: RequestStream,
        http: reqwest::Client,
        consumer: String,
        batch_size: usize,
        block_timeout: Duration,
    ) -> Self {
        Self {
            store,
            apps,
            limiter,
            stream,
            http,
            consumer,
            batch_size,
            block_timeout,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Run until `cancel` fires. Blocking reads happen on a connection
    /// dedicated to this worker so they cannot stall other store users.
    pub async fn run(self, cancel: CancellationToken) {
        let mut read_conn = loop {
            match self.store.dedicated().await {
                Ok(conn) => break conn,
                Err(e) => {
                    error!(
                        "worker: failed to open read connection, consumer={}, error={}",
                        self.consumer, e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        };

        loop {
            let batch = tokio::select! {
                result = self.stream.read_batch(
                    &mut read_conn,
                    &self.consumer,
                    self.batch_size,
                    self.block_timeout,
                ) => result,
                _ = cancel.cancelled() => break,
            };

            let entries = match batch {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        "worker: read failed, consumer={}, error={}",
                        self.consumer, e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            };

            for entry in entries {
                self.process(&entry).await;
            }
        }

        debug!("worker: stopped, consumer={}", self.consumer);
    }

    /// Handle one entry end to end. The entry is acknowledged on every path
    /// so the stream drains; an entry that cannot even be decoded is logged
    /// and dropped (there is no ticket to record an outcome under).
    async fn process(&self, entry: &StreamEntry) {
        let request = match DeferredRequest::decode(&entry.payload) {
            Ok(request) => request,
            Err(e) => {
                error!(
                    "worker: dropping undecodable entry, id={}, error={}",
                    entry.id, e
                );
                self.ack(&entry.id).await;
                return;
            }
        };

        match self.execute(&request).await {
            Ok(Processed::Completed(status)) => {
                self.record(&request.ticket_id, &Outcome::Completed {
                    status_code: status,
                })
                .await;
                metrics::counter!(
                    "gateway_deferred_processed_total",
                    "result" => "completed",
                )
                .increment(1);
            }
            Ok(Processed::Requeued) => {
                metrics::counter!(
                    "gateway_deferred_processed_total",
                    "result" => "requeued",
                )
                .increment(1);
            }
            Err(e) => {
                warn!(
                    "worker: processing failed, ticket={}, app={}, error={}",
                    request.ticket_id, request.app_id, e
                );
                self.record(&request.ticket_id, &Outcome::Failed {
                    error: e.to_string(),
                })
                .await;
                metrics::counter!(
                    "gateway_deferred_processed_total",
                    "result" => "failed",
                )
                .increment(1);
            }
        }

        self.ack(&entry.id).await;
    }

    async fn execute(&self, request: &DeferredRequest) -> Result<Processed, GatewayError> {
        let app = self.apps.load(&request.app_id).await?;

        if !self.limiter.decide(&app.id, &app.rate_limit).await?.is_admit() {
            // Still over limit: back to the tail for a later pass. The
            // original entry is acked by the caller, preserving the
            // acked-or-pending invariant.
            self.stream.append(&request.refreshed()).await?;
            debug!(
                "worker: still over limit, requeued, ticket={}, app={}",
                request.ticket_id, request.app_id
            );
            return Ok(Processed::Requeued);
        }

        let status = self.call_upstream(&app, request).await?;
        Ok(Processed::Completed(status))
    }

    async fn call_upstream(
        &self,
        app: &App,
        request: &DeferredRequest,
    ) -> Result<u16, GatewayError> {
        let url = format!("{}/{}", app.base_url, request.path);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| GatewayError::Worker(format!("invalid method {}", request.method)))?;

        let mut builder = self
            .http
            .request(method, url.as_str())
            .headers(replay_headers(&request.headers));
        if let Some(body) = request.body_bytes()? {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        Ok(response.status().as_u16())
    }

    async fn record(&self, ticket_id: &str, result: &Outcome) {
        if let Err(e) = outcome::record(&self.store, ticket_id, result).await {
            error!(
                "worker: failed to record outcome, ticket={}, error={}",
                ticket_id, e
            );
        }
    }

    async fn ack(&self, entry_id: &str) {
        if let Err(e) = self.stream.ack(entry_id).await {
            error!("worker: ack failed, id={}, error={}", entry_id, e);
        }
    }
}

/// Stored headers minus the ones that must not be replayed: `host` follows
/// the upstream URL, and hop-by-hop/framing headers are re-derived by the
/// client.
fn replay_headers(headers: &HashMap<String, String>) -> reqwest::header::HeaderMap {
    use reqwest::header::{HeaderName, HeaderValue};

    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        if skip_on_replay(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    map
}

fn skip_on_replay(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "host"
            | "content-length"
            | "transfer-encoding"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_headers_keeps_authorization_verbatim() {
        let headers = HashMap::from([
            ("authorization".to_string(), "Bearer abc".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ]);
        let map = replay_headers(&headers);
        assert_eq!(map.get("authorization").unwrap(), "Bearer abc");
        assert_eq!(map.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn test_replay_headers_drops_framing_and_host() {
        let headers = HashMap::from([
            ("Host".to_string(), "old.example.com".to_string()),
            ("Content-Length".to_string(), "42".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("x-request-id".to_string(), "r-1".to_string()),
        ]);
        let map = replay_headers(&headers);
        assert!(map.get("host").is_none());
        assert!(map.get("content-length").is_none());
        assert!(map.get("connection").is_none());
        assert_eq!(map.get("x-request-id").unwrap(), "r-1");
    }

    #[test]
    fn test_replay_headers_skips_invalid_values() {
        let headers = HashMap::from([("x-bad".to_string(), "line\nbreak".to_string())]);
        let map = replay_headers(&headers);
        assert!(map.get("x-bad").is_none());
    }
}
