use crate::error::GatewayError;
use crate::store::{KvStore, StreamEntry};
use base64::Engine;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Stream entries carry the serialized request under this single field.
const PAYLOAD_FIELD: &str = "payload";

/// A request that was denied by the limiter and parked for deferred
/// execution. The ticket id is the client's handle for status polling.
///
/// Headers are stored verbatim, including any `authorization` the client
/// sent — the worker replays the request as received. The body is base64
/// so the record survives JSON transport; bodyless methods store `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredRequest {
    pub ticket_id: String,
    pub app_id: String,
    pub method: String,
    /// Path relative to the app's base URL, without a leading slash.
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub enqueued_at: u64,
}

impl DeferredRequest {
    pub fn new(
        app_id: &str,
        method: &str,
        path: &str,
        headers: HashMap<String, String>,
        body: Option<&[u8]>,
    ) -> Self {
        Self {
            ticket_id: uuid::Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            method: method.to_string(),
            path: path.trim_start_matches('/').to_string(),
            headers,
            body: body.map(|b| base64::engine::general_purpose::STANDARD.encode(b)),
            enqueued_at: now_ms(),
        }
    }

    pub fn body_bytes(&self) -> Result<Option<Vec<u8>>, GatewayError> {
        match self.body {
            Some(ref encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|e| GatewayError::Worker(format!("invalid request body encoding: {}", e))),
            None => Ok(None),
        }
    }

    pub fn encode(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self)
            .map_err(|e| GatewayError::Worker(format!("request serialization failed: {}", e)))
    }

    pub fn decode(payload: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(payload)
            .map_err(|e| GatewayError::Worker(format!("malformed deferred request: {}", e)))
    }

    /// A copy stamped with the current time, for re-appending a record the
    /// limiter denied again.
    pub fn refreshed(&self) -> Self {
        Self {
            enqueued_at: now_ms(),
            ..self.clone()
        }
    }
}

/// What the backpressure pass should do to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrimAction {
    Keep,
    /// Drop everything older than this entry id (the oldest still-pending
    /// one — in-flight work is preserved, only idle surplus goes).
    ToMinId(String),
    /// Nothing is pending; cut straight down to the cap.
    ToMaxLen(u64),
}

/// Decide the trim for an observed stream length. Pure so the boundary
/// cases are testable without a store.
pub fn trim_action(len: u64, max_len: u64, oldest_pending: Option<String>) -> TrimAction {
    if len <= max_len {
        return TrimAction::Keep;
    }
    match oldest_pending {
        Some(id) => TrimAction::ToMinId(id),
        None => TrimAction::ToMaxLen(max_len),
    }
}

/// This node's append-only log of deferred requests, with one consumer
/// group shared by the node's workers. Entries are delivered to exactly one
/// consumer and stay pending under its name until acknowledged.
#[derive(Clone)]
pub struct RequestStream {
    store: KvStore,
    stream_key: String,
    group_key: String,
}

impl RequestStream {
    pub fn new(store: KvStore, node_id: &str) -> Self {
        Self {
            store,
            stream_key: stream_key_for(node_id),
            group_key: group_key_for(node_id),
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    /// Create the consumer group (cursor `0`, MKSTREAM). Idempotent.
    pub async fn create_group(&self) -> Result<(), GatewayError> {
        self.store
            .xgroup_create(&self.stream_key, &self.group_key)
            .await?;
        Ok(())
    }

    /// Append a request to the tail. Returns the store-assigned entry id.
    pub async fn append(&self, request: &DeferredRequest) -> Result<String, GatewayError> {
        let payload = request.encode()?;
        let id = self
            .store
            .xadd(&self.stream_key, PAYLOAD_FIELD, &payload)
            .await?;
        Ok(id)
    }

    /// Blocking group read on the caller's dedicated connection.
    pub async fn read_batch(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, GatewayError> {
        Ok(self
            .store
            .xread_group(
                conn,
                &self.stream_key,
                &self.group_key,
                consumer,
                PAYLOAD_FIELD,
                count,
                block,
            )
            .await?)
    }

    pub async fn ack(&self, entry_id: &str) -> Result<(), GatewayError> {
        self.store
            .xack(&self.stream_key, &self.group_key, entry_id)
            .await?;
        Ok(())
    }

    pub async fn len(&self) -> Result<u64, GatewayError> {
        Ok(self.store.xlen(&self.stream_key).await?)
    }

    pub async fn oldest_pending_id(&self) -> Result<Option<String>, GatewayError> {
        Ok(self
            .store
            .xpending_min_id(&self.stream_key, &self.group_key)
            .await?)
    }

    /// Enforce the length cap: trim idle surplus from the head, never past
    /// the oldest still-pending entry. Returns the number of entries
    /// dropped.
    pub async fn enforce_max_len(&self, max_len: u64) -> Result<u64, GatewayError> {
        let len = self.len().await?;
        let action = trim_action(len, max_len, self.oldest_pending_id().await?);
        let trimmed = match action {
            TrimAction::Keep => 0,
            TrimAction::ToMinId(ref id) => self.store.xtrim_min_id(&self.stream_key, id).await?,
            TrimAction::ToMaxLen(cap) => self.store.xtrim_max_len(&self.stream_key, cap).await?,
        };
        Ok(trimmed)
    }

    pub async fn delete_consumer(&self, consumer: &str) -> Result<(), GatewayError> {
        self.store
            .xgroup_del_consumer(&self.stream_key, &self.group_key, consumer)
            .await?;
        Ok(())
    }
}

fn stream_key_for(node_id: &str) -> String {
    format!("stream:{}", node_id)
}

fn group_key_for(node_id: &str) -> String {
    format!("group:{}", node_id)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_request_roundtrip() {
        let req = DeferredRequest::new(
            "app-1",
            "POST",
            "v1/orders",
            HashMap::from([("content-type".to_string(), "application/json".to_string())]),
            Some(br#"{"qty":2}"#),
        );
        let payload = req.encode().unwrap();
        let back = DeferredRequest::decode(&payload).unwrap();
        assert_eq!(back, req);
        assert_eq!(back.body_bytes().unwrap().unwrap(), br#"{"qty":2}"#);
    }

    #[test]
    fn test_ticket_ids_are_unique() {
        let a = DeferredRequest::new("app", "GET", "x", HashMap::new(), None);
        let b = DeferredRequest::new("app", "GET", "x", HashMap::new(), None);
        assert_ne!(a.ticket_id, b.ticket_id);
    }

    #[test]
    fn test_path_is_stored_relative() {
        let req = DeferredRequest::new("app", "GET", "/v1/users", HashMap::new(), None);
        assert_eq!(req.path, "v1/users");
    }

    #[test]
    fn test_bodyless_request_stays_bodyless() {
        let req = DeferredRequest::new("app", "GET", "v1/users", HashMap::new(), None);
        assert!(req.body.is_none());
        assert!(req.body_bytes().unwrap().is_none());
    }

    #[test]
    fn test_refreshed_keeps_identity_and_restamps() {
        let req = DeferredRequest {
            ticket_id: "t-1".to_string(),
            app_id: "app".to_string(),
            method: "GET".to_string(),
            path: "x".to_string(),
            headers: HashMap::new(),
            body: None,
            enqueued_at: 1,
        };
        let refreshed = req.refreshed();
        assert_eq!(refreshed.ticket_id, "t-1");
        assert!(refreshed.enqueued_at > 1);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(DeferredRequest::decode("not json").is_err());
    }

    #[test]
    fn test_trim_action_under_cap_keeps() {
        assert_eq!(trim_action(10, 100, None), TrimAction::Keep);
        assert_eq!(trim_action(100, 100, Some("1-0".into())), TrimAction::Keep);
    }

    #[test]
    fn test_trim_action_preserves_pending() {
        assert_eq!(
            trim_action(101, 100, Some("42-0".into())),
            TrimAction::ToMinId("42-0".into())
        );
    }

    #[test]
    fn test_trim_action_idle_stream_cuts_to_cap() {
        assert_eq!(trim_action(101, 100, None), TrimAction::ToMaxLen(100));
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(stream_key_for("node:3"), "stream:node:3");
        assert_eq!(group_key_for("node:3"), "group:node:3");
    }
}
