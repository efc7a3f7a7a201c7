use crate::error::GatewayError;
use crate::store::KvStore;
use serde::{Deserialize, Serialize};

/// Outcomes live 48 hours; after that a ticket reads as pending again and
/// the client has lost its window to collect the result.
pub const OUTCOME_TTL_SECS: u64 = 48 * 60 * 60;

/// The recorded result of a deferred request, keyed by ticket id. Absence
/// of the record is the `pending` state; it is never materialised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Completed {
        #[serde(rename = "statusCode")]
        status_code: u16,
    },
    Failed {
        error: String,
    },
}

pub fn key(ticket_id: &str) -> String {
    format!("response:{}", ticket_id)
}

/// Record the outcome for a ticket. First write wins in practice: workers
/// only write once per entry, and subsequent status reads return the stored
/// value unchanged until TTL expiry.
pub async fn record(store: &KvStore, ticket_id: &str, outcome: &Outcome) -> Result<(), GatewayError> {
    let payload = serde_json::to_string(outcome)
        .map_err(|e| GatewayError::Worker(format!("outcome serialization failed: {}", e)))?;
    store.set_ex(&key(ticket_id), &payload, OUTCOME_TTL_SECS).await?;
    Ok(())
}

/// Fetch the stored outcome JSON for a ticket, verbatim. `None` is pending.
pub async fn fetch_raw(store: &KvStore, ticket_id: &str) -> Result<Option<String>, GatewayError> {
    Ok(store.get_string(&key(ticket_id)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_wire_format() {
        let outcome = Outcome::Completed { status_code: 204 };
        let json = serde_json::to_string(&outcome).unwrap();
        assert_eq!(json, r#"{"status":"completed","statusCode":204}"#);
        let back: Outcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn test_failed_wire_format() {
        let outcome = Outcome::Failed {
            error: "connection refused".to_string(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert_eq!(
            json,
            r#"{"status":"failed","error":"connection refused"}"#
        );
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(key("t-123"), "response:t-123");
    }
}
