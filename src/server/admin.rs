use super::GatewayState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            // Ready means the store answers for this node's stream.
            match state.pool.stream().len().await {
                Ok(backlog) => {
                    let workers = state.pool.worker_count().await;
                    let max_workers = state.config.load().workers.max_workers;
                    Ok(Response::builder()
                        .status(200)
                        .header("content-type", "application/json")
                        .body(full_body(format!(
                            r#"{{"status":"ready","node_id":"{}","workers":{},"max_workers":{},"stream_length":{}}}"#,
                            state.pool.node_id(),
                            workers,
                            max_workers,
                            backlog,
                        )))
                        .unwrap())
                }
                Err(e) => {
                    tracing::warn!("admin: readiness probe failed, error={}", e);
                    Ok(Response::builder()
                        .status(503)
                        .header("content-type", "application/json")
                        .body(full_body(r#"{"status":"unavailable"}"#))
                        .unwrap())
                }
            }
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
