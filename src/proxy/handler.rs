use crate::apps::App;
use crate::error::GatewayError;
use crate::outcome;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::queue::DeferredRequest;
use crate::server::GatewayState;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Handle an incoming HTTP request through a phased lifecycle:
///
/// 1. ROUTE    — `/apis/status/<ticket>` or `/apis/<app>/<tail>`
/// 2. LOOKUP   — load the application from the KV store
/// 3. DECIDE   — consult the rate-limit engine
/// 4. FORWARD  — admitted: proxy inline and relay the upstream response
///    ENQUEUE  — denied: park the request on this node's stream, 202
/// 5. LOG      — finalize metrics, one access-log line
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();

    match route(&path) {
        Route::Status { ticket_id } => {
            if req.method() != &http::Method::GET {
                return Ok(plain_error(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "method not allowed",
                ));
            }
            Ok(handle_status(&state, &ticket_id).await)
        }
        Route::Proxy { app_id, tail } => {
            handle_proxy(req, state, peer_addr, app_id, tail).await
        }
        Route::NotFound => {
            debug!("proxy: no route matched, path={}", path);
            Ok(plain_error(StatusCode::NOT_FOUND, "not found"))
        }
    }
}

/// Status polling (read-only): the stored outcome verbatim, or `pending`
/// when no outcome has been recorded for the ticket.
async fn handle_status(state: &GatewayState, ticket_id: &str) -> Response<BoxBody> {
    match outcome::fetch_raw(&state.store, ticket_id).await {
        Ok(Some(stored)) => json_response(StatusCode::OK, stored),
        Ok(None) => json_response(StatusCode::OK, r#"{"status":"pending"}"#.to_string()),
        Err(e) => {
            warn!("status: outcome read failed, ticket={}, error={}", ticket_id, e);
            plain_error(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

async fn handle_proxy(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
    app_id: String,
    tail: String,
) -> Result<Response<BoxBody>, hyper::Error> {
    let query = req.uri().query().map(str::to_string);
    let method = req.method().clone();
    let ctx = RequestContext::new(
        app_id.clone(),
        method.as_str().to_string(),
        req.uri().path().to_string(),
        peer_addr.ip(),
    );

    // Buffer the body up front — it is needed whether the request is
    // forwarded inline or serialized onto the stream.
    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("proxy: failed to read request body, app={}, error={}", app_id, e);
            return Ok(ctx.error_response(StatusCode::BAD_REQUEST, "bad request"));
        }
    };

    let app = match state.apps.load(&app_id).await {
        Ok(app) => app,
        Err(e) => return Ok(app_error_response(&ctx, &e)),
    };

    let decision = match state.limiter.decide(&app.id, &app.rate_limit).await {
        Ok(decision) => decision,
        Err(e) => {
            warn!("proxy: limiter failed, app={}, error={}", app_id, e);
            return Ok(ctx.error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
            ));
        }
    };

    if decision.is_admit() {
        Ok(forward_upstream(&state, &ctx, &app, &parts, query.as_deref(), &tail, body_bytes).await)
    } else {
        Ok(enqueue_deferred(&state, &ctx, &app, &parts, query.as_deref(), &tail, &body_bytes).await)
    }
}

/// Map an app-lookup failure onto the client-facing surface: 404 for an
/// unknown app, 400 for a config the engine cannot use, generic 500 for
/// store trouble. Causes stay in the logs.
fn app_error_response(ctx: &RequestContext, e: &GatewayError) -> Response<BoxBody> {
    match e {
        GatewayError::NotFound(_) => {
            debug!("proxy: unknown application, app={}", ctx.app_id);
            ctx.error_response(StatusCode::NOT_FOUND, "application not found")
        }
        GatewayError::Validation(msg) => {
            warn!("proxy: bad application config, app={}, error={}", ctx.app_id, msg);
            ctx.error_response(StatusCode::BAD_REQUEST, "invalid rate limit configuration")
        }
        other => {
            warn!("proxy: application load failed, app={}, error={}", ctx.app_id, other);
            ctx.error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

/// The admitted path: forward the request to the upstream API and relay
/// status, headers, and body back to the client.
async fn forward_upstream(
    state: &GatewayState,
    ctx: &RequestContext,
    app: &App,
    parts: &http::request::Parts,
    query: Option<&str>,
    tail: &str,
    body: Bytes,
) -> Response<BoxBody> {
    let url = upstream_url(&app.base_url, tail, query);

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            return ctx.error_response(StatusCode::BAD_REQUEST, "bad request");
        }
    };
    let has_body = method != reqwest::Method::GET && method != reqwest::Method::HEAD;

    let mut headers = forward_headers(&parts.headers);
    let forwarded_for = forwarded_for_value(
        parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok()),
        &ctx.client_ip.to_string(),
    );
    if let Ok(v) = http::HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", v);
    }

    let mut builder = state.http.request(method, url.as_str()).headers(headers);
    if has_body {
        builder = builder.body(body);
    }

    let upstream_resp = match builder.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!("proxy: upstream error, app={}, url={}, error={}", ctx.app_id, url, e);
            return ctx.error_response(StatusCode::BAD_GATEWAY, "bad gateway");
        }
    };

    let status = upstream_resp.status().as_u16();
    let resp_headers = upstream_resp.headers().clone();
    let content_type = resp_headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let resp_bytes = match upstream_resp.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(
                "proxy: failed to read upstream body, app={}, error={}",
                ctx.app_id, e
            );
            return ctx.error_response(StatusCode::BAD_GATEWAY, "bad gateway");
        }
    };

    // Decode per the upstream's declared content type, then re-encode for
    // the client. Meaning is preserved; representation may be normalized.
    let relayed = RelayBody::decode(content_type.as_deref(), resp_bytes).into_bytes();

    let mut builder =
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in &resp_headers {
        if skip_on_relay(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }

    ctx.finalize_metrics(status);
    access_log(ctx, status, "forwarded");

    builder
        .body(full_body(relayed))
        .unwrap_or_else(|_| plain_error(StatusCode::BAD_GATEWAY, "bad gateway"))
}

/// The denied path: serialize the request onto this node's stream and hand
/// the client a ticket for status polling.
async fn enqueue_deferred(
    state: &GatewayState,
    ctx: &RequestContext,
    app: &App,
    parts: &http::request::Parts,
    query: Option<&str>,
    tail: &str,
    body: &Bytes,
) -> Response<BoxBody> {
    let has_body = parts.method != http::Method::GET && parts.method != http::Method::HEAD;
    let relative = match query {
        Some(q) => format!("{}?{}", tail, q),
        None => tail.to_string(),
    };

    let deferred = DeferredRequest::new(
        &app.id,
        parts.method.as_str(),
        &relative,
        headers_to_map(&parts.headers),
        has_body.then_some(body.as_ref()),
    );

    if let Err(e) = state.pool.stream().append(&deferred).await {
        warn!("proxy: enqueue failed, app={}, error={}", ctx.app_id, e);
        return ctx.error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
    }

    metrics::counter!("gateway_deferred_enqueued_total").increment(1);
    ctx.finalize_metrics(StatusCode::ACCEPTED.as_u16());
    access_log(ctx, StatusCode::ACCEPTED.as_u16(), "queued");

    let body = serde_json::json!({
        "status": "queued",
        "data": {
            "requestId": deferred.ticket_id,
            "message": "Request queued for deferred execution",
        },
    });
    json_response(StatusCode::ACCEPTED, body.to_string())
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Where a request path leads. `status` is reserved and never treated as an
/// application id.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Status { ticket_id: String },
    Proxy { app_id: String, tail: String },
    NotFound,
}

fn route(path: &str) -> Route {
    let Some(rest) = path.strip_prefix("/apis/") else {
        return Route::NotFound;
    };

    if let Some(ticket_id) = rest.strip_prefix("status/") {
        if ticket_id.is_empty() {
            return Route::NotFound;
        }
        return Route::Status {
            ticket_id: ticket_id.to_string(),
        };
    }

    let (app_id, tail) = match rest.split_once('/') {
        Some((app_id, tail)) => (app_id, tail),
        None => (rest, ""),
    };
    if app_id.is_empty() || app_id == "status" {
        return Route::NotFound;
    }

    Route::Proxy {
        app_id: app_id.to_string(),
        tail: tail.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Upstream request / response plumbing
// ---------------------------------------------------------------------------

fn upstream_url(base_url: &str, tail: &str, query: Option<&str>) -> String {
    let mut url = format!("{}/{}", base_url, tail.trim_start_matches('/'));
    if let Some(q) = query {
        url.push('?');
        url.push_str(q);
    }
    url
}

/// Client headers destined for the upstream: everything except `host`
/// (rewritten to the upstream origin by the client) and hop-by-hop/framing
/// headers.
fn forward_headers(headers: &http::HeaderMap) -> http::HeaderMap {
    let mut out = http::HeaderMap::new();
    for (name, value) in headers {
        if skip_on_relay(name.as_str()) || *name == http::header::HOST {
            continue;
        }
        out.append(name, value.clone());
    }
    out
}

fn skip_on_relay(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

/// `X-Forwarded-For` with the caller appended to any existing chain.
fn forwarded_for_value(existing: Option<&str>, peer_ip: &str) -> String {
    match existing {
        Some(chain) if !chain.is_empty() => format!("{}, {}", chain, peer_ip),
        _ => peer_ip.to_string(),
    }
}

/// All request headers, verbatim, for the deferred record. Values that are
/// not valid UTF-8 cannot survive the JSON wire format and are dropped.
fn headers_to_map(headers: &http::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// An upstream body, decoded according to the declared content type so the
/// relay can re-encode it without changing its meaning.
enum RelayBody {
    Json(serde_json::Value),
    Text(String),
    Binary(Bytes),
}

impl RelayBody {
    fn decode(content_type: Option<&str>, bytes: Bytes) -> Self {
        match content_type {
            Some(ct) if is_json(ct) => match serde_json::from_slice(&bytes) {
                Ok(value) => RelayBody::Json(value),
                Err(_) => RelayBody::Binary(bytes),
            },
            Some(ct) if is_text(ct) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => RelayBody::Text(text),
                Err(_) => RelayBody::Binary(bytes),
            },
            _ => RelayBody::Binary(bytes),
        }
    }

    fn into_bytes(self) -> Bytes {
        match self {
            RelayBody::Json(value) => Bytes::from(value.to_string()),
            RelayBody::Text(text) => Bytes::from(text),
            RelayBody::Binary(bytes) => bytes,
        }
    }
}

fn is_json(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

fn is_text(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
        .starts_with("text/")
}

// ---------------------------------------------------------------------------
// Responses / logging
// ---------------------------------------------------------------------------

fn json_response(status: StatusCode, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

fn plain_error(status: StatusCode, msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
        .unwrap()
}

fn access_log(ctx: &RequestContext, status: u16, disposition: &str) {
    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        path = %ctx.path,
        app = %ctx.app_id,
        status = status,
        disposition = disposition,
        latency_ms = %ctx.start.elapsed().as_millis(),
        "access"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_status() {
        assert_eq!(
            route("/apis/status/t-1"),
            Route::Status {
                ticket_id: "t-1".to_string()
            }
        );
    }

    #[test]
    fn test_route_proxy_with_tail() {
        assert_eq!(
            route("/apis/app-1/v1/users"),
            Route::Proxy {
                app_id: "app-1".to_string(),
                tail: "v1/users".to_string()
            }
        );
    }

    #[test]
    fn test_route_proxy_bare_app() {
        assert_eq!(
            route("/apis/app-1"),
            Route::Proxy {
                app_id: "app-1".to_string(),
                tail: "".to_string()
            }
        );
    }

    #[test]
    fn test_route_rejects_non_apis_paths() {
        assert_eq!(route("/"), Route::NotFound);
        assert_eq!(route("/health"), Route::NotFound);
        assert_eq!(route("/apis/"), Route::NotFound);
    }

    #[test]
    fn test_route_status_is_reserved() {
        assert_eq!(route("/apis/status"), Route::NotFound);
        assert_eq!(route("/apis/status/"), Route::NotFound);
    }

    #[test]
    fn test_upstream_url_joins_and_keeps_query() {
        assert_eq!(
            upstream_url("https://api.example.com", "v1/users", None),
            "https://api.example.com/v1/users"
        );
        assert_eq!(
            upstream_url("https://api.example.com", "v1/users", Some("page=2")),
            "https://api.example.com/v1/users?page=2"
        );
        assert_eq!(
            upstream_url("https://api.example.com", "", None),
            "https://api.example.com/"
        );
    }

    #[test]
    fn test_forwarded_for_appends() {
        assert_eq!(forwarded_for_value(None, "10.0.0.9"), "10.0.0.9");
        assert_eq!(
            forwarded_for_value(Some("1.2.3.4"), "10.0.0.9"),
            "1.2.3.4, 10.0.0.9"
        );
    }

    #[test]
    fn test_forward_headers_strips_host_and_hops() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::HOST, "gw.example.com".parse().unwrap());
        headers.insert(http::header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert("x-api-key", "k".parse().unwrap());
        let out = forward_headers(&headers);
        assert!(out.get("host").is_none());
        assert!(out.get("connection").is_none());
        assert_eq!(out.get("x-api-key").unwrap(), "k");
    }

    #[test]
    fn test_relay_body_json() {
        let body = Bytes::from_static(br#"{ "ok" : true }"#);
        let relayed = RelayBody::decode(Some("application/json; charset=utf-8"), body);
        assert!(matches!(relayed, RelayBody::Json(_)));
        // Normalized but meaning-preserving.
        assert_eq!(relayed.into_bytes(), Bytes::from_static(br#"{"ok":true}"#));
    }

    #[test]
    fn test_relay_body_invalid_json_falls_back_to_bytes() {
        let body = Bytes::from_static(b"not json");
        let relayed = RelayBody::decode(Some("application/json"), body.clone());
        assert!(matches!(relayed, RelayBody::Binary(_)));
        assert_eq!(relayed.into_bytes(), body);
    }

    #[test]
    fn test_relay_body_text_and_binary() {
        let text = RelayBody::decode(Some("text/plain"), Bytes::from_static(b"hello"));
        assert!(matches!(text, RelayBody::Text(_)));

        let binary = RelayBody::decode(Some("image/png"), Bytes::from_static(b"\x89PNG"));
        assert!(matches!(binary, RelayBody::Binary(_)));

        let untyped = RelayBody::decode(None, Bytes::from_static(b"data"));
        assert!(matches!(untyped, RelayBody::Binary(_)));
    }

    #[test]
    fn test_content_type_classification() {
        assert!(is_json("application/json"));
        assert!(is_json("application/problem+json"));
        assert!(!is_json("text/json-ish"));
        assert!(is_text("text/html; charset=utf-8"));
        assert!(!is_text("application/octet-stream"));
    }

    #[test]
    fn test_headers_to_map_keeps_authorization() {
        let mut headers = http::HeaderMap::new();
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        let map = headers_to_map(&headers);
        assert_eq!(map.get("authorization").unwrap(), "Bearer abc");
        assert_eq!(map.len(), 2);
    }
}
