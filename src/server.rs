//! Protocol Engine and HTTP Surface: maps HTTP methods/paths/headers/query
//! to [`StreamStore`] operations, builds the `Stream-*`/`Producer-*`/`ETag`
//! response headers, and implements the two live read modes (long-poll and
//! SSE) on top of the store's waiter machinery.

use std::{sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    extract::{Path, RawQuery, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{sse::Event, IntoResponse, Response, Sse},
    routing::{delete, get, head, options, post, put},
    Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use futures::Stream as FuturesStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::{
    cursor::{self, CursorOptions},
    offset::{self, OffsetQuery},
    store::{self, StoreError, StreamStore},
    types::{AppendOptions, AppendOutcome, ProducerRef, ReadResult, ServerOptions, StreamConfig},
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StreamStore>,
    pub options: ServerOptions,
}

/// Build the router with all stream endpoints, CORS, and the standard
/// security headers.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route(
            "/{*path}",
            put(handle_create)
                .head(handle_head)
                .get(handle_read)
                .post(handle_append)
                .delete(handle_delete)
                .options(handle_options),
        )
        .layer(middleware::from_fn(security_headers))
        .layer(cors)
        .with_state(state)
}

/// `X-Content-Type-Options` and `Cross-Origin-Resource-Policy` on every
/// response, regardless of outcome. CORS headers are layered separately by
/// [`CorsLayer`]; these two are not CORS headers so tower-http's CORS
/// middleware doesn't set them.
async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("cross-origin-resource-policy"),
        HeaderValue::from_static("cross-origin"),
    );
    response
}

fn normalize_path(raw: &str) -> String {
    format!("/{raw}")
}

async fn handle_options() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

// ---------------------------------------------------------------------
// PUT — create
// ---------------------------------------------------------------------

async fn handle_create(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = normalize_path(&path);

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let ttl_seconds = match header_str(&headers, "stream-ttl") {
        None => None,
        Some(raw) => match parse_strict_decimal(raw) {
            Some(n) => Some(n),
            None => return bad_request("invalid Stream-TTL"),
        },
    };

    let expires_at = match header_str(&headers, "stream-expires-at") {
        None => None,
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(dt) => Some(dt.with_timezone(&Utc)),
            Err(_) => return bad_request("invalid Stream-Expires-At"),
        },
    };

    let body_bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => return bad_request("failed to read request body"),
    };
    let initial_data = (!body_bytes.is_empty()).then_some(body_bytes);

    let config = StreamConfig {
        content_type,
        ttl_seconds,
        expires_at,
        initial_data,
    };

    match state.store.create(&path, config) {
        Ok((stream, created)) => {
            let mut builder = Response::builder()
                .status(if created {
                    StatusCode::CREATED
                } else {
                    StatusCode::OK
                })
                .header("stream-next-offset", &stream.current_offset)
                .header(header::LOCATION, path.as_str());
            if let Some(ct) = &stream.content_type {
                builder = builder.header(header::CONTENT_TYPE, ct.as_str());
            }
            builder.body(Body::empty()).unwrap()
        }
        Err(e) => store_error_response(e),
    }
}

// ---------------------------------------------------------------------
// HEAD
// ---------------------------------------------------------------------

async fn handle_head(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let path = normalize_path(&path);

    let stream = match state.store.get(&path) {
        Ok(s) => s,
        Err(e) => return store_error_response(e),
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("stream-next-offset", &stream.current_offset)
        .header(header::CACHE_CONTROL, "no-store");
    if let Some(ct) = &stream.content_type {
        builder = builder.header(header::CONTENT_TYPE, ct.as_str());
    }
    builder.body(Body::empty()).unwrap()
}

// ---------------------------------------------------------------------
// GET — catch-up, long-poll, SSE
// ---------------------------------------------------------------------

/// Raw, unvalidated query parameters. Parsed by hand (rather than
/// `axum::extract::Query`) so a repeated `offset` key or an empty `offset`
/// value can be told apart from an absent one, per spec.
#[derive(Debug, Default)]
struct RawReadQuery {
    offset: Option<String>,
    live: Option<String>,
    cursor: Option<String>,
}

fn parse_read_query(raw: Option<&str>) -> Result<RawReadQuery, &'static str> {
    let mut query = RawReadQuery::default();
    let mut offset_seen = false;

    let Some(raw) = raw else {
        return Ok(query);
    };

    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        match key.as_ref() {
            "offset" => {
                if offset_seen {
                    return Err("offset may only be specified once");
                }
                offset_seen = true;
                if value.is_empty() {
                    return Err("offset must not be empty");
                }
                query.offset = Some(value.into_owned());
            }
            "live" => query.live = Some(value.into_owned()),
            "cursor" => query.cursor = Some(value.into_owned()),
            _ => {}
        }
    }

    Ok(query)
}

async fn handle_read(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let path = normalize_path(&path);

    let query = match parse_read_query(raw_query.as_deref()) {
        Ok(q) => q,
        Err(msg) => return bad_request(msg),
    };

    let live = match query.live.as_deref() {
        None => None,
        Some("long-poll") => Some("long-poll"),
        Some("sse") => Some("sse"),
        Some(_) => return bad_request("live must be 'long-poll' or 'sse'"),
    };

    if live.is_some() && query.offset.is_none() {
        return bad_request("offset is required for live reads");
    }

    let offset_query = match OffsetQuery::parse(query.offset.as_deref()) {
        Ok(q) => q,
        Err(e) => return bad_request(&e.to_string()),
    };

    let cursor_options = CursorOptions {
        interval_seconds: state.options.cursor_interval_seconds,
        epoch: state.options.cursor_epoch,
    };
    let client_cursor = query.cursor.as_deref().and_then(cursor::parse_cursor);
    let cursor_value = cursor::cursor(client_cursor, &cursor_options);

    match live {
        Some("sse") => handle_sse(state, path, offset_query, cursor_options, cursor_value).await,
        Some("long-poll") => handle_long_poll(state, path, offset_query, cursor_value).await,
        _ => {
            let requested_raw = query.offset.unwrap_or_else(|| "-1".to_string());
            let if_none_match = headers.get(header::IF_NONE_MATCH).cloned();
            handle_catch_up(state, path, offset_query, requested_raw, if_none_match).await
        }
    }
}

async fn handle_catch_up(
    state: AppState,
    path: String,
    query: OffsetQuery,
    requested_raw: String,
    if_none_match: Option<HeaderValue>,
) -> Response {
    let stream = match state.store.get(&path) {
        Ok(s) => s,
        Err(e) => return store_error_response(e),
    };
    let result = match state.store.read(&path, &query) {
        Ok(r) => r,
        Err(e) => return store_error_response(e),
    };

    let next_offset = result
        .messages
        .last()
        .map(|m| m.offset.clone())
        .unwrap_or_else(|| stream.current_offset.clone());

    // `offset=now` never gets an ETag — it deliberately resolves at request
    // time and must never be cached.
    if matches!(query, OffsetQuery::Now) {
        let body = store::format_response(stream.is_json(), &result.messages);
        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header("stream-next-offset", &next_offset)
            .header("stream-up-to-date", "true")
            .header(header::CACHE_CONTROL, "no-store");
        if let Some(ct) = &stream.content_type {
            builder = builder.header(header::CONTENT_TYPE, ct.as_str());
        }
        return builder.body(Body::from(body)).unwrap();
    }

    let etag = compute_etag(&path, &requested_raw, &next_offset);
    if if_none_match.as_ref().and_then(|v| v.to_str().ok()) == Some(etag.as_str()) {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, &etag)
            .body(Body::empty())
            .unwrap();
    }

    let body = store::format_response(stream.is_json(), &result.messages);
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("stream-next-offset", &next_offset)
        .header("stream-up-to-date", result.up_to_date.to_string())
        .header(header::ETAG, etag);
    if let Some(ct) = &stream.content_type {
        builder = builder.header(header::CONTENT_TYPE, ct.as_str());
    }
    builder.body(Body::from(body)).unwrap()
}

async fn handle_long_poll(
    state: AppState,
    path: String,
    query: OffsetQuery,
    cursor_value: u64,
) -> Response {
    let stream = match state.store.get(&path) {
        Ok(s) => s,
        Err(e) => return store_error_response(e),
    };
    let result = match state.store.read(&path, &query) {
        Ok(r) => r,
        Err(e) => return store_error_response(e),
    };

    if !result.messages.is_empty() {
        return long_poll_response(&stream, &result, cursor_value);
    }

    let timeout_duration = Duration::from_millis(state.options.long_poll_timeout_ms);
    let wait = match state
        .store
        .wait_for_messages(&path, &query, timeout_duration)
        .await
    {
        Ok(w) => w,
        Err(e) => return store_error_response(e),
    };

    if wait.timed_out || wait.messages.is_empty() {
        let next_offset = query
            .resolve(&stream.current_offset)
            .unwrap_or_else(|| stream.current_offset.clone());
        return Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("stream-next-offset", next_offset)
            .header("stream-up-to-date", "true")
            .header("stream-cursor", cursor_value.to_string())
            .body(Body::empty())
            .unwrap();
    }

    let delivered = ReadResult {
        messages: wait.messages,
        up_to_date: true,
    };
    long_poll_response(&stream, &delivered, cursor_value)
}

fn long_poll_response(stream: &crate::types::Stream, result: &ReadResult, cursor_value: u64) -> Response {
    let next_offset = result
        .messages
        .last()
        .map(|m| m.offset.clone())
        .unwrap_or_else(|| stream.current_offset.clone());
    let body = store::format_response(stream.is_json(), &result.messages);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("stream-next-offset", &next_offset)
        .header("stream-up-to-date", result.up_to_date.to_string())
        .header("stream-cursor", cursor_value.to_string());
    if let Some(ct) = &stream.content_type {
        builder = builder.header(header::CONTENT_TYPE, ct.as_str());
    }
    builder.body(Body::from(body)).unwrap()
}

// ---------------------------------------------------------------------
// GET — SSE
// ---------------------------------------------------------------------

fn stream_supports_sse(stream: &crate::types::Stream) -> bool {
    let ct = stream
        .content_type
        .as_deref()
        .map(crate::types::normalize_content_type)
        .unwrap_or_else(|| crate::types::normalize_content_type(crate::types::DEFAULT_CONTENT_TYPE));
    ct == "application/json" || ct.starts_with("text/")
}

async fn handle_sse(
    state: AppState,
    path: String,
    offset_query: OffsetQuery,
    cursor_options: CursorOptions,
    cursor_value: u64,
) -> Response {
    let stream = match state.store.get(&path) {
        Ok(s) => s,
        Err(e) => return store_error_response(e),
    };
    if !stream_supports_sse(&stream) {
        return bad_request("SSE is only supported for application/json or text/* streams");
    }

    let events = sse_events(state, path, offset_query, cursor_options, cursor_value);

    Sse::new(events)
        .keep_alive(
            axum::response::sse::KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}

fn sse_data_events(stream: &crate::types::Stream, messages: &[crate::types::StreamMessage]) -> Vec<Event> {
    let is_json = stream.is_json();
    messages
        .iter()
        .map(|m| {
            let payload = if is_json {
                let mut data = m.data.clone();
                if data.last() == Some(&b',') {
                    data.pop();
                }
                String::from_utf8_lossy(&data).into_owned()
            } else {
                String::from_utf8_lossy(&m.data).into_owned()
            };
            Event::default().event("data").data(payload)
        })
        .collect()
}

fn sse_control_event(next_offset: &str, cursor_value: u64, up_to_date: bool) -> Event {
    let body = serde_json::json!({
        "streamNextOffset": next_offset,
        "streamCursor": cursor_value.to_string(),
        "upToDate": up_to_date,
    });
    Event::default().event("control").data(body.to_string())
}

/// Drives the SSE emit loop: replay anything already on the stream, then
/// alternate between waiting for the next batch of messages and emitting
/// them, emitting a keep-alive control frame on each wait timeout.
fn sse_events(
    state: AppState,
    path: String,
    mut offset_query: OffsetQuery,
    cursor_options: CursorOptions,
    mut cursor_value: u64,
) -> impl FuturesStream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let Ok(result) = state.store.read(&path, &offset_query) else {
            return;
        };
        if let Ok(stream) = state.store.get(&path) {
            for event in sse_data_events(&stream, &result.messages) {
                yield Ok(event);
            }
        }
        let mut last_offset = result
            .messages
            .last()
            .map(|m| m.offset.clone())
            .unwrap_or_else(|| stream_current_offset(&state, &path));
        if let Some(last) = result.messages.last() {
            offset_query = OffsetQuery::At(last.offset.clone());
        }
        cursor_value = cursor::cursor(Some(cursor_value), &cursor_options);
        yield Ok(sse_control_event(&last_offset, cursor_value, true));

        let timeout_duration = Duration::from_millis(state.options.long_poll_timeout_ms);
        loop {
            let Ok(wait) = state
                .store
                .wait_for_messages(&path, &offset_query, timeout_duration)
                .await
            else {
                return;
            };

            if wait.messages.is_empty() {
                if state.store.get(&path).is_err() {
                    return;
                }
                cursor_value = cursor::cursor(Some(cursor_value), &cursor_options);
                yield Ok(sse_control_event(&last_offset, cursor_value, true));
                continue;
            }

            let Ok(stream) = state.store.get(&path) else {
                return;
            };
            for event in sse_data_events(&stream, &wait.messages) {
                yield Ok(event);
            }
            last_offset = wait.messages.last().unwrap().offset.clone();
            offset_query = OffsetQuery::At(last_offset.clone());
            cursor_value = cursor::cursor(Some(cursor_value), &cursor_options);
            yield Ok(sse_control_event(&last_offset, cursor_value, true));
        }
    }
}

fn stream_current_offset(state: &AppState, path: &str) -> String {
    state
        .store
        .get_current_offset(path)
        .unwrap_or_else(|| offset::INITIAL_OFFSET.to_string())
}

// ---------------------------------------------------------------------
// POST — append
// ---------------------------------------------------------------------

async fn handle_append(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = normalize_path(&path);

    let Some(content_type) = header_str(&headers, "content-type") else {
        return bad_request("Content-Type is required");
    };

    let stream_seq = header_str(&headers, "stream-seq").map(str::to_string);

    let producer = match parse_producer(&headers) {
        Ok(p) => p,
        Err(msg) => return bad_request(msg),
    };

    let body_bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => return bad_request("failed to read request body"),
    };
    if body_bytes.is_empty() {
        return bad_request("empty body not allowed");
    }

    let opts = AppendOptions {
        content_type: Some(content_type.to_string()),
        stream_seq,
        producer,
    };

    match state.store.append(&path, body_bytes, opts).await {
        Ok(AppendOutcome::Accepted {
            offset,
            producer: None,
        }) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("stream-next-offset", offset)
            .body(Body::empty())
            .unwrap(),
        Ok(AppendOutcome::Accepted {
            offset,
            producer: Some((epoch, seq)),
        }) => Response::builder()
            .status(StatusCode::OK)
            .header("stream-next-offset", offset)
            .header("producer-epoch", epoch.to_string())
            .header("producer-seq", seq.to_string())
            .body(Body::empty())
            .unwrap(),
        Ok(AppendOutcome::Duplicate { epoch, seq }) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("producer-epoch", epoch.to_string())
            .header("producer-seq", seq.to_string())
            .body(Body::empty())
            .unwrap(),
        Err(e) => {
            if !matches!(e, StoreError::NotFound) {
                warn!(path = %path, error = %e, "append rejected");
            }
            store_error_response(e)
        }
    }
}

fn parse_producer(headers: &HeaderMap) -> Result<Option<ProducerRef>, &'static str> {
    let id = header_str(headers, "producer-id");
    let epoch = header_str(headers, "producer-epoch");
    let seq = header_str(headers, "producer-seq");

    match (id, epoch, seq) {
        (None, None, None) => Ok(None),
        (Some(id), Some(epoch), Some(seq)) => {
            if id.is_empty() {
                return Err("Producer-Id must not be empty");
            }
            let epoch = parse_strict_decimal(epoch).ok_or("invalid Producer-Epoch")?;
            let seq = parse_strict_decimal(seq).ok_or("invalid Producer-Seq")?;
            Ok(Some(ProducerRef {
                id: id.to_string(),
                epoch,
                seq,
            }))
        }
        _ => Err("Producer-Id, Producer-Epoch, and Producer-Seq must all be present or all absent"),
    }
}

// ---------------------------------------------------------------------
// DELETE
// ---------------------------------------------------------------------

async fn handle_delete(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let path = normalize_path(&path);
    if state.store.delete(&path) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

// ---------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, message.to_string()).into_response()
}

/// Parse a header value as a non-negative integer in strict decimal form:
/// digits only, no sign, no leading zero unless the value is exactly `"0"`.
fn parse_strict_decimal(raw: &str) -> Option<u64> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if raw.len() > 1 && raw.starts_with('0') {
        return None;
    }
    raw.parse().ok()
}

/// `"base64(path):<startOffset>:<endOffset>"`, a strong ETag over the
/// stream identity and the offset range a read covered.
fn compute_etag(path: &str, start_offset: &str, end_offset: &str) -> String {
    let path_b64 = URL_SAFE_NO_PAD.encode(path);
    format!("\"{path_b64}:{start_offset}:{end_offset}\"")
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound => (StatusCode::NOT_FOUND, err.to_string()).into_response(),
        StoreError::Conflict => (StatusCode::CONFLICT, err.to_string()).into_response(),
        StoreError::TtlConflict
        | StoreError::InvalidTtl
        | StoreError::InvalidExpiresAt
        | StoreError::InvalidEpochSeq
        | StoreError::InvalidJson
        | StoreError::EmptyArray
        | StoreError::EmptyBody => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        StoreError::InvalidOffset(_) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        StoreError::ContentTypeMismatch { .. } | StoreError::SequenceConflict => {
            (StatusCode::CONFLICT, err.to_string()).into_response()
        }
        StoreError::StaleEpoch { current } => (
            StatusCode::FORBIDDEN,
            [("producer-epoch", current.to_string())],
            err.to_string(),
        )
            .into_response(),
        StoreError::SequenceGap { expected, received } => (
            StatusCode::CONFLICT,
            [
                ("producer-expected-seq", expected.to_string()),
                ("producer-received-seq", received.to_string()),
            ],
            err.to_string(),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------

/// Bind and serve, shutting down gracefully (and waking any live long-poll
/// or SSE readers) on Ctrl+C or SIGTERM.
pub async fn start_server(options: ServerOptions) -> std::io::Result<()> {
    let store = StreamStore::new(options.producer_ttl_ms);
    let state = AppState {
        store: store.clone(),
        options: options.clone(),
    };
    let router = create_router(state);

    let addr = format!("{}:{}", options.host, options.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "durable streams server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.cancel_all_waits();
    info!("durable streams server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes as body_to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn test_state() -> AppState {
        AppState {
            store: StreamStore::new(7 * 24 * 60 * 60 * 1000),
            options: ServerOptions::default(),
        }
    }

    fn fast_long_poll_state() -> AppState {
        AppState {
            store: StreamStore::new(7 * 24 * 60 * 60 * 1000),
            options: ServerOptions {
                long_poll_timeout_ms: 50,
                ..ServerOptions::default()
            },
        }
    }

    async fn body_string(response: Response) -> String {
        let bytes = body_to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn create_returns_201_and_offset() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get("stream-next-offset").unwrap(),
            offset::INITIAL_OFFSET
        );
    }

    #[tokio::test]
    async fn idempotent_create_returns_200_then_conflict_on_mismatch() {
        let state = test_state();
        let app = create_router(state);

        let first = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);

        let mismatched = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .header("content-type", "application/json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(mismatched.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn ttl_and_expires_at_conflict_is_a_400() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .header("stream-ttl", "60")
                    .header("stream-expires-at", "2030-01-01T00:00:00Z")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_ttl_header_is_a_400() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .header("stream-ttl", "007")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn append_then_catch_up_read() {
        let state = test_state();
        let app = create_router(state);

        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let append = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .body(Body::from("hello world"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(append.status(), StatusCode::NO_CONTENT);

        let read = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/s?offset=-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(read.status(), StatusCode::OK);
        assert_eq!(body_string(read).await, "hello world");
    }

    #[tokio::test]
    async fn json_stream_read_wraps_into_array() {
        let state = test_state();
        let app = create_router(state);

        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"[{"a":1}]"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        app.clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/s")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"b":2}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        let read = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/s?offset=-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_string(read).await, r#"[{"a":1},{"b":2}]"#);
    }

    #[tokio::test]
    async fn content_type_mismatch_is_409() {
        let state = test_state();
        let app = create_router(state);

        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/s")
                    .header("content-type", "application/json")
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn producer_happy_path_duplicate_then_gap() {
        let state = test_state();
        let app = create_router(state);

        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let accepted = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .header("producer-id", "p1")
                    .header("producer-epoch", "0")
                    .header("producer-seq", "0")
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
        assert_eq!(accepted.headers().get("producer-epoch").unwrap(), "0");
        assert_eq!(accepted.headers().get("producer-seq").unwrap(), "0");

        let duplicate = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .header("producer-id", "p1")
                    .header("producer-epoch", "0")
                    .header("producer-seq", "0")
                    .body(Body::from("y"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(duplicate.status(), StatusCode::NO_CONTENT);
        assert_eq!(duplicate.headers().get("producer-seq").unwrap(), "0");

        let gap = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .header("producer-id", "p1")
                    .header("producer-epoch", "0")
                    .header("producer-seq", "2")
                    .body(Body::from("z"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(gap.status(), StatusCode::CONFLICT);
        assert_eq!(gap.headers().get("producer-expected-seq").unwrap(), "1");
        assert_eq!(gap.headers().get("producer-received-seq").unwrap(), "2");
    }

    #[tokio::test]
    async fn stale_epoch_is_403_with_current_epoch_header() {
        let state = test_state();
        let app = create_router(state);

        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        app.clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .header("producer-id", "p1")
                    .header("producer-epoch", "3")
                    .header("producer-seq", "0")
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await
            .unwrap();

        let stale = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .header("producer-id", "p1")
                    .header("producer-epoch", "2")
                    .header("producer-seq", "0")
                    .body(Body::from("y"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(stale.status(), StatusCode::FORBIDDEN);
        assert_eq!(stale.headers().get("producer-epoch").unwrap(), "3");
    }

    #[tokio::test]
    async fn producer_trio_must_be_all_or_nothing() {
        let app = create_router(test_state());
        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .header("producer-id", "p1")
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_then_404() {
        let state = test_state();
        let app = create_router(state);

        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let deleted = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let missing = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let head = app
            .oneshot(
                Request::builder()
                    .method("HEAD")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(head.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn offset_now_returns_current_offset_and_no_store() {
        let state = test_state();
        let app = create_router(state);

        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        app.clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/s?offset=now")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("stream-up-to-date").unwrap(), "true");
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
        let next_offset = response.headers().get("stream-next-offset").cloned();
        assert_eq!(body_string(response).await, "");
        assert!(next_offset.is_some());
    }

    #[tokio::test]
    async fn live_read_requires_offset() {
        let app = create_router(test_state());
        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/s?live=long-poll")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_offset_parameter_is_a_400() {
        let app = create_router(test_state());
        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/s?offset=-1&offset=now")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn long_poll_times_out_with_204() {
        let state = fast_long_poll_state();
        let app = create_router(state);

        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/s?offset=now&live=long-poll")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers().get("stream-up-to-date").unwrap(), "true");
        assert!(response.headers().get("stream-cursor").is_some());
    }

    #[tokio::test]
    async fn long_poll_wakes_on_append() {
        let state = fast_long_poll_state();
        let options = ServerOptions {
            long_poll_timeout_ms: 5_000,
            ..state.options.clone()
        };
        let state = AppState { options, ..state };
        let app = create_router(state);

        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let waiting_app = app.clone();
        let waiter = tokio::spawn(async move {
            waiting_app
                .oneshot(
                    Request::builder()
                        .method("GET")
                        .uri("/s?offset=now&live=long-poll")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        app.oneshot(
            Request::builder()
                .method("POST")
                .uri("/s")
                .header("content-type", "text/plain")
                .body(Body::from("late"))
                .unwrap(),
        )
        .await
        .unwrap();

        let response = waiter.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "late");
    }

    #[tokio::test]
    async fn sse_rejected_for_binary_streams() {
        let app = create_router(test_state());
        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .header("content-type", "application/octet-stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/s?offset=-1&live=sse")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn if_none_match_returns_304() {
        let state = test_state();
        let app = create_router(state);

        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .header("content-type", "text/plain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let first = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/s?offset=-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let etag = first.headers().get(header::ETAG).unwrap().clone();

        let second = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/s?offset=-1")
                    .header(header::IF_NONE_MATCH, etag)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn options_returns_204() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn responses_carry_security_headers() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(
            response.headers().get("cross-origin-resource-policy").unwrap(),
            "cross-origin"
        );
    }
}
