//! HTTP handlers.
//!
//! Well-formed routes first (CRUD, uploads, encodings, redirect, delay,
//! large payloads, streaming), then the deliberate faults. Every route lives
//! under `/api`; anything unmatched gets a JSON 404 naming the endpoint.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, OriginalUri, Path, Query, Request, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, patch, post, put};
use axum::{Form, Json, Router};
use bytes::Bytes;
use chrono::{Local, SecondsFormat, Utc};
use rand::RngCore;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::compression::CompressionLayer;
use tracing::{debug, info, warn};

use crate::records::Record;
use crate::scenario::{FaultScenario, REDIRECT_LOCATION};
use crate::server::ServerState;

type AppState = Arc<ServerState>;

const X_CONTENT_TYPE_OPTIONS: HeaderName = HeaderName::from_static("x-content-type-options");

pub const TRUNCATED_BODY: &str =
    r#"{ "message": "This is the start of a valid JSON object, but it will die soon...""#;
pub const INVALID_JSON_BODY: &str = r#"{ "status": "ok", "data": [1, 2, 3, "oops..."#;
pub const SERVER_ERROR_HTML: &str = "<html>\n<head><title>503 Service Unavailable</title></head>\n<body>\n<h1>503 Service Unavailable</h1>\n<p>The upstream server is currently unavailable.</p>\n<hr>\n<address>Nginx/1.18.0</address>\n</body>\n</html>\n";
pub const STREAM_STARTED: &str = "--- Stream Started ---\n";
pub const STREAM_FINISHED: &str = "--- Stream Finished ---";
/// Length `/error/truncated` declares.
pub const TRUNCATED_DECLARED_LENGTH: u64 = 1024;
const COMPRESS_ITEMS: usize = 1000;

/// Builds the router for `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        // -----------------------------------------------------------------
        // Records
        // -----------------------------------------------------------------
        .route("/api/get", get(list_records))
        .route("/api/post", post(create_record))
        .route("/api/query-and-body", post(query_and_body))
        .route("/api/patch/{id}", patch(patch_record))
        .route("/api/put/{id}", put(replace_record))
        .route("/api/delete/{id}", delete(delete_record))
        // -----------------------------------------------------------------
        // Encodings and payloads
        // -----------------------------------------------------------------
        .route("/api/multipart", post(multipart_upload))
        .route("/api/form", post(form_login))
        .route("/api/binary", get(binary))
        .route("/api/compress", get(compressible).layer(CompressionLayer::new()))
        .route("/api/redirect", get(redirect))
        .route("/api/delay", get(delayed))
        .route("/api/large-body", get(large_body))
        .route("/api/image", get(small_image))
        .route("/api/large-image", get(large_image))
        .route("/api/stream-xhr", get(stream_xhr))
        // -----------------------------------------------------------------
        // Faults
        // -----------------------------------------------------------------
        .route("/api/error/client-error", get(client_error))
        .route("/api/error/server-error", get(server_error))
        .route("/api/error/truncated", get(truncated))
        .route("/api/error/json", get(invalid_json))
        .route("/api/error/protocol", get(protocol_on_reused_connection))
        .route("/api/error/hang", get(hang))
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .with_state(state)
}

fn json_error(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": error, "message": message.into() }))).into_response()
}

fn user_not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "User not found" }))).into_response()
}

async fn not_found(OriginalUri(uri): OriginalUri) -> Response {
    let endpoint = uri.path_and_query().map_or(uri.path(), |pq| pq.as_str());
    debug!(endpoint, "No route");
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Not Found", "endpoint": endpoint })),
    )
        .into_response()
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let rows: String = state.table.iter().map(index_row).collect();
    Html(format!(
        "<html>\n<head><title>faultline</title></head>\n<body>\n<h1>faultline fault server</h1>\n<table>\n<tr><th>Method</th><th>Path</th><th>Behaviour</th></tr>\n{rows}</table>\n</body>\n</html>\n"
    ))
}

fn index_row(scenario: &FaultScenario) -> String {
    let marker = if scenario.is_fault() { " (fault)" } else { "" };
    format!(
        "<tr><td>{}</td><td>{}</td><td>{}{marker}</td></tr>\n",
        scenario.method, scenario.path, scenario.summary
    )
}

// ---------------------------------------------------------------------------
// Record body extraction
// ---------------------------------------------------------------------------

/// A request body as a record: a JSON object, a URL-encoded form, or empty.
struct RecordBody(Record);

impl<S> FromRequest<S> for RecordBody
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("application/json") {
            let Json(value) = Json::<Value>::from_request(req, state)
                .await
                .map_err(IntoResponse::into_response)?;
            match value {
                Value::Object(map) => Ok(Self(map)),
                _ => Err(json_error(
                    StatusCode::BAD_REQUEST,
                    "Bad Request",
                    "Expected a JSON object",
                )),
            }
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            let Form(fields) = Form::<HashMap<String, String>>::from_request(req, state)
                .await
                .map_err(IntoResponse::into_response)?;
            Ok(Self(fields.into_iter().map(|(k, v)| (k, Value::String(v))).collect()))
        } else {
            Ok(Self(Map::new()))
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

async fn list_records(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    let page = match query.get("page") {
        Some(raw) => raw.parse::<i64>().map_or_else(|_| json!(raw), |n| json!(n)),
        None => json!(1),
    };
    let sort = query.get("sort").map_or("asc", String::as_str);

    let data = state.records.list();
    let mut meta = json!({ "page": page, "sort": sort, "total": data.len() });
    if query.get("redirected").is_some_and(|v| v == "true") {
        meta["redirected"] = json!(true);
    }
    Json(json!({ "meta": meta, "data": data })).into_response()
}

async fn create_record(State(state): State<AppState>, RecordBody(fields): RecordBody) -> Response {
    let created = state.records.create(fields);
    info!(id = %created["id"], "Record created");
    (
        StatusCode::CREATED,
        Json(json!({
            "message": "Post request successful",
            "userId": created["id"],
            "captured_data": created,
        })),
    )
        .into_response()
}

async fn query_and_body(Query(query): Query<HashMap<String, String>>, RecordBody(body): RecordBody) -> Json<Value> {
    Json(json!({
        "received_query": query,
        "received_body": body,
        "message": "Query params and body received successfully",
    }))
}

async fn patch_record(State(state): State<AppState>, Path(id): Path<String>, RecordBody(fields): RecordBody) -> Response {
    match id.parse::<i64>() {
        Ok(id) if state.records.patch(id, fields) => StatusCode::NO_CONTENT.into_response(),
        _ => user_not_found(),
    }
}

async fn replace_record(State(state): State<AppState>, Path(id): Path<String>, RecordBody(fields): RecordBody) -> Response {
    let Some(user) = id.parse::<i64>().ok().and_then(|id| state.records.replace(id, fields)) else {
        return user_not_found();
    };
    Json(json!({ "message": "Put request successful", "user": user })).into_response()
}

async fn delete_record(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match id.parse::<i64>() {
        Ok(id) if state.records.delete(id) => {
            Json(json!({ "message": "Delete request successful", "deletedId": id })).into_response()
        }
        _ => user_not_found(),
    }
}

// ---------------------------------------------------------------------------
// Encodings and payloads
// ---------------------------------------------------------------------------

struct UploadedFile {
    filename: Option<String>,
    mimetype: Option<String>,
    size: usize,
}

async fn multipart_upload(mut multipart: Multipart) -> Response {
    let mut file = None;
    let mut description = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return e.into_response(),
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("multipart_data") => {
                let filename = field.file_name().map(str::to_string);
                let mimetype = field.content_type().map(str::to_string);
                match field.bytes().await {
                    Ok(bytes) => {
                        file = Some(UploadedFile {
                            filename,
                            mimetype,
                            size: bytes.len(),
                        })
                    }
                    Err(e) => return e.into_response(),
                }
            }
            Some("description") => match field.text().await {
                Ok(text) => description = Some(text),
                Err(e) => return e.into_response(),
            },
            _ => {}
        }
    }

    let Some(file) = file else {
        return (StatusCode::BAD_REQUEST, "No file uploaded.").into_response();
    };
    Json(json!({
        "filename": file.filename,
        "mimetype": file.mimetype,
        "size": file.size,
        "metadata_received": description,
    }))
    .into_response()
}

async fn form_login(Form(fields): Form<HashMap<String, String>>) -> Json<Value> {
    Json(json!({
        "type": "Legacy Form",
        "received_user": fields.get("username"),
        "login_status": "active",
    }))
}

async fn binary(State(state): State<AppState>) -> Response {
    let mut bytes = vec![0u8; state.config.binary_bytes];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    ([(CONTENT_TYPE, "application/octet-stream")], bytes).into_response()
}

async fn compressible() -> Json<Value> {
    let items: Vec<Value> = (0..COMPRESS_ITEMS)
        .map(|i| json!({ "id": i, "text": format!("Repeating string to compress {i}") }))
        .collect();
    Json(Value::Array(items))
}

async fn redirect() -> Response {
    (StatusCode::MOVED_PERMANENTLY, [(LOCATION, REDIRECT_LOCATION)]).into_response()
}

async fn delayed(State(state): State<AppState>) -> Json<Value> {
    let delay = state.config.delay;
    tokio::time::sleep(delay).await;
    Json(json!({
        "message": "Response received after delay",
        "delay_ms": delay.as_millis() as u64,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

async fn large_body(State(state): State<AppState>) -> Response {
    ([(CONTENT_TYPE, "text/plain; charset=utf-8")], state.large_body.clone()).into_response()
}

fn png(result: Result<Bytes, crate::server::ServerError>) -> Response {
    match result {
        Ok(bytes) => ([(CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(e) => {
            warn!(error = %e, "Image rendering failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", e.to_string())
        }
    }
}

async fn small_image(State(state): State<AppState>) -> Response {
    png(state.images.small().await)
}

async fn large_image(State(state): State<AppState>) -> Response {
    png(state.images.large().await)
}

/// Counts a `/stream-xhr` producer while it runs.
struct ActiveStream(AppState);

impl ActiveStream {
    fn new(state: AppState) -> Self {
        state.active_streams.fetch_add(1, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.0.active_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

fn stream_chunk(n: u32, last: bool) -> Bytes {
    let mut chunk = format!("[Chunk {n}] Data received at {}\n", Local::now().format("%H:%M:%S"));
    if last {
        chunk.push_str(STREAM_FINISHED);
    }
    Bytes::from(chunk)
}

async fn stream_xhr(State(state): State<AppState>) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(4);
    let interval = state.config.stream_interval;
    let count = state.config.stream_chunks;
    let active = ActiveStream::new(state);

    tokio::spawn(async move {
        let _active = active;
        if tx.send(Ok(Bytes::from_static(STREAM_STARTED.as_bytes()))).await.is_err() {
            return;
        }
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        for n in 1..=count {
            tokio::select! {
                _ = tx.closed() => {
                    debug!(sent = n - 1, "Stream client went away");
                    return;
                }
                _ = ticks.tick() => {}
            }
            if tx.send(Ok(stream_chunk(n, n == count))).await.is_err() {
                return;
            }
        }
        debug!(chunks = count, "Stream finished");
    });

    (
        [
            (CONTENT_TYPE, "text/plain; charset=utf-8"),
            (CACHE_CONTROL, "no-cache"),
            (X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

async fn client_error() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "Forbidden", "message": "Invalid Token provided", "code": 4003 })),
    )
        .into_response()
}

async fn server_error() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, Html(SERVER_ERROR_HTML)).into_response()
}

/// Declares more bytes than it sends, then kills the connection.
async fn truncated(State(state): State<AppState>) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(2);
    let pause = state.config.truncate_after;

    tokio::spawn(async move {
        if tx.send(Ok(Bytes::from_static(TRUNCATED_BODY.as_bytes()))).await.is_err() {
            return;
        }
        tokio::time::sleep(pause).await;
        // A body error makes hyper drop the connection mid-response.
        let _ = tx
            .send(Err(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "truncated on purpose")))
            .await;
    });

    (
        [
            (CONTENT_TYPE, "application/json".to_string()),
            (CONTENT_LENGTH, TRUNCATED_DECLARED_LENGTH.to_string()),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

async fn invalid_json() -> Response {
    ([(CONTENT_TYPE, "application/json")], INVALID_JSON_BODY).into_response()
}

/// Reached only by a pipelined request; the first request of a connection
/// is answered by the listener's transport override.
async fn protocol_on_reused_connection() -> Response {
    warn!("Protocol fault requested on a pipelined connection");
    let mut response = json_error(
        StatusCode::BAD_GATEWAY,
        "Bad Gateway",
        "the protocol fault is only injected on a fresh connection",
    );
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

async fn hang() -> Response {
    debug!("Hanging request");
    std::future::pending::<Response>().await
}
