//! HTTP client seam used by the instrumented app.
//!
//! Requests go through an [`HttpTransport`]. Two transports exist:
//! [`NativeTransport`] (reqwest) and
//! [`PolyfillTransport`](crate::polyfill::PolyfillTransport), a minimal
//! HTTP/1.1 client on a raw TCP stream. Both report failures through the same
//! [`NetError`] taxonomy so scenarios can be compared across them.
//!
//! Cancellation is driven by an [`AbortSignal`]: a cancellation token plus an
//! optional deadline. The signal covers the whole exchange, headers and body.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::FetchSpec;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure taxonomy of an HTTP exchange.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetError {
    /// The signal's deadline passed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The signal was cancelled explicitly.
    #[error("request aborted")]
    Aborted,

    /// The body does not parse under its declared content type.
    #[error("malformed response body: {error}")]
    Malformed { raw: String, error: String },

    /// The connection ended before the declared body length arrived.
    #[error("response truncated: received {received} of {} bytes", display_length(.expected))]
    Truncated { expected: Option<u64>, received: u64 },

    /// The bytes on the wire are not an HTTP response.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Connection-level failure (refused, reset, DNS, TLS).
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with an error status.
    #[error("HTTP status {0}")]
    Status(u16),

    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

fn display_length(length: &Option<u64>) -> String {
    length.map_or_else(|| "unknown".to_string(), |n| n.to_string())
}

impl NetError {
    /// Stable name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            NetError::Timeout(_) => "Timeout",
            NetError::Aborted => "Aborted",
            NetError::Malformed { .. } => "MalformedResponse",
            NetError::Truncated { .. } => "TransportTruncation",
            NetError::ProtocolViolation(_) => "ProtocolViolation",
            NetError::Transport(_) => "Transport",
            NetError::Status(_) => "Status",
            NetError::InvalidRequest(_) => "InvalidRequest",
        }
    }
}

// ---------------------------------------------------------------------------
// Abort signal
// ---------------------------------------------------------------------------

/// Caller-supplied cancellation for one exchange.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl AbortSignal {
    /// A signal that only fires on [`cancel`](Self::cancel).
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that fires `limit` from now.
    pub fn timeout(limit: Duration) -> Self {
        Self::new().with_timeout(limit)
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.deadline = Some((Instant::now() + limit, limit));
        self
    }

    /// Uses an externally owned token, e.g. a child of a shutdown token.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal fires, with the error it stands for.
    pub async fn fired(&self) -> NetError {
        match self.deadline {
            Some((at, limit)) => tokio::select! {
                biased;
                _ = self.token.cancelled() => NetError::Aborted,
                _ = tokio::time::sleep_until(at) => NetError::Timeout(limit),
            },
            None => {
                self.token.cancelled().await;
                NetError::Aborted
            }
        }
    }

    /// Runs `fut` unless the signal fires first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, NetError>
    where
        F: Future<Output = Result<T, NetError>>,
    {
        tokio::select! {
            biased;
            err = self.fired() => Err(err),
            result = fut => result,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// An outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets a JSON body and its content type.
    pub fn json(self, value: &Value) -> Self {
        let body = value.to_string();
        self.with_default_header("Content-Type", "application/json").body(body)
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    fn with_default_header(self, name: &str, value: &str) -> Self {
        if self.has_header(name) {
            self
        } else {
            self.header(name, value)
        }
    }

    /// Sets a `multipart/form-data` body. Object values carrying a
    /// `filename` become file parts; everything else is a text field.
    pub fn multipart(self, fields: &Map<String, Value>) -> Self {
        let content_type = format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}");
        self.header("Content-Type", content_type).body(encode_multipart(fields))
    }

    /// Builds the request a `fetchData` command describes. Multipart fields
    /// take precedence over `body`. String bodies are sent verbatim as a
    /// URL-encoded form unless the caller names a content type; other JSON
    /// values are serialized.
    pub fn from_fetch(spec: &FetchSpec) -> Self {
        let method = spec.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let mut request = Self::new(method, spec.url.clone());
        for (name, value) in &spec.headers {
            request = request.header(name.clone(), text_of(value));
        }
        if let Some(fields) = &spec.multipart {
            return request.multipart(fields);
        }
        match &spec.body {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request
                .with_default_header("Content-Type", "application/x-www-form-urlencoded")
                .body(text.clone()),
            Some(other) => request.json(other),
        }
    }
}

const MULTIPART_BOUNDARY: &str = "faultline-form-boundary";

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn encode_multipart(fields: &Map<String, Value>) -> String {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!("--{MULTIPART_BOUNDARY}\r\n"));
        match value {
            Value::Object(file) if file.contains_key("filename") => {
                let filename = file.get("filename").map(text_of).unwrap_or_default();
                let content_type = file
                    .get("contentType")
                    .map(text_of)
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let content = file.get("content").map(text_of).unwrap_or_default();
                body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n{content}\r\n"
                ));
            }
            other => {
                body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{}\r\n",
                    text_of(other)
                ));
            }
        }
    }
    body.push_str(&format!("--{MULTIPART_BOUNDARY}--\r\n"));
    body
}

/// Produces a response body one chunk at a time.
#[async_trait]
pub trait BodySource: Send {
    /// The next chunk, or `None` at the end of the body.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, NetError>;

    /// Releases the underlying connection. Further reads return `None`.
    async fn cancel(&mut self);
}

/// A received response head with a lazily read body.
pub struct HttpResponse {
    status: u16,
    url: String,
    headers: Vec<(String, String)>,
    body: Box<dyn BodySource>,
    received: u64,
    finished: bool,
    signal: AbortSignal,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Header names are stored lowercased.
    pub fn new(
        status: u16,
        url: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Box<dyn BodySource>,
    ) -> Self {
        Self {
            status,
            url: url.into(),
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect(),
            body,
            received: 0,
            finished: false,
            signal: AbortSignal::new(),
        }
    }

    pub(crate) fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The final URL, after redirects.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The declared `Content-Length`, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// Bytes of body read so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Fails with [`NetError::Status`] for non-2xx responses.
    pub fn error_for_status(self) -> Result<Self, NetError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(NetError::Status(self.status))
        }
    }

    /// Reads the next body chunk under the response's abort signal.
    ///
    /// A body that ends short of its `Content-Length` fails with
    /// [`NetError::Truncated`].
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, NetError> {
        if self.finished {
            return Ok(None);
        }
        let expected = self.content_length();
        let signal = self.signal.clone();
        let next = signal.run(self.body.next_chunk()).await;
        match next {
            Ok(Some(chunk)) => {
                self.received += chunk.len() as u64;
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.finished = true;
                match expected {
                    Some(expected) if self.received < expected => Err(NetError::Truncated {
                        expected: Some(expected),
                        received: self.received,
                    }),
                    _ => Ok(None),
                }
            }
            Err(NetError::Truncated { .. }) => {
                self.finished = true;
                Err(NetError::Truncated {
                    expected,
                    received: self.received,
                })
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    /// Reads the remaining body.
    pub async fn bytes(mut self) -> Result<Bytes, NetError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Reads the remaining body as text, replacing invalid UTF-8.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads and parses the body as JSON.
    ///
    /// # Errors
    ///
    /// - [`NetError::Malformed`] carrying the raw text and the parse error.
    /// - Any error of [`chunk`](Self::chunk).
    pub async fn json(self) -> Result<Value, NetError> {
        let raw = self.text().await?;
        serde_json::from_str(&raw).map_err(|e| NetError::Malformed {
            raw,
            error: e.to_string(),
        })
    }

    /// Stops reading and releases the connection.
    pub async fn cancel(mut self) {
        self.finished = true;
        self.body.cancel().await;
        debug!(url = %self.url, received = self.received, "Response body cancelled");
    }
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// A network implementation the app can be switched to.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Short name used in logs and reports.
    fn name(&self) -> &'static str;

    /// Sends the request and returns once the response head is received.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, NetError>;
}

/// Sends `request` under `signal`. The signal keeps governing body reads of
/// the returned response.
pub async fn fetch(
    transport: &dyn HttpTransport,
    request: HttpRequest,
    signal: &AbortSignal,
) -> Result<HttpResponse, NetError> {
    debug!(transport = transport.name(), method = %request.method, url = %request.url, "Fetch");
    let response = signal.run(transport.send(request)).await?;
    Ok(response.with_signal(signal.clone()))
}

/// The platform network stack, backed by reqwest.
#[derive(Debug, Clone)]
pub struct NativeTransport {
    client: reqwest::Client,
}

impl NativeTransport {
    pub fn new() -> Result<Self, NetError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| NetError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for NativeTransport {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, NetError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| NetError::InvalidRequest(e.to_string()))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| classify_reqwest(&e))?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Ok(HttpResponse::new(
            status,
            url,
            headers,
            Box::new(NativeBody {
                response: Some(response),
            }),
        ))
    }
}

struct NativeBody {
    response: Option<reqwest::Response>,
}

#[async_trait]
impl BodySource for NativeBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, NetError> {
        let Some(response) = self.response.as_mut() else {
            return Ok(None);
        };
        match response.chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.response = None;
                Ok(None)
            }
            Err(e) => {
                self.response = None;
                Err(classify_reqwest(&e))
            }
        }
    }

    async fn cancel(&mut self) {
        self.response = None;
    }
}

/// Maps a reqwest failure onto the taxonomy by inspecting the hyper cause.
fn classify_reqwest(err: &reqwest::Error) -> NetError {
    if let Some(cause) = hyper_cause(err) {
        if cause.is_parse() || cause.is_parse_status() {
            return NetError::ProtocolViolation(cause.to_string());
        }
        if cause.is_incomplete_message() {
            return NetError::Truncated {
                expected: None,
                received: 0,
            };
        }
    }
    // hyper reports a body cut short of its Content-Length as UnexpectedEof.
    if io_cause(err).is_some_and(|e| {
        matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
        )
    }) && (err.is_body() || err.is_decode())
    {
        return NetError::Truncated {
            expected: None,
            received: 0,
        };
    }
    if err.is_builder() {
        return NetError::InvalidRequest(err.to_string());
    }
    NetError::Transport(error_chain(err))
}

fn hyper_cause<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a hyper::Error> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(cause) = e.downcast_ref::<hyper::Error>() {
            return Some(cause);
        }
        current = e.source();
    }
    None
}

fn io_cause<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a std::io::Error> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(cause) = e.downcast_ref::<std::io::Error>() {
            return Some(cause);
        }
        current = e.source();
    }
    None
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        text.push_str(": ");
        text.push_str(&e.to_string());
        current = e.source();
    }
    text
}
