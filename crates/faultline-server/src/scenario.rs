//! The route table as data.
//!
//! Every route the server answers is described by a [`FaultScenario`]: which
//! status it returns, what its body looks like and how the response is
//! timed. The table drives the index page, `faultline scenarios` and the
//! request prober, and is checked against the router in tests.

use serde::Serialize;

use crate::config::ServerConfig;

/// Prefix of every API route.
pub const API_BASE: &str = "/api";

/// The route answered through the transport override instead of HTTP.
pub const PROTOCOL_VIOLATION_PATH: &str = "/api/error/protocol";

/// Where `/redirect` points.
pub const REDIRECT_LOCATION: &str = "/api/get?redirected=true";

/// Which status line a route produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StatusPolicy {
    /// Always this status.
    Fixed { status: u16 },
    /// `found` when the addressed record exists, `missing` otherwise.
    RecordDependent { found: u16, missing: u16 },
    /// No status line is ever written.
    Absent,
}

/// Shape of the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BodyPolicy {
    WellFormedJson,
    /// Plain text or HTML with the given content type.
    Text { content_type: &'static str },
    /// `Content-Length: declared` but far fewer bytes, then the connection dies.
    Truncated { declared: u64 },
    /// `application/json` with syntactically broken JSON.
    InvalidJson,
    /// Raw bytes that do not form an HTTP response.
    RawProtocolViolation,
    Binary { content_type: &'static str },
    ChunkedStream,
    Redirect { location: &'static str },
    Empty,
}

/// When the response is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TimingPolicy {
    Immediate,
    FixedDelay { ms: u64 },
    /// Never answers.
    Hang,
    ChunkedInterval { ms: u64, count: u32 },
}

/// One route and its declared behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultScenario {
    pub method: &'static str,
    /// Path with `:id` placeholders.
    pub path: &'static str,
    pub status: StatusPolicy,
    pub body: BodyPolicy,
    pub timing: TimingPolicy,
    pub summary: &'static str,
}

impl FaultScenario {
    /// Whether the route misbehaves on purpose.
    pub fn is_fault(&self) -> bool {
        matches!(
            self.body,
            BodyPolicy::Truncated { .. } | BodyPolicy::InvalidJson | BodyPolicy::RawProtocolViolation
        ) || matches!(self.timing, TimingPolicy::Hang)
            || matches!(self.status, StatusPolicy::Fixed { status } if status >= 400)
    }

    /// The path with placeholders filled in with `id`.
    pub fn concrete_path(&self, id: i64) -> String {
        self.path.replace(":id", &id.to_string())
    }
}

const fn fixed(status: u16) -> StatusPolicy {
    StatusPolicy::Fixed { status }
}

const JSON: BodyPolicy = BodyPolicy::WellFormedJson;
const NOW: TimingPolicy = TimingPolicy::Immediate;

fn scenario(
    method: &'static str,
    path: &'static str,
    status: StatusPolicy,
    body: BodyPolicy,
    timing: TimingPolicy,
    summary: &'static str,
) -> FaultScenario {
    FaultScenario {
        method,
        path,
        status,
        body,
        timing,
        summary,
    }
}

/// The full route table for `config`.
pub fn fault_table(config: &ServerConfig) -> Vec<FaultScenario> {
    let delay_ms = config.delay.as_millis() as u64;
    let interval_ms = config.stream_interval.as_millis() as u64;
    let missing = StatusPolicy::RecordDependent {
        found: 200,
        missing: 404,
    };

    vec![
        scenario("GET", "/api/get", fixed(200), JSON, NOW, "record list echoing page/sort"),
        scenario("POST", "/api/post", fixed(201), JSON, NOW, "create record"),
        scenario("POST", "/api/query-and-body", fixed(200), JSON, NOW, "echo query and body"),
        scenario(
            "PATCH",
            "/api/patch/:id",
            StatusPolicy::RecordDependent {
                found: 204,
                missing: 404,
            },
            BodyPolicy::Empty,
            NOW,
            "partial update, no body",
        ),
        scenario("PUT", "/api/put/:id", missing, JSON, NOW, "full replace"),
        scenario("DELETE", "/api/delete/:id", missing, JSON, NOW, "remove record"),
        scenario("POST", "/api/multipart", fixed(200), JSON, NOW, "file + field echo"),
        scenario("POST", "/api/form", fixed(200), JSON, NOW, "URL-encoded form echo"),
        scenario(
            "GET",
            "/api/binary",
            fixed(200),
            BodyPolicy::Binary {
                content_type: "application/octet-stream",
            },
            NOW,
            "random octet-stream",
        ),
        scenario("GET", "/api/compress", fixed(200), JSON, NOW, "large gzip-compressible JSON"),
        scenario(
            "GET",
            "/api/redirect",
            fixed(301),
            BodyPolicy::Redirect {
                location: REDIRECT_LOCATION,
            },
            NOW,
            "permanent redirect to /api/get",
        ),
        scenario(
            "GET",
            "/api/delay",
            fixed(200),
            JSON,
            TimingPolicy::FixedDelay { ms: delay_ms },
            "fixed-delay response",
        ),
        scenario(
            "GET",
            "/api/large-body",
            fixed(200),
            BodyPolicy::Text {
                content_type: "text/plain; charset=utf-8",
            },
            NOW,
            "multi-megabyte text body",
        ),
        scenario(
            "GET",
            "/api/image",
            fixed(200),
            BodyPolicy::Binary {
                content_type: "image/png",
            },
            NOW,
            "small PNG",
        ),
        scenario(
            "GET",
            "/api/large-image",
            fixed(200),
            BodyPolicy::Binary {
                content_type: "image/png",
            },
            NOW,
            "large PNG",
        ),
        scenario(
            "GET",
            "/api/stream-xhr",
            fixed(200),
            BodyPolicy::ChunkedStream,
            TimingPolicy::ChunkedInterval {
                ms: interval_ms,
                count: config.stream_chunks,
            },
            "chunked plain-text stream",
        ),
        scenario("GET", "/api/error/client-error", fixed(403), JSON, NOW, "structured 403"),
        scenario(
            "GET",
            "/api/error/server-error",
            fixed(503),
            BodyPolicy::Text {
                content_type: "text/html; charset=utf-8",
            },
            NOW,
            "HTML 503",
        ),
        scenario(
            "GET",
            "/api/error/truncated",
            fixed(200),
            BodyPolicy::Truncated { declared: 1024 },
            NOW,
            "oversized Content-Length, then forced close",
        ),
        scenario("GET", "/api/error/json", fixed(200), BodyPolicy::InvalidJson, NOW, "malformed JSON"),
        scenario(
            "GET",
            PROTOCOL_VIOLATION_PATH,
            StatusPolicy::Absent,
            BodyPolicy::RawProtocolViolation,
            NOW,
            "raw non-HTTP bytes, then close",
        ),
        scenario(
            "GET",
            "/api/error/hang",
            StatusPolicy::Absent,
            BodyPolicy::Empty,
            TimingPolicy::Hang,
            "accept, never respond",
        ),
    ]
}
