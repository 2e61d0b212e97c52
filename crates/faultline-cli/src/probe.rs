//! `faultline probe`: replays the canonical request sequence against a fault
//! server and records every exchange.
//!
//! Each entry is `{request, response}` on success or `{request, error}` when
//! the exchange failed. Response bodies are decoded by content type: JSON is
//! parsed, text is kept as text, anything else is hex encoded.

use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use faultline_core::harness::NetworkHarness;
use faultline_core::http::{AbortSignal, HttpRequest, HttpResponse, NetError};

const MULTIPART_BOUNDARY: &str = "faultline-probe-boundary";

/// Body of one probe request.
#[derive(Debug, Clone)]
pub enum ProbeBody {
    None,
    Json(Value),
    Form(Vec<(&'static str, &'static str)>),
    /// One file part plus text fields.
    Multipart {
        field: &'static str,
        filename: &'static str,
        content_type: &'static str,
        content: &'static str,
        fields: Vec<(&'static str, &'static str)>,
    },
}

/// One request of the sequence.
#[derive(Debug, Clone)]
pub struct ProbeStep {
    pub method: &'static str,
    pub path: &'static str,
    pub query: Vec<(&'static str, &'static str)>,
    pub body: ProbeBody,
    /// Overrides the default timeout.
    pub timeout: Option<Duration>,
}

fn step(method: &'static str, path: &'static str) -> ProbeStep {
    ProbeStep {
        method,
        path,
        query: Vec::new(),
        body: ProbeBody::None,
        timeout: None,
    }
}

impl ProbeStep {
    fn query(mut self, query: &[(&'static str, &'static str)]) -> Self {
        self.query = query.to_vec();
        self
    }

    fn body(mut self, body: ProbeBody) -> Self {
        self.body = body;
        self
    }

    fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Full URL below `base_url` (which ends in `/api`).
    pub fn url(&self, base_url: &str) -> String {
        let mut url = format!("{}{}", base_url.trim_end_matches('/'), self.path);
        if !self.query.is_empty() {
            let query: Vec<String> = self.query.iter().map(|(k, v)| format!("{k}={v}")).collect();
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }

    /// The request to send, plus the body as recorded in the log.
    pub fn request(&self, base_url: &str) -> (HttpRequest, Value) {
        let request = HttpRequest::new(self.method, self.url(base_url));
        match &self.body {
            ProbeBody::None => (request, Value::Null),
            ProbeBody::Json(value) => (request.json(value), value.clone()),
            ProbeBody::Form(fields) => {
                let encoded: Vec<String> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
                let recorded: Map<String, Value> =
                    fields.iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
                (
                    request
                        .header("Content-Type", "application/x-www-form-urlencoded")
                        .body(encoded.join("&")),
                    Value::Object(recorded),
                )
            }
            ProbeBody::Multipart {
                field,
                filename,
                content_type,
                content,
                fields,
            } => {
                let body = encode_multipart(field, filename, content_type, content, fields);
                let mut recorded: Map<String, Value> =
                    fields.iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
                recorded.insert(field.to_string(), json!({ "filename": filename, "size": content.len() }));
                (
                    request
                        .header(
                            "Content-Type",
                            format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
                        )
                        .body(body),
                    Value::Object(recorded),
                )
            }
        }
    }
}

/// Encodes a `multipart/form-data` body with one file part.
pub fn encode_multipart(
    field: &str,
    filename: &str,
    content_type: &str,
    content: &str,
    fields: &[(&str, &str)],
) -> String {
    let mut body = String::new();
    body.push_str(&format!(
        "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n{content}\r\n"
    ));
    for (name, value) in fields {
        body.push_str(&format!(
            "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    body.push_str(&format!("--{MULTIPART_BOUNDARY}--\r\n"));
    body
}

/// The canonical sequence: CRUD, encodings and payloads, then every fault.
pub fn canonical_steps(hang_timeout: Duration) -> Vec<ProbeStep> {
    vec![
        step("GET", "/get").query(&[("page", "2"), ("sort", "desc")]),
        step("POST", "/post").body(ProbeBody::Json(json!({"name": "Alice", "email": "alice@example.com"}))),
        step("POST", "/query-and-body")
            .query(&[("type", "test"), ("source", "mobile")])
            .body(ProbeBody::Json(json!({"payload": "data", "extra": 123}))),
        step("PATCH", "/patch/1").body(ProbeBody::Json(json!({"name": "Johnny"}))),
        step("PUT", "/put/2").body(ProbeBody::Json(json!({"name": "Janette", "email": "janette@example.com"}))),
        step("DELETE", "/delete/1"),
        step("POST", "/multipart").body(ProbeBody::Multipart {
            field: "multipart_data",
            filename: "test.txt",
            content_type: "text/plain",
            content: "filecontent",
            fields: vec![("description", "Test file upload")],
        }),
        step("POST", "/form").body(ProbeBody::Form(vec![("username", "testuser"), ("password", "1234")])),
        step("GET", "/binary"),
        step("GET", "/compress"),
        step("GET", "/redirect"),
        step("GET", "/delay"),
        step("GET", "/large-body"),
        step("GET", "/image"),
        step("GET", "/stream-xhr"),
        step("GET", "/error/client-error"),
        step("GET", "/error/server-error"),
        step("GET", "/error/truncated"),
        step("GET", "/error/json"),
        step("GET", "/error/protocol"),
        step("GET", "/error/hang").timeout(hang_timeout),
    ]
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn headers_value(headers: &[(String, String)]) -> Value {
    Value::Object(headers.iter().map(|(k, v)| (k.clone(), json!(v))).collect())
}

fn error_value(err: &NetError) -> Value {
    json!({ "kind": err.kind(), "message": err.to_string() })
}

/// Decodes a body for the log. JSON that fails to parse is reported as an
/// error next to the raw text.
pub fn decode_body(content_type: &str, body: &[u8]) -> (Value, Option<NetError>) {
    let content_type = content_type.to_ascii_lowercase();
    if content_type.contains("json") {
        let raw = String::from_utf8_lossy(body).into_owned();
        return match serde_json::from_str(&raw) {
            Ok(value) => (value, None),
            Err(e) => {
                let err = NetError::Malformed {
                    raw: raw.clone(),
                    error: e.to_string(),
                };
                (Value::String(raw), Some(err))
            }
        };
    }
    if content_type.starts_with("text/") || (content_type.is_empty() && std::str::from_utf8(body).is_ok()) {
        return (json!(String::from_utf8_lossy(body)), None);
    }
    (Value::String(hex(body)), None)
}

async fn record_response(response: HttpResponse) -> Result<(Value, Option<NetError>), NetError> {
    let status = response.status();
    let headers = headers_value(response.headers());
    let content_type = response.header("content-type").unwrap_or_default().to_string();
    let body = response.bytes().await?;
    let (body, error) = decode_body(&content_type, &body);
    Ok((json!({ "status": status, "headers": headers, "body": body }), error))
}

/// Runs `steps` in order and returns one log entry per step.
pub async fn run(harness: &NetworkHarness, base_url: &str, steps: &[ProbeStep], timeout: Duration) -> Vec<Value> {
    let mut log = Vec::with_capacity(steps.len());
    for step in steps {
        let (request, recorded_body) = step.request(base_url);
        let query: Map<String, Value> = step.query.iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
        let mut entry = Map::new();
        entry.insert(
            "request".to_string(),
            json!({
                "url": request.url,
                "method": request.method,
                "headers": headers_value(&request.headers),
                "query": query,
                "body": recorded_body,
            }),
        );

        let signal = AbortSignal::timeout(step.timeout.unwrap_or(timeout));
        let outcome = match harness.fetch(request, &signal).await {
            Ok(response) => record_response(response).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok((response, error)) => {
                entry.insert("response".to_string(), response);
                if let Some(err) = error {
                    entry.insert("error".to_string(), error_value(&err));
                }
                debug!(path = step.path, "Probe step answered");
            }
            Err(err) => {
                info!(path = step.path, kind = err.kind(), "Probe step failed");
                entry.insert("error".to_string(), error_value(&err));
            }
        }
        log.push(Value::Object(entry));
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_query() {
        let step = step("GET", "/get").query(&[("page", "2"), ("sort", "desc")]);
        assert_eq!(
            step.url("http://127.0.0.1:3000/api/"),
            "http://127.0.0.1:3000/api/get?page=2&sort=desc"
        );
    }

    #[test]
    fn multipart_body_layout() {
        let body = encode_multipart(
            "multipart_data",
            "test.txt",
            "text/plain",
            "filecontent",
            &[("description", "Test file upload")],
        );
        assert!(body.starts_with("--faultline-probe-boundary\r\n"));
        assert!(body.contains("name=\"multipart_data\"; filename=\"test.txt\"\r\nContent-Type: text/plain\r\n\r\nfilecontent\r\n"));
        assert!(body.contains("name=\"description\"\r\n\r\nTest file upload\r\n"));
        assert!(body.ends_with("--faultline-probe-boundary--\r\n"));
    }

    #[test]
    fn form_request_is_urlencoded() {
        let step = step("POST", "/form").body(ProbeBody::Form(vec![("username", "testuser"), ("password", "1234")]));
        let (request, recorded) = step.request("http://h/api");
        assert_eq!(request.body.as_deref(), Some(&b"username=testuser&password=1234"[..]));
        assert_eq!(recorded, json!({"username": "testuser", "password": "1234"}));
    }

    #[test]
    fn bodies_decode_by_content_type() {
        assert_eq!(decode_body("application/json; charset=utf-8", b"{\"a\":1}").0, json!({"a": 1}));
        assert_eq!(decode_body("text/html", b"<h1>x</h1>").0, json!("<h1>x</h1>"));
        assert_eq!(decode_body("application/octet-stream", &[0, 255, 16]).0, json!("00ff10"));

        let (raw, err) = decode_body("application/json", b"{ \"data\": [1, ");
        assert_eq!(raw, json!("{ \"data\": [1, "));
        assert_eq!(err.map(|e| e.kind()), Some("MalformedResponse"));
    }

    #[test]
    fn canonical_sequence_ends_with_hang() {
        let steps = canonical_steps(Duration::from_secs(10));
        assert_eq!(steps.len(), 21);
        let last = steps.last().unwrap();
        assert_eq!(last.path, "/error/hang");
        assert_eq!(last.timeout, Some(Duration::from_secs(10)));
        assert!(steps.iter().any(|s| s.path == "/error/protocol"));
    }
}
