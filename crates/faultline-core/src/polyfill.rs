//! Polyfilled network stack: a minimal HTTP/1.1 client on a raw TCP stream.
//!
//! Used as the drop-in replacement for [`NativeTransport`](crate::http::NativeTransport)
//! when the app runs in polyfill mode. It writes the request by hand, parses
//! the status line and headers itself and frames the body by
//! `Content-Length`, chunked transfer encoding or connection close. Every
//! request uses `Connection: close`, and no `Accept-Encoding` is sent, so
//! bodies arrive identity-encoded.
//!
//! Redirects are followed within the same origin only; a redirect to another
//! origin is handed back as the 3xx response. Only plain `http://` URLs are
//! supported.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::http::{BodySource, HttpRequest, HttpResponse, HttpTransport, NetError};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_REDIRECTS: usize = 10;
const READ_CHUNK: usize = 16 * 1024;

/// HTTP/1.1 over a hand-driven TCP stream.
#[derive(Debug, Clone, Default)]
pub struct PolyfillTransport {
    _private: (),
}

impl PolyfillTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpTransport for PolyfillTransport {
    fn name(&self) -> &'static str {
        "polyfill"
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, NetError> {
        let mut url = Url::parse(&request.url).map_err(|e| NetError::InvalidRequest(e.to_string()))?;
        let mut method = request.method.to_ascii_uppercase();
        let mut body = request.body;

        for _ in 0..=MAX_REDIRECTS {
            let response = exchange(&method, &url, &request.headers, body.as_ref()).await?;
            let status = response.status();
            let location = match status {
                301 | 302 | 303 | 307 | 308 => response.header("location").map(str::to_string),
                _ => None,
            };
            let Some(location) = location else {
                return Ok(response);
            };

            let next = url
                .join(&location)
                .map_err(|e| NetError::ProtocolViolation(format!("bad redirect location {location:?}: {e}")))?;
            if next.origin() != url.origin() {
                debug!(status, from = %url, to = %next, "Cross-origin redirect returned unfollowed");
                return Ok(response);
            }
            debug!(status, from = %url, to = %next, "Following redirect");
            response.cancel().await;

            if status == 303 || (matches!(status, 301 | 302) && method == "POST") {
                method = "GET".to_string();
                body = None;
            }
            url = next;
        }
        Err(NetError::Transport(format!("more than {MAX_REDIRECTS} redirects")))
    }
}

/// One request/response exchange on a fresh connection.
async fn exchange(
    method: &str,
    url: &Url,
    headers: &[(String, String)],
    body: Option<&Bytes>,
) -> Result<HttpResponse, NetError> {
    if url.scheme() != "http" {
        return Err(NetError::InvalidRequest(format!(
            "polyfill supports plain http only, got {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| NetError::InvalidRequest(format!("no host in {url}")))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| NetError::Transport(format!("connect {host}:{port}: {e}")))?;
    let mut reader = BufReader::new(stream);

    let head = encode_request(method, url, headers, body);
    reader
        .get_mut()
        .write_all(&head)
        .await
        .map_err(|e| NetError::Transport(e.to_string()))?;
    if let Some(body) = body {
        reader
            .get_mut()
            .write_all(body)
            .await
            .map_err(|e| NetError::Transport(e.to_string()))?;
    }

    let (status, response_headers) = read_head(&mut reader).await?;
    let framing = framing_for(method, status, &response_headers)?;
    Ok(HttpResponse::new(
        status,
        url.as_str(),
        response_headers,
        Box::new(PolyfillBody {
            reader: Some(reader),
            framing,
        }),
    ))
}

fn encode_request(method: &str, url: &Url, headers: &[(String, String)], body: Option<&Bytes>) -> Vec<u8> {
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    };

    let mut head = format!("{method} {target} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n");
    let has = |name: &str| headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name));
    if !has("accept") {
        head.push_str("Accept: */*\r\n");
    }
    if !has("user-agent") {
        head.push_str(concat!("User-Agent: faultline-polyfill/", env!("CARGO_PKG_VERSION"), "\r\n"));
    }
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("accept-encoding")
        {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    match body {
        Some(body) => head.push_str(&format!("Content-Length: {}\r\n", body.len())),
        None if matches!(method, "POST" | "PUT" | "PATCH") => head.push_str("Content-Length: 0\r\n"),
        None => {}
    }
    head.push_str("\r\n");
    head.into_bytes()
}

async fn read_line(reader: &mut BufReader<TcpStream>, budget: &mut usize) -> Result<Option<String>, NetError> {
    let mut line = Vec::new();
    let n = reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| NetError::Transport(e.to_string()))?;
    if n == 0 {
        return Ok(None);
    }
    *budget = budget.saturating_sub(n);
    if *budget == 0 {
        return Err(NetError::ProtocolViolation("response head too large".to_string()));
    }
    while line.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// Parses `HTTP/1.x <status> <reason>`.
pub(crate) fn parse_status_line(line: &str) -> Result<u16, NetError> {
    let violation = || NetError::ProtocolViolation(format!("invalid status line {line:?}"));
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(violation());
    }
    let code = parts.next().unwrap_or_default();
    if code.len() != 3 {
        return Err(violation());
    }
    let status: u16 = code.parse().map_err(|_| violation())?;
    if !(100..=599).contains(&status) {
        return Err(violation());
    }
    Ok(status)
}

async fn read_head(reader: &mut BufReader<TcpStream>) -> Result<(u16, Vec<(String, String)>), NetError> {
    let mut budget = MAX_HEAD_BYTES;
    loop {
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or_else(|| NetError::Transport("connection closed before response".to_string()))?;
        let status = parse_status_line(&line)?;

        let mut headers = Vec::new();
        loop {
            let line = read_line(reader, &mut budget)
                .await?
                .ok_or_else(|| NetError::ProtocolViolation("connection closed inside headers".to_string()))?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| NetError::ProtocolViolation(format!("invalid header line {line:?}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        // Interim responses precede the real one.
        if (100..200).contains(&status) && status != 101 {
            continue;
        }
        return Ok((status, headers));
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Framing {
    Length { remaining: u64 },
    Chunked,
    Close,
    Done,
}

fn framing_for(method: &str, status: u16, headers: &[(String, String)]) -> Result<Framing, NetError> {
    if method == "HEAD" || status == 204 || status == 304 {
        return Ok(Framing::Done);
    }
    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };
    if header("transfer-encoding").is_some_and(|te| te.to_ascii_lowercase().contains("chunked")) {
        return Ok(Framing::Chunked);
    }
    match header("content-length") {
        Some(length) => {
            let remaining = length
                .trim()
                .parse()
                .map_err(|_| NetError::ProtocolViolation(format!("invalid content-length {length:?}")))?;
            Ok(if remaining == 0 {
                Framing::Done
            } else {
                Framing::Length { remaining }
            })
        }
        None => Ok(Framing::Close),
    }
}

struct PolyfillBody {
    reader: Option<BufReader<TcpStream>>,
    framing: Framing,
}

fn is_cut_off(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    )
}

fn truncated() -> NetError {
    // Counts are filled in by `HttpResponse::chunk`.
    NetError::Truncated {
        expected: None,
        received: 0,
    }
}

impl PolyfillBody {
    fn finish(&mut self) {
        self.framing = Framing::Done;
        self.reader = None;
    }

    async fn read_some(reader: &mut BufReader<TcpStream>, limit: usize) -> std::io::Result<Bytes> {
        let mut buf = vec![0u8; limit];
        let n = reader.read(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn next_chunked(&mut self) -> Result<Option<Bytes>, NetError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut budget = MAX_HEAD_BYTES;
        let size_line = match read_line(reader, &mut budget).await {
            Ok(Some(line)) => line,
            Ok(None) => return Err(truncated()),
            Err(NetError::Transport(_)) => return Err(truncated()),
            Err(e) => return Err(e),
        };
        let size_text = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| NetError::ProtocolViolation(format!("invalid chunk size {size_line:?}")))?;

        if size == 0 {
            // Trailer section ends with an empty line.
            while let Ok(Some(line)) = read_line(reader, &mut budget).await {
                if line.is_empty() {
                    break;
                }
            }
            self.finish();
            return Ok(None);
        }

        let mut data = vec![0u8; size];
        if let Err(e) = reader.read_exact(&mut data).await {
            return Err(if is_cut_off(&e) {
                truncated()
            } else {
                NetError::Transport(e.to_string())
            });
        }
        let mut crlf = [0u8; 2];
        if let Err(e) = reader.read_exact(&mut crlf).await {
            if !is_cut_off(&e) {
                return Err(NetError::Transport(e.to_string()));
            }
        }
        Ok(Some(Bytes::from(data)))
    }
}

#[async_trait]
impl BodySource for PolyfillBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, NetError> {
        let result = match self.framing {
            Framing::Done => return Ok(None),
            Framing::Chunked => self.next_chunked().await,
            Framing::Length { remaining } => {
                let Some(reader) = self.reader.as_mut() else {
                    return Ok(None);
                };
                let limit = remaining.min(READ_CHUNK as u64) as usize;
                match Self::read_some(reader, limit).await {
                    Ok(chunk) if chunk.is_empty() => Err(truncated()),
                    Ok(chunk) => {
                        let remaining = remaining - chunk.len() as u64;
                        self.framing = if remaining == 0 {
                            Framing::Done
                        } else {
                            Framing::Length { remaining }
                        };
                        Ok(Some(chunk))
                    }
                    Err(e) if is_cut_off(&e) => Err(truncated()),
                    Err(e) => Err(NetError::Transport(e.to_string())),
                }
            }
            Framing::Close => {
                let Some(reader) = self.reader.as_mut() else {
                    return Ok(None);
                };
                match Self::read_some(reader, READ_CHUNK).await {
                    Ok(chunk) if chunk.is_empty() => Ok(None),
                    Ok(chunk) => Ok(Some(chunk)),
                    Err(e) => Err(NetError::Transport(e.to_string())),
                }
            }
        };
        match &result {
            Ok(None) | Err(_) => self.finish(),
            Ok(Some(_)) if self.framing == Framing::Done => self.reader = None,
            Ok(Some(_)) => {}
        }
        result
    }

    async fn cancel(&mut self) {
        self.finish();
    }
}
