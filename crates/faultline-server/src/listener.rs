//! Connection-level fault injection.
//!
//! Some faults cannot be expressed through an HTTP framework, which always
//! writes a well-formed status line. [`FaultListener`] sits between the TCP
//! socket and axum: it peeks at the first request line of every new
//! connection and, for routes with a [`TransportOverride`], takes the raw
//! socket away from the HTTP stack and writes the faulty bytes itself.
//!
//! Only the first request of a connection is inspected. The server closes
//! every connection after one response, so a later request on the same
//! connection only happens with pipelining and reaches the router instead.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::scenario::PROTOCOL_VIOLATION_PATH;

/// What `/error/protocol` writes instead of an HTTP response.
pub const PROTOCOL_VIOLATION_BYTES: &[u8] = b"BAD_PROTOCOL 999 WHAT?\r\nContent-Type: ?????\r\n\r\nSome raw data";

const PEEK_LIMIT: usize = 8 * 1024;
const PEEK_TIMEOUT: Duration = Duration::from_secs(2);
const PEEK_POLL: Duration = Duration::from_millis(5);
const HEAD_LIMIT: usize = 64 * 1024;
const BACKLOG: usize = 64;

/// A response written below the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOverride {
    /// Non-HTTP bytes, then a clean close.
    ProtocolViolation,
}

impl TransportOverride {
    /// The override for a raw `GET` request line, if any.
    pub fn for_request_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        if parts.next()? != "GET" {
            return None;
        }
        let target = parts.next()?;
        let path = target.split('?').next().unwrap_or(target);
        (path == PROTOCOL_VIOLATION_PATH).then_some(Self::ProtocolViolation)
    }

    async fn apply(self, mut stream: TcpStream) -> io::Result<()> {
        match self {
            Self::ProtocolViolation => {
                drain_head(&mut stream).await?;
                stream.write_all(PROTOCOL_VIOLATION_BYTES).await?;
                stream.flush().await?;
                stream.shutdown().await
            }
        }
    }
}

/// Consumes the request head so closing the socket does not reset it.
async fn drain_head(stream: &mut TcpStream) -> io::Result<()> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < HEAD_LIMIT {
        let n = tokio::time::timeout(PEEK_TIMEOUT, stream.read(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request head not received"))??;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    Ok(())
}

/// Waits until the first request line is buffered and returns it.
///
/// Returns `None` if the peer closes first. Connections that stay silent
/// past the timeout are handed to the HTTP stack as they are.
async fn peek_request_line(stream: &TcpStream) -> io::Result<Option<String>> {
    let mut buf = vec![0u8; PEEK_LIMIT];
    let deadline = tokio::time::Instant::now() + PEEK_TIMEOUT;
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(end) = buf[..n].windows(2).position(|w| w == b"\r\n") {
            return Ok(Some(String::from_utf8_lossy(&buf[..end]).into_owned()));
        }
        if n == buf.len() || tokio::time::Instant::now() >= deadline {
            return Ok(Some(String::new()));
        }
        tokio::time::sleep(PEEK_POLL).await;
    }
}

async fn classify(stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<(TcpStream, SocketAddr)>) {
    let line = match peek_request_line(&stream).await {
        Ok(Some(line)) => line,
        Ok(None) => return,
        Err(e) => {
            debug!(%peer, error = %e, "Connection failed before first request");
            return;
        }
    };

    match TransportOverride::for_request_line(&line) {
        Some(fault) => {
            info!(%peer, ?fault, "Applying transport override");
            if let Err(e) = fault.apply(stream).await {
                debug!(%peer, error = %e, "Transport override interrupted");
            }
        }
        None => {
            let _ = tx.send((stream, peer)).await;
        }
    }
}

/// A [`axum::serve::Listener`] that applies [`TransportOverride`]s.
pub struct FaultListener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<(TcpStream, SocketAddr)>,
}

impl FaultListener {
    /// Starts accepting on `listener` until `shutdown` fires.
    pub fn new(listener: TcpListener, shutdown: CancellationToken) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, incoming) = mpsc::channel(BACKLOG);

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(classify(stream, peer, tx.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
            debug!("Acceptor stopped");
        });

        Ok(Self { local_addr, incoming })
    }
}

impl axum::serve::Listener for FaultListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(connection) => connection,
            // Acceptor gone: serve only finishes through graceful shutdown.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}
