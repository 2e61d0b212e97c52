//! Streaming/polyfill harness.
//!
//! [`NetworkHarness`] holds the app's current network implementation and
//! lets scenarios flip between the native and the polyfilled stack. The same
//! streaming scenario can then be run under both modes and the resulting
//! [`StreamReport`]s compared.
//!
//! # Example
//!
//! ```no_run
//! use faultline_core::harness::{NetworkHarness, NetworkMode};
//! use faultline_core::http::AbortSignal;
//! use faultline_core::protocol::StreamPolicy;
//!
//! # async fn run() -> Result<(), faultline_core::http::NetError> {
//! let harness = NetworkHarness::with_defaults()?;
//! let url = "http://127.0.0.1:3000/api/stream-xhr";
//!
//! let native = harness
//!     .run_stream(url, StreamPolicy::Cancel { after: 3 }, AbortSignal::new())
//!     .await;
//! let polyfill = harness
//!     .with_mode(NetworkMode::Polyfill, harness.run_stream(url, StreamPolicy::Cancel { after: 3 }, AbortSignal::new()))
//!     .await;
//! assert_eq!(native.chunks, polyfill.chunks);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::http::{fetch, AbortSignal, HttpRequest, HttpResponse, HttpTransport, NativeTransport, NetError};
use crate::polyfill::PolyfillTransport;
use crate::protocol::StreamPolicy;

/// Timeout applied to fire-and-forget requests.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Which network implementation is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Native,
    Polyfill,
}

impl NetworkMode {
    pub fn from_polyfill(enabled: bool) -> Self {
        if enabled {
            NetworkMode::Polyfill
        } else {
            NetworkMode::Native
        }
    }
}

/// Failure recorded in a [`StreamReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedError {
    pub kind: String,
    pub message: String,
}

impl From<&NetError> for ReportedError {
    fn from(err: &NetError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Terminal state of a streaming scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamReport {
    #[serde(flatten)]
    pub policy: StreamPolicy,
    pub mode: NetworkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Body chunks read. Always zero for `fallback`, which reads the body
    /// as a whole.
    pub chunks: usize,
    pub bytes: u64,
    /// Whether the reader was cancelled explicitly.
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportedError>,
}

impl StreamReport {
    fn new(policy: StreamPolicy, mode: NetworkMode) -> Self {
        Self {
            policy,
            mode,
            status: None,
            chunks: 0,
            bytes: 0,
            cancelled: false,
            error: None,
        }
    }

    fn failed(mut self, err: &NetError) -> Self {
        self.error = Some(err.into());
        self
    }
}

/// The app's switchable network stack.
pub struct NetworkHarness {
    native: Arc<dyn HttpTransport>,
    polyfill: Arc<dyn HttpTransport>,
    mode: RwLock<NetworkMode>,
    fetch_timeout: Duration,
}

impl NetworkHarness {
    pub fn new(native: Arc<dyn HttpTransport>, polyfill: Arc<dyn HttpTransport>) -> Self {
        Self {
            native,
            polyfill,
            mode: RwLock::new(NetworkMode::Native),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Reqwest for native mode, [`PolyfillTransport`] for polyfill mode.
    pub fn with_defaults() -> Result<Self, NetError> {
        Ok(Self::new(
            Arc::new(NativeTransport::new()?),
            Arc::new(PolyfillTransport::new()),
        ))
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn mode(&self) -> NetworkMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switches mode and returns the previous one.
    pub fn set_mode(&self, mode: NetworkMode) -> NetworkMode {
        let previous = std::mem::replace(
            &mut *self.mode.write().unwrap_or_else(PoisonError::into_inner),
            mode,
        );
        if previous != mode {
            info!(from = ?previous, to = ?mode, "Network mode switched");
        }
        previous
    }

    pub fn set_polyfill(&self, enabled: bool) -> NetworkMode {
        self.set_mode(NetworkMode::from_polyfill(enabled))
    }

    /// The transport of the current mode.
    pub fn transport(&self) -> Arc<dyn HttpTransport> {
        match self.mode() {
            NetworkMode::Native => self.native.clone(),
            NetworkMode::Polyfill => self.polyfill.clone(),
        }
    }

    /// Runs `scenario` under `mode` and restores the previous mode afterwards,
    /// also when the scenario is dropped early.
    pub async fn with_mode<F: Future>(&self, mode: NetworkMode, scenario: F) -> F::Output {
        let _restore = ModeGuard {
            harness: self,
            previous: self.set_mode(mode),
        };
        scenario.await
    }

    /// Fetches through the current transport.
    pub async fn fetch(&self, request: HttpRequest, signal: &AbortSignal) -> Result<HttpResponse, NetError> {
        fetch(&*self.transport(), request, signal).await
    }

    /// Issues a request nobody waits for. The body is drained so the exchange
    /// completes; the outcome is only logged.
    pub async fn fire_and_forget(&self, request: HttpRequest) {
        let signal = AbortSignal::timeout(self.fetch_timeout);
        let url = request.url.clone();
        let outcome = match self.fetch(request, &signal).await {
            Ok(response) => {
                let status = response.status();
                response.bytes().await.map(|body| (status, body.len()))
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok((status, len)) => debug!(%url, status, len, "Background fetch finished"),
            Err(e) => warn!(%url, kind = e.kind(), error = %e, "Background fetch failed"),
        }
    }

    /// Reads a streamed GET of `url` according to `policy`.
    ///
    /// Never fails: errors are recorded in the report.
    pub async fn run_stream(&self, url: &str, policy: StreamPolicy, signal: AbortSignal) -> StreamReport {
        let mode = self.mode();
        let report = StreamReport::new(policy, mode);
        let mut response = match self.fetch(HttpRequest::get(url), &signal).await {
            Ok(response) => response,
            Err(e) => return report.failed(&e),
        };
        let mut report = StreamReport {
            status: Some(response.status()),
            ..report
        };

        let limit = match policy {
            StreamPolicy::Fallback | StreamPolicy::Plain => {
                return match response.bytes().await {
                    Ok(body) => {
                        report.bytes = body.len() as u64;
                        report
                    }
                    Err(e) => report.failed(&e),
                };
            }
            StreamPolicy::Complete => None,
            StreamPolicy::Cancel { after } | StreamPolicy::Abandon { after } => Some(after),
        };

        while limit.map_or(true, |after| report.chunks < after) {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    report.chunks += 1;
                    report.bytes += chunk.len() as u64;
                }
                Ok(None) => break,
                Err(e) => {
                    report = report.failed(&e);
                    break;
                }
            }
        }

        match policy {
            StreamPolicy::Cancel { .. } => {
                response.cancel().await;
                report.cancelled = true;
            }
            StreamPolicy::Abandon { .. } => drop(response),
            StreamPolicy::Complete | StreamPolicy::Fallback | StreamPolicy::Plain => {}
        }

        info!(
            policy = policy.name(),
            mode = ?mode,
            chunks = report.chunks,
            bytes = report.bytes,
            cancelled = report.cancelled,
            "Stream scenario finished"
        );
        report
    }
}

struct ModeGuard<'a> {
    harness: &'a NetworkHarness,
    previous: NetworkMode,
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        self.harness.set_mode(self.previous);
    }
}
