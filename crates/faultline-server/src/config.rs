//! Fault server configuration.
//!
//! Defaults reproduce the canonical scenario timings (1 s stream interval,
//! 5 chunks, 3 s delay, 5 MiB large body). Tests shrink them.

use std::net::SocketAddr;
use std::time::Duration;

/// Runtime knobs of the fault-injection server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind: SocketAddr,

    /// Pause between `/stream-xhr` chunks.
    pub stream_interval: Duration,

    /// Number of numbered `/stream-xhr` chunks.
    pub stream_chunks: u32,

    /// How long `/delay` holds the request.
    pub delay: Duration,

    /// Size of the `/large-body` payload in bytes.
    pub large_body_bytes: usize,

    /// Size of the `/binary` payload in bytes.
    pub binary_bytes: usize,

    /// Time between the partial write and the teardown in `/error/truncated`.
    pub truncate_after: Duration,

    /// Edge length of the `/image` PNG in pixels.
    pub image_size: u32,

    /// Edge length of the `/large-image` PNG in pixels.
    pub large_image_size: u32,

    /// How long shutdown waits for open connections (hung requests, streams)
    /// before dropping them.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            stream_interval: Duration::from_secs(1),
            stream_chunks: 5,
            delay: Duration::from_millis(3000),
            large_body_bytes: 5 * 1024 * 1024,
            binary_bytes: 128,
            truncate_after: Duration::from_millis(100),
            image_size: 64,
            large_image_size: 2048,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Defaults bound to `bind`.
    pub fn bound_to(bind: SocketAddr) -> Self {
        Self {
            bind,
            ..Self::default()
        }
    }
}
