//! Shared helpers for fault server integration tests.

use std::time::Duration;

use faultline_server::{FaultServer, ServerConfig, ServerHandle};

/// Timings shrunk so the whole suite runs in a couple of seconds.
pub fn fast_config() -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        stream_interval: Duration::from_millis(20),
        stream_chunks: 3,
        delay: Duration::from_millis(50),
        large_body_bytes: 64 * 1024,
        truncate_after: Duration::from_millis(20),
        image_size: 16,
        large_image_size: 128,
        shutdown_grace: Duration::from_millis(200),
        ..ServerConfig::default()
    }
}

pub async fn start_with(config: ServerConfig) -> ServerHandle {
    FaultServer::bind(config).await.unwrap().spawn()
}

pub async fn start() -> ServerHandle {
    start_with(fast_config()).await
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// A client that reports redirects instead of following them.
pub fn no_redirect_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
