use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use faultline_server::{FaultServer, ServerConfig};

#[derive(Parser)]
#[command(name = "faultline-server")]
#[command(about = "HTTP server that serves well-formed and deliberately broken responses")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:3000", env = "FAULTLINE_BIND")]
    bind: SocketAddr,

    /// Milliseconds between /stream-xhr chunks
    #[arg(long, default_value_t = 1000, env = "FAULTLINE_STREAM_INTERVAL_MS")]
    stream_interval_ms: u64,

    /// Number of /stream-xhr chunks
    #[arg(long, default_value_t = 5, env = "FAULTLINE_STREAM_CHUNKS")]
    stream_chunks: u32,

    /// Milliseconds /delay waits before answering
    #[arg(long, default_value_t = 3000, env = "FAULTLINE_DELAY_MS")]
    delay_ms: u64,

    /// Size of the /large-body payload in bytes
    #[arg(long, default_value_t = 5 * 1024 * 1024, env = "FAULTLINE_LARGE_BODY_BYTES")]
    large_body_bytes: usize,

    /// Size of the /binary payload in bytes
    #[arg(long, default_value_t = 128, env = "FAULTLINE_BINARY_BYTES")]
    binary_bytes: usize,

    /// Milliseconds between the partial write and the teardown in /error/truncated
    #[arg(long, default_value_t = 100, env = "FAULTLINE_TRUNCATE_AFTER_MS")]
    truncate_after_ms: u64,

    /// Edge length of the /image PNG in pixels
    #[arg(long, default_value_t = 64, env = "FAULTLINE_IMAGE_SIZE")]
    image_size: u32,

    /// Edge length of the /large-image PNG in pixels
    #[arg(long, default_value_t = 2048, env = "FAULTLINE_LARGE_IMAGE_SIZE")]
    large_image_size: u32,

    /// Milliseconds shutdown waits for open connections
    #[arg(long, default_value_t = 5000, env = "FAULTLINE_SHUTDOWN_GRACE_MS")]
    shutdown_grace_ms: u64,

    /// Log to ~/.faultline/logs/faultline-server.log instead of stderr
    #[arg(long)]
    log_file: bool,
}

impl Args {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            stream_interval: Duration::from_millis(self.stream_interval_ms),
            stream_chunks: self.stream_chunks,
            delay: Duration::from_millis(self.delay_ms),
            large_body_bytes: self.large_body_bytes,
            binary_bytes: self.binary_bytes,
            truncate_after: Duration::from_millis(self.truncate_after_ms),
            image_size: self.image_size,
            large_image_size: self.large_image_size,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

fn logs_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".faultline")
        .join("logs");
    std::fs::create_dir_all(&dir).ok();
    dir
}

fn init_logging(to_file: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if to_file {
        let file_appender = tracing_appender::rolling::never(logs_dir(), "faultline-server.log");
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(file_appender)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_file);

    let config = args.config();
    info!(bind = %config.bind, "Starting faultline-server");

    let server = FaultServer::bind(config).await?;
    println!("faultline-server listening on {}", server.base_url());

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        trigger.cancel();
    });

    server.run(shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_server_config() {
        let args = Args::try_parse_from(["faultline-server"]).unwrap();
        let config = args.config();
        let defaults = ServerConfig::default();
        assert_eq!(config.large_body_bytes, defaults.large_body_bytes);
        assert_eq!(config.binary_bytes, defaults.binary_bytes);
        assert_eq!(config.truncate_after, defaults.truncate_after);
        assert_eq!(config.image_size, defaults.image_size);
        assert_eq!(config.large_image_size, defaults.large_image_size);
        assert_eq!(config.shutdown_grace, defaults.shutdown_grace);
    }

    #[test]
    fn every_knob_has_a_flag() {
        let args = Args::try_parse_from([
            "faultline-server",
            "--bind",
            "127.0.0.1:0",
            "--large-body-bytes",
            "1024",
            "--binary-bytes",
            "16",
            "--truncate-after-ms",
            "5",
            "--image-size",
            "8",
            "--large-image-size",
            "32",
            "--shutdown-grace-ms",
            "250",
        ])
        .unwrap();
        let config = args.config();
        assert_eq!(config.bind.port(), 0);
        assert_eq!(config.large_body_bytes, 1024);
        assert_eq!(config.binary_bytes, 16);
        assert_eq!(config.truncate_after, Duration::from_millis(5));
        assert_eq!(config.image_size, 8);
        assert_eq!(config.large_image_size, 32);
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
    }
}
