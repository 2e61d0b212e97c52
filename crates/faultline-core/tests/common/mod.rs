//! Shared test helpers for faultline-core integration tests.
//!
//! [`rig`] wires a complete instrumented app to a live [`ControlHost`] over a
//! real WebSocket, with one target mounted and an in-memory environment.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use faultline_core::app::InstrumentedApp;
use faultline_core::channel::ControlChannel;
use faultline_core::device::{DeviceQueryRegistry, StaticEnvironment};
use faultline_core::harness::NetworkHarness;
use faultline_core::host::ControlHost;
use faultline_core::target::{FixedLayout, MountedTarget, Rect, Target, TargetRegistry, Viewport};
use faultline_server::{FaultServer, ServerConfig, ServerHandle};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait before concluding that a reply will never come.
pub const SILENCE: Duration = Duration::from_millis(300);

pub const LOGIN_ID: &str = "login-button";

/// Normalizes to (0.1, 0.5, 0.8, 0.25) in a 390x844 viewport.
pub fn login_rect() -> Rect {
    Rect {
        x: 39.0,
        y: 422.0,
        width: 312.0,
        height: 211.0,
    }
}

pub struct Rig {
    pub host: ControlHost,
    pub app: Arc<InstrumentedApp>,
    pub environment: Arc<StaticEnvironment>,
    pub activations: Arc<Mutex<Vec<String>>>,
    pub login: MountedTarget,
}

impl Rig {
    pub fn activations(&self) -> Vec<String> {
        self.activations.lock().unwrap().clone()
    }
}

/// Binds a host, connects an app to it and waits until it is up.
pub async fn rig() -> Rig {
    let host = ControlHost::bind("127.0.0.1:0").await.unwrap();
    let channel = ControlChannel::new(host.url());
    let targets = TargetRegistry::new(channel.clone(), Viewport::new(390.0, 844.0));
    let environment = Arc::new(StaticEnvironment::default());
    let queries = DeviceQueryRegistry::with_app_name(environment.clone(), "faultline-demo");
    let network = Arc::new(NetworkHarness::with_defaults().unwrap());
    let app = InstrumentedApp::new(channel, targets.clone(), queries, network);

    let activations = Arc::new(Mutex::new(Vec::new()));
    let log = activations.clone();
    let login = targets.mount(
        Target::new(LOGIN_ID, "Log in").on_activate(move |id| log.lock().unwrap().push(id.to_string())),
        FixedLayout(login_rect()),
    );

    app.start().await.unwrap();
    host.wait_for_app(TIMEOUT).await.unwrap();

    Rig {
        host,
        app,
        environment,
        activations,
        login,
    }
}

/// Polls `condition` until it holds or [`TIMEOUT`] elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A fault server with shrunk timings on a free port.
pub async fn fault_server() -> ServerHandle {
    let config = ServerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        stream_interval: Duration::from_millis(30),
        stream_chunks: 5,
        delay: Duration::from_millis(50),
        large_body_bytes: 256 * 1024,
        truncate_after: Duration::from_millis(20),
        image_size: 16,
        large_image_size: 64,
        shutdown_grace: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    FaultServer::bind(config).await.unwrap().spawn()
}
