//! `faultline demo-app`: a headless instrumented app.
//!
//! Mounts the two stock targets, connects to a control host and answers
//! commands until interrupted. After a disconnect the app is rebuilt from
//! scratch and reconnects, the way a reloaded bundle would.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use faultline_core::app::InstrumentedApp;
use faultline_core::channel::ControlChannel;
use faultline_core::config::AppManifest;
use faultline_core::device::{DeviceQueryRegistry, StaticEnvironment};
use faultline_core::faults;
use faultline_core::harness::NetworkHarness;
use faultline_core::target::{FixedLayout, MountedTarget, Rect, Target, TargetRegistry, Viewport};

use crate::CliError;

pub const LOGIN_TARGET: &str = "login-button";
pub const CRASH_TARGET: &str = "uncaught-exception-button";

const VIEWPORT: (f64, f64) = (390.0, 844.0);
const RETRY_DELAY: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One incarnation of the demo app. Dropping it unmounts its targets.
pub struct DemoApp {
    pub app: Arc<InstrumentedApp>,
    _targets: Vec<MountedTarget>,
}

impl DemoApp {
    /// Wires a fresh app for `url` with the identity from `manifest`.
    pub fn build(url: &str, manifest: &AppManifest) -> Result<Self, CliError> {
        let channel = ControlChannel::new(url);
        let targets = TargetRegistry::new(channel.clone(), Viewport::new(VIEWPORT.0, VIEWPORT.1));
        let environment = Arc::new(StaticEnvironment::default());
        let queries = DeviceQueryRegistry::new(environment, manifest)
            .map_err(|e| CliError::ActionFailed(format!("Invalid app manifest: {}", e)))?;
        let network = NetworkHarness::with_defaults()
            .map(Arc::new)
            .map_err(|e| CliError::ActionFailed(format!("Failed to build HTTP client: {}", e)))?;
        let app = InstrumentedApp::new(channel, targets.clone(), queries, network);

        let login = targets.mount(
            Target::new(LOGIN_TARGET, "Log in").on_activate(|id| info!(target_id = id, "Login pressed")),
            FixedLayout(Rect {
                x: 39.0,
                y: 422.0,
                width: 312.0,
                height: 48.0,
            }),
        );
        let crash = targets.mount(
            Target::new(CRASH_TARGET, "Throw uncaught exception").on_activate(|id| {
                faults::spawn_unhandled_panic(id);
            }),
            FixedLayout(Rect {
                x: 39.0,
                y: 494.0,
                width: 312.0,
                height: 48.0,
            }),
        );

        Ok(Self {
            app,
            _targets: vec![login, crash],
        })
    }
}

/// Runs the connect/serve/rebuild loop until the future is dropped.
pub async fn run(url: &str, manifest: &AppManifest) -> Result<(), CliError> {
    loop {
        let demo = DemoApp::build(url, manifest)?;
        if let Err(e) = demo.app.start().await {
            warn!(%url, error = %e, "Control host unreachable, retrying");
            tokio::time::sleep(RETRY_DELAY).await;
            continue;
        }
        info!(%url, app = demo.app.queries().app_name(), "Demo app connected");

        while demo.app.channel().is_connected() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        info!("Control host went away, rebuilding");
        drop(demo);
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use faultline_core::host::ControlHost;
    use faultline_core::protocol::{Command, DeviceQuery};
    use serde_json::json;

    #[tokio::test]
    async fn demo_app_answers_the_host() {
        let host = ControlHost::bind("127.0.0.1:0").await.unwrap();
        let url = host.url();
        let manifest = AppManifest::named("demo-under-test");
        let app = tokio::spawn(async move { run(&url, &manifest).await });

        host.wait_for_app(Duration::from_secs(5)).await.unwrap();
        let reply = host
            .request(&Command::Query(DeviceQuery::AppName), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.value, Some(json!("demo-under-test")));

        let reply = host
            .request(
                &Command::GetPosition {
                    target: LOGIN_TARGET.to_string(),
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(reply.position.is_some());
        app.abort();
    }

    #[test]
    fn manifest_without_name_is_rejected() {
        let err = DemoApp::build("ws://127.0.0.1:1/", &AppManifest::default()).err().unwrap();
        assert!(matches!(err, CliError::ActionFailed(ref m) if m.contains("no name")), "{err}");
    }
}
