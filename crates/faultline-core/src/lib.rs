//! # faultline-core
//!
//! Remote control of an instrumented app from an external inspection tool.
//!
//! The app opens one WebSocket [`channel`] to the tool. The tool sends flat,
//! id-correlated JSON commands; the app answers them from its mounted
//! [`target`]s (geometry, activation) and its [`device`] query registry, and
//! can run network scenarios against the fault-injection server through a
//! switchable native/polyfilled stack ([`harness`]).
//!
//! ## Modules
//!
//! - [`protocol`] - Wire envelope, replies, notifications and the typed [`protocol::Command`] set
//! - [`channel`] - App-side WebSocket connection with subscriber dispatch
//! - [`target`] - Measurable, activatable UI targets
//! - [`device`] - Device/environment query registry
//! - [`http`] - HTTP client seam, abort signals and the failure taxonomy
//! - [`polyfill`] - Hand-rolled HTTP/1.1 transport used in polyfill mode
//! - [`harness`] - Network mode switching and streaming scenarios
//! - [`app`] - Composition root dispatching commands to the above
//! - [`host`] - Tool side of the channel
//! - [`faults`] - Deliberate crash injection
//! - [`config`] - Persistent configuration and app manifest
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use faultline_core::app::InstrumentedApp;
//! use faultline_core::channel::ControlChannel;
//! use faultline_core::device::{DeviceQueryRegistry, StaticEnvironment};
//! use faultline_core::harness::NetworkHarness;
//! use faultline_core::target::{FixedLayout, Rect, Target, TargetRegistry, Viewport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let channel = ControlChannel::new("ws://127.0.0.1:8080/");
//!     let targets = TargetRegistry::new(channel.clone(), Viewport::new(390.0, 844.0));
//!     let queries = DeviceQueryRegistry::with_app_name(Arc::new(StaticEnvironment::default()), "demo");
//!     let network = Arc::new(NetworkHarness::with_defaults().unwrap());
//!
//!     let app = InstrumentedApp::new(channel, targets.clone(), queries, network);
//!     let _button = targets.mount(
//!         Target::new("login-button", "Log in").on_activate(|_| println!("logging in")),
//!         FixedLayout(Rect { x: 20.0, y: 400.0, width: 350.0, height: 44.0 }),
//!     );
//!     app.start().await.unwrap();
//! }
//! ```

pub mod app;
pub mod channel;
pub mod config;
pub mod device;
pub mod faults;
pub mod harness;
pub mod host;
pub mod http;
pub mod polyfill;
pub mod protocol;
pub mod target;
