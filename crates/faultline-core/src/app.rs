//! Composition root of an instrumented app.
//!
//! [`InstrumentedApp`] owns one [`ControlChannel`] and the collaborators that
//! answer control commands. It subscribes to the channel once and dispatches
//! every decoded [`Command`] through a single exhaustive `match`.
//!
//! Synchronous commands (geometry, activation, plain queries) are answered on
//! the channel's reader task before the next frame is read. Commands that
//! await the platform or the network run on their own tasks, so their replies
//! may arrive in any order. A panic in such a task is logged and the request
//! stays unanswered; the dispatch loop keeps running.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, info_span, warn, Instrument};

use crate::channel::{ChannelError, ControlChannel, Subscription};
use crate::device::DeviceQueryRegistry;
use crate::harness::{NetworkHarness, NetworkMode};
use crate::http::{AbortSignal, HttpRequest};
use crate::protocol::{Command, ControlMessage, ControlReply, Geometry, Notification};
use crate::target::TargetRegistry;

/// An app wired to the control channel.
pub struct InstrumentedApp {
    channel: ControlChannel,
    targets: Arc<TargetRegistry>,
    queries: DeviceQueryRegistry,
    network: Arc<NetworkHarness>,
    subscription: Mutex<Option<Subscription>>,
}

impl InstrumentedApp {
    pub fn new(
        channel: ControlChannel,
        targets: Arc<TargetRegistry>,
        queries: DeviceQueryRegistry,
        network: Arc<NetworkHarness>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            targets,
            queries,
            network,
            subscription: Mutex::new(None),
        })
    }

    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    pub fn targets(&self) -> &Arc<TargetRegistry> {
        &self.targets
    }

    pub fn queries(&self) -> &DeviceQueryRegistry {
        &self.queries
    }

    pub fn network(&self) -> &Arc<NetworkHarness> {
        &self.network
    }

    /// Subscribes to the channel (once) and connects it.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        {
            let mut subscription = self.subscription.lock().unwrap_or_else(PoisonError::into_inner);
            if subscription.is_none() {
                let app = Arc::downgrade(self);
                *subscription = Some(self.channel.on_message(move |message| {
                    if let Some(app) = app.upgrade() {
                        app.handle(message);
                    }
                }));
            }
        }
        self.channel.connect().await
    }

    /// Dispatches one inbound message. Must be called within a Tokio runtime.
    pub fn handle(&self, message: &ControlMessage) {
        let command = match Command::decode(message) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, message = %message.message, "Rejecting control message");
                return;
            }
        };
        let id = message.id.clone();
        let span = info_span!("command", name = command.name(), id = ?id);
        let _entered = span.enter();

        match command {
            Command::GetPosition { target } => match self.targets.measure(&target) {
                Some(geometry) => self.reply_position(id, geometry),
                None => debug!(%target, "Target not measurable, no reply"),
            },
            Command::Click { target } => {
                if !self.targets.activate(&target) {
                    debug!(%target, "Click for unmounted target ignored");
                }
            }
            Command::Query(query) => match self.queries.answer_now(query) {
                Some(value) => self.reply_value(id, value),
                None => {
                    let queries = self.queries.clone();
                    let channel = self.channel.clone();
                    self.spawn_isolated(query.name(), async move {
                        let value = queries.answer(query).await;
                        reply(&channel, id, value);
                    });
                }
            },
            Command::FetchData(spec) => {
                let network = self.network.clone();
                self.spawn_isolated("fetch_data", async move {
                    network.fire_and_forget(HttpRequest::from_fetch(&spec)).await;
                });
            }
            Command::SetNetworkMode { polyfill } => {
                self.network.set_polyfill(polyfill);
                self.reply_value(id, json!(self.network.mode()));
            }
            Command::RunStream(request) => {
                let network = self.network.clone();
                let channel = self.channel.clone();
                self.spawn_isolated("run_stream", async move {
                    let scenario = network.run_stream(&request.url, request.policy, AbortSignal::new());
                    let report = match request.polyfill {
                        Some(enabled) => network.with_mode(NetworkMode::from_polyfill(enabled), scenario).await,
                        None => scenario.await,
                    };
                    match id {
                        Some(id) => channel.send(&ControlReply::value(id, json!(report))),
                        None => channel.send(&Notification::Stream { stream: report }),
                    }
                });
            }
            Command::Unknown(name) => warn!(%name, "Unknown control message"),
        }
    }

    fn reply_value(&self, id: Option<String>, value: Value) {
        reply(&self.channel, id, value);
    }

    fn reply_position(&self, id: Option<String>, geometry: Geometry) {
        match id {
            Some(id) => self.channel.send(&ControlReply::position(id, geometry)),
            None => debug!("Position request without id, reply suppressed"),
        }
    }

    /// Runs `work` on its own task. A panic inside it is logged, never
    /// propagated.
    fn spawn_isolated<F>(&self, command: &'static str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let span = info_span!("handler", command);
        tokio::spawn(
            async move {
                if AssertUnwindSafe(work).catch_unwind().await.is_err() {
                    warn!("Handler panicked, request left unanswered");
                }
            }
            .instrument(span),
        );
    }
}

fn reply(channel: &ControlChannel, id: Option<String>, value: Value) {
    match id {
        Some(id) => channel.send(&ControlReply::value(id, value)),
        None => debug!("Request without id, reply suppressed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use futures_util::StreamExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tokio_tungstenite::tungstenite::Message;

    use crate::device::StaticEnvironment;
    use crate::target::{FixedLayout, Rect, Target, Viewport};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// An app connected to a bare WebSocket peer that surfaces every frame
    /// the app sends.
    async fn connected_app() -> (Arc<InstrumentedApp>, UnboundedReceiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(frame)) = socket.next().await {
                if let Message::Text(text) = frame {
                    let _ = tx.send(serde_json::from_str(text.as_str()).unwrap());
                }
            }
        });

        let channel = ControlChannel::new(url);
        let targets = TargetRegistry::new(channel.clone(), Viewport::new(390.0, 844.0));
        let queries = DeviceQueryRegistry::with_app_name(Arc::new(StaticEnvironment::default()), "handler-test");
        let network = Arc::new(NetworkHarness::with_defaults().unwrap());
        let app = InstrumentedApp::new(channel, targets, queries, network);
        app.start().await.unwrap();
        (app, rx)
    }

    fn message(name: &str, id: Option<&str>) -> ControlMessage {
        let message = ControlMessage::new(name);
        match id {
            Some(id) => message.with_id(id),
            None => message,
        }
    }

    /// Sends a query that is always answered and returns the first frame
    /// seen afterwards. Anything sent before it would arrive first.
    async fn next_frame_after_marker(app: &InstrumentedApp, frames: &mut UnboundedReceiver<Value>) -> Value {
        app.handle(&message("getAppName", Some("marker")));
        tokio::time::timeout(TIMEOUT, frames.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn unknown_command_is_ignored() {
        let (app, mut frames) = connected_app().await;

        app.handle(&message("getShoeSize", Some("1")));

        let frame = next_frame_after_marker(&app, &mut frames).await;
        assert_eq!(frame["id"], "marker");
        assert_eq!(frame["value"], "handler-test");
        assert!(app.channel().is_connected());
    }

    #[tokio::test]
    async fn requests_without_id_get_no_reply() {
        let (app, mut frames) = connected_app().await;
        let _login = app.targets().mount(
            Target::new("login-button", "Log in"),
            FixedLayout(Rect {
                x: 39.0,
                y: 422.0,
                width: 312.0,
                height: 211.0,
            }),
        );

        app.handle(&message("getColorScheme", None));
        app.handle(&message("getPosition:login-button", None));
        app.handle(&ControlMessage::new("setNetworkMode").with_field("polyfill", Value::Bool(true)));

        let frame = next_frame_after_marker(&app, &mut frames).await;
        assert_eq!(frame["id"], "marker");
        assert_eq!(app.network().mode(), crate::harness::NetworkMode::Polyfill);
    }

    #[tokio::test]
    async fn malformed_command_is_rejected_without_reply() {
        let (app, mut frames) = connected_app().await;

        app.handle(&message("setNetworkMode", Some("2")));
        app.handle(&message("fetchData", Some("3")));

        let frame = next_frame_after_marker(&app, &mut frames).await;
        assert_eq!(frame["id"], "marker");
        assert_eq!(app.network().mode(), crate::harness::NetworkMode::Native);
    }
}
