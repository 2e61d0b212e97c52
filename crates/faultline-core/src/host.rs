//! Tool side of the control channel.
//!
//! A [`ControlHost`] is the WebSocket endpoint an instrumented app connects
//! to. It correlates requests with replies by `id` and broadcasts the app's
//! notifications (activation echoes, stream reports) to any number of local
//! listeners.
//!
//! Exactly one app connection is active at a time. A newer connection
//! replaces the previous one, whose socket is then closed.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use faultline_core::host::ControlHost;
//! use faultline_core::protocol::{Command, DeviceQuery};
//!
//! #[tokio::main]
//! async fn main() {
//!     let host = ControlHost::bind("127.0.0.1:8080").await.unwrap();
//!     host.wait_for_app(Duration::from_secs(30)).await.unwrap();
//!
//!     let reply = host
//!         .request(&Command::Query(DeviceQuery::Orientation), Duration::from_secs(5))
//!         .await
//!         .unwrap();
//!     println!("orientation: {:?}", reply.value);
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::protocol::{AppFrame, Command, ControlMessage, ControlReply, Notification};

const NOTIFICATION_CAPACITY: usize = 256;

/// Errors raised on the tool side.
#[derive(Error, Debug)]
pub enum HostError {
    /// The listener could not be bound.
    #[error("failed to bind control host: {0}")]
    Bind(#[from] std::io::Error),

    /// No app is connected.
    #[error("no app connected")]
    NotConnected,

    /// The app did not reply (or connect) in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The app disconnected before replying.
    #[error("app disconnected")]
    Disconnected,

    /// The outbound message could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

struct HostInner {
    pending: Mutex<HashMap<String, oneshot::Sender<ControlReply>>>,
    outbound: Mutex<Option<(u64, mpsc::UnboundedSender<String>)>>,
    notifications: broadcast::Sender<Notification>,
    connected: watch::Sender<bool>,
    connections: AtomicU64,
    unmatched_replies: AtomicU64,
    shutdown: CancellationToken,
}

impl HostInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<ControlReply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self) -> MutexGuard<'_, Option<(u64, mpsc::UnboundedSender<String>)>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_text(&self, text: String) -> Result<(), HostError> {
        match self.outbound().as_ref() {
            Some((_, tx)) => tx.send(text).map_err(|_| HostError::NotConnected),
            None => Err(HostError::NotConnected),
        }
    }

    /// Routes one frame received from the app.
    fn route_frame(&self, text: &str) {
        match serde_json::from_str::<AppFrame>(text) {
            Ok(AppFrame::Reply(reply)) => match self.pending().remove(&reply.id) {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => {
                    self.unmatched_replies.fetch_add(1, Ordering::Relaxed);
                    warn!(id = %reply.id, "Reply for unknown request id dropped");
                }
            },
            Ok(AppFrame::Notification(notification)) => {
                debug!(?notification, "App notification");
                let _ = self.notifications.send(notification);
            }
            Err(e) => warn!(error = %e, "Dropping unparsable app frame"),
        }
    }
}

/// Removes a pending request slot when the request finishes or is dropped.
struct PendingSlot<'a> {
    id: String,
    inner: &'a HostInner,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.inner.pending().remove(&self.id);
    }
}

/// The WebSocket endpoint instrumented apps connect to.
pub struct ControlHost {
    inner: Arc<HostInner>,
    local_addr: SocketAddr,
}

impl ControlHost {
    /// Binds the host and starts accepting app connections at `/`.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, HostError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (connected, _) = watch::channel(false);
        let inner = Arc::new(HostInner {
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            notifications,
            connected,
            connections: AtomicU64::new(0),
            unmatched_replies: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        let router = Router::new().route("/", get(upgrade)).with_state(inner.clone());
        let shutdown = inner.shutdown.clone();
        tokio::spawn(
            async move {
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
                {
                    warn!(error = %e, "Control host stopped");
                }
            }
            .instrument(info_span!("control_host", %local_addr)),
        );
        info!(%local_addr, "Control host listening");

        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The URL apps should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}/", self.local_addr)
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Number of app connections accepted so far.
    pub fn connections_accepted(&self) -> u64 {
        self.inner.connections.load(Ordering::Relaxed)
    }

    /// Replies whose id matched no pending request.
    pub fn unmatched_replies(&self) -> u64 {
        self.inner.unmatched_replies.load(Ordering::Relaxed)
    }

    /// Waits until an app is connected.
    pub async fn wait_for_app(&self, timeout: Duration) -> Result<(), HostError> {
        let mut connected = self.inner.connected.subscribe();
        let outcome = tokio::time::timeout(timeout, async {
            connected.wait_for(|up| *up).await.map(|_| ())
        })
        .await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(HostError::NotConnected),
            Err(_) => Err(HostError::Timeout(timeout)),
        }
    }

    /// Subscribes to app notifications sent from now on.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// Sends `command` with a fresh id and waits for the matching reply.
    ///
    /// # Errors
    ///
    /// - [`HostError::NotConnected`] if no app is connected.
    /// - [`HostError::Timeout`] if no reply arrives in time. Commands the app
    ///   declines to answer (e.g. measuring an unmounted target) end here.
    /// - [`HostError::Disconnected`] if the app goes away first.
    pub async fn request(&self, command: &Command, timeout: Duration) -> Result<ControlReply, HostError> {
        self.request_message(command.to_message(), timeout).await
    }

    /// Like [`request`](Self::request) for a raw envelope. Any id on
    /// `message` is replaced.
    pub async fn request_message(&self, message: ControlMessage, timeout: Duration) -> Result<ControlReply, HostError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(id.clone(), tx);
        let _slot = PendingSlot {
            id: id.clone(),
            inner: &self.inner,
        };

        let message = message.with_id(id);
        self.inner.send_text(serde_json::to_string(&message)?)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(HostError::Disconnected),
            Err(_) => Err(HostError::Timeout(timeout)),
        }
    }

    /// Sends `command` without an id; no reply is expected.
    pub fn notify(&self, command: &Command) -> Result<(), HostError> {
        self.inner.send_text(serde_json::to_string(&command.to_message())?)
    }

    /// Sends a raw text frame, e.g. to exercise malformed-frame handling.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), HostError> {
        self.inner.send_text(text.into())
    }

    /// Stops accepting connections and closes the current one.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Drop for ControlHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(inner): State<Arc<HostInner>>) -> Response {
    ws.on_upgrade(move |socket| serve_app(inner, socket))
}

async fn serve_app(inner: Arc<HostInner>, socket: WebSocket) {
    let generation = inner.connections.fetch_add(1, Ordering::Relaxed) + 1;
    let span = info_span!("app_connection", generation);

    async move {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        // Replacing the sender ends the previous connection's writer.
        if inner.outbound().replace((generation, tx)).is_some() {
            info!("App reconnected, previous connection replaced");
        } else {
            info!("App connected");
        }
        inner.connected.send_replace(true);

        // Ends once the sender is dropped: on replacement or on disconnect below.
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => inner.route_frame(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => inner.route_frame(text),
                        Err(_) => warn!(len = bytes.len(), "Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "App connection read failed");
                        break;
                    }
                },
            }
        }

        let mut outbound = inner.outbound();
        if outbound.as_ref().is_some_and(|(current, _)| *current == generation) {
            *outbound = None;
            inner.connected.send_replace(false);
            // Dropping the senders fails every waiter with `Disconnected`.
            inner.pending().clear();
            info!("App disconnected");
        }
    }
    .instrument(span)
    .await
}
