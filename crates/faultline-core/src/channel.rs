//! App-side control channel.
//!
//! A [`ControlChannel`] owns the single WebSocket connection from the
//! instrumented app to the external tool. It is created once by the app's
//! composition root and handed to collaborators by cloning (clones share the
//! same connection and subscriber table).
//!
//! # Behaviour
//!
//! - [`ControlChannel::connect`] is idempotent: concurrent and repeated calls
//!   share one connection attempt and never open a second socket.
//! - Inbound frames are decoded as UTF-8 JSON [`ControlMessage`]s. Malformed
//!   frames are dropped with a `warn!` diagnostic.
//! - Subscribers run one after another on the reader task, so a message is
//!   fully handed out before the next frame is read. A panicking subscriber is
//!   logged and skipped.
//! - There is no reconnect, backoff or queuing. Frames sent while no
//!   connection is open are dropped.
//!
//! # Example
//!
//! ```no_run
//! use faultline_core::channel::ControlChannel;
//! use faultline_core::protocol::Notification;
//!
//! #[tokio::main]
//! async fn main() {
//!     let channel = ControlChannel::new("ws://127.0.0.1:8080/");
//!     channel.connect().await.unwrap();
//!
//!     let _subscription = channel.on_message(|message| {
//!         println!("tool says {}", message.message);
//!     });
//!
//!     channel.send(&Notification::Action { action: "ready".to_string() });
//! }
//! ```

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, OnceCell};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::protocol::{decode_frame, ControlMessage};

/// Errors that can occur while opening the control connection.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The WebSocket handshake failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

/// A subscriber callback.
pub type MessageHandler = Arc<dyn Fn(&ControlMessage) + Send + Sync>;

struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
}

struct ChannelInner {
    url: String,
    connection: OnceCell<Connection>,
    subscribers: Mutex<BTreeMap<u64, MessageHandler>>,
    next_subscriber: AtomicU64,
}

impl ChannelInner {
    fn subscribers(&self) -> MutexGuard<'_, BTreeMap<u64, MessageHandler>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the app's control connection.
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<ChannelInner>,
}

impl ControlChannel {
    /// Creates a channel targeting `url`. No connection is opened until
    /// [`connect`](Self::connect) is called.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                url: url.into(),
                connection: OnceCell::new(),
                subscribers: Mutex::new(BTreeMap::new()),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    /// The tool endpoint this channel connects to.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Opens the connection, or returns immediately if one was already
    /// established.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::ConnectionFailed`] if the handshake fails. A failed
    ///   attempt leaves the channel unconnected so the caller may try again.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.inner
            .connection
            .get_or_try_init(|| Self::open(self.inner.clone()))
            .await?;
        Ok(())
    }

    /// Whether a connection was established and is still open.
    pub fn is_connected(&self) -> bool {
        self.inner
            .connection
            .get()
            .is_some_and(|connection| connection.open.load(Ordering::Acquire))
    }

    async fn open(inner: Arc<ChannelInner>) -> Result<Connection, ChannelError> {
        let (socket, _) = connect_async(inner.url.as_str())
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
        info!(url = %inner.url, "Control channel connected");

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = open.clone();
        tokio::spawn(
            async move {
                while let Some(text) = outbound_rx.recv().await {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        warn!(error = %e, "Control channel write failed");
                        break;
                    }
                }
                writer_open.store(false, Ordering::Release);
                let _ = sink.close().await;
            }
            .instrument(info_span!("control_writer")),
        );

        let reader_open = open.clone();
        let reader_inner = Arc::downgrade(&inner);
        tokio::spawn(
            async move {
                while let Some(frame) = stream.next().await {
                    let Some(inner) = reader_inner.upgrade() else {
                        break;
                    };
                    match frame {
                        Ok(Message::Text(text)) => dispatch_frame(&inner, text.as_str()),
                        Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                            Ok(text) => dispatch_frame(&inner, text),
                            Err(_) => warn!(len = bytes.len(), "Dropping non UTF-8 binary frame"),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "Control channel read failed");
                            break;
                        }
                    }
                }
                reader_open.store(false, Ordering::Release);
                info!("Control channel closed");
            }
            .instrument(info_span!("control_reader")),
        );

        Ok(Connection { outbound, open })
    }

    /// Serializes `frame` and sends it. Fire-and-forget: the frame is dropped
    /// when no connection is open.
    pub fn send<T: Serialize>(&self, frame: &T) {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Dropping unserializable control frame");
                return;
            }
        };
        match self.inner.connection.get() {
            Some(connection) if connection.open.load(Ordering::Acquire) => {
                if connection.outbound.send(text).is_err() {
                    debug!("Control channel writer gone, frame dropped");
                }
            }
            _ => debug!("Control channel not connected, frame dropped"),
        }
    }

    /// Registers a subscriber for every decoded inbound message.
    ///
    /// The subscriber stays registered until the returned [`Subscription`]
    /// is dropped or [`Subscription::unsubscribe`] is called.
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ControlMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers().insert(id, Arc::new(handler));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }
}

/// Decodes one text frame and hands it to every subscriber.
fn dispatch_frame(inner: &ChannelInner, text: &str) {
    let message = match decode_frame(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, frame = %truncate_for_log(text), "Dropping malformed control frame");
            return;
        }
    };
    debug!(message = %message.message, id = ?message.id, "Control message received");

    // Snapshot so subscribers may (un)subscribe while being called.
    let handlers: Vec<MessageHandler> = inner.subscribers().values().cloned().collect();
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
            warn!(message = %message.message, "Control message handler panicked");
        }
    }
}

fn truncate_for_log(text: &str) -> &str {
    const MAX: usize = 200;
    if text.len() <= MAX {
        return text;
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Registration token returned by [`ControlChannel::on_message`].
pub struct Subscription {
    id: u64,
    inner: Weak<ChannelInner>,
}

impl Subscription {
    /// Removes the subscriber. Equivalent to dropping the token.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_subscriber(channel: &ControlChannel) -> (Subscription, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let subscription = channel.on_message(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (subscription, count)
    }

    #[test]
    fn well_formed_frames_reach_subscribers() {
        let channel = ControlChannel::new("ws://unused");
        let (_subscription, count) = counting_subscriber(&channel);

        dispatch_frame(&channel.inner, r#"{"message": "getAppName", "id": "1"}"#);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let channel = ControlChannel::new("ws://unused");
        let (_subscription, count) = counting_subscriber(&channel);

        dispatch_frame(&channel.inner, "{not json");
        dispatch_frame(&channel.inner, r#"{"id": "no-message-key"}"#);
        dispatch_frame(&channel.inner, r#"{"message": "getAppName", "v": 99}"#);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        dispatch_frame(&channel.inner, r#"{"message": "getAppName"}"#);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_starve_others() {
        let channel = ControlChannel::new("ws://unused");
        let _bad = channel.on_message(|_| panic!("handler fault"));
        let (_good, count) = counting_subscriber(&channel);

        dispatch_frame(&channel.inner, r#"{"message": "getOrientation"}"#);
        dispatch_frame(&channel.inner, r#"{"message": "getOrientation"}"#);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let channel = ControlChannel::new("ws://unused");
        let (subscription, count) = counting_subscriber(&channel);
        assert_eq!(channel.subscriber_count(), 1);

        subscription.unsubscribe();
        assert_eq!(channel.subscriber_count(), 0);

        dispatch_frame(&channel.inner, r#"{"message": "getOrientation"}"#);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn send_without_connection_is_dropped() {
        let channel = ControlChannel::new("ws://unused");
        assert!(!channel.is_connected());
        channel.send(&serde_json::json!({"action": "x"}));
    }

    #[tokio::test]
    async fn failed_connect_reports_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let channel = ControlChannel::new(format!("ws://{addr}/"));
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, ChannelError::ConnectionFailed(_)));
        assert!(!channel.is_connected());
    }

    #[test]
    fn long_frames_are_truncated_on_char_boundary() {
        let text = "é".repeat(150);
        let shown = truncate_for_log(&text);
        assert!(shown.len() <= 200);
        assert!(text.starts_with(shown));
    }
}
