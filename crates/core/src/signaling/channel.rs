//! WebSocket signaling channel
//!
//! One connection per session lifetime. Outbound messages go through an
//! ordered queue drained by the connection task, so a `send` issued while the
//! socket is still connecting is written exactly once after the open
//! transition, or fails with a transport error if the attempt fails or the
//! channel is closed first.

use super::protocol::{InboundEvent, OutboundMessage};
use crate::config::CallConfig;
use crate::events::Notifier;
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Observable state of the signaling channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection exists
    Disconnected,
    /// Connection attempt in progress; sends are queued
    Connecting,
    /// Connected; queued sends are being written
    Open,
    /// The last connection attempt failed
    Failed(String),
}

struct Outgoing {
    text: String,
    event_type: &'static str,
    ack: oneshot::Sender<Result<()>>,
}

struct Connection {
    id: u64,
    outbound: mpsc::UnboundedSender<Outgoing>,
    shutdown: Option<oneshot::Sender<()>>,
}

struct ChannelInner {
    config: CallConfig,
    state: watch::Sender<ChannelState>,
    connection: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

impl ChannelInner {
    /// Forget connection `id` if it is still the current one
    ///
    /// Returns false when the connection was already closed or replaced, in
    /// which case the channel state belongs to someone else.
    fn release(&self, id: u64, final_state: ChannelState) -> bool {
        let mut connection = self.connection.lock();
        if connection.as_ref().map(|c| c.id) != Some(id) {
            return false;
        }
        *connection = None;
        self.state.send_replace(final_state);
        true
    }
}

/// Pending delivery of one queued message
pub struct Delivery {
    event_type: &'static str,
    ack: oneshot::Receiver<Result<()>>,
    timeout: Option<Duration>,
}

impl Delivery {
    /// Wire name of the queued message
    pub fn event_type(&self) -> &'static str {
        self.event_type
    }

    /// Wait until the message is written to the socket
    ///
    /// Dropping the `Delivery`, or giving up after the send timeout, withdraws
    /// a message that has not been written yet.
    ///
    /// # Errors
    ///
    /// `Error::Transport` if the connection attempt fails, the channel closes
    /// before the message is written, or the open transition takes longer than
    /// the configured send timeout.
    pub async fn delivered(self) -> Result<()> {
        let event_type = self.event_type;
        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.ack).await.map_err(|_| {
                Error::Transport(format!(
                    "timed out after {:?} waiting to deliver {}",
                    limit, event_type
                ))
            })?,
            None => self.ack.await,
        };

        outcome.map_err(|_| {
            Error::Transport(format!("channel closed before {} was delivered", event_type))
        })?
    }
}

/// Persistent bidirectional signaling connection
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

impl SignalingChannel {
    /// Create a disconnected channel
    pub fn new(config: CallConfig) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);

        Self {
            inner: Arc::new(ChannelInner {
                config,
                state,
                connection: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current channel state
    pub fn state(&self) -> ChannelState {
        self.inner.state.borrow().clone()
    }

    /// Subscribe to channel state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Whether a connection exists (connecting or open)
    pub fn is_connected(&self) -> bool {
        self.inner.connection.lock().is_some()
    }

    /// Connect to the signaling server
    ///
    /// Returns as soon as the connection attempt is started; decoded inbound
    /// events are forwarded to `inbound` in delivery order. Calling this while
    /// a connection exists is a no-op.
    ///
    /// # Arguments
    ///
    /// * `token` - Bearer credential, sent as `?token=` and as an
    ///   `Authorization` header
    /// * `inbound` - Sink for decoded server events
    pub fn connect(&self, token: &str, inbound: mpsc::UnboundedSender<InboundEvent>) -> Result<()> {
        let mut connection = self.inner.connection.lock();
        if connection.is_some() {
            debug!("Signaling channel already connected, ignoring connect");
            return Ok(());
        }

        let request = build_request(&self.inner.config, token)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();

        info!(
            "Connecting to signaling server: {}{}",
            self.inner.config.signaling_url, self.inner.config.ws_path
        );
        self.inner.state.send_replace(ChannelState::Connecting);

        *connection = Some(Connection {
            id,
            outbound,
            shutdown: Some(shutdown),
        });
        drop(connection);

        tokio::spawn(Self::connection_task(
            Arc::clone(&self.inner),
            id,
            request,
            outbound_rx,
            shutdown_rx,
            inbound,
        ));

        Ok(())
    }

    /// Queue a message without waiting for it to be written
    ///
    /// # Errors
    ///
    /// `Error::Transport` if no connection exists.
    pub fn enqueue(&self, message: OutboundMessage) -> Result<Delivery> {
        let event_type = message.event_type();
        let text = message.to_json()?;

        let connection = self.inner.connection.lock();
        let connection = connection.as_ref().ok_or_else(|| {
            Error::Transport(format!("not connected, cannot send {}", event_type))
        })?;

        let (ack, ack_rx) = oneshot::channel();
        connection
            .outbound
            .send(Outgoing {
                text,
                event_type,
                ack,
            })
            .map_err(|_| Error::Transport(format!("channel closed, cannot send {}", event_type)))?;

        debug!(event_type, "Queued signaling message");

        Ok(Delivery {
            event_type,
            ack: ack_rx,
            timeout: self.inner.config.send_timeout(),
        })
    }

    /// Send a message, waiting for the channel to open if it is connecting
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.enqueue(message)?.delivered().await
    }

    /// Queue a message and report a failed delivery to the user
    ///
    /// Ordering is fixed at call time; the delivery wait runs on its own task
    /// so the caller never blocks on the open transition.
    pub fn post(&self, message: OutboundMessage, notifier: &Notifier) {
        match self.enqueue(message) {
            Ok(delivery) => {
                let notifier = notifier.clone();
                tokio::spawn(async move {
                    let event_type = delivery.event_type();
                    if let Err(e) = delivery.delivered().await {
                        warn!("Failed to deliver {}: {}", event_type, e);
                        notifier.error(e.to_string());
                    }
                });
            }
            Err(e) => {
                warn!("Failed to send signaling message: {}", e);
                notifier.error(e.to_string());
            }
        }
    }

    /// Close the connection
    ///
    /// Messages still queued fail with a transport error. A later
    /// [`connect`](Self::connect) establishes a fresh connection.
    pub fn close(&self) {
        let taken = self.inner.connection.lock().take();
        if let Some(mut connection) = taken {
            info!("Closing signaling channel");
            if let Some(shutdown) = connection.shutdown.take() {
                let _ = shutdown.send(());
            }
            self.inner.state.send_replace(ChannelState::Disconnected);
        }
    }

    async fn connection_task(
        inner: Arc<ChannelInner>,
        id: u64,
        request: Request,
        mut outbound: mpsc::UnboundedReceiver<Outgoing>,
        mut shutdown: oneshot::Receiver<()>,
        inbound: mpsc::UnboundedSender<InboundEvent>,
    ) {
        let ws_stream = tokio::select! {
            result = connect_async(request) => match result {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => {
                    error!("Failed to connect to signaling server: {}", e);
                    inner.release(id, ChannelState::Failed(e.to_string()));
                    fail_pending(&mut outbound, "connection attempt failed");
                    return;
                }
            },
            _ = &mut shutdown => {
                debug!("Signaling channel closed while connecting");
                fail_pending(&mut outbound, "channel closed");
                return;
            }
        };

        // close() may have raced with the handshake
        if inner.connection.lock().as_ref().map(|c| c.id) != Some(id) {
            fail_pending(&mut outbound, "channel closed");
            return;
        }

        inner.state.send_replace(ChannelState::Open);
        info!("Connected to signaling server");

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }

                next = outbound.recv() => {
                    let Some(out) = next else { break };
                    // The sender timed out or dropped its Delivery
                    if out.ack.is_closed() {
                        debug!(event_type = out.event_type, "Dropping abandoned signaling message");
                        continue;
                    }
                    match write.send(Message::Text(out.text)).await {
                        Ok(()) => {
                            debug!(event_type = out.event_type, "Sent signaling message");
                            let _ = out.ack.send(Ok(()));
                        }
                        Err(e) => {
                            error!("Failed to send {}: {}", out.event_type, e);
                            let _ = out.ack.send(Err(Error::Transport(format!(
                                "failed to send {}: {}",
                                out.event_type, e
                            ))));
                            break;
                        }
                    }
                }

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => match InboundEvent::decode(&text) {
                        Ok(event) => {
                            debug!(kind = %event.kind(), "Received signaling event");
                            if inbound.send(event).is_err() {
                                debug!("Inbound event receiver dropped");
                            }
                        }
                        Err(e) => warn!("Dropping inbound signaling message: {}", e),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("Signaling connection closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Signaling connection error: {}", e);
                        break;
                    }
                },
            }
        }

        inner.release(id, ChannelState::Disconnected);
        fail_pending(&mut outbound, "channel closed");
        debug!("Signaling connection task terminated");
    }
}

fn build_request(config: &CallConfig, token: &str) -> Result<Request> {
    let endpoint = config.signaling_endpoint(token)?;
    let mut request = endpoint.as_str().into_client_request()?;

    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| Error::InvalidConfig(format!("token is not a valid header value: {}", e)))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    Ok(request)
}

fn fail_pending(outbound: &mut mpsc::UnboundedReceiver<Outgoing>, reason: &str) {
    outbound.close();
    while let Ok(out) = outbound.try_recv() {
        warn!("Could not deliver {}: {}", out.event_type, reason);
        let _ = out
            .ack
            .send(Err(Error::Transport(format!("{}: {}", out.event_type, reason))));
    }
}
