//! Call orchestrator integration test harness
//!
//! Provides:
//! - [`MockSignalingServer`]: a real WebSocket server on a random port that
//!   records every client message and pushes server events on demand
//! - [`TestCall`]: an orchestrator wired to the mock server with fake peer
//!   links and a controllable media source
//!
//! Basic usage pattern:
//!
//! 1. Start a `MockSignalingServer`
//! 2. Start one or more `TestCall`s against it
//! 3. Push server events with `server.push(..)`
//! 4. Await projections with the `TestCall::wait_for_*` helpers
//! 5. Inspect what the client sent with `server.wait_for_event(..)`

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, warn};
use vcme_core::test_utils::{FakeMediaSource, FakePeerLinkFactory};
use vcme_core::{
    CallConfig, CallContext, CallEvent, CallHandle, CallOrchestrator, CallPhase, MediaStreams,
    PeerLinkSnapshot, SessionSnapshot,
};

/// Upper bound for every wait in the harness
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Handshake data recorded for each connection
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request URI including the query string
    pub uri: String,
    /// `Authorization` header, if sent
    pub authorization: Option<String>,
}

struct ServerState {
    received: watch::Sender<Vec<Value>>,
    connections: watch::Sender<usize>,
    current: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    handshake_delay: Duration,
}

/// WebSocket signaling server speaking the call protocol
pub struct MockSignalingServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    accept_task: JoinHandle<()>,
}

impl MockSignalingServer {
    /// Start a server on a random loopback port
    pub async fn start() -> HarnessResult<Self> {
        Self::start_with_handshake_delay(Duration::ZERO).await
    }

    /// Start a server that holds every WebSocket handshake for `delay`
    ///
    /// Clients stay in the connecting state for that long.
    pub async fn start_with_handshake_delay(delay: Duration) -> HarnessResult<Self> {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (received, _) = watch::channel(Vec::new());
        let (connections, _) = watch::channel(0);
        let state = Arc::new(ServerState {
            received,
            connections,
            current: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            handshake_delay: delay,
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!("Mock server accepted {}", peer);
                tokio::spawn(serve(Arc::clone(&accept_state), stream));
            }
        });

        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    /// Base URL to put in `CallConfig::signaling_url`
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Client configuration pointing at this server
    pub fn config(&self) -> CallConfig {
        CallConfig {
            signaling_url: self.url(),
            send_timeout_secs: 5,
            ..Default::default()
        }
    }

    /// Number of completed WebSocket handshakes
    pub fn connections(&self) -> usize {
        *self.state.connections.borrow()
    }

    /// Handshakes seen so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// Wait until at least `count` handshakes completed
    pub async fn wait_for_connections(&self, count: usize) -> HarnessResult<()> {
        let mut rx = self.state.connections.subscribe();
        tokio::time::timeout(TIMEOUT, rx.wait_for(|n| *n >= count))
            .await
            .map_err(|_| HarnessError::Timeout(format!("{} connections", count)))?
            .map_err(|e| HarnessError::ServerError(e.to_string()))?;
        Ok(())
    }

    /// Push a server event to the current connection
    pub async fn push(&self, kind: &str, payload: Value) -> HarnessResult<()> {
        self.push_raw(json!({ "EventType": kind, "Payload": payload }).to_string())
            .await
    }

    /// Push a raw text frame to the current connection
    pub async fn push_raw(&self, text: String) -> HarnessResult<()> {
        self.wait_for_connections(1).await?;
        let current = self.state.current.lock();
        let sender = current
            .as_ref()
            .ok_or_else(|| HarnessError::ServerError("no open connection".to_string()))?;
        sender
            .send(Message::Text(text))
            .map_err(|_| HarnessError::ServerError("connection closed".to_string()))
    }

    /// Close the current connection from the server side
    pub fn close_connection(&self) {
        if let Some(sender) = self.state.current.lock().take() {
            let _ = sender.send(Message::Close(None));
        }
    }

    /// Every message received so far, in order
    pub fn received(&self) -> Vec<Value> {
        self.state.received.borrow().clone()
    }

    /// Payloads of received messages of one type, in order
    pub fn payloads_of(&self, event_type: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|m| m["event_type"] == event_type)
            .map(|m| m["payload"].clone())
            .collect()
    }

    /// Names of received messages, in order
    pub fn event_types(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m["event_type"].as_str().map(str::to_string))
            .collect()
    }

    /// Wait until at least `count` messages of `event_type` arrived and
    /// return their payloads
    pub async fn wait_for_count(&self, event_type: &str, count: usize) -> HarnessResult<Vec<Value>> {
        let mut rx = self.state.received.subscribe();
        tokio::time::timeout(
            TIMEOUT,
            rx.wait_for(|messages| {
                messages
                    .iter()
                    .filter(|m| m["event_type"] == event_type)
                    .count()
                    >= count
            }),
        )
        .await
        .map_err(|_| HarnessError::Timeout(format!("{} x {}", count, event_type)))?
        .map_err(|e| HarnessError::ServerError(e.to_string()))?;

        Ok(self.payloads_of(event_type))
    }

    /// Wait for the first message of `event_type` and return its payload
    pub async fn wait_for_event(&self, event_type: &str) -> HarnessResult<Value> {
        let mut payloads = self.wait_for_count(event_type, 1).await?;
        Ok(payloads.remove(0))
    }
}

impl Drop for MockSignalingServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(state: Arc<ServerState>, stream: TcpStream) {
    if !state.handshake_delay.is_zero() {
        tokio::time::sleep(state.handshake_delay).await;
    }

    let mut recorded = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        recorded = Some(RecordedRequest {
            uri: request.uri().to_string(),
            authorization: request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        });
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!("Mock server handshake failed: {}", e);
            return;
        }
    };

    if let Some(recorded) = recorded {
        state.requests.lock().push(recorded);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    *state.current.lock() = Some(tx);
    state.connections.send_modify(|n| *n += 1);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if write.send(message).await.is_err() || closing {
                        break;
                    }
                }
                None => break,
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
                    state.received.send_modify(|messages| messages.push(value));
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("Mock server connection closed");
}

/// An orchestrator running against a [`MockSignalingServer`]
pub struct TestCall {
    /// User action handle
    pub handle: CallHandle,
    /// Notifications emitted by the orchestrator
    pub events: mpsc::UnboundedReceiver<CallEvent>,
    /// Records every peer-link primitive the orchestrator created
    pub peers: FakePeerLinkFactory,
    /// Local media source
    pub media: FakeMediaSource,
    task: JoinHandle<()>,
}

impl TestCall {
    /// Start an orchestrator for `user_id` whose media is available at once
    pub async fn start(server: &MockSignalingServer, user_id: &str) -> Self {
        Self::start_with_media(server, user_id, FakeMediaSource::new()).await
    }

    /// Start an orchestrator with a specific media source
    pub async fn start_with_media(
        server: &MockSignalingServer,
        user_id: &str,
        media: FakeMediaSource,
    ) -> Self {
        let peers = FakePeerLinkFactory::new();
        let ctx = CallContext::new(server.config(), user_id, format!("token-{}", user_id))
            .with_peer_factory(Arc::new(peers.clone()))
            .with_media_source(Arc::new(media.clone()));

        let (orchestrator, handle, events) = CallOrchestrator::new(ctx);
        let task = tokio::spawn(orchestrator.run());

        Self {
            handle,
            events,
            peers,
            media,
            task,
        }
    }

    /// Wait until the session projection satisfies `predicate`
    pub async fn wait_for_session(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut rx = self.handle.subscribe();
        let snapshot = tokio::time::timeout(TIMEOUT, rx.wait_for(predicate))
            .await
            .expect("timed out waiting for session state")
            .expect("orchestrator stopped");
        snapshot.clone()
    }

    /// Wait until the session is in `phase`
    pub async fn wait_for_phase(&self, phase: CallPhase) -> SessionSnapshot {
        self.wait_for_session(|s| s.phase == phase).await
    }

    /// Wait until the link projection satisfies `predicate`
    pub async fn wait_for_link(
        &self,
        predicate: impl FnMut(&PeerLinkSnapshot) -> bool,
    ) -> PeerLinkSnapshot {
        let mut rx = self.handle.subscribe_link();
        let snapshot = tokio::time::timeout(TIMEOUT, rx.wait_for(predicate))
            .await
            .expect("timed out waiting for peer link state")
            .expect("peer worker stopped");
        snapshot.clone()
    }

    /// Wait until the media projection satisfies `predicate`
    pub async fn wait_for_media(
        &self,
        predicate: impl FnMut(&MediaStreams) -> bool,
    ) -> MediaStreams {
        let mut rx = self.handle.subscribe_media();
        let streams = tokio::time::timeout(TIMEOUT, rx.wait_for(predicate))
            .await
            .expect("timed out waiting for media streams")
            .expect("peer worker stopped");
        streams.clone()
    }

    /// Receive events until one matches `predicate`
    pub async fn wait_for_call_event(
        &mut self,
        mut predicate: impl FnMut(&CallEvent) -> bool,
    ) -> CallEvent {
        tokio::time::timeout(TIMEOUT, async {
            while let Some(event) = self.events.recv().await {
                if predicate(&event) {
                    return event;
                }
            }
            panic!("event stream ended");
        })
        .await
        .expect("timed out waiting for call event")
    }

    /// Receive events until a notice arrives and return its text
    pub async fn next_notice(&mut self) -> String {
        match self
            .wait_for_call_event(|e| matches!(e, CallEvent::Notice { .. }))
            .await
        {
            CallEvent::Notice { message, .. } => message,
            _ => unreachable!(),
        }
    }

    /// Drop the handle and wait for the orchestrator to stop
    pub async fn shutdown(self) {
        let Self { handle, task, .. } = self;
        drop(handle);
        let _ = tokio::time::timeout(TIMEOUT, task).await;
    }
}

/// Drive a client into an active call as a joiner
///
/// Pushes `waiting_room` then `accepted_into_room` and waits for the phase
/// to become active.
pub async fn join_active(
    server: &MockSignalingServer,
    call: &TestCall,
    call_id: &str,
    participants: &[&str],
) -> SessionSnapshot {
    server
        .push("waiting_room", json!({ "call_id": call_id }))
        .await
        .expect("push waiting_room");
    server
        .push(
            "accepted_into_room",
            json!({ "call_id": call_id, "participants": participants }),
        )
        .await
        .expect("push accepted_into_room");
    call.wait_for_phase(CallPhase::Active).await
}
