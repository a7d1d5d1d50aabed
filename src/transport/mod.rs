//! Event channel between a sync client and the relay.
//!
//! The channel carries named events with JSON payloads. A request can ask for
//! an acknowledgement; the channel correlates the answer by id so callers
//! simply await it. Lifecycle changes are delivered as synthetic events
//! (`connect`, `disconnect`, `reconnect`, `connect_error`) through the same
//! `on` registry, which lets applications observe connection state without
//! the sync core interpreting it.
//!
//! `SocketChannel` implements the channel over a pluggable [`Connector`]. It
//! buffers outbound frames while disconnected and reconnects with
//! exponential backoff when configured to.

pub mod memory;
pub mod websocket;

pub use memory::{MemoryConnector, MemoryFactory};
pub use websocket::{WebSocketConnector, WebSocketFactory};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;

/// Fired on every successful connection
pub const CONNECT: &str = "connect";
/// Fired when an established connection ends; payload is the reason
pub const DISCONNECT: &str = "disconnect";
/// Fired on connections after the first
pub const RECONNECT: &str = "reconnect";
/// Fired when a connection attempt fails; payload is the error
pub const CONNECT_ERROR: &str = "connect_error";

/// Errors raised by the channel layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("No acknowledgement within {0:?}")]
    AckTimeout(Duration),

    #[error("Frame codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// A frame on the wire, JSON-encoded as one text message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
        /// Present when the sender expects an acknowledgement
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
    Ack {
        id: u64,
        #[serde(default)]
        payload: Value,
    },
}

impl Frame {
    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        Frame::Event {
            event: event.into(),
            payload,
            ack: None,
        }
    }

    pub fn encode(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::Codec(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(text).map_err(|e| ChannelError::Codec(e.to_string()))
    }
}

/// Identifier of a registered event handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Callback invoked with an event's payload
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// A persistent duplex event channel
#[async_trait]
pub trait Channel: Send + Sync {
    /// Start connecting. Idempotent.
    ///
    /// # Panics
    ///
    /// Socket-backed implementations spawn their connection task here and
    /// panic when called outside a tokio runtime.
    fn connect(&self);

    /// Flush queued frames, close the connection and stop reconnecting. Idempotent.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Queue an event for delivery
    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError>;

    /// Send an event and wait for the peer's acknowledgement
    async fn emit_with_ack(&self, event: &str, payload: Value) -> Result<Value, ChannelError>;

    fn on(&self, event: &str, handler: EventHandler) -> HandlerId;

    /// Remove a handler; returns whether it was registered
    fn off(&self, id: HandlerId) -> bool;

    /// Number of registered handlers across all events
    fn handler_count(&self) -> usize;
}

/// Builds channels. Constructed once by the application and injected.
pub trait ChannelFactory: Send + Sync {
    fn open(&self) -> Arc<dyn Channel>;
}

/// Handler registry, ack correlation and outbound queue shared by a channel
/// and its connection task
pub struct ChannelCore {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    connected: AtomicBool,
    ever_connected: AtomicBool,
    next_handler: AtomicU64,
    next_ack: AtomicU64,
}

impl Default for ChannelCore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelCore {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            connected: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            next_handler: AtomicU64::new(1),
            next_ack: AtomicU64::new(1),
        }
    }

    pub fn on(&self, event: &str, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(handler, _)| *handler != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<Frame>>) {
        *self.outbound.lock() = tx;
    }

    pub fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(ChannelError::Closed)?;
        tx.send(frame).map_err(|_| ChannelError::Closed)
    }

    pub fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        self.send(Frame::event(event, payload))
    }

    pub async fn emit_with_ack(
        &self,
        event: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ChannelError> {
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = Frame::Event {
            event: event.to_string(),
            payload,
            ack: Some(id),
        };
        if let Err(e) = self.send(frame) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let answer = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(answer) => answer,
                Err(_) => {
                    self.pending.lock().remove(&id);
                    return Err(ChannelError::AckTimeout(limit));
                }
            },
            None => rx.await,
        };
        answer.map_err(|_| ChannelError::Closed)
    }

    /// Deliver an inbound frame
    pub fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Event { event, payload, .. } => self.dispatch_event(&event, payload),
            Frame::Ack { id, payload } => match self.pending.lock().remove(&id) {
                Some(tx) => {
                    let _ = tx.send(payload);
                }
                None => debug!("Dropping ack {} with no pending request", id),
            },
        }
    }

    /// Run every handler registered for `event`, in registration order
    pub fn dispatch_event(&self, event: &str, payload: Value) {
        // Handlers may (un)register while being called
        let handlers: Vec<EventHandler> = match self.handlers.read().get(event) {
            Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
            None => return,
        };
        for handler in handlers {
            handler(payload.clone());
        }
    }

    /// Called by a connector once its connection is established
    pub fn opened(&self) {
        self.connected.store(true, Ordering::Release);
        let reconnected = self.ever_connected.swap(true, Ordering::AcqRel);
        self.dispatch_event(CONNECT, Value::Null);
        if reconnected {
            self.dispatch_event(RECONNECT, Value::Null);
        }
    }

    fn reset_lifecycle(&self) {
        self.ever_connected.store(false, Ordering::Release);
    }

    /// Mark the connection as ended. Returns whether it was connected.
    fn closed(&self, reason: &str) -> bool {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        if was_connected {
            self.dispatch_event(DISCONNECT, Value::String(reason.to_string()));
        }
        was_connected
    }

    /// Fail every request still waiting for an acknowledgement
    fn fail_pending(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        if !pending.is_empty() {
            debug!("Failing {} pending acknowledgements", pending.len());
        }
        // Dropping the senders wakes the waiters with `Closed`
        drop(pending);
    }
}

/// One way of establishing a connection for a `SocketChannel`
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Run a single connection session.
    ///
    /// Implementations call `core.opened()` once connected, forward `outbound`
    /// frames, dispatch inbound frames into `core`, and return when the peer
    /// goes away or `shutdown` flips, flushing frames still queued in the
    /// latter case.
    async fn run(
        &self,
        core: &Arc<ChannelCore>,
        outbound: &mut mpsc::UnboundedReceiver<Frame>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ChannelError>;
}

struct Session {
    shutdown: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

/// Reconnecting channel over a `Connector`
pub struct SocketChannel {
    core: Arc<ChannelCore>,
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    session: Mutex<Option<Session>>,
}

impl SocketChannel {
    pub fn new(connector: Arc<dyn Connector>, config: ChannelConfig) -> Self {
        Self {
            core: Arc::new(ChannelCore::new()),
            connector,
            config,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

#[async_trait]
impl Channel for SocketChannel {
    /// Must be called from within a tokio runtime
    fn connect(&self) {
        let mut session = self.session.lock();
        if session.is_some() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.core.set_outbound(Some(tx));

        let task = tokio::spawn(supervise(
            self.core.clone(),
            self.connector.clone(),
            self.config.clone(),
            rx,
            shutdown_rx,
        ));

        *session = Some(Session {
            shutdown: shutdown_tx,
            _task: task,
        });
    }

    fn disconnect(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        // Queued frames stay in the receiver and are flushed by the connector
        self.core.set_outbound(None);
        let _ = session.shutdown.send(true);
        self.core.fail_pending();
        self.core.closed("client disconnect");
        // The next `connect` starts a fresh session, not a reconnect
        self.core.reset_lifecycle();
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        self.core.emit(event, payload)
    }

    async fn emit_with_ack(&self, event: &str, payload: Value) -> Result<Value, ChannelError> {
        self.core
            .emit_with_ack(event, payload, self.config.ack_timeout)
            .await
    }

    fn on(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.core.on(event, handler)
    }

    fn off(&self, id: HandlerId) -> bool {
        self.core.off(id)
    }

    fn handler_count(&self) -> usize {
        self.core.handler_count()
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            let _ = session.shutdown.send(true);
        }
    }
}

/// Connection supervisor: runs sessions and reconnects between them
async fn supervise(
    core: Arc<ChannelCore>,
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        let result = connector.run(&core, &mut outbound, &mut shutdown).await;

        // `disconnect` already closed the core, which may belong to a new session by now
        if *shutdown.borrow() {
            break;
        }
        let was_connected = core.closed("transport close");

        match result {
            Ok(()) => info!("Connection to {} closed", config.url),
            Err(e) => {
                warn!("Connection to {} failed: {}", config.url, e);
                core.dispatch_event(CONNECT_ERROR, Value::String(e.to_string()));
            }
        }

        if !config.reconnect {
            break;
        }
        if was_connected {
            attempt = 0;
        }
        attempt += 1;
        if config
            .max_reconnect_attempts
            .is_some_and(|max| attempt > max)
        {
            warn!("Giving up on {} after {} attempts", config.url, attempt - 1);
            break;
        }

        let delay = config.backoff(attempt);
        debug!("Reconnect attempt {} in {:?}", attempt, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }

    debug!("Connection supervisor for {} stopped", config.url);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_wire_shape() {
        let frame = Frame::event("client-handshake", json!("ws-1"));
        assert_eq!(
            frame.encode().unwrap(),
            r#"{"type":"event","event":"client-handshake","payload":"ws-1"}"#
        );

        let ack = Frame::decode(r#"{"type":"ack","id":7,"payload":null}"#).unwrap();
        assert_eq!(
            ack,
            Frame::Ack {
                id: 7,
                payload: Value::Null
            }
        );
        assert!(Frame::decode("{}").is_err());
    }

    #[test]
    fn test_handlers_dispatch_and_off() {
        let core = ChannelCore::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let sink = hits.clone();
        let id = core.on("ping", Arc::new(move |payload| sink.lock().push(payload)));
        core.dispatch(Frame::event("ping", json!(1)));
        core.dispatch(Frame::event("other", json!(2)));

        assert!(core.off(id));
        assert!(!core.off(id));
        core.dispatch(Frame::event("ping", json!(3)));

        assert_eq!(*hits.lock(), vec![json!(1)]);
        assert_eq!(core.handler_count(), 0);
    }

    #[test]
    fn test_emit_without_session_is_closed() {
        let core = ChannelCore::new();
        assert!(matches!(
            core.emit("client-update", Value::Null),
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_ack_correlation_out_of_order() {
        let core = Arc::new(ChannelCore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        core.set_outbound(Some(tx));

        let first = tokio::spawn({
            let core = core.clone();
            async move { core.emit_with_ack("doc-load", json!("a"), None).await }
        });
        let second = tokio::spawn({
            let core = core.clone();
            async move { core.emit_with_ack("doc-load", json!("b"), None).await }
        });

        let mut ids = HashMap::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                Frame::Event {
                    payload,
                    ack: Some(id),
                    ..
                } => {
                    ids.insert(payload.as_str().unwrap().to_string(), id);
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }

        // Answer in reverse order
        core.dispatch(Frame::Ack {
            id: ids["b"],
            payload: json!("for-b"),
        });
        core.dispatch(Frame::Ack {
            id: ids["a"],
            payload: json!("for-a"),
        });

        assert_eq!(first.await.unwrap().unwrap(), json!("for-a"));
        assert_eq!(second.await.unwrap().unwrap(), json!("for-b"));
    }

    #[tokio::test]
    async fn test_ack_timeout_and_fail_pending() {
        let core = Arc::new(ChannelCore::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        core.set_outbound(Some(tx));

        let result = core
            .emit_with_ack("doc-load", Value::Null, Some(Duration::from_millis(10)))
            .await;
        assert!(matches!(result, Err(ChannelError::AckTimeout(_))));
        assert!(core.pending.lock().is_empty());

        let waiting = tokio::spawn({
            let core = core.clone();
            async move { core.emit_with_ack("doc-load", Value::Null, None).await }
        });
        tokio::task::yield_now().await;
        while core.pending.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        core.fail_pending();
        assert!(matches!(waiting.await.unwrap(), Err(ChannelError::Closed)));
    }

    #[test]
    fn test_lifecycle_events() {
        let core = ChannelCore::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        for name in [CONNECT, RECONNECT, DISCONNECT] {
            let sink = events.clone();
            core.on(name, Arc::new(move |_| sink.lock().push(name)));
        }

        core.opened();
        assert!(core.closed("bye"));
        assert!(!core.closed("bye"));
        core.opened();

        assert_eq!(*events.lock(), vec![CONNECT, DISCONNECT, CONNECT, RECONNECT]);

        assert!(core.closed("bye"));
        core.reset_lifecycle();
        core.opened();
        assert_eq!(events.lock().last(), Some(&CONNECT));
        assert_eq!(events.lock().len(), 6);
    }
}
