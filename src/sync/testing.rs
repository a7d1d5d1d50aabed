//! Channel double for unit tests: records what the core emits and lets tests
//! deliver inbound events by hand.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::transport::{Channel, ChannelCore, ChannelError, EventHandler, HandlerId};

#[derive(Default)]
pub struct RecordingChannel {
    core: ChannelCore,
    sent: Mutex<Vec<(String, Value)>>,
    acks: Mutex<HashMap<String, Value>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    connected: AtomicBool,
    failing: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every `event` request with `payload`
    pub fn set_ack(&self, event: &str, payload: Value) {
        self.acks.lock().insert(event.to_string(), payload);
    }

    /// Make every emit fail with `ChannelError::Closed`
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Run the handlers registered for `event`
    pub fn deliver(&self, event: &str, payload: Value) {
        self.core.dispatch_event(event, payload);
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().clone()
    }

    /// Payloads of every emitted `event`, in order
    pub fn sent_events(&self, event: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn record(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().push((event.to_string(), payload));
        Ok(())
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        self.record(event, payload)
    }

    async fn emit_with_ack(&self, event: &str, payload: Value) -> Result<Value, ChannelError> {
        self.record(event, payload)?;
        Ok(self.acks.lock().get(event).cloned().unwrap_or(Value::Null))
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
