//! Relay server for the sync protocol.
//!
//! The relay tracks which connections joined which workspace room, answers
//! `doc-load` requests from in-memory Automerge documents, merges
//! `client-update` deltas into those documents and rebroadcasts them, and
//! relays awareness diffs between room members. It is transport-agnostic:
//! every connection is an outbound `mpsc` queue of frames, fed by the axum
//! WebSocket handler in the binary or by the in-memory connector.
//!
//! Documents live only as long as the process.

mod room;

pub use room::Room;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sync::protocol::{
    decode_binary, encode_binary, from_payload, to_payload, AwarenessMessage, DocLoadAck,
    DocLoadRequest, DocUpdateMessage, Event,
};
use crate::sync::{DocReplica, SyncError, SyncResult, WorkspaceId};
use crate::transport::Frame;

/// Identifier of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected client
struct Connection {
    /// Channel to send frames to this client
    tx: mpsc::UnboundedSender<Frame>,
    /// Rooms this client has joined
    rooms: Mutex<HashSet<WorkspaceId>>,
}

/// Relay statistics
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub connections: usize,
    pub rooms: usize,
    pub documents: usize,
    pub uptime_seconds: u64,
}

/// Summary of one room
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub workspace_id: WorkspaceId,
    pub members: usize,
    pub documents: usize,
    pub age_seconds: u64,
}

/// The relay
pub struct RelayServer {
    connections: DashMap<ConnectionId, Connection>,
    rooms: DashMap<WorkspaceId, Arc<Room>>,
    started_at: Instant,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Register a connection; frames for it arrive on the returned receiver
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Frame>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            id,
            Connection {
                tx,
                rooms: Mutex::new(HashSet::new()),
            },
        );
        info!("Connection registered: {}", id);
        (id, rx)
    }

    /// Drop a connection and its room memberships.
    ///
    /// Closing the outbound queue also ends the connection's transport.
    pub fn disconnect(&self, conn: ConnectionId) -> bool {
        let Some((_, connection)) = self.connections.remove(&conn) else {
            return false;
        };
        for workspace_id in connection.rooms.lock().drain() {
            if let Some(room) = self.rooms.get(&workspace_id) {
                room.remove_member(conn);
            }
        }
        info!("Connection unregistered: {}", conn);
        true
    }

    /// Handle one frame received from `conn`
    pub fn handle_frame(&self, conn: ConnectionId, frame: Frame) {
        let (event, payload, ack) = match frame {
            Frame::Event {
                event,
                payload,
                ack,
            } => (event, payload, ack),
            Frame::Ack { id, .. } => {
                debug!("Ignoring ack {} from {}", id, conn);
                return;
            }
        };

        let event = match event.parse::<Event>() {
            Ok(event) => event,
            Err(e) => {
                warn!("Connection {}: {}", conn, e);
                return;
            }
        };

        let reply = match event {
            Event::ClientHandshake => self.on_handshake(conn, payload),
            Event::ClientLeave => self.on_leave(conn, payload),
            Event::DocLoad => Ok(self.on_doc_load(payload).into_value()),
            Event::ClientUpdate => self.on_client_update(conn, payload),
            Event::AwarenessInit => self.on_awareness_init(conn, payload),
            Event::AwarenessUpdate => self.on_awareness_update(conn, payload),
            Event::ServerUpdate | Event::ServerAwarenessBroadcast | Event::NewClientAwarenessInit => {
                warn!("Connection {} sent server-only event {}", conn, event);
                return;
            }
        };

        match (reply, ack) {
            (Ok(payload), Some(id)) => self.send_to(conn, Frame::Ack { id, payload }),
            (Err(e), Some(id)) => {
                warn!("Connection {}: {} failed: {}", conn, event, e);
                let payload = DocLoadAck::Error(e.to_string()).into_value();
                self.send_to(conn, Frame::Ack { id, payload });
            }
            (Err(e), None) => warn!("Connection {}: {} failed: {}", conn, event, e),
            (Ok(_), None) => {}
        }
    }

    fn on_handshake(&self, conn: ConnectionId, payload: Value) -> SyncResult<Value> {
        let workspace_id = room_name(&payload)?;
        let room = self.room_or_create(workspace_id);
        room.add_member(conn);
        if let Some(connection) = self.connections.get(&conn) {
            connection.rooms.lock().insert(workspace_id.to_string());
        }
        info!("Connection {} joined {}", conn, workspace_id);
        Ok(Value::Null)
    }

    fn on_leave(&self, conn: ConnectionId, payload: Value) -> SyncResult<Value> {
        let workspace_id = room_name(&payload)?;
        if let Some(room) = self.rooms.get(workspace_id) {
            room.remove_member(conn);
        }
        if let Some(connection) = self.connections.get(&conn) {
            connection.rooms.lock().remove(workspace_id);
        }
        info!("Connection {} left {}", conn, workspace_id);
        Ok(Value::Null)
    }

    fn on_doc_load(&self, payload: Value) -> DocLoadAck {
        match self.load_doc(payload) {
            Ok(Some(update)) => DocLoadAck::Update(update),
            Ok(None) => DocLoadAck::UpToDate,
            Err(e) => DocLoadAck::Error(e.to_string()),
        }
    }

    fn load_doc(&self, payload: Value) -> SyncResult<Option<String>> {
        let request: DocLoadRequest = from_payload(payload)?;
        let Some(doc) = self
            .rooms
            .get(&request.workspace_id)
            .and_then(|room| room.document(&request.guid))
        else {
            debug!("doc-load for unknown {}/{}", request.workspace_id, request.guid);
            return Ok(None);
        };

        let state_vector = request
            .state_vector
            .as_deref()
            .map(decode_binary)
            .transpose()?;
        let update = doc.encode_state_as_update(state_vector.as_deref())?;

        Ok((!update.is_empty()).then(|| encode_binary(&update)))
    }

    fn on_client_update(&self, conn: ConnectionId, payload: Value) -> SyncResult<Value> {
        let msg: DocUpdateMessage = from_payload(payload)?;
        let update = decode_binary(&msg.update)?;

        let room = self.room_or_create(&msg.workspace_id);
        room.document_or_create(&msg.guid).apply_update(&update)?;
        debug!(
            "Applied {} byte update to {}/{} from {}",
            update.len(),
            msg.workspace_id,
            msg.guid,
            conn
        );

        let frame = Frame::event(Event::ServerUpdate.as_str(), to_payload(&msg)?);
        self.broadcast(&room, conn, frame);
        Ok(Value::Null)
    }

    fn on_awareness_init(&self, conn: ConnectionId, payload: Value) -> SyncResult<Value> {
        let workspace_id = room_name(&payload)?;
        if let Some(room) = self.rooms.get(workspace_id).map(|room| room.clone()) {
            let frame = Frame::event(Event::NewClientAwarenessInit.as_str(), Value::Null);
            self.broadcast(&room, conn, frame);
        }
        Ok(Value::Null)
    }

    fn on_awareness_update(&self, conn: ConnectionId, payload: Value) -> SyncResult<Value> {
        let msg: AwarenessMessage = from_payload(payload)?;
        if let Some(room) = self.rooms.get(&msg.workspace_id).map(|room| room.clone()) {
            let frame = Frame::event(Event::ServerAwarenessBroadcast.as_str(), to_payload(&msg)?);
            self.broadcast(&room, conn, frame);
        }
        Ok(Value::Null)
    }

    /// Send a frame to every member of `room` except `exclude`
    fn broadcast(&self, room: &Room, exclude: ConnectionId, frame: Frame) {
        for member in room.members_except(exclude) {
            self.send_to(member, frame.clone());
        }
    }

    fn send_to(&self, conn: ConnectionId, frame: Frame) {
        if let Some(connection) = self.connections.get(&conn) {
            if connection.tx.send(frame).is_err() {
                debug!("Connection {} is gone", conn);
            }
        }
    }

    fn room_or_create(&self, workspace_id: &str) -> Arc<Room> {
        self.rooms
            .entry(workspace_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(workspace_id)))
            .clone()
    }

    pub fn room(&self, workspace_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(workspace_id).map(|room| room.clone())
    }

    pub fn rooms(&self) -> Vec<RoomSummary> {
        self.rooms
            .iter()
            .map(|entry| {
                let room = entry.value();
                RoomSummary {
                    workspace_id: room.workspace_id().to_string(),
                    members: room.member_count(),
                    documents: room.document_count(),
                    age_seconds: room.age_seconds(),
                }
            })
            .collect()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            connections: self.connections.len(),
            rooms: self.rooms.len(),
            documents: self.rooms.iter().map(|room| room.document_count()).sum(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Room-scoped control events carry the workspace id as a bare string
fn room_name(payload: &Value) -> SyncResult<&str> {
    payload
        .as_str()
        .ok_or_else(|| SyncError::Protocol(format!("expected workspace id, got {payload}")))
}
