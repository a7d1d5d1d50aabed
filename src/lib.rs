//! collab-sync - CRDT document and awareness synchronization
//!
//! Keeps Automerge document replicas and ephemeral presence state consistent
//! between clients over a persistent, reconnecting event channel:
//! - `sync` holds the client core (`DocSyncAdapter`, `AwarenessBridge`) and
//!   the document and awareness engines it drives
//! - `transport` provides the event channel with ack correlation, over
//!   WebSocket or in process
//! - `server` is the relay that joins clients into workspace rooms
//! - `config` carries the runtime settings of both sides

pub mod config;
pub mod server;
pub mod sync;
pub mod transport;

pub use config::{ChannelConfig, RelayConfig};
pub use server::{RelayServer, RelayStats};
pub use sync::{
    Awareness, AwarenessBridge, CollabDocument, DocReplica, DocSubscription, DocSyncAdapter,
    Origin, QueryOptions, SyncError, SyncResult,
};
pub use transport::{Channel, ChannelError, ChannelFactory, MemoryFactory, WebSocketFactory};
