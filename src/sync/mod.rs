//! Document and awareness synchronization over a shared event channel.
//!
//! This module implements the client side of the sync protocol:
//! - `DocSyncAdapter` bootstraps, pushes and receives document updates
//! - `AwarenessBridge` keeps the ephemeral presence map in step with peers
//! - `Awareness` is the in-memory presence engine both sides apply diffs to
//! - `CollabDocument` is the automerge-backed document replica
//!
//! Binary payloads travel base64-encoded inside JSON event payloads. Every
//! message is scoped to a workspace (the "room"); messages for another
//! workspace are dropped without being applied.

pub mod adapter;
pub mod awareness;
pub mod bridge;
pub mod document;
pub mod protocol;
pub mod subscriptions;

#[cfg(test)]
mod testing;

pub use adapter::{DocSubscription, DocSyncAdapter, QueryOptions};
pub use awareness::{Awareness, AwarenessChange, AwarenessError, Origin};
pub use bridge::{AwarenessBridge, AwarenessSubscription};
pub use document::{CollabDocument, DocReplica, DocumentError};

use crate::transport::ChannelError;

/// Identifier of a workspace; doubles as the room name on the channel
pub type WorkspaceId = String;

/// Globally unique identifier of a document replica
pub type Guid = String;

/// Identifier of one awareness replica instance
pub type ClientId = u64;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the sync core
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The peer answered a request with an explicit error
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Awareness error: {0}")]
    Awareness(#[from] AwarenessError),

    /// A payload did not have the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}
