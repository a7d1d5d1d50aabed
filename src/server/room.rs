//! Per-workspace room state on the relay.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use super::ConnectionId;
use crate::sync::{CollabDocument, Guid, WorkspaceId};

/// A workspace room: connected members and the documents they share
pub struct Room {
    workspace_id: WorkspaceId,
    members: RwLock<HashSet<ConnectionId>>,
    documents: DashMap<Guid, Arc<CollabDocument>>,
    created_at: Instant,
}

impl Room {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            members: RwLock::new(HashSet::new()),
            documents: DashMap::new(),
            created_at: Instant::now(),
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Add a member; returns false if it was already present
    pub fn add_member(&self, conn: ConnectionId) -> bool {
        self.members.write().insert(conn)
    }

    pub fn remove_member(&self, conn: ConnectionId) -> bool {
        self.members.write().remove(&conn)
    }

    pub fn is_member(&self, conn: ConnectionId) -> bool {
        self.members.read().contains(&conn)
    }

    /// Members other than `exclude`
    pub fn members_except(&self, exclude: ConnectionId) -> Vec<ConnectionId> {
        self.members
            .read()
            .iter()
            .copied()
            .filter(|member| *member != exclude)
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    pub fn document(&self, guid: &str) -> Option<Arc<CollabDocument>> {
        self.documents.get(guid).map(|doc| doc.clone())
    }

    pub fn document_or_create(&self, guid: &str) -> Arc<CollabDocument> {
        self.documents
            .entry(guid.to_string())
            .or_insert_with(|| Arc::new(CollabDocument::new(guid)))
            .clone()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn age_seconds(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership() {
        let room = Room::new("ws-1");
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        assert!(room.add_member(a));
        assert!(!room.add_member(a));
        room.add_member(b);

        assert_eq!(room.member_count(), 2);
        assert_eq!(room.members_except(a), vec![b]);
        assert!(room.remove_member(a));
        assert!(!room.is_member(a));
    }

    #[test]
    fn test_documents_created_once() {
        let room = Room::new("ws-1");
        assert!(room.document("doc").is_none());

        let first = room.document_or_create("doc");
        let second = room.document_or_create("doc");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(room.document_count(), 1);
    }
}
