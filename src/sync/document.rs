//! Document replicas and the automerge-backed implementation.
//!
//! The sync core only needs four things from a CRDT document: its guid, a
//! state vector, the update a peer with a given state vector is missing, and
//! a way to apply an update. `DocReplica` is that seam; `CollabDocument`
//! implements it on top of an Automerge `AutoCommit`.
//!
//! For Automerge the state vector is the hash of every change the replica
//! holds, each 32 bytes, concatenated. Heads alone are not enough: a replica
//! with unpushed local changes has heads the peer has never seen, and the
//! peer could not tell which of its own changes those already depend on. An
//! update is the raw encoding of the missing changes in causal order, which
//! `load_incremental` applies idempotently.

use automerge::{
    transaction::Transactable, ActorId, AutoCommit, AutomergeError, ChangeHash, ObjType, ReadDoc,
    ScalarValue, Value, ROOT,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use thiserror::Error;

use super::Guid;

/// Size of one change hash inside a state vector
const HASH_LEN: usize = 32;

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] AutomergeError),

    #[error("Invalid state vector: {0} bytes is not a multiple of {HASH_LEN}")]
    InvalidStateVector(usize),

    #[error("Field is not text: {0}")]
    NotText(String),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// A CRDT document replica the sync core can observe and mutate.
///
/// Implementations use interior mutability: the replica is owned by the
/// embedding application and shared with the core behind an `Arc`.
pub trait DocReplica: Send + Sync {
    /// Globally unique identifier of this replica's document
    fn guid(&self) -> &str;

    /// Summary of the replica's causal knowledge
    fn state_vector(&self) -> Vec<u8>;

    /// Everything a replica holding `state_vector` is missing; the full state
    /// when `state_vector` is `None`. Empty when there is nothing to send.
    fn encode_state_as_update(&self, state_vector: Option<&[u8]>) -> DocumentResult<Vec<u8>>;

    /// Merge an update. Already-known updates are a no-op.
    fn apply_update(&self, update: &[u8]) -> DocumentResult<()>;
}

/// Collaborative document backed by Automerge
pub struct CollabDocument {
    /// Document identifier
    guid: Guid,
    /// The underlying Automerge document
    doc: Mutex<AutoCommit>,
}

impl CollabDocument {
    /// Create a new empty collaborative document
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            doc: Mutex::new(AutoCommit::new()),
        }
    }

    /// Create a document with a specific actor ID
    pub fn with_actor(guid: impl Into<String>, actor_id: &[u8]) -> Self {
        Self {
            guid: guid.into(),
            doc: Mutex::new(AutoCommit::new().with_actor(ActorId::from(actor_id))),
        }
    }

    /// Load a document from binary Automerge data
    pub fn load(guid: impl Into<String>, data: &[u8]) -> DocumentResult<Self> {
        Ok(Self {
            guid: guid.into(),
            doc: Mutex::new(AutoCommit::load(data)?),
        })
    }

    /// Save the full document
    pub fn save(&self) -> Vec<u8> {
        self.doc.lock().save()
    }

    /// Current heads, sorted
    pub fn heads(&self) -> Vec<ChangeHash> {
        self.doc.lock().get_heads()
    }

    /// Run a local mutation and return the update it produced.
    ///
    /// The returned bytes are what `DocSyncAdapter::send_doc_update` expects.
    pub fn transact<F>(&self, f: F) -> DocumentResult<Vec<u8>>
    where
        F: FnOnce(&mut AutoCommit) -> Result<(), AutomergeError>,
    {
        let mut doc = self.doc.lock();
        let before = doc.get_heads();
        f(&mut doc)?;
        Ok(doc.save_after(&before))
    }

    /// Set a string field on the document root
    pub fn put_field(&self, key: &str, value: &str) -> DocumentResult<Vec<u8>> {
        self.transact(|doc| doc.put(ROOT, key, value))
    }

    /// Read a string field from the document root
    pub fn get_field(&self, key: &str) -> DocumentResult<Option<String>> {
        let doc = self.doc.lock();
        if let Some((Value::Scalar(s), _)) = doc.get(ROOT, key)? {
            if let ScalarValue::Str(text) = s.as_ref() {
                return Ok(Some(text.to_string()));
            }
        }
        Ok(None)
    }

    /// Splice a text field on the root, creating it if absent
    pub fn splice_text(
        &self,
        key: &str,
        position: usize,
        delete_count: usize,
        insert: &str,
    ) -> DocumentResult<Vec<u8>> {
        let mut doc = self.doc.lock();
        let before = doc.get_heads();

        let text_id = match doc.get(ROOT, key)? {
            Some((Value::Object(ObjType::Text), id)) => id,
            Some(_) => return Err(DocumentError::NotText(key.to_string())),
            None => doc.put_object(ROOT, key, ObjType::Text)?,
        };
        doc.splice_text(&text_id, position, delete_count as isize, insert)?;

        Ok(doc.save_after(&before))
    }

    /// Read a text field from the root
    pub fn text(&self, key: &str) -> DocumentResult<Option<String>> {
        let doc = self.doc.lock();
        match doc.get(ROOT, key)? {
            Some((Value::Object(ObjType::Text), id)) => Ok(Some(doc.text(&id)?)),
            Some(_) => Err(DocumentError::NotText(key.to_string())),
            None => Ok(None),
        }
    }
}

impl DocReplica for CollabDocument {
    fn guid(&self) -> &str {
        &self.guid
    }

    fn state_vector(&self) -> Vec<u8> {
        let mut doc = self.doc.lock();
        let hashes: Vec<ChangeHash> = doc.get_changes(&[]).iter().map(|c| c.hash()).collect();
        encode_hashes(&hashes)
    }

    fn encode_state_as_update(&self, state_vector: Option<&[u8]>) -> DocumentResult<Vec<u8>> {
        let mut doc = self.doc.lock();
        match state_vector {
            None => Ok(doc.save()),
            Some(sv) => {
                let known: HashSet<ChangeHash> = decode_hashes(sv)?.into_iter().collect();
                let mut update = Vec::new();
                for change in doc.get_changes(&[]) {
                    if !known.contains(&change.hash()) {
                        update.extend_from_slice(change.raw_bytes());
                    }
                }
                Ok(update)
            }
        }
    }

    fn apply_update(&self, update: &[u8]) -> DocumentResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        self.doc.lock().load_incremental(update)?;
        Ok(())
    }
}

/// Concatenate change hashes into a state vector
pub fn encode_hashes(hashes: &[ChangeHash]) -> Vec<u8> {
    let mut out = Vec::with_capacity(hashes.len() * HASH_LEN);
    for hash in hashes {
        out.extend_from_slice(&hash.0);
    }
    out
}

/// Split a state vector back into change hashes
pub fn decode_hashes(state_vector: &[u8]) -> DocumentResult<Vec<ChangeHash>> {
    if state_vector.len() % HASH_LEN != 0 {
        return Err(DocumentError::InvalidStateVector(state_vector.len()));
    }
    Ok(state_vector
        .chunks_exact(HASH_LEN)
        .map(|chunk| {
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(chunk);
            ChangeHash(hash)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_document() {
        let doc = CollabDocument::new("doc-1");
        assert_eq!(doc.guid(), "doc-1");
        assert!(doc.state_vector().is_empty());
    }

    #[test]
    fn test_fields_and_save_load() {
        let doc = CollabDocument::new("doc-1");
        doc.put_field("title", "Groceries").unwrap();

        let loaded = CollabDocument::load("doc-1", &doc.save()).unwrap();
        assert_eq!(loaded.get_field("title").unwrap(), Some("Groceries".to_string()));
        assert_eq!(loaded.get_field("missing").unwrap(), None);
    }

    #[test]
    fn test_state_vector_roundtrip() {
        let doc = CollabDocument::new("doc-1");
        doc.put_field("a", "1").unwrap();
        let sv = doc.state_vector();
        assert_eq!(sv.len(), HASH_LEN);
        assert_eq!(decode_hashes(&sv).unwrap(), doc.heads());

        // Every change is listed, not only the heads
        doc.put_field("b", "2").unwrap();
        assert_eq!(doc.state_vector().len(), 2 * HASH_LEN);
        assert_eq!(doc.heads().len(), 1);

        assert!(matches!(
            decode_hashes(&[1, 2, 3]),
            Err(DocumentError::InvalidStateVector(3))
        ));
    }

    #[test]
    fn test_diff_against_state_vector() {
        let server = CollabDocument::new("doc-1");
        let client = CollabDocument::new("doc-1");

        let first = server.put_field("title", "v1").unwrap();
        client.apply_update(&first).unwrap();

        server.put_field("body", "hello").unwrap();

        let missing = server
            .encode_state_as_update(Some(&client.state_vector()))
            .unwrap();
        assert!(!missing.is_empty());
        client.apply_update(&missing).unwrap();
        assert_eq!(client.get_field("body").unwrap(), Some("hello".to_string()));
        assert_eq!(client.heads(), server.heads());

        // Current replica has nothing left to receive
        let nothing = server
            .encode_state_as_update(Some(&client.state_vector()))
            .unwrap();
        assert!(nothing.is_empty());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let a = CollabDocument::new("doc-1");
        let b = CollabDocument::new("doc-1");
        let update = a.put_field("k", "v").unwrap();

        b.apply_update(&update).unwrap();
        b.apply_update(&update).unwrap();
        b.apply_update(&[]).unwrap();
        assert_eq!(b.heads(), a.heads());
    }

    #[test]
    fn test_replica_ahead_of_peer_gets_nothing() {
        let server = CollabDocument::new("doc-1");
        let client = CollabDocument::new("doc-1");

        let first = server.put_field("title", "v1").unwrap();
        client.apply_update(&first).unwrap();

        // Local edit not pushed yet
        client.put_field("draft", "unsent").unwrap();

        let update = server
            .encode_state_as_update(Some(&client.state_vector()))
            .unwrap();
        assert!(update.is_empty());
    }

    #[test]
    fn test_diverged_replica_gets_only_missing_changes() {
        let server = CollabDocument::new("doc-1");
        let client = CollabDocument::new("doc-1");

        let first = server.put_field("title", "v1").unwrap();
        client.apply_update(&first).unwrap();

        let second = server.put_field("body", "hello").unwrap();
        client.put_field("draft", "unsent").unwrap();

        let update = server
            .encode_state_as_update(Some(&client.state_vector()))
            .unwrap();
        assert_eq!(update, second);
        client.apply_update(&update).unwrap();
        assert_eq!(client.get_field("body").unwrap(), Some("hello".to_string()));
    }

    #[test]
    fn test_unknown_changes_are_ignored() {
        let server = CollabDocument::new("doc-1");
        server.put_field("k", "v").unwrap();

        let stranger = CollabDocument::new("doc-1");
        stranger.put_field("other", "x").unwrap();

        let update = server
            .encode_state_as_update(Some(&stranger.state_vector()))
            .unwrap();
        stranger.apply_update(&update).unwrap();
        assert_eq!(stranger.get_field("k").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn test_concurrent_text_edits_converge() {
        let doc1 = CollabDocument::with_actor("doc", b"actor-one");
        let seed = doc1.splice_text("content", 0, 0, "Hello").unwrap();

        let doc2 = CollabDocument::with_actor("doc", b"actor-two");
        doc2.apply_update(&seed).unwrap();

        let u1 = doc1.splice_text("content", 5, 0, " World").unwrap();
        let u2 = doc2.splice_text("content", 0, 0, "Say ").unwrap();

        doc1.apply_update(&u2).unwrap();
        doc2.apply_update(&u1).unwrap();

        let merged = doc1.text("content").unwrap().unwrap();
        assert_eq!(merged, "Say Hello World");
        assert_eq!(doc2.text("content").unwrap().unwrap(), merged);
    }

    #[test]
    fn test_text_on_scalar_field_rejected() {
        let doc = CollabDocument::new("doc");
        doc.put_field("title", "x").unwrap();
        assert!(matches!(doc.text("title"), Err(DocumentError::NotText(_))));
    }
}
