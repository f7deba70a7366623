//! Narrow datastore interface and entity keys
//!
//! The engine never talks to a concrete database. It sees a key-value
//! store with transactional variants through the [`Datastore`] and
//! [`StoreTransaction`] traits; entities cross the seam as
//! `serde_json::Value` and the typed (de)serialization happens in the
//! context-level accessors. A reference in-memory implementation lives
//! in [`memory`].

pub mod memory;

use serde_json::Value;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::context::{Cause, Context};

/// Provisional identity handed out by a transactional put on an
/// incomplete key, redeemable against the [`CommitResult`].
pub type PendingId = u64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store: entity not found")]
    NotFound,
    #[error("store: concurrent transaction conflict")]
    Conflict,
    #[error("store: incomplete key used for lookup")]
    IncompleteKey,
    #[error("store: context no longer live: {0}")]
    Canceled(Cause),
    #[error("store: entity decode: {0}")]
    Decode(String),
    #[error("store: {0}")]
    Backend(String),
}

/// Identity part of an entity key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyId {
    /// No identity yet; the store assigns one on put
    Incomplete,
    Id(i64),
    Name(String),
}

#[derive(Debug, Clone)]
struct KeyState {
    kind: String,
    id: KeyId,
    pending: Option<PendingId>,
}

/// Shared, mutable entity key
///
/// A key put inside a transaction while still incomplete stays
/// unresolved until the commit succeeds; the owning context tracks it
/// and patches the final id in place afterwards, which is why the key
/// is a shared handle rather than a plain value.
#[derive(Clone, Debug)]
pub struct Key(Arc<Mutex<KeyState>>);

impl Key {
    pub fn incomplete(kind: &str) -> Self {
        Self::build(kind, KeyId::Incomplete)
    }

    pub fn for_id(kind: &str, id: i64) -> Self {
        Self::build(kind, KeyId::Id(id))
    }

    pub fn for_name(kind: &str, name: &str) -> Self {
        Self::build(kind, KeyId::Name(name.to_string()))
    }

    fn build(kind: &str, id: KeyId) -> Self {
        Self(Arc::new(Mutex::new(KeyState { kind: kind.to_string(), id, pending: None })))
    }

    pub fn kind(&self) -> String {
        self.0.lock().unwrap().kind.clone()
    }

    pub fn id(&self) -> KeyId {
        self.0.lock().unwrap().id.clone()
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self.0.lock().unwrap().id, KeyId::Incomplete)
    }

    /// Numeric id, if resolved
    pub fn int_id(&self) -> Option<i64> {
        match self.0.lock().unwrap().id {
            KeyId::Id(id) => Some(id),
            _ => None,
        }
    }

    pub(crate) fn set_id(&self, id: i64) {
        let mut state = self.0.lock().unwrap();
        state.id = KeyId::Id(id);
        state.pending = None;
    }

    pub(crate) fn set_pending(&self, pending: PendingId) {
        self.0.lock().unwrap().pending = Some(pending);
    }

    pub(crate) fn pending(&self) -> Option<PendingId> {
        self.0.lock().unwrap().pending
    }
}

/// Mapping from pending ids to the final identities a commit assigned
#[derive(Debug, Default)]
pub struct CommitResult {
    assigned: std::collections::HashMap<PendingId, i64>,
}

impl CommitResult {
    pub fn new(assigned: std::collections::HashMap<PendingId, i64>) -> Self {
        Self { assigned }
    }

    pub fn resolve(&self, pending: PendingId) -> Option<i64> {
        self.assigned.get(&pending).copied()
    }
}

/// Key-value store collaborator, treated as a black box
///
/// Every call takes the calling context so a backend can honor
/// cancellation; the in-memory reference implementation checks
/// `ctx.err()` on entry and little else.
pub trait Datastore: Send + Sync {
    fn get(&self, ctx: &Context, key: &Key) -> Result<Value, StoreError>;
    fn get_multi(&self, ctx: &Context, keys: &[Key]) -> Result<Vec<Option<Value>>, StoreError>;
    /// Returns the assigned numeric id when `key` was incomplete
    fn put(&self, ctx: &Context, key: &Key, value: Value) -> Result<Option<i64>, StoreError>;
    fn put_multi(
        &self,
        ctx: &Context,
        keys: &[Key],
        values: Vec<Value>,
    ) -> Result<Vec<Option<i64>>, StoreError>;
    fn delete(&self, ctx: &Context, key: &Key) -> Result<(), StoreError>;
    fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> Result<(), StoreError>;
    fn allocate_ids(&self, ctx: &Context, kind: &str, count: usize) -> Result<Vec<i64>, StoreError>;
    fn begin(&self, ctx: &Context) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// One open transaction
///
/// Reads observe the snapshot taken at begin plus the transaction's own
/// writes. `commit` fails with [`StoreError::Conflict`] when another
/// transaction touched the store in between; the accessor layer retries
/// on exactly that error.
pub trait StoreTransaction: Send {
    fn get(&mut self, key: &Key) -> Result<Value, StoreError>;
    fn get_multi(&mut self, keys: &[Key]) -> Result<Vec<Option<Value>>, StoreError>;
    /// Returns a pending id when `key` was incomplete; the final id is
    /// only assigned if the commit succeeds.
    fn put(&mut self, key: &Key, value: Value) -> Result<Option<PendingId>, StoreError>;
    fn put_multi(
        &mut self,
        keys: &[Key],
        values: Vec<Value>,
    ) -> Result<Vec<Option<PendingId>>, StoreError>;
    fn delete(&mut self, key: &Key) -> Result<(), StoreError>;
    fn delete_multi(&mut self, keys: &[Key]) -> Result<(), StoreError>;
    fn commit(self: Box<Self>) -> Result<CommitResult, StoreError>;
    fn rollback(self: Box<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_identity_transitions() {
        let key = Key::incomplete("U");
        assert!(key.is_incomplete());
        assert_eq!(key.int_id(), None);
        key.set_pending(7);
        assert_eq!(key.pending(), Some(7));
        key.set_id(42);
        assert!(!key.is_incomplete());
        assert_eq!(key.int_id(), Some(42));
        // Resolution clears the provisional identity.
        assert_eq!(key.pending(), None);
    }

    #[test]
    fn key_clones_share_state() {
        let key = Key::incomplete("U");
        let alias = key.clone();
        key.set_id(5);
        assert_eq!(alias.int_id(), Some(5));
    }

    #[test]
    fn commit_result_resolution() {
        let mut assigned = std::collections::HashMap::new();
        assigned.insert(1, 100);
        let result = CommitResult::new(assigned);
        assert_eq!(result.resolve(1), Some(100));
        assert_eq!(result.resolve(2), None);
    }
}
