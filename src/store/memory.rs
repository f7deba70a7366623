//! In-memory datastore
//!
//! Thread-safe reference implementation backing the test suite and dev
//! servers. Real deployments plug a production backend into the
//! [`Datastore`](super::Datastore) trait instead. Transactions take a
//! version snapshot at begin, buffer their writes, and conflict at
//! commit when the store moved underneath them; scripted conflicts can
//! be injected to exercise the retry path.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{CommitResult, Datastore, Key, KeyId, PendingId, StoreError, StoreTransaction};
use crate::context::Context;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EntityId {
    Id(i64),
    Name(String),
}

fn entity_id(key: &Key) -> Result<(String, EntityId), StoreError> {
    match key.id() {
        KeyId::Incomplete => Err(StoreError::IncompleteKey),
        KeyId::Id(id) => Ok((key.kind(), EntityId::Id(id))),
        KeyId::Name(name) => Ok((key.kind(), EntityId::Name(name))),
    }
}

fn check_live(ctx: &Context) -> Result<(), StoreError> {
    match ctx.err() {
        Some(cause) => Err(StoreError::Canceled(cause)),
        None => Ok(()),
    }
}

#[derive(Default)]
struct Inner {
    entities: HashMap<(String, EntityId), Value>,
    next_id: i64,
    version: u64,
    forced_conflicts: u32,
}

impl Inner {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory [`Datastore`]
#[derive(Clone, Default)]
pub struct MemoryDatastore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the next `n` commits to fail with a conflict, regardless
    /// of actual contention.
    pub fn inject_conflicts(&self, n: u32) {
        self.inner.lock().unwrap().forced_conflicts = n;
    }

    /// Number of stored entities, across all kinds
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, ctx: &Context, key: &Key) -> Result<Value, StoreError> {
        check_live(ctx)?;
        let id = entity_id(key)?;
        let inner = self.inner.lock().unwrap();
        inner.entities.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    fn get_multi(&self, ctx: &Context, keys: &[Key]) -> Result<Vec<Option<Value>>, StoreError> {
        check_live(ctx)?;
        let inner = self.inner.lock().unwrap();
        keys.iter()
            .map(|key| Ok(inner.entities.get(&entity_id(key)?).cloned()))
            .collect()
    }

    fn put(&self, ctx: &Context, key: &Key, value: Value) -> Result<Option<i64>, StoreError> {
        check_live(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        inner.version += 1;
        if key.is_incomplete() {
            let id = inner.allocate();
            inner.entities.insert((key.kind(), EntityId::Id(id)), value);
            return Ok(Some(id));
        }
        let id = entity_id(key)?;
        inner.entities.insert(id, value);
        Ok(None)
    }

    fn put_multi(
        &self,
        ctx: &Context,
        keys: &[Key],
        values: Vec<Value>,
    ) -> Result<Vec<Option<i64>>, StoreError> {
        check_live(ctx)?;
        if keys.len() != values.len() {
            return Err(StoreError::Backend("put_multi: keys/values length mismatch".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.version += 1;
        let mut assigned = Vec::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            if key.is_incomplete() {
                let id = inner.allocate();
                inner.entities.insert((key.kind(), EntityId::Id(id)), value);
                assigned.push(Some(id));
            } else {
                let id = entity_id(key)?;
                inner.entities.insert(id, value);
                assigned.push(None);
            }
        }
        Ok(assigned)
    }

    fn delete(&self, ctx: &Context, key: &Key) -> Result<(), StoreError> {
        check_live(ctx)?;
        let id = entity_id(key)?;
        let mut inner = self.inner.lock().unwrap();
        inner.version += 1;
        inner.entities.remove(&id);
        Ok(())
    }

    fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> Result<(), StoreError> {
        check_live(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        inner.version += 1;
        for key in keys {
            let id = entity_id(key)?;
            inner.entities.remove(&id);
        }
        Ok(())
    }

    fn allocate_ids(
        &self,
        ctx: &Context,
        _kind: &str,
        count: usize,
    ) -> Result<Vec<i64>, StoreError> {
        check_live(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        Ok((0..count).map(|_| inner.allocate()).collect())
    }

    fn begin(&self, ctx: &Context) -> Result<Box<dyn StoreTransaction>, StoreError> {
        check_live(ctx)?;
        let inner = self.inner.lock().unwrap();
        Ok(Box::new(MemoryTransaction {
            store: self.inner.clone(),
            base_version: inner.version,
            snapshot: inner.entities.clone(),
            writes: Vec::new(),
            next_pending: 0,
        }))
    }
}

enum Write {
    Put { kind: String, id: Option<EntityId>, pending: Option<PendingId>, value: Value },
    Delete { kind: String, id: EntityId },
}

struct MemoryTransaction {
    store: Arc<Mutex<Inner>>,
    base_version: u64,
    snapshot: HashMap<(String, EntityId), Value>,
    writes: Vec<Write>,
    next_pending: PendingId,
}

impl MemoryTransaction {
    /// Snapshot overlaid with this transaction's own writes.
    fn read(&self, id: &(String, EntityId)) -> Option<Value> {
        for write in self.writes.iter().rev() {
            match write {
                Write::Put { kind, id: Some(wid), value, .. }
                    if *kind == id.0 && *wid == id.1 =>
                {
                    return Some(value.clone());
                }
                Write::Delete { kind, id: wid } if *kind == id.0 && *wid == id.1 => {
                    return None;
                }
                _ => {}
            }
        }
        self.snapshot.get(id).cloned()
    }
}

impl StoreTransaction for MemoryTransaction {
    fn get(&mut self, key: &Key) -> Result<Value, StoreError> {
        let id = entity_id(key)?;
        self.read(&id).ok_or(StoreError::NotFound)
    }

    fn get_multi(&mut self, keys: &[Key]) -> Result<Vec<Option<Value>>, StoreError> {
        keys.iter().map(|key| Ok(self.read(&entity_id(key)?))).collect()
    }

    fn put(&mut self, key: &Key, value: Value) -> Result<Option<PendingId>, StoreError> {
        if key.is_incomplete() {
            self.next_pending += 1;
            let pending = self.next_pending;
            self.writes.push(Write::Put {
                kind: key.kind(),
                id: None,
                pending: Some(pending),
                value,
            });
            return Ok(Some(pending));
        }
        let (kind, id) = entity_id(key)?;
        self.writes.push(Write::Put { kind, id: Some(id), pending: None, value });
        Ok(None)
    }

    fn put_multi(
        &mut self,
        keys: &[Key],
        values: Vec<Value>,
    ) -> Result<Vec<Option<PendingId>>, StoreError> {
        if keys.len() != values.len() {
            return Err(StoreError::Backend("put_multi: keys/values length mismatch".into()));
        }
        keys.iter().zip(values).map(|(key, value)| self.put(key, value)).collect()
    }

    fn delete(&mut self, key: &Key) -> Result<(), StoreError> {
        let (kind, id) = entity_id(key)?;
        self.writes.push(Write::Delete { kind, id });
        Ok(())
    }

    fn delete_multi(&mut self, keys: &[Key]) -> Result<(), StoreError> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<CommitResult, StoreError> {
        let mut inner = self.store.lock().unwrap();
        if inner.forced_conflicts > 0 {
            inner.forced_conflicts -= 1;
            return Err(StoreError::Conflict);
        }
        if inner.version != self.base_version {
            return Err(StoreError::Conflict);
        }
        let mut assigned = HashMap::new();
        for write in self.writes {
            match write {
                Write::Put { kind, id, pending, value } => {
                    let id = match id {
                        Some(id) => id,
                        None => {
                            let new_id = inner.allocate();
                            if let Some(pending) = pending {
                                assigned.insert(pending, new_id);
                            }
                            EntityId::Id(new_id)
                        }
                    };
                    inner.entities.insert((kind, id), value);
                }
                Write::Delete { kind, id } => {
                    inner.entities.remove(&(kind, id));
                }
            }
        }
        inner.version += 1;
        Ok(CommitResult::new(assigned))
    }

    fn rollback(self: Box<Self>) {
        // Buffered writes are simply dropped.
    }
}
