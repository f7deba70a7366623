//! Datastore access through the context
//!
//! Typed get/put/delete that transparently redirect to the open
//! transaction when one is bound somewhere up the context chain, and
//! otherwise go straight to the store under a bounded per-call timeout
//! so a slow store call can never silently eat the whole request
//! budget. `transact` wraps the begin/run/commit cycle with bounded
//! retry on commit conflicts.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{Context, Node, TxnSlot};
use crate::store::{Key, StoreError};

/// Attempts per transaction before the conflict is surfaced
const TXN_ATTEMPTS: u32 = 3;

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|err| StoreError::Decode(err.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|err| StoreError::Decode(err.to_string()))
}

impl Context {
    pub fn new_key(&self, kind: &str) -> Key {
        Key::incomplete(kind)
    }

    pub fn key_for_id(&self, kind: &str, id: i64) -> Key {
        Key::for_id(kind, id)
    }

    pub fn key_for_name(&self, kind: &str, name: &str) -> Key {
        Key::for_name(kind, name)
    }

    /// Nearest node up the chain holding an open transaction
    fn txn_node(&self) -> Option<Arc<Node>> {
        let mut current = Some(self.node.clone());
        while let Some(node) = current {
            if node.txn.lock().unwrap().is_some() {
                return Some(node);
            }
            current = node.parent_arc();
        }
        None
    }

    /// Run a direct (non-transactional) store call under its own
    /// bounded child context.
    fn direct<T>(
        &self,
        f: impl FnOnce(&Context) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let ctx = self.with_timeout(self.app().config().datastore_timeout());
        let result = f(&ctx);
        if !ctx.same_node(self) {
            ctx.cancel();
        }
        result
    }

    pub fn data_get<T: DeserializeOwned>(&self, key: &Key) -> Result<T, StoreError> {
        if let Some(node) = self.txn_node() {
            let mut slot = node.txn.lock().unwrap();
            let slot = slot.as_mut().expect("transaction vanished mid-request");
            return decode(slot.txn.get(key)?);
        }
        let app = self.app().clone();
        decode(self.direct(|ctx| app.datastore().get(ctx, key))?)
    }

    pub fn data_get_multi<T: DeserializeOwned>(
        &self,
        keys: &[Key],
    ) -> Result<Vec<Option<T>>, StoreError> {
        let values = if let Some(node) = self.txn_node() {
            let mut slot = node.txn.lock().unwrap();
            let slot = slot.as_mut().expect("transaction vanished mid-request");
            slot.txn.get_multi(keys)?
        } else {
            let app = self.app().clone();
            self.direct(|ctx| app.datastore().get_multi(ctx, keys))?
        };
        values.into_iter().map(|v| v.map(decode).transpose()).collect()
    }

    /// Put an entity. An incomplete key is completed in place: directly
    /// on a plain put, or only after commit when inside a transaction.
    pub fn data_put<T: Serialize>(&self, key: &Key, value: &T) -> Result<(), StoreError> {
        let value = encode(value)?;
        if let Some(node) = self.txn_node() {
            let mut slot = node.txn.lock().unwrap();
            let slot = slot.as_mut().expect("transaction vanished mid-request");
            if let Some(pending) = slot.txn.put(key, value)? {
                key.set_pending(pending);
                slot.pending.push(key.clone());
            }
            return Ok(());
        }
        let app = self.app().clone();
        if let Some(id) = self.direct(|ctx| app.datastore().put(ctx, key, value))? {
            key.set_id(id);
        }
        Ok(())
    }

    pub fn data_put_multi<T: Serialize>(
        &self,
        keys: &[Key],
        values: &[T],
    ) -> Result<(), StoreError> {
        let encoded: Result<Vec<Value>, StoreError> = values.iter().map(encode).collect();
        let encoded = encoded?;
        if let Some(node) = self.txn_node() {
            let mut slot = node.txn.lock().unwrap();
            let slot = slot.as_mut().expect("transaction vanished mid-request");
            let pendings = slot.txn.put_multi(keys, encoded)?;
            for (key, pending) in keys.iter().zip(pendings) {
                if let Some(pending) = pending {
                    key.set_pending(pending);
                    slot.pending.push(key.clone());
                }
            }
            return Ok(());
        }
        let app = self.app().clone();
        let assigned = self.direct(|ctx| app.datastore().put_multi(ctx, keys, encoded))?;
        for (key, id) in keys.iter().zip(assigned) {
            if let Some(id) = id {
                key.set_id(id);
            }
        }
        Ok(())
    }

    pub fn data_delete(&self, key: &Key) -> Result<(), StoreError> {
        if let Some(node) = self.txn_node() {
            let mut slot = node.txn.lock().unwrap();
            let slot = slot.as_mut().expect("transaction vanished mid-request");
            return slot.txn.delete(key);
        }
        let app = self.app().clone();
        self.direct(|ctx| app.datastore().delete(ctx, key))
    }

    pub fn data_delete_multi(&self, keys: &[Key]) -> Result<(), StoreError> {
        if let Some(node) = self.txn_node() {
            let mut slot = node.txn.lock().unwrap();
            let slot = slot.as_mut().expect("transaction vanished mid-request");
            return slot.txn.delete_multi(keys);
        }
        let app = self.app().clone();
        self.direct(|ctx| app.datastore().delete_multi(ctx, keys))
    }

    /// Reserve `count` ids for `kind` without writing anything
    pub fn allocate_ids(&self, kind: &str, count: usize) -> Result<Vec<i64>, StoreError> {
        let app = self.app().clone();
        self.direct(|ctx| app.datastore().allocate_ids(ctx, kind, count))
    }

    /// [`Context::transact_with_timeout`] under the configured
    /// transaction timeout
    pub fn transact<F>(&self, f: F) -> anyhow::Result<()>
    where
        F: FnMut(&Context) -> anyhow::Result<()>,
    {
        self.transact_with_timeout(self.app().config().transaction_timeout(), f)
    }

    /// Run `f` inside a transaction bound to a child context. Store
    /// calls made through that context (or its descendants) hit the
    /// transaction instead of the store. The whole begin/run/commit
    /// cycle retries on commit conflicts, up to 3 attempts; an error
    /// from `f` rolls back and surfaces immediately. After a successful
    /// commit every key that was put while incomplete holds its final
    /// id.
    pub fn transact_with_timeout<F>(&self, timeout: Duration, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(&Context) -> anyhow::Result<()>,
    {
        for _ in 0..TXN_ATTEMPTS {
            let ctx = self.with_timeout(timeout);
            let cleanup = |ctx: &Context| {
                if !ctx.same_node(self) {
                    ctx.cancel();
                }
            };
            let txn = match self.app().datastore().begin(&ctx) {
                Ok(txn) => txn,
                Err(err) => {
                    cleanup(&ctx);
                    return Err(err.into());
                }
            };
            *ctx.node.txn.lock().unwrap() = Some(TxnSlot { txn, pending: Vec::new() });
            if let Err(err) = f(&ctx) {
                if let Some(slot) = ctx.node.txn.lock().unwrap().take() {
                    slot.txn.rollback();
                }
                cleanup(&ctx);
                return Err(err);
            }
            let slot = ctx
                .node
                .txn
                .lock()
                .unwrap()
                .take()
                .expect("transaction slot emptied during f");
            let committed = slot.txn.commit();
            cleanup(&ctx);
            match committed {
                Ok(commit) => {
                    for key in slot.pending {
                        if let Some(pending) = key.pending() {
                            if let Some(id) = commit.resolve(pending) {
                                key.set_id(id);
                            }
                        }
                    }
                    return Ok(());
                }
                Err(StoreError::Conflict) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::Conflict.into())
    }
}
