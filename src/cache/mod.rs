//! Cache collaborator: get/set/delete with expiration, counters and CAS
//!
//! Mirrors a memcache-style client. Backends provide their own internal
//! concurrency safety, so the engine calls them without extra locking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache: key not found")]
    Missing,
    #[error("cache: value is not a counter")]
    NotCounter,
    #[error("cache: {0}")]
    Backend(String),
}

pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn get_multi(&self, keys: &[&str]) -> HashMap<String, Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);
    fn delete(&self, key: &str);
    /// Saturating at zero, like memcache decrement
    fn decrement(&self, key: &str, delta: u64) -> Result<u64, CacheError>;
    fn increment(&self, key: &str, delta: u64) -> Result<u64, CacheError>;
    /// Swap only when the current value equals `old`; returns whether
    /// the swap happened.
    fn compare_and_swap(&self, key: &str, old: &[u8], new: Vec<u8>) -> Result<bool, CacheError>;
}

struct Entry {
    value: Vec<u8>,
    expires: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

/// In-memory [`Cache`] for tests and dev servers
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(entry: &Entry) -> Result<u64, CacheError> {
        std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(CacheError::NotCounter)
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock().unwrap();
        entries.get(key).filter(|e| e.live()).map(|e| e.value.clone())
    }

    fn get_multi(&self, keys: &[&str]) -> HashMap<String, Vec<u8>> {
        let entries = self.entries.lock().unwrap();
        keys.iter()
            .filter_map(|key| {
                entries
                    .get(*key)
                    .filter(|e| e.live())
                    .map(|e| (key.to_string(), e.value.clone()))
            })
            .collect()
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let expires = if ttl.is_zero() { None } else { Some(Instant::now() + ttl) };
        self.entries.lock().unwrap().insert(key.to_string(), Entry { value, expires });
    }

    fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    fn decrement(&self, key: &str, delta: u64) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(key).filter(|e| e.live()).ok_or(CacheError::Missing)?;
        let next = Self::counter(entry)?.saturating_sub(delta);
        entry.value = next.to_string().into_bytes();
        Ok(next)
    }

    fn increment(&self, key: &str, delta: u64) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(key).filter(|e| e.live()).ok_or(CacheError::Missing)?;
        let next = Self::counter(entry)?.wrapping_add(delta);
        entry.value = next.to_string().into_bytes();
        Ok(next)
    }

    fn compare_and_swap(&self, key: &str, old: &[u8], new: Vec<u8>) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(key).filter(|e| e.live()).ok_or(CacheError::Missing)?;
        if entry.value != old {
            return Ok(false);
        }
        entry.value = new;
        Ok(true)
    }
}
