//! Blob store collaborator
//!
//! Static assets and other opaque byte payloads live behind this seam.
//! A missing blob is a `None`, not an error; errors are reserved for
//! backend failures.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::context::Context;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob: {0}")]
    Backend(String),
}

pub trait BlobStore: Send + Sync {
    fn read(&self, ctx: &Context, path: &str) -> Result<Option<Vec<u8>>, BlobError>;
    fn write(&self, ctx: &Context, path: &str, data: Vec<u8>) -> Result<(), BlobError>;
}

/// In-memory [`BlobStore`] for tests and dev servers
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn read(&self, _ctx: &Context, path: &str) -> Result<Option<Vec<u8>>, BlobError> {
        Ok(self.blobs.read().unwrap().get(path).cloned())
    }

    fn write(&self, _ctx: &Context, path: &str, data: Vec<u8>) -> Result<(), BlobError> {
        self.blobs.write().unwrap().insert(path.to_string(), data);
        Ok(())
    }
}
