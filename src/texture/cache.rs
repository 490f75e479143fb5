//! Texture cache collaborator trait, grounded on the `HttpClient`
//! production/mock pairing in `http.rs`: an interface plus an in-memory
//! mock shipped in the same module, per Non-goals (no persistent cache
//! implementation is in scope here).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::Result;

/// A texture's cache identity (the original keys on UUID; any opaque key
/// works here).
pub type TextureId = uuid::Uuid;

#[async_trait]
pub trait TextureCache: Send + Sync {
    async fn read(&self, id: TextureId) -> Result<Option<Bytes>>;
    async fn write(&self, id: TextureId, data: Bytes, encoded_size: u32) -> Result<()>;
    /// Reprioritize a pending write without changing its data (e.g. to
    /// flush out-of-order when a texture becomes visible again).
    async fn prioritize_write(&self, id: TextureId) -> Result<()>;
    async fn remove(&self, id: TextureId) -> Result<()>;
}

/// Deterministic in-memory mock for tests, mirroring `MockHttpClient`.
#[derive(Clone, Default)]
pub struct InMemoryTextureCache {
    entries: Arc<Mutex<HashMap<TextureId, (Bytes, u32)>>>,
    prioritized: Arc<Mutex<Vec<TextureId>>>,
}

impl InMemoryTextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: TextureId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn prioritized_writes(&self) -> Vec<TextureId> {
        self.prioritized.lock().clone()
    }
}

#[async_trait]
impl TextureCache for InMemoryTextureCache {
    async fn read(&self, id: TextureId) -> Result<Option<Bytes>> {
        Ok(self.entries.lock().get(&id).map(|(data, _)| data.clone()))
    }

    async fn write(&self, id: TextureId, data: Bytes, encoded_size: u32) -> Result<()> {
        self.entries.lock().insert(id, (data, encoded_size));
        Ok(())
    }

    async fn prioritize_write(&self, id: TextureId) -> Result<()> {
        self.prioritized.lock().push(id);
        Ok(())
    }

    async fn remove(&self, id: TextureId) -> Result<()> {
        self.entries.lock().remove(&id);
        Ok(())
    }
}
