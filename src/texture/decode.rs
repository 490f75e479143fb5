//! Image decoder collaborator trait. Per Non-goals, decode algorithms
//! themselves are out of scope; this is the interface the worker state
//! machine drives plus a deterministic mock, mirroring `MockHttpClient`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::Result;

/// Result of a (possibly partial, per spec.md's two-phase retry shape)
/// decode attempt.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub components: u8,
    /// True if this decode used fewer than all available source bytes
    /// (a progressive/discard-level decode of a partially fetched image).
    pub is_partial: bool,
}

#[async_trait]
pub trait ImageDecoder: Send + Sync {
    /// Decode `data`, which may be a subset of the texture's full bytes
    /// when called mid-fetch against whatever has arrived so far.
    async fn decode(&self, data: Bytes, discard_level: u8) -> Result<DecodedImage>;

    /// Abort any in-progress decode for this worker's texture. No-op if
    /// nothing is in flight.
    fn abort(&self);
}

/// Deterministic in-memory mock. Always "succeeds" with a fixed
/// synthetic image sized from the input length, so tests can assert on
/// decode call counts without a real image codec.
#[derive(Clone, Default)]
pub struct MockImageDecoder {
    calls: Arc<AtomicUsize>,
    aborted: Arc<Mutex<bool>>,
}

impl MockImageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn was_aborted(&self) -> bool {
        *self.aborted.lock()
    }
}

#[async_trait]
impl ImageDecoder for MockImageDecoder {
    async fn decode(&self, data: Bytes, discard_level: u8) -> Result<DecodedImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DecodedImage {
            width: 64 >> discard_level.min(5),
            height: 64 >> discard_level.min(5),
            components: 4,
            is_partial: data.len() < 1024,
        })
    }

    fn abort(&self) {
        *self.aborted.lock() = true;
    }
}
