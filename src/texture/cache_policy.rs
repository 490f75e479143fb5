//! Cache write policy for one texture fetch, per spec.md §4.6.

/// Whether the current image state should be committed to the texture
/// cache. `ShouldWrite` additionally carries the original's `size + 1`
/// convention: the worker marks a cache entry as a whole-image write by
/// passing `size` unchanged, and a partial (not-yet-fully-decoded) write
/// by passing `size + 1`, so the cache layer can tell the two apart
/// without a separate boolean field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWritePolicy {
    NotWrite,
    CanWrite,
    /// `partial` set means this is a partial write: the cache should
    /// record `size + 1` bytes read, not `size`.
    ShouldWrite { partial: bool },
}

impl CacheWritePolicy {
    /// The byte count to record in the cache entry, applying the
    /// `size + 1`-marks-partial convention.
    pub fn encoded_size(self, size: u32) -> Option<u32> {
        match self {
            CacheWritePolicy::NotWrite => None,
            CacheWritePolicy::CanWrite => Some(size),
            CacheWritePolicy::ShouldWrite { partial: false } => Some(size),
            CacheWritePolicy::ShouldWrite { partial: true } => Some(size + 1),
        }
    }

    pub fn should_write(self) -> bool {
        !matches!(self, CacheWritePolicy::NotWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_write_marks_size_plus_one() {
        let policy = CacheWritePolicy::ShouldWrite { partial: true };
        assert_eq!(policy.encoded_size(100), Some(101));
    }

    #[test]
    fn whole_write_leaves_size_unchanged() {
        let policy = CacheWritePolicy::ShouldWrite { partial: false };
        assert_eq!(policy.encoded_size(100), Some(100));
    }

    #[test]
    fn not_write_encodes_nothing() {
        assert_eq!(CacheWritePolicy::NotWrite.encoded_size(100), None);
    }
}
