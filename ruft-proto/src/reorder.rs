use std::cmp::Ordering;
use std::collections::BinaryHeap;

use bytes::Bytes;

/// Holds segments that arrived ahead of the stream cursor until the gap
/// before them is filled
#[derive(Debug, Default)]
pub(crate) struct ReorderBuffer {
    chunks: BinaryHeap<Chunk>,
}

impl ReorderBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, offset: u64, payload: Bytes) {
        self.chunks.push(Chunk { offset, payload });
    }

    /// Remove and return the chunk sitting exactly at `cursor`
    ///
    /// Chunks the cursor has already passed are duplicates and get
    /// discarded on the way.
    pub(crate) fn pop_at(&mut self, cursor: u64) -> Option<Bytes> {
        while let Some(chunk) = self.chunks.peek() {
            match chunk.offset.cmp(&cursor) {
                Ordering::Less => {
                    self.chunks.pop();
                }
                Ordering::Equal => return self.chunks.pop().map(|chunk| chunk.payload),
                Ordering::Greater => return None,
            }
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.chunks.len()
    }
}

#[derive(Debug, Eq)]
struct Chunk {
    offset: u64,
    payload: Bytes,
}

impl Ord for Chunk {
    // Invert ordering based on offset (max-heap, min offset first),
    // prioritize longer chunks at the same offset.
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset
            .cmp(&other.offset)
            .reverse()
            .then(self.payload.len().cmp(&other.payload.len()))
    }
}

impl PartialOrd for Chunk {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        (self.offset, self.payload.len()) == (other.offset, other.payload.len())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn drains_in_offset_order() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(6, Bytes::from_static(b"789"));
        buffer.insert(3, Bytes::from_static(b"456"));
        assert_matches!(buffer.pop_at(0), None);
        buffer.insert(0, Bytes::from_static(b"123"));
        assert_matches!(buffer.pop_at(0), Some(ref b) if &b[..] == b"123");
        assert_matches!(buffer.pop_at(3), Some(ref b) if &b[..] == b"456");
        assert_matches!(buffer.pop_at(6), Some(ref b) if &b[..] == b"789");
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn gap_blocks_drain() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(3, Bytes::from_static(b"456"));
        buffer.insert(9, Bytes::from_static(b"x"));
        assert_matches!(buffer.pop_at(3), Some(_));
        assert_matches!(buffer.pop_at(6), None);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn duplicates_are_discarded() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(3, Bytes::from_static(b"456"));
        buffer.insert(3, Bytes::from_static(b"456"));
        assert_matches!(buffer.pop_at(3), Some(_));
        // The cursor has moved past the twin; it must not surface again
        assert_matches!(buffer.pop_at(6), None);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn stale_chunks_are_discarded() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(0, Bytes::from_static(b"old"));
        buffer.insert(6, Bytes::from_static(b"new"));
        assert_matches!(buffer.pop_at(6), Some(ref b) if &b[..] == b"new");
        assert_eq!(buffer.len(), 0);
    }
}
