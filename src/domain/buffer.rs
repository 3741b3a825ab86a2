//! I/O Buffers
//!
//! An [`IoBuffer`] is an ordered list of immutable, reference-counted byte
//! elements. Elements may be views into read-cache entries, so a buffer is
//! never mutated after it has been assembled.
//!
//! ```text
//!  IoBuffer (logical length = 12 KiB)
//!  ┌──────────────┬──────────────────────┬──────────────┐
//!  │ cache slice  │  freshly read bytes  │ cache slice  │
//!  │ (4 KiB view) │  (4 KiB, owned)      │ (4 KiB view) │
//!  └──────────────┴──────────────────────┴──────────────┘
//! ```

use bytes::{Bytes, BytesMut};

/// Ordered list of byte elements that together form one logical buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoBuffer {
    elements: Vec<Bytes>,
    size: u64,
}

impl IoBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with room for `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            elements: Vec::with_capacity(capacity),
            size: 0,
        }
    }

    /// Create a buffer holding a single element.
    pub fn from_element(element: Bytes) -> Self {
        let mut buffer = Self::with_capacity(1);
        buffer.push(element);
        buffer
    }

    /// Append an element. Empty elements are ignored.
    pub fn push(&mut self, element: Bytes) {
        if element.is_empty() {
            return;
        }
        self.size += element.len() as u64;
        self.elements.push(element);
    }

    /// Append a zero-copy view of `element[delta..delta + length]`.
    ///
    /// # Panics
    ///
    /// Panics if the requested view is out of bounds of `element`.
    pub fn push_reference(&mut self, element: &Bytes, delta: usize, length: usize) {
        self.push(element.slice(delta..delta + length));
    }

    /// Total size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns `true` if the buffer holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of elements.
    #[inline]
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// The elements in order.
    pub fn elements(&self) -> &[Bytes] {
        &self.elements
    }

    /// Iterate over `(file_offset, element)` pairs, starting at `base`.
    pub fn elements_at(&self, base: u64) -> impl Iterator<Item = (u64, &Bytes)> {
        self.elements.iter().scan(base, |offset, element| {
            let at = *offset;
            *offset += element.len() as u64;
            Some((at, element))
        })
    }

    /// Returns the buffer as a single contiguous element.
    ///
    /// A single-element buffer is returned without copying.
    pub fn to_contiguous(&self) -> Bytes {
        match self.elements.as_slice() {
            [] => Bytes::new(),
            [only] => only.clone(),
            elements => {
                let mut joined = BytesMut::with_capacity(self.size as usize);
                for element in elements {
                    joined.extend_from_slice(element);
                }
                joined.freeze()
            }
        }
    }

    /// Copy the buffer contents into a new `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.to_contiguous().to_vec()
    }
}

impl From<Bytes> for IoBuffer {
    fn from(element: Bytes) -> Self {
        Self::from_element(element)
    }
}

impl From<Vec<u8>> for IoBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_element(Bytes::from(data))
    }
}

impl FromIterator<Bytes> for IoBuffer {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        let mut buffer = IoBuffer::new();
        for element in iter {
            buffer.push(element);
        }
        buffer
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_tracks_size() {
        let mut buffer = IoBuffer::new();
        buffer.push(Bytes::from_static(b"abcd"));
        buffer.push(Bytes::new());
        buffer.push(Bytes::from_static(b"ef"));

        assert_eq!(buffer.size(), 6);
        assert_eq!(buffer.element_count(), 2);
        assert_eq!(buffer.to_vec(), b"abcdef");
    }

    #[test]
    fn test_push_reference_is_zero_copy() {
        let entry = Bytes::from(vec![7u8; 4096]);
        let mut buffer = IoBuffer::new();
        buffer.push_reference(&entry, 1024, 512);

        let view = &buffer.elements()[0];
        assert_eq!(view.len(), 512);
        // Same backing allocation
        assert_eq!(view.as_ptr(), entry[1024..].as_ptr());
    }

    #[test]
    fn test_elements_at_offsets() {
        let buffer: IoBuffer = vec![
            Bytes::from_static(b"aa"),
            Bytes::from_static(b"bbb"),
            Bytes::from_static(b"c"),
        ]
        .into_iter()
        .collect();

        let offsets: Vec<u64> = buffer.elements_at(100).map(|(at, _)| at).collect();
        assert_eq!(offsets, vec![100, 102, 105]);
    }

    #[test]
    fn test_to_contiguous_single_element_shares_storage() {
        let element = Bytes::from(vec![1u8, 2, 3]);
        let buffer = IoBuffer::from_element(element.clone());
        assert_eq!(buffer.to_contiguous().as_ptr(), element.as_ptr());
    }
}
