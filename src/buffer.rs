//! Composite flush buffers.
//!
//! A [`CompositeBuffer`] is a list of reference-counted byte segments. The
//! writer appends incoming network buffers without copying; the flusher
//! later drains the segments into the sink as one sequential append. The
//! buffers themselves are pooled by the flusher, so [`clear`] keeps the
//! segment list's allocation for the next borrower.
//!
//! [`clear`]: CompositeBuffer::clear

use bytes::Bytes;

/// An ordered collection of retained byte slices behaving as one logical
/// buffer.
#[derive(Debug, Default)]
pub struct CompositeBuffer {
    segments: Vec<Bytes>,
    len: usize,
    capacity: usize,
}

impl CompositeBuffer {
    /// Create an empty buffer with a nominal capacity.
    ///
    /// The capacity is a flush threshold rather than an allocation: pushing
    /// past it is allowed, the writer simply uses it to decide when to hand
    /// the buffer to the flusher.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            segments: Vec::new(),
            len: 0,
            capacity,
        }
    }

    /// Total bytes across all segments.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The flush threshold this buffer was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a retained segment. Zero-copy: the buffer holds a refcount,
    /// not a duplicate of the bytes.
    pub fn push(&mut self, segment: Bytes) {
        self.len += segment.len();
        self.segments.push(segment);
    }

    /// The segments in append order.
    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// Drop all segments, releasing their refcounts, but keep the segment
    /// list's allocation for reuse.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }
}
