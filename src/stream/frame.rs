//! Frame and buffer containers.
//!
//! A [`Frame`] is an ordered list of [`Buffer`]s. Each buffer owns a fixed
//! backing allocation and exposes a movable payload window inside it:
//! head-room grows or shrinks at the front (used to reserve and later reveal
//! protocol headers in place) while the tail marks the end of written data.

use bytes::BytesMut;

use crate::error::{Error, Result};

/// A single contiguous buffer with head-room and payload cursors.
///
/// ```text
/// ┌──────────┬──────────────────────┬──────────────┐
/// │ head-room│       payload        │  available   │
/// └──────────┴──────────────────────┴──────────────┘
/// 0          head                   tail        capacity
/// ```
#[derive(Debug, Clone)]
pub struct Buffer {
    mem: BytesMut,
    head: usize,
    tail: usize,
}

impl Buffer {
    /// Allocate a zeroed buffer of the given capacity with no payload.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            mem: BytesMut::zeroed(capacity),
            head: 0,
            tail: 0,
        }
    }

    /// Build a buffer whose payload is an existing byte run (ingress path).
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut mem = BytesMut::with_capacity(data.len());
        mem.extend_from_slice(data);
        Self {
            tail: data.len(),
            mem,
            head: 0,
        }
    }

    /// Total backing capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.mem.len()
    }

    /// Bytes reserved at the front of the buffer.
    pub fn head_room(&self) -> usize {
        self.head
    }

    /// Move the head cursor. The tail never retreats past the new head, so
    /// shrinking head-room exposes previously reserved bytes as payload.
    pub fn set_head_room(&mut self, head_room: usize) {
        debug_assert!(head_room <= self.mem.len());
        self.head = head_room;
        self.tail = self.tail.max(head_room);
    }

    /// Space still writable past the tail.
    pub fn available(&self) -> usize {
        self.mem.len() - self.tail
    }

    /// Length of the payload window.
    pub fn payload_len(&self) -> usize {
        self.tail - self.head
    }

    /// Force the payload window to exactly `len` bytes past the head.
    pub fn set_payload_len(&mut self, len: usize) {
        debug_assert!(self.head + len <= self.mem.len());
        self.tail = self.head + len;
    }

    /// The payload window.
    pub fn payload(&self) -> &[u8] {
        &self.mem[self.head..self.tail]
    }

    /// Mutable payload window.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.mem[self.head..self.tail]
    }

    /// Append bytes at the tail, growing the payload window.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.available() {
            return Err(Error::Buffer {
                expected: data.len(),
                actual: self.available(),
            });
        }
        self.mem[self.tail..self.tail + data.len()].copy_from_slice(data);
        self.tail += data.len();
        Ok(())
    }
}

/// A reference-counted-style frame: one or more buffers moved as a unit.
///
/// The controller only ever produces single-buffer frames; multi-buffer
/// frames are accepted on ingress seams and coalesced.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    buffers: Vec<Buffer>,
}

impl Frame {
    /// Create an empty frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a frame holding one freshly allocated buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffers: vec![Buffer::with_capacity(capacity)],
        }
    }

    /// Create a single-buffer frame from received wire bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            buffers: vec![Buffer::from_bytes(data)],
        }
    }

    /// Wrap an existing buffer.
    pub fn from_buffer(buffer: Buffer) -> Self {
        Self {
            buffers: vec![buffer],
        }
    }

    /// Number of buffers in the frame.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// First buffer, if any.
    pub fn first(&self) -> Option<&Buffer> {
        self.buffers.first()
    }

    /// Mutable first buffer, if any.
    pub fn first_mut(&mut self) -> Option<&mut Buffer> {
        self.buffers.first_mut()
    }

    /// Detach the first buffer from the frame.
    pub fn split_off_first(&mut self) -> Option<Buffer> {
        if self.buffers.is_empty() {
            None
        } else {
            Some(self.buffers.remove(0))
        }
    }

    /// Append a buffer at the end of the frame.
    pub fn append_buffer(&mut self, buffer: Buffer) {
        self.buffers.push(buffer);
    }

    /// Total payload across all buffers.
    pub fn payload_len(&self) -> usize {
        self.buffers.iter().map(Buffer::payload_len).sum()
    }

    /// Iterate over the frame's buffers.
    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }
}
