//! Growable receive buffer with explicit read and write cursors.
//!
//! The layout is always:
//!
//! ```text
//! 0          read_pos          write_pos          capacity
//! ├──consumed──┼──────unread──────┼──────free───────┤
//! ```
//!
//! Sockets write into [`FrameBuffer::write_region`] and then
//! [`commit`](FrameBuffer::commit) the byte count; parsers look at
//! [`read_region`](FrameBuffer::read_region) and the session
//! [`consume`](FrameBuffer::consume)s whatever was delivered.
//!
//! # Example
//!
//! ```
//! use packwire::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new(16);
//! buffer.write_region()[..5].copy_from_slice(b"hello");
//! buffer.commit(5);
//! assert_eq!(buffer.read_region(), b"hello");
//!
//! buffer.consume(2);
//! buffer.compact();
//! assert_eq!(buffer.read_region(), b"llo");
//! assert_eq!(buffer.remaining(), 13);
//! ```

use std::fmt;

/// Default receive buffer capacity.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 1024;

/// Fixed-capacity byte buffer with read/write cursors.
///
/// Invariant: `read_pos <= write_pos <= capacity`. Calls that would break
/// it ([`commit`](Self::commit) past the free space, [`consume`](Self::consume)
/// past the unread bytes) are programming errors and panic.
pub struct FrameBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
}

impl FrameBuffer {
    /// Create an empty buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Create a buffer holding a copy of `bytes`.
    ///
    /// The capacity is `capacity` or `bytes.len()`, whichever is larger.
    pub fn from_slice(capacity: usize, bytes: &[u8]) -> Self {
        let mut buffer = Self::new(capacity.max(bytes.len()));
        buffer.data[..bytes.len()].copy_from_slice(bytes);
        buffer.write_pos = bytes.len();
        buffer
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of unread bytes (`write_pos - read_pos`).
    #[inline]
    pub fn size(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Free space after the write cursor (`capacity - write_pos`).
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Offset of the read cursor.
    #[inline]
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// Offset of the write cursor.
    #[inline]
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Whether there are no unread bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Free region to read socket bytes into.
    #[inline]
    pub fn write_region(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    /// Unread bytes.
    #[inline]
    pub fn read_region(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Advance the write cursor after `n` bytes were written into
    /// [`write_region`](Self::write_region).
    ///
    /// # Panics
    ///
    /// Panics if `n > remaining()`.
    pub fn commit(&mut self, n: usize) {
        assert!(
            n <= self.remaining(),
            "commit of {} bytes exceeds {} free bytes",
            n,
            self.remaining()
        );
        self.write_pos += n;
    }

    /// Advance the read cursor past `n` delivered bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n > size()`.
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.size(),
            "consume of {} bytes exceeds {} unread bytes",
            n,
            self.size()
        );
        self.read_pos += n;
    }

    /// Move the unread bytes to offset 0, freeing the consumed prefix for writes.
    pub fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        let size = self.size();
        self.data.copy_within(self.read_pos..self.write_pos, 0);
        self.read_pos = 0;
        self.write_pos = size;
    }

    /// Drop all content; both cursors go back to 0.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RECV_BUFFER_SIZE)
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("capacity", &self.capacity())
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .finish()
    }
}
