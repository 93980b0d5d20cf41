//! Delivered frame with shared ownership.
//!
//! A [`Frame`] is a reference-counted view of the unread bytes of a
//! [`FrameBuffer`]. Observers may clone a frame to keep it past the
//! `on_recv` call; the session notices the extra reference and switches to a
//! fresh receive buffer, so retained frames are never overwritten.
//!
//! # Example
//!
//! ```
//! use packwire::protocol::Frame;
//!
//! let frame = Frame::copy_from_slice(b"hello");
//! assert_eq!(frame.as_bytes(), b"hello");
//! assert!(!frame.is_retained());
//!
//! let kept = frame.clone();
//! assert!(frame.is_retained());
//! assert_eq!(kept.ref_count(), 2);
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;

use super::FrameBuffer;

/// A complete message as determined by the frame parser.
#[derive(Clone)]
pub struct Frame {
    buffer: Arc<FrameBuffer>,
}

impl Frame {
    /// Wrap a shared buffer; the frame is its unread region.
    pub(crate) fn from_shared(buffer: Arc<FrameBuffer>) -> Self {
        Self { buffer }
    }

    /// Create a frame holding a private copy of `bytes`.
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        Self {
            buffer: Arc::new(FrameBuffer::from_slice(bytes.len(), bytes)),
        }
    }

    /// The frame bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.read_region()
    }

    /// Frame length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.size()
    }

    /// Whether the frame has no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of live handles to the backing buffer.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.buffer)
    }

    /// Whether another handle to the backing buffer exists.
    #[inline]
    pub fn is_retained(&self) -> bool {
        self.ref_count() > 1
    }

    /// Copy the frame into a `Bytes`, e.g. to echo it back with
    /// [`Session::send`](crate::Session::send).
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl Deref for Frame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl PartialEq<[u8]> for Frame {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.len())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
