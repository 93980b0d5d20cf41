//! Pluggable frame parsers.
//!
//! A parser looks at the unread bytes of the receive buffer and decides how
//! many of them form one complete message:
//!
//! - [`ParseOutcome::NeedMore`] - no complete frame yet, keep reading
//! - [`ParseOutcome::Consumed`] - the first `n` bytes are one frame
//! - [`ParseOutcome::Invalid`] - the bytes are malformed, drop the peer
//!
//! Any `Fn(&[u8]) -> ParseOutcome` closure is a parser. Three parsers ship
//! with the crate:
//!
//! - [`Passthrough`] - every read is one frame (plain TCP sessions)
//! - [`LengthPrefixed`] - big-endian length header followed by the payload
//! - [`Delimited`] - frames end with a delimiter sequence
//!
//! # Length-prefixed wire format
//!
//! ```text
//! ┌──────────────┬───────────────────┐
//! │ Length (BE)  │ Payload           │
//! │ 1, 2 or 4 B  │ `Length` bytes    │
//! └──────────────┴───────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{PackwireError, Result};

/// Default maximum frame size for the built-in parsers (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Decision of a [`FrameParser`] about the buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The buffered bytes do not contain a complete frame yet.
    NeedMore,
    /// The buffered bytes are malformed; the session is dropped.
    Invalid,
    /// The first `n` bytes are one complete frame. Valid only for
    /// `0 < n <= data.len()`; anything else is treated as `Invalid`.
    Consumed(usize),
}

/// Decides frame boundaries in a byte stream.
///
/// Parsers are shared between every session of a listener, so state has to
/// live behind interior mutability if a parser needs any.
pub trait FrameParser: Send + Sync + 'static {
    /// Inspect the unread bytes (never empty) and report the outcome.
    fn parse(&self, data: &[u8]) -> ParseOutcome;
}

impl<F> FrameParser for F
where
    F: Fn(&[u8]) -> ParseOutcome + Send + Sync + 'static,
{
    fn parse(&self, data: &[u8]) -> ParseOutcome {
        self(data)
    }
}

// ============================================================================
// Passthrough
// ============================================================================

/// Treats every read as one complete frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl FrameParser for Passthrough {
    fn parse(&self, data: &[u8]) -> ParseOutcome {
        if data.is_empty() {
            ParseOutcome::NeedMore
        } else {
            ParseOutcome::Consumed(data.len())
        }
    }
}

// ============================================================================
// Length-prefixed
// ============================================================================

/// Width of the big-endian length header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixWidth {
    /// 1-byte length.
    U8,
    /// 2-byte big-endian length.
    U16,
    /// 4-byte big-endian length.
    U32,
}

impl PrefixWidth {
    /// Header size in bytes.
    #[inline]
    pub fn header_len(self) -> usize {
        match self {
            PrefixWidth::U8 => 1,
            PrefixWidth::U16 => 2,
            PrefixWidth::U32 => 4,
        }
    }

    /// Largest payload the header can describe.
    #[inline]
    pub fn max_payload(self) -> usize {
        match self {
            PrefixWidth::U8 => u8::MAX as usize,
            PrefixWidth::U16 => u16::MAX as usize,
            PrefixWidth::U32 => u32::MAX as usize,
        }
    }

    fn decode(self, header: &[u8]) -> usize {
        match self {
            PrefixWidth::U8 => header[0] as usize,
            PrefixWidth::U16 => u16::from_be_bytes([header[0], header[1]]) as usize,
            PrefixWidth::U32 => {
                u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize
            }
        }
    }

    fn encode_into(self, len: usize, buf: &mut BytesMut) {
        match self {
            PrefixWidth::U8 => buf.put_u8(len as u8),
            PrefixWidth::U16 => buf.put_u16(len as u16),
            PrefixWidth::U32 => buf.put_u32(len as u32),
        }
    }
}

/// Frames made of a big-endian length header followed by the payload.
///
/// The delivered frame includes the header.
///
/// # Example
///
/// ```
/// use packwire::protocol::{FrameParser, LengthPrefixed, ParseOutcome, PrefixWidth};
///
/// let parser = LengthPrefixed::new(PrefixWidth::U16);
/// let wire = parser.encode(b"hello").unwrap();
/// assert_eq!(&wire[..2], &[0, 5]);
/// assert_eq!(parser.parse(&wire), ParseOutcome::Consumed(7));
/// assert_eq!(parser.parse(&wire[..4]), ParseOutcome::NeedMore);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixed {
    width: PrefixWidth,
    max_frame_size: usize,
}

impl LengthPrefixed {
    /// Create a parser with the default maximum frame size.
    pub fn new(width: PrefixWidth) -> Self {
        Self {
            width,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the maximum total frame size (header included).
    ///
    /// Larger announced frames are rejected as invalid.
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Header width.
    pub fn width(&self) -> PrefixWidth {
        self.width
    }

    /// Build a wire frame: header + payload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if the payload does not fit the header or
    /// exceeds the maximum frame size.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        let header_len = self.width.header_len();
        if payload.len() > self.width.max_payload() {
            return Err(PackwireError::invalid(format!(
                "payload of {} bytes does not fit a {}-byte length header",
                payload.len(),
                header_len
            )));
        }
        if header_len + payload.len() > self.max_frame_size {
            return Err(PackwireError::invalid(format!(
                "frame of {} bytes exceeds maximum {}",
                header_len + payload.len(),
                self.max_frame_size
            )));
        }

        let mut buf = BytesMut::with_capacity(header_len + payload.len());
        self.width.encode_into(payload.len(), &mut buf);
        buf.extend_from_slice(payload);
        Ok(buf.freeze())
    }

    /// Split a delivered frame into its payload.
    ///
    /// Returns `None` if the frame is shorter than the header.
    pub fn payload<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]> {
        frame.get(self.width.header_len()..)
    }
}

impl FrameParser for LengthPrefixed {
    fn parse(&self, data: &[u8]) -> ParseOutcome {
        let header_len = self.width.header_len();
        if data.len() < header_len {
            return ParseOutcome::NeedMore;
        }

        let total = header_len + self.width.decode(&data[..header_len]);
        if total > self.max_frame_size {
            tracing::debug!(
                "Announced frame of {} bytes exceeds maximum {}",
                total,
                self.max_frame_size
            );
            return ParseOutcome::Invalid;
        }

        if data.len() < total {
            ParseOutcome::NeedMore
        } else {
            ParseOutcome::Consumed(total)
        }
    }
}

// ============================================================================
// Delimited
// ============================================================================

/// Frames terminated by a delimiter sequence (delimiter included in the frame).
///
/// # Example
///
/// ```
/// use packwire::protocol::{Delimited, FrameParser, ParseOutcome};
///
/// let parser = Delimited::lines();
/// assert_eq!(parser.parse(b"ping\npong"), ParseOutcome::Consumed(5));
/// assert_eq!(parser.parse(b"pong"), ParseOutcome::NeedMore);
/// ```
#[derive(Debug, Clone)]
pub struct Delimited {
    delimiter: Vec<u8>,
    max_frame_size: usize,
}

impl Delimited {
    /// Create a parser for the given non-empty delimiter.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if the delimiter is empty.
    pub fn new(delimiter: impl Into<Vec<u8>>) -> Result<Self> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(PackwireError::invalid("frame delimiter must not be empty"));
        }
        Ok(Self {
            delimiter,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        })
    }

    /// `\n` terminated lines.
    pub fn lines() -> Self {
        Self {
            delimiter: b"\n".to_vec(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the maximum frame size (delimiter included).
    ///
    /// When that many bytes are buffered without a delimiter the data is
    /// rejected as invalid.
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// The delimiter sequence.
    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }
}

impl FrameParser for Delimited {
    fn parse(&self, data: &[u8]) -> ParseOutcome {
        let found = data
            .windows(self.delimiter.len())
            .position(|window| window == self.delimiter.as_slice());

        match found {
            Some(pos) => {
                let end = pos + self.delimiter.len();
                if end > self.max_frame_size {
                    ParseOutcome::Invalid
                } else {
                    ParseOutcome::Consumed(end)
                }
            }
            None if data.len() >= self.max_frame_size => ParseOutcome::Invalid,
            None => ParseOutcome::NeedMore,
        }
    }
}
