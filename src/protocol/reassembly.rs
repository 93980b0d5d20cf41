//! Frame extraction and receive-buffer reuse.
//!
//! After every successful read the session hands its buffer to
//! [`reassemble`], which runs the parser over the unread bytes until it
//! needs more data:
//!
//! - **exact match**: the whole unread region is one frame. The buffer
//!   itself is delivered by shared ownership. If the observer kept a handle
//!   the next read goes into a fresh buffer, otherwise the buffer is reset
//!   and reused.
//! - **partial**: the first `n` bytes are copied into their own frame, the
//!   buffer consumes them and parsing repeats on the rest.
//! - **need more**: a consumed prefix is compacted away; a buffer that is
//!   full with nothing to compact is [`PackwireError::RecvBufferTooSmall`].
//! - **invalid** (or a count outside `1..=size`):
//!   [`PackwireError::RecvDataInvalid`].

use std::sync::Arc;

use super::{Frame, FrameBuffer, FrameParser, ParseOutcome};
use crate::error::{PackwireError, Result};

/// What the session should do after a reassembly pass.
#[derive(Debug)]
pub enum Reassembly {
    /// Keep reading into this buffer.
    Continue(FrameBuffer),
    /// The delivery callback asked to stop; no further reads.
    Halted,
}

/// Extract every complete frame from `buffer` and decide the next buffer.
///
/// `deliver` is called once per frame in wire order and returns whether
/// the session is still running. `recv_buffer_size` is the capacity of the
/// replacement buffer allocated when the observer retains a delivered
/// buffer.
///
/// # Errors
///
/// `RecvBufferTooSmall` or `RecvDataInvalid`; both are fatal to the session.
pub fn reassemble<F>(
    mut buffer: FrameBuffer,
    parser: &dyn FrameParser,
    recv_buffer_size: usize,
    mut deliver: F,
) -> Result<Reassembly>
where
    F: FnMut(Frame) -> bool,
{
    loop {
        let size = buffer.size();
        if size == 0 {
            buffer.reset();
            return Ok(Reassembly::Continue(buffer));
        }

        match parser.parse(buffer.read_region()) {
            ParseOutcome::Consumed(n) if n == size => {
                let shared = Arc::new(buffer);
                let running = deliver(Frame::from_shared(Arc::clone(&shared)));

                let next = match Arc::try_unwrap(shared) {
                    Ok(mut reusable) => {
                        reusable.reset();
                        reusable
                    }
                    // Retained by the observer: never write into it again.
                    Err(_) => FrameBuffer::new(recv_buffer_size),
                };

                return Ok(if running {
                    Reassembly::Continue(next)
                } else {
                    Reassembly::Halted
                });
            }

            ParseOutcome::Consumed(n) if n > 0 && n < size => {
                let frame = Frame::copy_from_slice(&buffer.read_region()[..n]);
                buffer.consume(n);
                if !deliver(frame) {
                    return Ok(Reassembly::Halted);
                }
            }

            ParseOutcome::NeedMore => {
                if buffer.read_pos() > 0 {
                    buffer.compact();
                } else if buffer.remaining() == 0 {
                    return Err(PackwireError::RecvBufferTooSmall {
                        capacity: buffer.capacity(),
                    });
                }
                return Ok(Reassembly::Continue(buffer));
            }

            ParseOutcome::Consumed(_) | ParseOutcome::Invalid => {
                return Err(PackwireError::RecvDataInvalid);
            }
        }
    }
}
