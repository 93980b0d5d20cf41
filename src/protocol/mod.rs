//! Protocol module - receive buffer, frames and pluggable framing.
//!
//! This module implements the byte-stream side of a session:
//! - [`FrameBuffer`] with read/write cursors for socket reads
//! - [`Frame`] shared-ownership handle given to observers
//! - [`FrameParser`] trait and the built-in parsers
//! - [`reassemble`] which turns buffered bytes into frames

mod frame;
mod frame_buffer;
mod parser;
mod reassembly;

pub use frame::Frame;
pub use frame_buffer::{FrameBuffer, DEFAULT_RECV_BUFFER_SIZE};
pub use parser::{
    Delimited, FrameParser, LengthPrefixed, ParseOutcome, Passthrough, PrefixWidth,
    DEFAULT_MAX_FRAME_SIZE,
};
pub use reassembly::{reassemble, Reassembly};
