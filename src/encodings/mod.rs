//! Delimiter-based frame encodings.
//!
//! Both codecs come as a whole-buffer encoder and an incremental decoder
//! that is fed one byte at a time from the byte source. A decoder that runs
//! out of destination space trashes the frame and resynchronizes on the
//! next delimiter.

pub mod cobs;
pub mod escs;

/// Outcome of feeding one byte to an incremental frame decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decode {
    /// Frame still incomplete.
    Pending,
    /// A complete frame of this many payload bytes is in the destination.
    Done(usize),
    /// The frame exceeded the destination capacity and was dropped.
    Overrun,
}
