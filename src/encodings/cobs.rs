//! Consistent overhead byte stuffing.
//!
//! Frame layout on the wire:
//! `0x00 | code | payload (1..=253, no 0x00) | 0x00`
//! where the trailing delimiter is `0xFF` when the frame is a non-final
//! segment of an extended message.

use heapless::Vec;

use super::Decode;

/// Frame start and end delimiter.
pub const DELIMITER: u8 = 0x00;
/// End delimiter of a non-final (extended) frame segment.
pub const EXTENDED: u8 = 0xFF;
/// Maximum payload bytes in one frame.
pub const MAX_PAYLOAD: usize = 253;

/// Encode `size` payload bytes in place.
///
/// `frame` is shaped `[delimiter, code, payload.., terminator]`: the payload
/// sits at `frame[2..2 + size]` and the two header slots plus the
/// terminator slot belong to the encoder. The caller guarantees
/// `size <= 253` and `frame.len() >= size + 3`.
pub fn encode(frame: &mut [u8], size: usize, extended: bool) {
    debug_assert!(size <= MAX_PAYLOAD);
    debug_assert!(frame.len() >= size + 3);

    frame[0] = DELIMITER;
    // Phantom delimiter behind the payload; becomes the terminator.
    frame[size + 2] = DELIMITER;

    let mut code_pos = 1;
    let mut scan = 2;
    let mut left = size + 1;

    while left > 0 {
        let mut code = 1usize;
        while frame[scan] != DELIMITER {
            scan += 1;
            code += 1;
        }
        scan += 1;

        frame[code_pos] = code as u8;
        code_pos += code;
        left -= code;
    }

    if extended {
        frame[code_pos] = EXTENDED;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// The next byte is the first code of a frame.
    FirstCode,
    /// This many payload bytes remain before the next code; zero means the
    /// next byte is a subsequent code carrying an implicit zero.
    Data(u8),
}

/// Incremental COBS decoder.
pub struct CobsDecoder {
    state: State,
    /// Bytes are ignored until the first delimiter after construction or
    /// after an overrun.
    trashed: bool,
}

impl CobsDecoder {
    pub const fn new() -> Self {
        Self {
            state: State::FirstCode,
            trashed: true,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::FirstCode;
        self.trashed = true;
    }

    /// Feed one received byte, collecting payload into `dest` up to `limit`
    /// bytes.
    pub fn feed<const N: usize>(
        &mut self,
        byte: u8,
        dest: &mut Vec<u8, N>,
        limit: usize,
    ) -> Decode {
        if byte == DELIMITER {
            let done = self.state == State::Data(0) && !self.trashed;
            self.state = State::FirstCode;
            self.trashed = false;

            if done && !dest.is_empty() {
                return Decode::Done(dest.len());
            }
            dest.clear();
            return Decode::Pending;
        }

        match self.state {
            State::FirstCode if self.trashed => Decode::Pending,
            State::FirstCode => {
                self.state = State::Data(byte - 1);
                Decode::Pending
            }
            State::Data(0) => {
                // A subsequent code carries the previous group's implicit
                // zero.
                self.state = State::Data(byte - 1);
                self.push(0, dest, limit)
            }
            State::Data(n) => {
                self.state = State::Data(n - 1);
                self.push(byte, dest, limit)
            }
        }
    }

    fn push<const N: usize>(&mut self, byte: u8, dest: &mut Vec<u8, N>, limit: usize) -> Decode {
        if dest.len() < limit && dest.push(byte).is_ok() {
            Decode::Pending
        } else {
            dest.clear();
            self.state = State::FirstCode;
            self.trashed = true;
            Decode::Overrun
        }
    }
}

impl Default for CobsDecoder {
    fn default() -> Self {
        Self::new()
    }
}
