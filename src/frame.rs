use alloc::boxed::Box;
use alloc::vec;

/// Outgoing frame buffer shared by the strobe and response paths.
///
/// `buf` is the wire-facing storage; for ESCS the payload is staged in
/// `stage` and encoded into `buf` once, on the first transmit attempt. For
/// COBS the payload sits at `buf[2..]` and is encoded chunk-wise in place,
/// with `cobs_backup` carrying the byte each chunk's terminator crushes.
pub(crate) struct Frame {
    pub buf: Box<[u8]>,
    pub stage: Box<[u8]>,
    /// Payload bytes prepared for the current message.
    pub total: usize,
    /// Transmit position within `buf`.
    pub cursor: usize,
    /// Bytes still to hand to the byte sink. For COBS this counts payload
    /// bytes, excluding the per-chunk framing overhead.
    pub remaining: usize,
    /// Tick countdown driving this frame's schedule.
    pub countdown: u16,
    pub cobs_backup: u8,
    /// Whole-message encode performed (ESCS).
    pub encoded: bool,
    /// Current chunk encode performed (COBS).
    pub chunk_encoded: bool,
    /// Bypass encoding for this message (advertisement signature).
    pub raw: bool,
}

impl Frame {
    pub fn new(buf_len: usize, stage_len: usize, countdown: u16) -> Self {
        Self {
            buf: vec![0; buf_len].into_boxed_slice(),
            stage: vec![0; stage_len].into_boxed_slice(),
            total: 0,
            cursor: 0,
            remaining: 0,
            countdown,
            cobs_backup: 0,
            encoded: false,
            chunk_encoded: false,
            raw: false,
        }
    }

    pub fn idle(&self) -> bool {
        self.remaining == 0
    }

    /// Arm transmission of `total` prepared payload bytes.
    pub fn load(&mut self, total: usize) {
        self.total = total;
        self.cursor = 0;
        self.remaining = total;
        self.encoded = false;
        self.chunk_encoded = false;
        self.raw = false;
    }

    /// Arm transmission of a preframed message that bypasses encoding.
    pub fn load_raw(&mut self, message: &[u8]) {
        self.buf[..message.len()].copy_from_slice(message);
        self.load(message.len());
        self.raw = true;
    }

    /// Drop whatever is still queued.
    pub fn abandon(&mut self) {
        self.remaining = 0;
    }
}
