//! Transmit pump: segment the queued message and hand one chunk per tick
//! to the byte sink.

use crate::{
    config::Encoding,
    encodings::{cobs, escs},
    frame::Frame,
    traits::{Hooks, Link, SendError},
};

use super::Host;

impl<L: Link, H: Hooks> Host<L, H> {
    /// Transmit at most one chunk. A queued strobe always goes first; the
    /// response gets the first free slot after the strobe has drained.
    pub(crate) fn pump(&mut self) {
        if !self.strobe.idle() {
            let encoding = if self.strobe.raw {
                // The advertisement signature is preframed.
                Encoding::None
            } else {
                self.cfg.strobe_encoding
            };
            Self::transmit(
                &mut self.link,
                &mut self.strobe,
                encoding,
                self.cfg.max_frame_size,
            );
        } else {
            Self::transmit(
                &mut self.link,
                &mut self.response,
                self.cfg.command_encoding,
                self.cfg.max_frame_size,
            );
        }
    }

    fn transmit(link: &mut L, frame: &mut Frame, encoding: Encoding, mtu: usize) {
        if frame.idle() {
            return;
        }

        match encoding {
            Encoding::Cobs => {
                let num = frame.remaining.min(cobs::MAX_PAYLOAD);
                let extended = frame.remaining > cobs::MAX_PAYLOAD;

                if !frame.chunk_encoded {
                    // The chunk header overlaps two already-sent payload
                    // bytes and the terminator crushes the byte carried in
                    // `cobs_backup` across chunk boundaries.
                    frame.buf[frame.cursor + 2] = frame.cobs_backup;
                    frame.cobs_backup = frame
                        .buf
                        .get(frame.cursor + cobs::MAX_PAYLOAD + 2)
                        .copied()
                        .unwrap_or(0);
                    cobs::encode(
                        &mut frame.buf[frame.cursor..frame.cursor + num + 3],
                        num,
                        extended,
                    );
                    frame.chunk_encoded = true;
                }

                match link.send(&frame.buf[frame.cursor..frame.cursor + num + 3]) {
                    Ok(()) => {
                        frame.cursor += num;
                        frame.remaining -= num;
                        frame.chunk_encoded = false;
                    }
                    Err(SendError::Busy) => {}
                    Err(SendError::Rejected) => {
                        warn!("link rejected chunk, message abandoned");
                        frame.abandon();
                    }
                }
            }

            Encoding::Escs => {
                if !frame.encoded {
                    let len = escs::encode(&frame.stage[..frame.total], &mut frame.buf);
                    frame.cursor = 0;
                    frame.remaining = len;
                    frame.encoded = true;
                }
                Self::send_plain(link, frame, mtu);
            }

            _ => Self::send_plain(link, frame, mtu),
        }
    }

    fn send_plain(link: &mut L, frame: &mut Frame, mtu: usize) {
        let num = frame.remaining.min(mtu);
        match link.send(&frame.buf[frame.cursor..frame.cursor + num]) {
            Ok(()) => {
                frame.cursor += num;
                frame.remaining -= num;
            }
            Err(SendError::Busy) => {}
            Err(SendError::Rejected) => {
                warn!("link rejected chunk, message abandoned");
                frame.abandon();
            }
        }
    }
}
