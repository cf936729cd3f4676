//! Strobe sampling: capture the active data space into the strobe buffer.

use crate::{
    config::{Encoding, StrobeDynamics},
    crc,
    traits::{Hooks, Link},
};

use super::{Host, STROBE_MARKER};

impl<L: Link, H: Hooks> Host<L, H> {
    /// Capture a snapshot of the active data space and arm the strobe frame.
    ///
    /// In encoded modes the payload leads with the invalid MessagePack code
    /// `0xC1` so the client can tell strobes from responses. In dynamic mode
    /// a bit mask of the cells sampled this cycle follows the marker. The
    /// optional CRC covers everything behind the marker and is appended
    /// last.
    pub(crate) fn sample_strobe(&mut self) {
        let timestamp = self.timestamp;

        let Self {
            cfg,
            registry,
            strobe,
            hooks,
            external,
            ..
        } = self;

        let encoded = cfg.strobe_encoding != Encoding::None;
        let dynamic = cfg.dynamics == StrobeDynamics::Dynamic;

        let total = {
            let dest: &mut [u8] = match cfg.strobe_encoding {
                Encoding::Cobs => &mut strobe.buf[2..],
                Encoding::Escs => &mut strobe.stage[..],
                _ => &mut strobe.buf[..],
            };

            let mut pos = 0;
            if encoded {
                dest[pos] = STROBE_MARKER;
                pos += 1;
            }
            let crc_start = pos;

            if let Some(region) = external {
                // Application-provided strobe payload.
                let len = region.len();
                region.read_into(&mut dest[pos..pos + len]);
                pos += len;
            } else if dynamic {
                let mask_base = pos;
                let mask_len = registry.mask_bytes() as usize;
                dest[mask_base..mask_base + mask_len].fill(0);
                pos += mask_len;

                let mut mask_pos = mask_base;
                let mut mask_bit = 1u8;
                for cell in registry.iter_mut() {
                    if cell.type_code.strobe_enabled() {
                        cell.rate_countdown -= 1;
                        if cell.rate_countdown == 0 {
                            cell.rate_countdown = cell.rate_divider;
                            dest[mask_pos] |= mask_bit;
                            let n = cell.strobe_bytes() as usize;
                            cell.sample_into(&mut dest[pos..pos + n], timestamp);
                            pos += n;
                        }
                    }
                    if mask_bit == 0x80 {
                        mask_pos += 1;
                        mask_bit = 1;
                    } else {
                        mask_bit <<= 1;
                    }
                }
            } else {
                for cell in registry.iter_mut() {
                    if cell.type_code.strobe_enabled() {
                        let n = cell.strobe_bytes() as usize;
                        cell.sample_into(&mut dest[pos..pos + n], timestamp);
                        pos += n;
                    }
                }
            }

            if cfg.strobe_crc {
                let value = hooks.crc(&dest[crc_start..pos]);
                crc::append(dest, pos, value, cfg.crc_width);
                pos += cfg.crc_width.bytes();
            }

            pos
        };

        strobe.load(total);
        if cfg.strobe_encoding == Encoding::Cobs {
            strobe.cobs_backup = strobe.buf[2];
        }
    }
}
