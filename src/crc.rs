//! Checksum support for command and strobe frames.
//!
//! The generator itself is user-replaceable through [`Hooks::crc`]; the
//! default is the 8-bit XOR fold below. Only the byte width is fixed here.
//!
//! [`Hooks::crc`]: crate::Hooks::crc

/// CRC width on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CrcWidth {
    One,
    Two,
    Four,
}

impl CrcWidth {
    pub const fn bytes(self) -> usize {
        match self {
            CrcWidth::One => 1,
            CrcWidth::Two => 2,
            CrcWidth::Four => 4,
        }
    }
}

/// Fallback checksum: XOR fold of all bytes, right-aligned in 32 bits.
pub fn xor(data: &[u8]) -> u32 {
    let mut value = 0u8;
    for b in data {
        value ^= *b;
    }
    value as u32
}

/// Append a right-aligned CRC value behind `len` payload bytes in `buf`.
/// The CRC is emitted in host byte order, least significant byte first on
/// little-endian targets.
pub(crate) fn append(buf: &mut [u8], len: usize, crc: u32, width: CrcWidth) {
    let bytes = crc.to_ne_bytes();
    buf[len..len + width.bytes()].copy_from_slice(&bytes[..width.bytes()]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_folds_to_zero_over_payload_and_crc() {
        // Given
        let mut buf = [0x12, 0x34, 0x56, 0x00];
        let crc = xor(&buf[..3]);

        // When
        append(&mut buf, 3, crc, CrcWidth::One);

        // Then
        assert_eq!(0, xor(&buf));
    }

    #[test]
    fn append_two_bytes() {
        // Given
        let mut buf = [0xAA, 0, 0, 0];

        // When
        append(&mut buf, 1, 0x00AA, CrcWidth::Two);

        // Then
        assert_eq!([0xAA, 0xAA, 0x00, 0x00], buf);
    }
}
