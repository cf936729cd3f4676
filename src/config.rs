use bitfield::bitfield;

use crate::{crc::CrcWidth, error::ConfigError};

/// Frame encoding selector. `None` is only valid for strobes, `Rn` only for
/// commands and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Encoding {
    /// No escaping, no delimiter. Strobe frames only.
    None = 0,
    /// `\r\n` terminated ASCII lines. Command/response frames only.
    Rn = 1,
    /// Consistent overhead byte stuffing, `0x00` delimiter.
    Cobs = 2,
    /// Escape sequences over a `0x7E` delimiter.
    Escs = 3,
}

/// Serialization of command and response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProcessingMode {
    /// Comma-separated decimal ASCII.
    Ascii = 0,
    /// MessagePack.
    MsgPack = 1,
}

/// Strobe composition policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StrobeDynamics {
    /// Every enabled cell is sampled each strobe cycle.
    Static = 0,
    /// Cells carry individual rate dividers; each strobe is prefixed by a
    /// bit mask of the cells sampled this cycle.
    Dynamic = 1,
}

bitfield! {
    /// The packed protocol-info word advertised to the client.
    #[derive(Clone, Copy)]
    pub struct ProtocolInfo(u32);
    pub command_encoding, set_command_encoding: 1, 0;
    pub strobe_matches_command, set_strobe_matches_command: 2;
    pub msgpack_mode, set_msgpack_mode: 3;
    pub dynamic_strobe, set_dynamic_strobe: 4;
    pub crc_width_minus_1, set_crc_width_minus_1: 6, 5;
    pub command_crc, set_command_crc: 7;
    pub strobe_crc, set_strobe_crc: 8;
    pub little_endian, set_little_endian: 9;
    pub command_buffer_minus_1, set_command_buffer_minus_1: 15, 10;
    pub response_buffer_minus_1, set_response_buffer_minus_1: 23, 16;
    pub frame_size_units_minus_1, set_frame_size_units_minus_1: 31, 24;
}

/// Slowest possible strobe rate in ticks.
pub const STROBE_SLOWEST: u16 = 65535;

/// Host configuration, fixed for the lifetime of a [`Host`].
///
/// Invalid combinations are rejected by [`HostConfig::validate`], which runs
/// during host construction.
///
/// [`Host`]: crate::Host
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Encoding for incoming commands and outgoing responses.
    pub command_encoding: Encoding,
    /// Encoding for outgoing strobe frames.
    pub strobe_encoding: Encoding,
    /// Serialization of command/response bodies.
    pub mode: ProcessingMode,
    /// Static or dynamic strobe composition.
    pub dynamics: StrobeDynamics,
    /// Maximum bytes handed to the byte sink per tick. Must be 256 for
    /// COBS, otherwise a multiple of 256 up to 65536.
    pub max_frame_size: usize,
    /// Receive (command) buffer size, 16..=64 bytes.
    pub command_buffer_size: usize,
    /// Response buffer size, 32..=256 bytes.
    pub response_buffer_size: usize,
    /// Tick period in milliseconds, 1..250.
    pub tick_period_ms: u16,
    /// Ticks after which an incomplete command is dropped.
    pub command_timeout_ticks: u16,
    /// Minimum strobe period in ticks.
    pub strobe_period_min: u16,
    /// Maximum strobe period in ticks.
    pub strobe_period_max: u16,
    /// Initial strobe period in ticks.
    pub strobe_period: u16,
    /// Ticks between command completion and response production.
    pub response_latency_ticks: u16,
    /// Serial baud rate, used for timing derivations only.
    pub baudrate: u32,
    /// Verify a trailing CRC on received commands.
    pub command_crc: bool,
    /// Append a CRC to strobe frames.
    pub strobe_crc: bool,
    /// CRC width on the wire.
    pub crc_width: CrcWidth,
    /// Strobe data is little-endian (host endianness flag in the
    /// protocol-info word).
    pub little_endian: bool,
    /// Auto-register an internal tick counter as cell 0.
    pub timestamp: bool,
    /// Strobe countdown is driven externally via [`Host::countdown`].
    ///
    /// [`Host::countdown`]: crate::Host::countdown
    pub external_sync: bool,
    /// Strobe payload comes from an application buffer instead of sampling.
    pub external_source: bool,
    /// Allow out-of-band notification frames.
    pub notifications: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            command_encoding: Encoding::Rn,
            strobe_encoding: Encoding::None,
            mode: ProcessingMode::Ascii,
            dynamics: StrobeDynamics::Static,
            max_frame_size: 4096,
            command_buffer_size: 64,
            response_buffer_size: 96,
            tick_period_ms: 10,
            command_timeout_ticks: 5,
            strobe_period_min: 10,
            strobe_period_max: STROBE_SLOWEST,
            strobe_period: 10,
            response_latency_ticks: 1,
            baudrate: 115_200,
            command_crc: false,
            strobe_crc: false,
            crc_width: CrcWidth::Two,
            little_endian: cfg!(target_endian = "little"),
            timestamp: false,
            external_sync: false,
            external_source: false,
            notifications: false,
        }
    }
}

impl HostConfig {
    /// Check all cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_encoding == Encoding::None {
            return Err(ConfigError::CommandEncodingNone);
        }

        if self.strobe_encoding == Encoding::Rn {
            return Err(ConfigError::StrobeEncodingRn);
        }

        if self.command_encoding == Encoding::Rn {
            if self.command_crc
                || self.strobe_encoding != Encoding::None
                || self.mode != ProcessingMode::Ascii
            {
                return Err(ConfigError::RnConstraint);
            }
        }

        if self.strobe_encoding != Encoding::None && self.strobe_encoding != self.command_encoding {
            return Err(ConfigError::StrobeEncodingMismatch);
        }

        if self.dynamics == StrobeDynamics::Dynamic && self.strobe_encoding == Encoding::None {
            return Err(ConfigError::DynamicsRequireEncoding);
        }

        if self.notifications && self.strobe_encoding == Encoding::None {
            return Err(ConfigError::NotificationsRequireEncoding);
        }

        if self.command_encoding == Encoding::Cobs {
            if self.max_frame_size != 256 {
                return Err(ConfigError::FrameSize);
            }
        } else if self.max_frame_size == 0
            || self.max_frame_size > 65536
            || self.max_frame_size % 256 != 0
        {
            return Err(ConfigError::FrameSize);
        }

        if !(16..=64).contains(&self.command_buffer_size) {
            return Err(ConfigError::CommandBufferSize);
        }

        if !(32..=256).contains(&self.response_buffer_size) {
            return Err(ConfigError::ResponseBufferSize);
        }

        if self.tick_period_ms == 0 || self.tick_period_ms >= 250 {
            return Err(ConfigError::TickPeriod);
        }

        if self.command_timeout_ticks == 0 || self.response_latency_ticks == 0 {
            return Err(ConfigError::Ticks);
        }

        if self.strobe_period_min == 0
            || self.strobe_period < self.strobe_period_min
            || self.strobe_period > self.strobe_period_max
        {
            return Err(ConfigError::StrobePeriod);
        }

        Ok(())
    }

    /// Responses can interleave with strobe frames only when the strobe
    /// stream is delimited.
    pub(crate) fn can_interleave(&self) -> bool {
        self.strobe_encoding != Encoding::None
    }

    /// Build the packed protocol-info word.
    pub fn protocol_info(&self) -> u32 {
        let mut info = ProtocolInfo(0);
        info.set_command_encoding(self.command_encoding as u32);
        info.set_strobe_matches_command(self.strobe_encoding == self.command_encoding);
        info.set_msgpack_mode(self.mode == ProcessingMode::MsgPack);
        info.set_dynamic_strobe(self.dynamics == StrobeDynamics::Dynamic);
        info.set_crc_width_minus_1(self.crc_width.bytes() as u32 - 1);
        info.set_command_crc(self.command_crc);
        info.set_strobe_crc(self.strobe_crc);
        info.set_little_endian(self.little_endian);
        info.set_command_buffer_minus_1(self.command_buffer_size as u32 - 1);
        info.set_response_buffer_minus_1(self.response_buffer_size as u32 - 1);
        info.set_frame_size_units_minus_1((self.max_frame_size as u32 >> 8) - 1);
        info.0
    }

    /// Ticks between advertisement transmissions for the given tick period.
    pub(crate) fn advertise_period_ticks(tick_period_ms: u16) -> u16 {
        250u16.div_ceil(tick_period_ms).max(1)
    }

    /// Worst case command-to-response latency in ticks.
    pub(crate) fn roundtrip_latency_ticks(&self, tick_period_ms: u16) -> u16 {
        let wire_bits = (self.command_buffer_size + self.response_buffer_size) as u32 * 10 * 1000;
        let ticks = wire_bits.div_ceil(self.baudrate * tick_period_ms as u32);
        ticks as u16 + self.response_latency_ticks + 2
    }
}
