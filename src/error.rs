/// POSIX-style error codes carried in tiny replies and returned by the
/// public API. The discriminants are the on-wire integer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(i32)]
pub enum Errno {
    /// I/O error
    Io = 5,
    /// Out of memory
    NoMem = 12,
    /// Permission denied
    Acces = 13,
    /// Bad address
    Fault = 14,
    /// Device or resource busy
    Busy = 16,
    /// Invalid argument
    Inval = 22,
    /// No space left on device
    NoSpc = 28,
    /// No message of desired type
    NoMsg = 35,
    /// No data available
    NoData = 61,
    /// Operation not supported on transport endpoint
    OpNotSupp = 95,
    /// Not supported
    NotSup = 134,
    /// Illegal byte sequence
    IlSeq = 138,
    /// Value too large for defined data type
    Overflow = 139,
    /// Operation canceled
    Canceled = 140,
}

impl Errno {
    /// The integer value sent back to the client.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Configuration rejected at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Commands must use a delimited encoding.
    CommandEncodingNone,
    /// RN is not a valid strobe encoding.
    StrobeEncodingRn,
    /// A non-NONE strobe encoding must match the command encoding.
    StrobeEncodingMismatch,
    /// RN command encoding requires ASCII mode, no command CRC and an
    /// unencoded strobe.
    RnConstraint,
    /// Dynamic strobing requires an encoded strobe.
    DynamicsRequireEncoding,
    /// Notifications require an encoded strobe.
    NotificationsRequireEncoding,
    /// COBS requires a 256 byte frame; other encodings a multiple of 256
    /// up to 65536.
    FrameSize,
    /// Command buffer must hold 16..=64 bytes.
    CommandBufferSize,
    /// Response buffer must hold 32..=256 bytes.
    ResponseBufferSize,
    /// CRC width must be 1, 2 or 4 bytes.
    CrcWidth,
    /// Tick period must be 1..250 ms.
    TickPeriod,
    /// Timeout and latency tick counts must be non-zero.
    Ticks,
    /// Strobe period bounds must satisfy 1 <= min <= default <= max.
    StrobePeriod,
}
