//! The host state machine: a single-threaded, cooperatively scheduled core
//! driven by [`Host::handle_com`] at the tick period and fed received bytes
//! through [`Host::receive_byte`].
//!
//! `receive_byte` is the only entry point that may run concurrently with
//! the tick handler; it writes the receive buffer and the pending-command
//! length and nothing else. Platform glue must serialize access to the
//! host on targets where the byte source is an interrupt.

mod interpreter;
mod pump;
mod sampler;

use alloc::boxed::Box;
use alloc::format;

use crate::{
    cell::{ChangeHook, Region, TypeCode},
    config::{Encoding, HostConfig},
    crc,
    encodings::{cobs::CobsDecoder, escs::EscsDecoder, Decode},
    error::{ConfigError, Errno},
    frame::Frame,
    registry::Registry,
    traits::{Hooks, Link, NoHooks},
};

/// Protocol version reported by `GET_PROTOCOL_INFO`.
pub const PROTOCOL_VERSION: &str = "0.0";
pub(crate) const VERSION_TAG: &str = "v0.0";

/// Leads every strobe payload in encoded modes: an invalid MessagePack
/// prefix, so the client can tell strobes from responses.
pub(crate) const STROBE_MARKER: u8 = 0xC1;

/// A received frame starting with this byte bypasses the interpreter and
/// goes to [`Hooks::controls`]. Same value as the strobe marker, reserved
/// in both directions.
const CONTROLS_MARKER: u8 = 0xC1;

/// Hard upper bound of the receive buffer; the configured size may be
/// smaller.
const COMMAND_BUFFER_MAX: usize = 64;

const SIGNATURE_LEN: usize = 16;

enum CommandDecoder {
    Rn,
    Cobs(CobsDecoder),
    Escs(EscsDecoder),
}

/// Incoming command buffer plus the inline frame decoder state.
struct Receiver {
    buf: heapless::Vec<u8, COMMAND_BUFFER_MAX>,
    decoder: CommandDecoder,
    /// Length of a completed, not yet consumed command; zero when none.
    pending: usize,
    timeout: u16,
}

impl Receiver {
    fn new(encoding: Encoding) -> Self {
        let decoder = match encoding {
            Encoding::Cobs => CommandDecoder::Cobs(CobsDecoder::new()),
            Encoding::Escs => CommandDecoder::Escs(EscsDecoder::new()),
            _ => CommandDecoder::Rn,
        };
        Self {
            buf: heapless::Vec::new(),
            decoder,
            pending: 0,
            timeout: 0,
        }
    }

    /// Drop an incomplete frame after a receive timeout.
    fn drop_partial(&mut self) {
        if self.pending == 0 {
            self.buf.clear();
            match &mut self.decoder {
                CommandDecoder::Cobs(d) => d.reset(),
                CommandDecoder::Escs(d) => d.reset(),
                CommandDecoder::Rn => {}
            }
        }
    }

    /// Release the buffer after the pending command has been handled.
    fn consume(&mut self) {
        self.pending = 0;
        self.buf.clear();
    }
}

/// The lasso host: exposes registered data cells to a remote client over a
/// byte-oriented serial link.
///
/// Lifecycle: construct with [`Host::new`], register cells, then call
/// [`Host::setup`] once. Afterwards drive [`Host::handle_com`] at the
/// configured tick period and feed received bytes to
/// [`Host::receive_byte`].
pub struct Host<L: Link, H: Hooks = NoHooks> {
    cfg: HostConfig,
    link: L,
    hooks: H,
    registry: Registry,
    recv: Receiver,
    strobe: Frame,
    response: Frame,
    strobing: bool,
    advertising: bool,
    overdrive: u32,
    strobe_period: u16,
    tick_period_ms: u16,
    roundtrip_ticks: u16,
    advertise_ticks: u16,
    protocol_info: u32,
    signature: [u8; SIGNATURE_LEN],
    timestamp: u32,
    ready: bool,
    external: Option<Region>,
}

impl<L: Link, H: Hooks> Host<L, H> {
    /// Create a host from a validated configuration. When the timestamp is
    /// enabled, the internal tick counter becomes cell 0.
    pub fn new(cfg: HostConfig, link: L, hooks: H) -> Result<Self, ConfigError> {
        cfg.validate()?;

        let protocol_info = cfg.protocol_info();
        let mut signature = [0u8; SIGNATURE_LEN];
        signature[..10].copy_from_slice(b"lassoHost/");
        signature[10..14].copy_from_slice(&if cfg.little_endian {
            protocol_info.to_le_bytes()
        } else {
            protocol_info.to_be_bytes()
        });
        signature[14] = b'\r';
        signature[15] = b'\n';

        let mut registry = Registry::new(cfg.external_source);
        if cfg.timestamp {
            let unit: &'static str =
                Box::leak(format!("{}ms", cfg.tick_period_ms).into_boxed_str());
            registry.register_timestamp(unit);
        }

        let tick = cfg.tick_period_ms;
        let roundtrip = cfg.roundtrip_latency_ticks(tick);

        Ok(Self {
            recv: Receiver::new(cfg.command_encoding),
            strobe: Frame::new(0, 0, cfg.strobe_period),
            response: Frame::new(0, 0, roundtrip),
            registry,
            strobing: false,
            advertising: true,
            overdrive: 0,
            strobe_period: cfg.strobe_period,
            tick_period_ms: tick,
            roundtrip_ticks: roundtrip,
            advertise_ticks: HostConfig::advertise_period_ticks(tick),
            protocol_info,
            signature,
            timestamp: 0,
            ready: false,
            external: None,
            cfg,
            link,
            hooks,
        })
    }

    /// Register a data cell. The registration index is the client-visible
    /// cell identifier. Rejected once [`Host::setup`] has run.
    ///
    /// `update_rate` is the cell's strobe divider in dynamic mode; pass 1
    /// otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn register_cell(
        &mut self,
        type_code: TypeCode,
        count: u16,
        region: Option<Region>,
        name: &'static str,
        unit: &'static str,
        on_change: Option<ChangeHook>,
        update_rate: u16,
    ) -> Result<u8, Errno> {
        if self.ready {
            return Err(Errno::Acces);
        }
        self.registry
            .register(type_code, count, region, name, unit, on_change, update_rate)
    }

    /// Wire the link and allocate the frame buffers. Call once, after all
    /// cells are registered.
    pub fn setup(&mut self) -> Result<(), Errno> {
        if self.ready {
            return Err(Errno::Acces);
        }
        self.link.setup()?;

        let strobe_payload_max = self.strobe_payload_max() as usize;
        let (strobe_buf, strobe_stage) = match self.cfg.strobe_encoding {
            Encoding::Cobs => (strobe_payload_max + 3, 0),
            Encoding::Escs => (2 * strobe_payload_max + 2, strobe_payload_max),
            _ => (strobe_payload_max, 0),
        };
        // The advertisement signature shares the strobe wire buffer.
        let strobe_buf = strobe_buf.max(SIGNATURE_LEN);

        let crc_bytes = if self.cfg.command_crc {
            self.cfg.crc_width.bytes()
        } else {
            0
        };
        let response_payload_max = self.cfg.response_buffer_size + crc_bytes;
        let (response_buf, response_stage) = match self.cfg.command_encoding {
            Encoding::Cobs => (response_payload_max + 3, 0),
            Encoding::Escs => (2 * response_payload_max + 2, response_payload_max),
            _ => (response_payload_max + 2, 0),
        };

        self.strobe = Frame::new(strobe_buf, strobe_stage, self.cfg.strobe_period);
        self.response = Frame::new(response_buf, response_stage, self.roundtrip_ticks);
        self.ready = true;
        info!("lasso host ready, {} cells registered", self.registry.len());
        Ok(())
    }

    /// Receive one byte from the byte source. O(1); may be called from an
    /// interrupt as long as the platform serializes access to the host.
    pub fn receive_byte(&mut self, byte: u8) -> Result<(), Errno> {
        let limit = self.cfg.command_buffer_size;
        let timeout = self.cfg.command_timeout_ticks;
        let recv = &mut self.recv;

        match &mut recv.decoder {
            CommandDecoder::Rn => {
                if byte == b'\n' {
                    if recv.pending > 0 {
                        return Err(Errno::NoSpc);
                    }
                    if recv.buf.is_empty() {
                        return Err(Errno::NoData);
                    }
                    if recv.buf.last() != Some(&b'\r') {
                        // '\n' is only valid directly behind '\r'.
                        recv.buf.clear();
                        return Err(Errno::IlSeq);
                    }
                    recv.buf.pop();
                    recv.timeout = 0;
                    if recv.buf.is_empty() {
                        return Err(Errno::NoData);
                    }
                    recv.pending = recv.buf.len();
                    Ok(())
                } else {
                    if recv.pending > 0 {
                        // Only one command at a time.
                        return Err(Errno::NoSpc);
                    }
                    if recv.buf.len() >= limit || recv.buf.push(byte).is_err() {
                        recv.buf.clear();
                        return Err(Errno::Overflow);
                    }
                    recv.timeout = timeout;
                    Ok(())
                }
            }

            CommandDecoder::Cobs(decoder) => {
                if recv.pending > 0 {
                    return Err(Errno::NoSpc);
                }
                match decoder.feed(byte, &mut recv.buf, limit) {
                    Decode::Pending => {
                        recv.timeout = timeout;
                        Ok(())
                    }
                    Decode::Done(len) => {
                        recv.pending = len;
                        recv.timeout = 0;
                        Ok(())
                    }
                    Decode::Overrun => {
                        recv.timeout = 0;
                        Err(Errno::Overflow)
                    }
                }
            }

            CommandDecoder::Escs(decoder) => {
                if recv.pending > 0 {
                    return Err(Errno::NoSpc);
                }
                match decoder.feed(byte, &mut recv.buf, limit) {
                    Decode::Pending => {
                        recv.timeout = timeout;
                        Ok(())
                    }
                    Decode::Done(len) => {
                        recv.pending = len;
                        recv.timeout = 0;
                        Ok(())
                    }
                    Decode::Overrun => {
                        recv.timeout = 0;
                        Err(Errno::Overflow)
                    }
                }
            }
        }
    }

    /// The tick handler. Drives sampling, command interpretation, the
    /// advertiser and the transmit pump. Call at the configured tick
    /// period; must not be re-entered.
    pub fn handle_com(&mut self) {
        if !self.ready {
            return;
        }

        if self.recv.timeout > 0 {
            self.recv.timeout -= 1;
            if self.recv.timeout == 0 {
                debug!("receive timeout, partial command dropped");
                self.recv.drop_partial();
            }
        }

        if self.advertising {
            self.strobe.countdown = self.strobe.countdown.saturating_sub(1);
            if self.strobe.countdown == 0 {
                self.strobe.countdown = self.advertise_ticks;
                let signature = self.signature;
                self.strobe.load_raw(&signature);
            }
        } else if self.strobing {
            if !self.cfg.external_sync {
                self.strobe.countdown = self.strobe.countdown.saturating_sub(1);
            }
            if self.strobe.countdown == 0 {
                self.strobe.countdown = self.strobe_period;
                if !self.strobe.idle() {
                    // Previous strobe not drained: drop this sample.
                    self.overdrive += 1;
                    warn!("strobe overrun, sample skipped");
                } else {
                    self.sample_strobe();
                }
            }
        }

        self.response.countdown = self.response.countdown.saturating_sub(1);
        if self.response.countdown == 0 {
            self.response.countdown = self.cfg.response_latency_ticks;
            if self.response.idle() && self.recv.pending > 0 {
                self.consume_command();
            }
        }

        self.pump();

        if self.cfg.timestamp {
            self.timestamp = self.timestamp.wrapping_add(1);
        }
    }

    /// Subtract externally counted cycles from the strobe countdown.
    pub fn countdown(&mut self, count: u16) {
        if count > self.strobe.countdown {
            self.strobe.countdown = 0;
        } else {
            self.strobe.countdown -= count;
        }
    }

    /// Adjust the tick period at run time and rederive the dependent
    /// timings.
    pub fn set_tick_period(&mut self, period_ms: u16) {
        let period_ms = period_ms.max(1);
        self.tick_period_ms = period_ms;
        self.advertise_ticks = HostConfig::advertise_period_ticks(period_ms);
        self.roundtrip_ticks = self.cfg.roundtrip_latency_ticks(period_ms);
    }

    /// Provide the strobe payload when an external strobe source is
    /// configured.
    pub fn set_strobe_source(&mut self, region: Region) -> Result<(), Errno> {
        if !self.cfg.external_source {
            return Err(Errno::NotSup);
        }
        self.external = Some(region);
        Ok(())
    }

    /// Queue an out-of-band notification frame. Only available with
    /// notifications configured; fails with `EBUSY` while the response
    /// channel is occupied.
    pub fn notify(&mut self, message: &[u8]) -> Result<(), Errno> {
        if !self.cfg.notifications {
            return Err(Errno::NotSup);
        }
        if !self.ready {
            return Err(Errno::Inval);
        }
        if message.is_empty() || message.len() > self.cfg.response_buffer_size {
            return Err(Errno::Inval);
        }
        if !self.response.idle() || self.recv.pending > 0 {
            return Err(Errno::Busy);
        }

        match self.cfg.command_encoding {
            Encoding::Cobs => {
                self.response.buf[2..2 + message.len()].copy_from_slice(message);
            }
            Encoding::Escs => {
                self.response.stage[..message.len()].copy_from_slice(message);
            }
            _ => return Err(Errno::NotSup),
        }
        self.response.load(message.len());
        if self.cfg.command_encoding == Encoding::Cobs {
            self.response.cobs_backup = self.response.buf[2];
        }
        Ok(())
    }

    /// Whether periodic strobing is active.
    pub fn is_strobing(&self) -> bool {
        self.strobing
    }

    /// Whether the host is still advertising for a client.
    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    /// Number of strobe periods skipped because the previous strobe had
    /// not drained.
    pub fn overdrive_count(&self) -> u32 {
        self.overdrive
    }

    /// Current strobe period in ticks.
    pub fn strobe_period(&self) -> u16 {
        self.strobe_period
    }

    /// Number of registered data cells.
    pub fn cell_count(&self) -> usize {
        self.registry.len()
    }

    /// Internal tick counter.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Wire payload bytes of a strobe over the currently enabled cells,
    /// including marker, dynamic-mask and CRC overheads.
    pub fn strobe_payload_bytes(&self) -> u32 {
        self.payload_overhead() + self.registry.data_bytes_total()
    }

    fn strobe_payload_max(&self) -> u32 {
        self.payload_overhead() + self.registry.data_bytes_max()
    }

    fn payload_overhead(&self) -> u32 {
        let marker = (self.cfg.strobe_encoding != Encoding::None) as u32;
        let mask = if self.cfg.dynamics == crate::config::StrobeDynamics::Dynamic {
            self.registry.mask_bytes()
        } else {
            0
        };
        let crc_bytes = if self.cfg.strobe_crc {
            self.cfg.crc_width.bytes() as u32
        } else {
            0
        };
        marker + mask + crc_bytes
    }

    /// Fraction of the serial budget left over by the current strobe rate,
    /// in units of 1/10000. ESCS conservatively assumes 100% overhead.
    fn cycle_margin(&self) -> i32 {
        let period_ms = self.strobe_period as f32 * self.tick_period_ms as f32;
        let factor = if self.cfg.strobe_encoding == Encoding::Escs {
            20_000.0
        } else {
            10_000.0
        };
        let bits_per_s = self.strobe_payload_bytes() as f32 * factor / period_ms;
        ((self.cfg.baudrate as f32 - bits_per_s) * 10_000.0 / self.cfg.baudrate as f32) as i32
    }

    /// Verify, dispatch and answer the pending command.
    fn consume_command(&mut self) {
        let len = self.recv.pending;
        let mut body_len = len;

        if self.cfg.command_crc {
            let width = self.cfg.crc_width.bytes();
            let frame = &self.recv.buf[..len];
            if len <= width || self.hooks.crc(frame) != 0 {
                warn!("command CRC mismatch, frame dropped");
                self.recv.consume();
                return;
            }
            body_len = len - width;
        }

        if self.recv.buf[0] == CONTROLS_MARKER {
            let Self { hooks, recv, .. } = self;
            hooks.controls(&recv.buf[1..body_len]);
            recv.consume();
            return;
        }

        let composed = self.interpret(body_len);
        self.recv.consume();

        if let Some(payload_len) = composed {
            self.load_response(payload_len);
        }
    }

    /// Finalize the composed response payload (line terminator or CRC) and
    /// arm the response frame.
    fn load_response(&mut self, payload_len: usize) {
        let Self {
            cfg,
            response,
            hooks,
            ..
        } = self;

        let total = match cfg.command_encoding {
            Encoding::Cobs => {
                let mut len = payload_len;
                if cfg.command_crc {
                    let value = hooks.crc(&response.buf[2..2 + len]);
                    crc::append(&mut response.buf[2..], len, value, cfg.crc_width);
                    len += cfg.crc_width.bytes();
                }
                len
            }
            Encoding::Escs => {
                let mut len = payload_len;
                if cfg.command_crc {
                    let value = hooks.crc(&response.stage[..len]);
                    crc::append(&mut response.stage, len, value, cfg.crc_width);
                    len += cfg.crc_width.bytes();
                }
                len
            }
            _ => {
                response.buf[payload_len] = b'\r';
                response.buf[payload_len + 1] = b'\n';
                payload_len + 2
            }
        };

        response.load(total);
        if cfg.command_encoding == Encoding::Cobs {
            response.cobs_backup = response.buf[2];
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    use crate::{
        cell::{Region, TypeCode, Value},
        config::{Encoding, HostConfig, ProcessingMode, StrobeDynamics},
        crc::CrcWidth,
        encodings::{cobs, escs, Decode},
        msgpack::{PackReader, PackWriter},
        traits::{NoHooks, SendError},
    };

    use super::*;

    #[derive(Default)]
    struct LinkState {
        sent: Vec<Vec<u8>>,
        busy: bool,
        reject: bool,
    }

    #[derive(Clone)]
    struct TestLink(Rc<RefCell<LinkState>>);

    impl TestLink {
        fn new() -> Self {
            Self(Rc::new(RefCell::new(LinkState::default())))
        }

        fn bytes(&self) -> Vec<u8> {
            self.0.borrow().sent.iter().flatten().copied().collect()
        }

        fn chunks(&self) -> Vec<Vec<u8>> {
            self.0.borrow().sent.clone()
        }

        fn chunk_count(&self) -> usize {
            self.0.borrow().sent.len()
        }

        fn clear(&self) {
            self.0.borrow_mut().sent.clear();
        }

        fn set_busy(&self, busy: bool) {
            self.0.borrow_mut().busy = busy;
        }

        fn set_reject(&self, reject: bool) {
            self.0.borrow_mut().reject = reject;
        }
    }

    impl Link for TestLink {
        fn send(&mut self, frame: &[u8]) -> Result<(), SendError> {
            let mut state = self.0.borrow_mut();
            if state.reject {
                return Err(SendError::Rejected);
            }
            if state.busy {
                return Err(SendError::Busy);
            }
            state.sent.push(frame.to_vec());
            Ok(())
        }
    }

    /// Scenario configuration: ASCII + RN, 10 ms ticks, 115200 baud,
    /// 32/96 byte buffers.
    fn rn_config() -> HostConfig {
        HostConfig {
            command_buffer_size: 32,
            max_frame_size: 256,
            little_endian: true,
            ..HostConfig::default()
        }
    }

    /// The protocol-info word for `rn_config`.
    const RN_INFO: u32 = 6_258_209;

    fn cobs_config() -> HostConfig {
        HostConfig {
            command_encoding: Encoding::Cobs,
            strobe_encoding: Encoding::Cobs,
            ..rn_config()
        }
    }

    fn leak<T>(value: T) -> *mut T {
        Box::into_raw(Box::new(value))
    }

    fn host_with_cell(
        config: HostConfig,
        type_code: TypeCode,
    ) -> (Host<TestLink>, TestLink, *mut u16) {
        let link = TestLink::new();
        let mut host = Host::new(config, link.clone(), NoHooks).unwrap();
        let ptr = leak(0xABCDu16);
        host.register_cell(
            type_code,
            1,
            Some(unsafe { Region::of(ptr) }),
            "x",
            "",
            None,
            1,
        )
        .unwrap();
        host.setup().unwrap();
        (host, link, ptr)
    }

    fn send(host: &mut Host<TestLink>, line: &str) {
        for b in line.bytes() {
            let _ = host.receive_byte(b);
        }
    }

    fn send_cobs<H: Hooks>(host: &mut Host<TestLink, H>, payload: &[u8]) {
        let mut frame = vec![0u8; payload.len() + 3];
        frame[2..2 + payload.len()].copy_from_slice(payload);
        cobs::encode(&mut frame, payload.len(), false);
        for &b in &frame {
            let _ = host.receive_byte(b);
        }
    }

    fn cobs_payload(chunk: &[u8]) -> Vec<u8> {
        let mut decoder = cobs::CobsDecoder::new();
        let mut dest = heapless::Vec::<u8, 64>::new();
        for &b in chunk {
            if let Decode::Done(n) = decoder.feed(b, &mut dest, 64) {
                return dest[..n].to_vec();
            }
        }
        panic!("incomplete COBS chunk");
    }

    fn escs_payload(chunk: &[u8]) -> Vec<u8> {
        let mut decoder = escs::EscsDecoder::new();
        let mut dest = heapless::Vec::<u8, 64>::new();
        for &b in chunk {
            if let Decode::Done(n) = decoder.feed(b, &mut dest, 64) {
                return dest[..n].to_vec();
            }
        }
        panic!("incomplete ESCS chunk");
    }

    fn run<H: Hooks>(host: &mut Host<TestLink, H>, ticks: usize) {
        for _ in 0..ticks {
            host.handle_com();
        }
    }

    #[test]
    fn s1_discovery() {
        // Given
        let (mut host, link, _) = host_with_cell(rn_config(), TypeCode::UINT16);

        // When
        send(&mut host, "i\r\n");
        run(&mut host, 8);

        // Then
        assert_eq!(format!("i{},v0.0,0\r\n", RN_INFO).into_bytes(), link.bytes());
        assert_eq!(RN_INFO, rn_config().protocol_info());
    }

    #[test]
    fn s2_count() {
        // Given
        let (mut host, link, _) = host_with_cell(rn_config(), TypeCode::UINT16);

        // When
        send(&mut host, "n\r\n");
        run(&mut host, 8);

        // Then
        assert_eq!(b"n1,0\r\n".to_vec(), link.bytes());
    }

    #[test]
    fn s3_params() {
        // Given
        let (mut host, link, _) = host_with_cell(rn_config(), TypeCode::UINT16);

        // When
        send(&mut host, "p0\r\n");
        run(&mut host, 8);

        // Then: index and name, type 34 (uint16), count, unit, update
        // rate, byte offset, err.
        assert_eq!(b"p0x,34,1,,1,0,0\r\n".to_vec(), link.bytes());
    }

    #[test]
    fn s4_value_read() {
        // Given
        let (mut host, link, _) = host_with_cell(rn_config(), TypeCode::UINT16);

        // When
        send(&mut host, "v0\r\n");
        run(&mut host, 8);

        // Then
        assert_eq!(b"v43981,0\r\n".to_vec(), link.bytes());
    }

    #[test]
    fn s5_value_write() {
        // Given
        let (mut host, link, ptr) = host_with_cell(rn_config(), TypeCode::UINT16.writable());

        // When
        send(&mut host, "V0,1234\r\n");
        run(&mut host, 8);

        // Then
        assert_eq!(b"V0\r\n".to_vec(), link.bytes());
        assert_eq!(1234, unsafe { *ptr });

        // When
        link.clear();
        send(&mut host, "v0\r\n");
        run(&mut host, 4);

        // Then
        assert_eq!(b"v1234,0\r\n".to_vec(), link.bytes());
    }

    #[test]
    fn s6_strobing() {
        // Given
        let (mut host, link, _) = host_with_cell(rn_config(), TypeCode::UINT16);

        // When: enable the cell, then strobing.
        send(&mut host, "S0,1\r\n");
        run(&mut host, 8);
        assert_eq!(b"S0\r\n".to_vec(), link.bytes());

        link.clear();
        send(&mut host, "W,1\r\n");
        run(&mut host, 4);

        // Then: W is silent over RN and the strobe carries the raw cell
        // bytes in host endianness.
        assert!(host.is_strobing());
        assert_eq!(vec![vec![0xCD, 0xAB]], link.chunks());

        // When
        send(&mut host, "P,20\r\n");
        run(&mut host, 4);
        assert_eq!(20, host.strobe_period());

        let mut fire_ticks = Vec::new();
        let mut seen = link.chunk_count();
        for tick in 0..100 {
            host.handle_com();
            if link.chunk_count() > seen {
                seen = link.chunk_count();
                fire_ticks.push(tick);
            }
        }

        // Then: successive strobes are 20 ticks = 200 ms apart.
        assert!(fire_ticks.len() >= 3);
        let last = fire_ticks[fire_ticks.len() - 1];
        let prev = fire_ticks[fire_ticks.len() - 2];
        assert_eq!(20, last - prev);
    }

    #[test]
    fn s7_unknown_opcode() {
        // Given
        let (mut host, link, _) = host_with_cell(rn_config(), TypeCode::UINT16);

        // When
        send(&mut host, "Z\r\n");
        run(&mut host, 8);

        // Then: EOPNOTSUPP
        assert_eq!(b"Z95\r\n".to_vec(), link.bytes());
    }

    #[test]
    fn get_suppressed_while_strobing_over_rn() {
        // Given
        let (mut host, link, _) = host_with_cell(rn_config(), TypeCode::UINT16.strobed());
        send(&mut host, "W,1\r\n");
        run(&mut host, 8);
        link.clear();

        // When
        send(&mut host, "v0\r\n");
        run(&mut host, 12);

        // Then: strobes keep flowing and no response goes out.
        assert!(link.chunk_count() >= 1);
        for chunk in link.chunks() {
            assert_eq!(vec![0xCD, 0xAB], chunk);
        }
    }

    #[test]
    fn advertisement_cadence() {
        // Given
        let (mut host, link, _) = host_with_cell(rn_config(), TypeCode::UINT16);
        assert!(host.is_advertising());

        // When
        let mut fire_ticks = Vec::new();
        let mut seen = 0;
        for tick in 0..100 {
            host.handle_com();
            if link.chunk_count() > seen {
                seen = link.chunk_count();
                fire_ticks.push(tick);
            }
        }

        // Then: ceil(250 / 10) = 25 ticks between signatures.
        assert!(fire_ticks.len() >= 3);
        assert_eq!(25, fire_ticks[1] - fire_ticks[0]);
        assert_eq!(25, fire_ticks[2] - fire_ticks[1]);

        // And: the signature is bit-exact.
        let mut expected = Vec::new();
        expected.extend_from_slice(b"lassoHost/");
        expected.extend_from_slice(&RN_INFO.to_le_bytes());
        expected.extend_from_slice(b"\r\n");
        assert_eq!(expected, link.chunks()[0]);
    }

    #[test]
    fn receive_timeout_drops_partial_command() {
        // Given
        let (mut host, link, _) = host_with_cell(rn_config(), TypeCode::UINT16);

        // When: an unterminated command, left alone past the timeout.
        send(&mut host, "v0");
        run(&mut host, 6);

        // And a well-formed command afterwards.
        send(&mut host, "n\r\n");
        run(&mut host, 8);

        // Then: only the second command was interpreted.
        assert_eq!(b"n1,0\r\n".to_vec(), link.bytes());
    }

    #[test]
    fn write_to_readonly_cell_is_denied() {
        // Given
        let (mut host, link, ptr) = host_with_cell(rn_config(), TypeCode::UINT16);

        // When
        send(&mut host, "V0,1\r\n");
        run(&mut host, 8);

        // Then: EACCES and untouched memory.
        assert_eq!(b"V13\r\n".to_vec(), link.bytes());
        assert_eq!(0xABCD, unsafe { *ptr });
    }

    #[test]
    fn index_out_of_range_is_a_fault() {
        // Given
        let (mut host, link, _) = host_with_cell(rn_config(), TypeCode::UINT16);

        // When
        send(&mut host, "p7\r\n");
        run(&mut host, 8);

        // Then: EFAULT tiny reply.
        assert_eq!(b"p14\r\n".to_vec(), link.bytes());
    }

    #[test]
    fn overrun_skips_sample_and_recovers() {
        // Given: strobing over a link that refuses to drain.
        let (mut host, link, _) = host_with_cell(rn_config(), TypeCode::UINT16.strobed());
        send(&mut host, "W,1\r\n");
        run(&mut host, 8);
        assert!(host.is_strobing());

        link.set_busy(true);
        link.clear();

        // When: more than one strobe period passes.
        run(&mut host, 25);

        // Then: the skipped samples are counted.
        assert!(host.overdrive_count() >= 1);
        assert_eq!(0, link.chunk_count());

        // When: the link frees up.
        link.set_busy(false);
        run(&mut host, 15);

        // Then: the queued strobe drains and sampling resumes.
        assert!(link.chunk_count() >= 2);
        for chunk in link.chunks() {
            assert_eq!(vec![0xCD, 0xAB], chunk);
        }
    }

    #[test]
    fn strobe_drains_before_response() {
        // Given: COBS on both streams, so strobes and responses
        // interleave.
        let (mut host, link, _) = host_with_cell(cobs_config(), TypeCode::UINT16.strobed());
        send_cobs(&mut host, b"W1");
        run(&mut host, 8);
        assert!(host.is_strobing());
        link.clear();

        // When: a strobe is held back by a busy link while a command
        // arrives.
        link.set_busy(true);
        run(&mut host, 10);
        send_cobs(&mut host, b"v0");
        run(&mut host, 3);
        link.set_busy(false);
        run(&mut host, 3);

        // Then: the strobe chunk goes out before the response chunk.
        let chunks = link.chunks();
        assert!(chunks.len() >= 2);
        let strobe = cobs_payload(&chunks[0]);
        assert_eq!(vec![0xC1, 0xCD, 0xAB], strobe);
        let response = cobs_payload(&chunks[1]);
        assert_eq!(b"v43981,0".to_vec(), response);
    }

    #[test]
    fn busy_link_retries_the_same_chunk() {
        // Given
        let (mut host, link, _) = host_with_cell(cobs_config(), TypeCode::UINT16.strobed());
        send_cobs(&mut host, b"W1");
        run(&mut host, 8);
        link.clear();
        link.set_busy(true);

        // When: a strobe fires and stays queued for a few ticks.
        run(&mut host, 12);
        link.set_busy(false);
        run(&mut host, 2);

        // Then: exactly one copy of the chunk went out.
        let strobes: Vec<_> = link
            .chunks()
            .iter()
            .map(|c| cobs_payload(c))
            .filter(|p| p.first() == Some(&0xC1))
            .collect();
        assert_eq!(1, strobes.len());
    }

    #[test]
    fn fatal_link_error_abandons_message() {
        // Given
        let (mut host, link, _) = host_with_cell(rn_config(), TypeCode::UINT16);
        link.set_reject(true);

        // When: a response is composed but the link rejects it.
        send(&mut host, "n\r\n");
        run(&mut host, 8);

        // Then: nothing retried once the link recovers.
        link.set_reject(false);
        run(&mut host, 4);
        assert_eq!(0, link.chunk_count());
    }

    #[test]
    fn strobe_length_tracks_enabled_cells() {
        // Given: COBS strobes with a CRC appended.
        let config = HostConfig {
            strobe_crc: true,
            crc_width: CrcWidth::Two,
            ..cobs_config()
        };
        let link = TestLink::new();
        let mut host = Host::new(config, link.clone(), NoHooks).unwrap();
        let a = leak(0u16);
        let b = leak(0f32);
        host.register_cell(
            TypeCode::UINT16.strobed(),
            1,
            Some(unsafe { Region::of(a) }),
            "a",
            "",
            None,
            1,
        )
        .unwrap();
        host.register_cell(
            TypeCode::FLOAT,
            1,
            Some(unsafe { Region::of(b) }),
            "b",
            "",
            None,
            1,
        )
        .unwrap();
        host.setup().unwrap();

        // Then: marker + enabled data + CRC.
        assert_eq!(1 + 2 + 2, host.strobe_payload_bytes());

        // When: the client enables the second cell.
        send_cobs(&mut host, b"S1,1");
        run(&mut host, 8);

        // Then
        assert_eq!(1 + 6 + 2, host.strobe_payload_bytes());
    }

    #[test]
    fn msgpack_discovery_roundtrip() {
        // Given
        let config = HostConfig {
            mode: ProcessingMode::MsgPack,
            ..cobs_config()
        };
        let (mut host, link, _) = host_with_cell(config.clone(), TypeCode::UINT16);

        // When: [opcode 'i', []]
        let mut command = [0u8; 8];
        let len = {
            let mut w = PackWriter::new(&mut command);
            w.open_array(2).unwrap();
            w.put_uint(b'i' as u64).unwrap();
            w.open_array(0).unwrap();
            w.offset()
        };
        send_cobs(&mut host, &command[..len]);
        run(&mut host, 8);

        // Then: [opcode, [info, "v0.0"], 0]
        let payload = cobs_payload(&link.chunks()[0]);
        let mut r = PackReader::new(&payload);
        assert_eq!(3, r.open_array().unwrap());
        assert_eq!(b'i' as u32, r.get_u32().unwrap());
        assert_eq!(2, r.open_array().unwrap());
        assert_eq!(config.protocol_info(), r.get_u32().unwrap());
        assert_eq!("v0.0", r.get_str().unwrap());
        assert_eq!(0, r.get_i64().unwrap());
    }

    #[test]
    fn msgpack_write_and_read_back() {
        // Given
        let config = HostConfig {
            mode: ProcessingMode::MsgPack,
            ..cobs_config()
        };
        let (mut host, link, ptr) = host_with_cell(config, TypeCode::UINT16.writable());

        // When: [opcode 'V', [0, 1234]]
        let mut command = [0u8; 16];
        let len = {
            let mut w = PackWriter::new(&mut command);
            w.open_array(2).unwrap();
            w.put_uint(b'V' as u64).unwrap();
            w.open_array(2).unwrap();
            w.put_uint(0).unwrap();
            w.put_uint(1234).unwrap();
            w.offset()
        };
        send_cobs(&mut host, &command[..len]);
        run(&mut host, 8);

        // Then: tiny acknowledgement and updated memory.
        let payload = cobs_payload(&link.chunks()[0]);
        let mut r = PackReader::new(&payload);
        assert_eq!(3, r.open_array().unwrap());
        assert_eq!(b'V' as u32, r.get_u32().unwrap());
        assert_eq!(0, r.open_array().unwrap());
        assert_eq!(0, r.get_i64().unwrap());
        assert_eq!(1234, unsafe { *ptr });
    }

    #[test]
    fn escs_end_to_end() {
        // Given
        let config = HostConfig {
            command_encoding: Encoding::Escs,
            strobe_encoding: Encoding::Escs,
            ..rn_config()
        };
        let (mut host, link, _) = host_with_cell(config, TypeCode::UINT16.strobed());

        // When
        let mut wire = [0u8; 16];
        let len = escs::encode(b"W1", &mut wire);
        for &b in &wire[..len] {
            let _ = host.receive_byte(b);
        }
        run(&mut host, 8);

        // Then: the acknowledgement frame first, then the marker-led
        // strobe.
        assert!(host.is_strobing());
        let chunks = link.chunks();
        assert!(chunks.len() >= 2);
        assert_eq!(b"W0".to_vec(), escs_payload(&chunks[0]));
        assert_eq!(vec![0xC1, 0xCD, 0xAB], escs_payload(&chunks[1]));
    }

    #[test]
    fn dynamic_strobe_prefixes_a_sample_mask() {
        // Given: two cells with different update dividers.
        let config = HostConfig {
            dynamics: StrobeDynamics::Dynamic,
            ..cobs_config()
        };
        let link = TestLink::new();
        let mut host = Host::new(config, link.clone(), NoHooks).unwrap();
        let a = leak(0xABCDu16);
        let b = leak(0x5Au8);
        host.register_cell(
            TypeCode::UINT16.strobed(),
            1,
            Some(unsafe { Region::of(a) }),
            "a",
            "",
            None,
            1,
        )
        .unwrap();
        host.register_cell(
            TypeCode::UINT8.strobed(),
            1,
            Some(unsafe { Region::of(b) }),
            "b",
            "",
            None,
            2,
        )
        .unwrap();
        host.setup().unwrap();

        // When
        send_cobs(&mut host, b"W1");
        run(&mut host, 25);

        // Then: the first cycle samples only the divider-1 cell, the
        // second both, with the mask marking who fired.
        let strobes: Vec<_> = link
            .chunks()
            .iter()
            .map(|c| cobs_payload(c))
            .filter(|p| p.first() == Some(&0xC1))
            .collect();
        assert!(strobes.len() >= 2);
        assert_eq!(vec![0xC1, 0x01, 0xCD, 0xAB], strobes[0]);
        assert_eq!(vec![0xC1, 0x03, 0xCD, 0xAB, 0x5A], strobes[1]);
    }

    #[test]
    fn timestamp_cell_is_registered_first() {
        // Given
        let config = HostConfig {
            timestamp: true,
            ..rn_config()
        };
        let (mut host, link, _) = host_with_cell(config, TypeCode::UINT16);

        // Then
        assert_eq!(2, host.cell_count());

        // When
        send(&mut host, "p0\r\n");
        run(&mut host, 8);

        // Then: uint32, strobe-enabled (type 37), unit derived from the
        // tick period.
        assert_eq!(b"p0Timestamp,37,1,10ms,1,0,0\r\n".to_vec(), link.bytes());
    }

    #[test]
    fn change_hook_can_reject_a_write() {
        // Given
        fn refuse(value: &Value) -> bool {
            !matches!(value, Value::U16(13))
        }

        let link = TestLink::new();
        let mut host = Host::new(rn_config(), link.clone(), NoHooks).unwrap();
        let ptr = leak(7u16);
        host.register_cell(
            TypeCode::UINT16.writable(),
            1,
            Some(unsafe { Region::of(ptr) }),
            "x",
            "",
            Some(refuse),
            1,
        )
        .unwrap();
        host.setup().unwrap();

        // When: a rejected value still gets a normal acknowledgement.
        send(&mut host, "V0,13\r\n");
        run(&mut host, 8);

        // Then
        assert_eq!(b"V0\r\n".to_vec(), link.bytes());
        assert_eq!(7, unsafe { *ptr });

        // When
        link.clear();
        send(&mut host, "V0,14\r\n");
        run(&mut host, 4);

        // Then
        assert_eq!(b"V0\r\n".to_vec(), link.bytes());
        assert_eq!(14, unsafe { *ptr });
    }

    #[test]
    fn controls_frame_bypasses_the_interpreter() {
        // Given
        struct Capture(Rc<RefCell<Vec<u8>>>);
        impl Hooks for Capture {
            fn controls(&mut self, controls: &[u8]) {
                self.0.borrow_mut().extend_from_slice(controls);
            }
        }

        let captured = Rc::new(RefCell::new(Vec::new()));
        let link = TestLink::new();
        let mut host =
            Host::new(cobs_config(), link.clone(), Capture(captured.clone())).unwrap();
        let ptr = leak(0u16);
        host.register_cell(
            TypeCode::UINT16,
            1,
            Some(unsafe { Region::of(ptr) }),
            "x",
            "",
            None,
            1,
        )
        .unwrap();
        host.setup().unwrap();

        // When: a 0xC1-prefixed frame arrives.
        send_cobs(&mut host, &[0xC1, 0x10, 0x20]);
        run(&mut host, 8);

        // Then: the raw bytes reach the hook and no response goes out.
        assert_eq!(vec![0x10, 0x20], *captured.borrow());
        assert_eq!(0, link.chunk_count());
    }

    #[test]
    fn registration_is_sealed_after_setup() {
        // Given
        let (mut host, _, _) = host_with_cell(rn_config(), TypeCode::UINT16);

        // Then
        let ptr = leak(0u16);
        assert_eq!(
            Err(Errno::Acces),
            host.register_cell(
                TypeCode::UINT16,
                1,
                Some(unsafe { Region::of(ptr) }),
                "late",
                "",
                None,
                1,
            )
        );
    }
}
