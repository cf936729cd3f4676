//! Command parsing, dispatch and response composition.
//!
//! A command is an opcode plus arguments; GET opcodes are lowercase ASCII,
//! SET opcodes uppercase. The response carries the opcode, an optional
//! payload and a trailing integer error code. Negative outcomes and plain
//! acknowledgements use the tiny reply: opcode and error code only.

use core::fmt::Write as _;

use crate::{
    cell::{CellKind, CellSource, ChangeHook, DataCell, Value},
    config::{Encoding, HostConfig, ProcessingMode},
    error::Errno,
    frame::Frame,
    msgpack::{PackReader, PackWriter},
    registry::Registry,
    traits::{Hooks, Link},
};

use super::{Host, PROTOCOL_VERSION, VERSION_TAG};

pub(super) const OP_GET_PROTOCOL_INFO: u8 = b'i';
pub(super) const OP_GET_TIMING_INFO: u8 = b't';
pub(super) const OP_GET_CELL_COUNT: u8 = b'n';
pub(super) const OP_GET_CELL_PARAMS: u8 = b'p';
pub(super) const OP_GET_CELL_VALUE: u8 = b'v';
pub(super) const OP_SET_ADVERTISE: u8 = b'A';
pub(super) const OP_SET_STROBE_PERIOD: u8 = b'P';
pub(super) const OP_SET_CELL_STROBE: u8 = b'S';
pub(super) const OP_SET_CELL_VALUE: u8 = b'V';
pub(super) const OP_SET_DATASPACE_STROBE: u8 = b'W';

const KNOWN_OPCODES: [u8; 10] = [
    OP_GET_PROTOCOL_INFO,
    OP_GET_TIMING_INFO,
    OP_GET_CELL_COUNT,
    OP_GET_CELL_PARAMS,
    OP_GET_CELL_VALUE,
    OP_SET_ADVERTISE,
    OP_SET_STROBE_PERIOD,
    OP_SET_CELL_STROBE,
    OP_SET_CELL_VALUE,
    OP_SET_DATASPACE_STROBE,
];

enum Outcome {
    Done,
    Silent,
}

impl<L: Link, H: Hooks> Host<L, H> {
    /// Parse and execute the received command of `len` bytes, composing the
    /// response payload in place. Returns the payload length, or `None`
    /// when the command produces no response.
    pub(crate) fn interpret(&mut self, len: usize) -> Option<usize> {
        match self.cfg.mode {
            ProcessingMode::Ascii => self.interpret_ascii(len),
            ProcessingMode::MsgPack => self.interpret_msgpack(len),
        }
    }

    fn interpret_ascii(&mut self, len: usize) -> Option<usize> {
        let margin = self.cycle_margin();
        let info = self.protocol_info;
        let roundtrip = self.roundtrip_ticks;
        let tick_ms = self.tick_period_ms;
        let timestamp = self.timestamp;

        let Self {
            cfg,
            registry,
            recv,
            response,
            strobe,
            hooks,
            strobing,
            advertising,
            strobe_period,
            ..
        } = self;

        let command = &recv.buf[..len];
        let opcode = command[0];

        // Without a delimited strobe stream, GET responses cannot
        // interleave with strobes; the client must stop strobing first.
        if opcode >= b'a' && *strobing && !cfg.can_interleave() {
            return None;
        }

        if *advertising && KNOWN_OPCODES.contains(&opcode) {
            debug!("client attached, advertising stops");
            *advertising = false;
            strobe.abandon();
        }

        let out = payload_area(cfg, response);
        let mut w = AsciiWriter::new(out);
        let _ = w.write_char(opcode as char);
        let payload_start = w.pos();

        let mut args = Scanner::new(&command[1..]);
        let mut tiny = true;
        let mut silent = false;
        let mut err = 0i32;

        match opcode {
            OP_GET_PROTOCOL_INFO => {
                let _ = write!(w, "{},v{},", info, PROTOCOL_VERSION);
                tiny = false;
            }

            OP_GET_TIMING_INFO => {
                let _ = write!(
                    w,
                    "{},{},{},{},{},{},{},",
                    tick_ms,
                    cfg.command_timeout_ticks,
                    roundtrip,
                    cfg.strobe_period_min,
                    cfg.strobe_period_max,
                    *strobe_period,
                    margin,
                );
                tiny = false;
            }

            OP_GET_CELL_COUNT => {
                let _ = write!(w, "{},", registry.len());
                tiny = false;
            }

            OP_GET_CELL_PARAMS => match args.unsigned() {
                Ok(idx) => match registry.seek(idx as usize) {
                    Some((cell, offset)) => {
                        let _ = write!(w, "{}", idx);
                        let _ = w.write_str(cell.name);
                        let _ = write!(w, ",{},{},", cell.type_code.raw(), cell.count);
                        let _ = w.write_str(cell.unit);
                        let _ = write!(w, ",{},{},", cell.rate_divider, offset);
                        tiny = false;
                    }
                    None => err = Errno::Fault.code(),
                },
                Err(e) => err = e.code(),
            },

            OP_GET_CELL_VALUE => match args.unsigned() {
                Ok(idx) => match registry.seek(idx as usize) {
                    Some((cell, _)) => match write_value_ascii(&mut w, cell, timestamp) {
                        Ok(()) => tiny = false,
                        Err(e) => err = e.code(),
                    },
                    None => err = Errno::Fault.code(),
                },
                Err(e) => err = e.code(),
            },

            OP_SET_ADVERTISE => {
                *advertising = true;
                if *strobing {
                    *strobing = false;
                    hooks.activate(false);
                }
                silent = true;
            }

            OP_SET_STROBE_PERIOD => match args.unsigned() {
                Ok(period)
                    if (cfg.strobe_period_min as u64..=cfg.strobe_period_max as u64)
                        .contains(&period) =>
                {
                    *strobe_period = hooks.period_change(period as u16);
                    if strobe.countdown > *strobe_period {
                        strobe.countdown = *strobe_period;
                    }
                    if *strobing && !cfg.can_interleave() {
                        silent = true;
                    }
                }
                Ok(_) => err = Errno::Inval.code(),
                Err(e) => err = e.code(),
            },

            OP_SET_DATASPACE_STROBE => match args.unsigned() {
                Ok(flag) => {
                    if flag != 0 {
                        if !*strobing {
                            // First strobe fires on the next tick.
                            strobe.countdown = 1;
                        }
                        *strobing = true;
                    } else {
                        *strobing = false;
                    }
                    info!("strobing: {}", *strobing);
                    hooks.activate(*strobing);
                    if !cfg.can_interleave() {
                        silent = true;
                    }
                }
                Err(e) => err = e.code(),
            },

            OP_SET_CELL_STROBE => {
                // Changing the strobe length mid-stream would corrupt it.
                if *strobing {
                    return None;
                }
                match args.unsigned().and_then(|idx| {
                    args.unsigned().map(|flag| (idx as usize, flag != 0))
                }) {
                    Ok((idx, member)) => {
                        if let Err(e) = registry.set_strobe_member(idx, member) {
                            err = e.code();
                        }
                    }
                    Err(e) => err = e.code(),
                }
            }

            OP_SET_CELL_VALUE => match args.unsigned() {
                Ok(idx) => {
                    err = match writable_cell(registry, idx as usize) {
                        Ok(cell) => match parse_value_ascii(cell, &mut args) {
                            Ok(value) => {
                                apply_value(cell, value);
                                0
                            }
                            Err(e) => e.code(),
                        },
                        Err(e) => e.code(),
                    };
                    if *strobing && !cfg.can_interleave() {
                        silent = true;
                    }
                }
                Err(e) => err = e.code(),
            },

            _ => err = Errno::OpNotSupp.code(),
        }

        if silent {
            return None;
        }

        if w.overflowed() {
            err = Errno::Canceled.code();
            tiny = true;
        }
        if tiny {
            w.truncate(payload_start);
        }
        let _ = write!(w, "{}", err);
        Some(w.pos())
    }

    fn interpret_msgpack(&mut self, len: usize) -> Option<usize> {
        let margin = self.cycle_margin();
        let info = self.protocol_info;
        let roundtrip = self.roundtrip_ticks;
        let tick_ms = self.tick_period_ms;
        let timestamp = self.timestamp;

        let Self {
            cfg,
            registry,
            recv,
            response,
            strobe,
            hooks,
            strobing,
            advertising,
            strobe_period,
            ..
        } = self;

        let command = &recv.buf[..len];

        // Envelope: a 2-element array of opcode and argument array.
        let mut reader = PackReader::new(command);
        if reader.open_array().ok()? != 2 {
            return None;
        }
        let opcode32 = reader.get_u32().ok()?;
        reader.open_array().ok()?;
        let opcode = u8::try_from(opcode32).unwrap_or(0xFF);

        if opcode >= b'a' && *strobing && !cfg.can_interleave() {
            return None;
        }

        if *advertising && KNOWN_OPCODES.contains(&opcode) {
            debug!("client attached, advertising stops");
            *advertising = false;
            strobe.abandon();
        }

        let ctx = MsgPackCtx {
            registry,
            hooks,
            strobe,
            strobing,
            advertising,
            strobe_period,
            cfg,
            info,
            margin,
            roundtrip,
            tick_ms,
            timestamp,
        };

        let composed = {
            let out = payload_area(cfg, response);
            let mut w = PackWriter::new(out);
            compose_msgpack(&mut w, opcode, opcode32, &mut reader, ctx)
                .map(|outcome| (outcome, w.offset()))
        };

        match composed {
            Ok((Outcome::Silent, _)) => None,
            Ok((Outcome::Done, offset)) => Some(offset),
            Err(_) => {
                // Serializer overflow: fall back to a tiny reply, which the
                // minimum response buffer always fits.
                let out = payload_area(cfg, response);
                let mut w = PackWriter::new(out);
                let _ = w.open_array(3);
                let _ = w.put_uint(opcode32 as u64);
                let _ = w.open_array(0);
                let _ = w.put_int(Errno::Canceled.code() as i64);
                Some(w.offset())
            }
        }
    }
}

struct MsgPackCtx<'a, H: Hooks> {
    registry: &'a mut Registry,
    hooks: &'a mut H,
    strobe: &'a mut Frame,
    strobing: &'a mut bool,
    advertising: &'a mut bool,
    strobe_period: &'a mut u16,
    cfg: &'a HostConfig,
    info: u32,
    margin: i32,
    roundtrip: u16,
    tick_ms: u16,
    timestamp: u32,
}

fn compose_msgpack<H: Hooks>(
    w: &mut PackWriter,
    opcode: u8,
    opcode_raw: u32,
    args: &mut PackReader,
    ctx: MsgPackCtx<H>,
) -> Result<Outcome, Errno> {
    let MsgPackCtx {
        registry,
        hooks,
        strobe,
        strobing,
        advertising,
        strobe_period,
        cfg,
        info,
        margin,
        roundtrip,
        tick_ms,
        timestamp,
    } = ctx;

    w.open_array(3)?;
    w.put_uint(opcode_raw as u64)?;

    let mut tiny = true;
    let mut silent = false;
    let mut err = 0i32;

    match opcode {
        OP_GET_PROTOCOL_INFO => {
            w.open_array(2)?;
            w.put_uint(info as u64)?;
            w.put_str(VERSION_TAG)?;
            tiny = false;
        }

        OP_GET_TIMING_INFO => {
            w.open_array(7)?;
            w.put_uint(tick_ms as u64)?;
            w.put_uint(cfg.command_timeout_ticks as u64)?;
            w.put_uint(roundtrip as u64)?;
            w.put_uint(cfg.strobe_period_min as u64)?;
            w.put_uint(cfg.strobe_period_max as u64)?;
            w.put_uint(*strobe_period as u64)?;
            w.put_int(margin as i64)?;
            tiny = false;
        }

        OP_GET_CELL_COUNT => {
            w.open_array(1)?;
            w.put_uint(registry.len() as u64)?;
            tiny = false;
        }

        OP_GET_CELL_PARAMS => match args.get_u32() {
            Ok(idx) => match registry.seek(idx as usize) {
                Some((cell, offset)) => {
                    w.open_array(6)?;
                    w.put_str(cell.name)?;
                    w.put_uint(cell.type_code.raw() as u64)?;
                    w.put_uint(cell.count as u64)?;
                    w.put_str(cell.unit)?;
                    w.put_uint(cell.rate_divider as u64)?;
                    w.put_uint(offset as u64)?;
                    tiny = false;
                }
                None => err = Errno::Fault.code(),
            },
            Err(e) => err = e.code(),
        },

        OP_GET_CELL_VALUE => match args.get_u32() {
            Ok(idx) => match registry.seek(idx as usize) {
                Some((cell, _)) => match write_value_msgpack(w, cell, timestamp) {
                    Ok(()) => tiny = false,
                    Err(Errno::Canceled) => return Err(Errno::Canceled),
                    Err(e) => err = e.code(),
                },
                None => err = Errno::Fault.code(),
            },
            Err(e) => err = e.code(),
        },

        OP_SET_ADVERTISE => {
            *advertising = true;
            if *strobing {
                *strobing = false;
                hooks.activate(false);
            }
            silent = true;
        }

        OP_SET_STROBE_PERIOD => match args.get_u32() {
            Ok(period)
                if (cfg.strobe_period_min as u32..=cfg.strobe_period_max as u32)
                    .contains(&period) =>
            {
                *strobe_period = hooks.period_change(period as u16);
                if strobe.countdown > *strobe_period {
                    strobe.countdown = *strobe_period;
                }
                if *strobing && !cfg.can_interleave() {
                    silent = true;
                }
            }
            Ok(_) => err = Errno::Inval.code(),
            Err(e) => err = e.code(),
        },

        OP_SET_DATASPACE_STROBE => match args.get_u32() {
            Ok(flag) => {
                if flag != 0 {
                    if !*strobing {
                        strobe.countdown = 1;
                    }
                    *strobing = true;
                } else {
                    *strobing = false;
                }
                info!("strobing: {}", *strobing);
                hooks.activate(*strobing);
                if !cfg.can_interleave() {
                    silent = true;
                }
            }
            Err(e) => err = e.code(),
        },

        OP_SET_CELL_STROBE => {
            if *strobing {
                return Ok(Outcome::Silent);
            }
            match args
                .get_u32()
                .and_then(|idx| args.get_bool().map(|flag| (idx as usize, flag)))
            {
                Ok((idx, member)) => {
                    if let Err(e) = registry.set_strobe_member(idx, member) {
                        err = e.code();
                    }
                }
                Err(e) => err = e.code(),
            }
        }

        OP_SET_CELL_VALUE => match args.get_u32() {
            Ok(idx) => {
                err = match writable_cell(registry, idx as usize) {
                    Ok(cell) => match parse_value_msgpack(cell, args) {
                        Ok(value) => {
                            apply_value(cell, value);
                            0
                        }
                        Err(e) => e.code(),
                    },
                    Err(e) => e.code(),
                };
                if *strobing && !cfg.can_interleave() {
                    silent = true;
                }
            }
            Err(e) => err = e.code(),
        },

        _ => err = Errno::OpNotSupp.code(),
    }

    if silent {
        return Ok(Outcome::Silent);
    }

    if tiny {
        w.open_array(0)?;
    }
    w.put_int(err as i64)?;
    Ok(Outcome::Done)
}

/// The slice the response payload is composed into, per command encoding.
fn payload_area<'f>(cfg: &HostConfig, response: &'f mut Frame) -> &'f mut [u8] {
    match cfg.command_encoding {
        Encoding::Escs => &mut response.stage[..cfg.response_buffer_size],
        Encoding::Cobs => &mut response.buf[2..2 + cfg.response_buffer_size],
        _ => &mut response.buf[..cfg.response_buffer_size],
    }
}

/// Look up a cell for a client write, rejecting bad indices and read-only
/// cells.
fn writable_cell(registry: &mut Registry, idx: usize) -> Result<&mut DataCell, Errno> {
    let cell = registry.get_mut(idx).ok_or(Errno::Fault)?;
    if !cell.type_code.client_writable() {
        return Err(Errno::Acces);
    }
    Ok(cell)
}

/// Run the cell's validator and store the accepted value. A rejected value
/// is dropped without an error. Detached cells have nowhere to store the
/// value; only the validator sees it.
fn apply_value(cell: &DataCell, value: Value) {
    let accepted = cell.on_change.map_or(true, |hook: ChangeHook| hook(&value));
    if !accepted {
        debug!("cell write rejected by validator");
        return;
    }

    let CellSource::Memory(region) = cell.source else {
        return;
    };

    match value {
        Value::Bool(v) => region.write_from(&[v as u8]),
        Value::U8(v) => region.write_from(&[v]),
        Value::I8(v) => region.write_from(&v.to_ne_bytes()),
        Value::U16(v) => region.write_from(&v.to_ne_bytes()),
        Value::I16(v) => region.write_from(&v.to_ne_bytes()),
        Value::U32(v) => region.write_from(&v.to_ne_bytes()),
        Value::I32(v) => region.write_from(&v.to_ne_bytes()),
        Value::U64(v) => region.write_from(&v.to_ne_bytes()),
        Value::I64(v) => region.write_from(&v.to_ne_bytes()),
        Value::F32(v) => region.write_from(&v.to_ne_bytes()),
        Value::F64(v) => region.write_from(&v.to_ne_bytes()),
        Value::Str(s) => {
            let count = cell.count as usize;
            let n = s.len().min(count);
            region.write_from(&s.as_bytes()[..n]);
            region.zero(n, count - n);
        }
    }
}

fn parse_value_ascii<'a>(cell: &DataCell, args: &mut Scanner<'a>) -> Result<Value<'a>, Errno> {
    let kind = cell.type_code.kind().ok_or(Errno::Inval)?;
    let width = cell.byte_width();

    match (kind, width) {
        (CellKind::Char, _) => {
            let text = args.rest_str()?;
            if text.is_empty() {
                return Err(Errno::Inval);
            }
            Ok(Value::Str(text))
        }
        (CellKind::Bool, 1) => Ok(Value::Bool(args.unsigned8()? != 0)),
        (CellKind::Unsigned, 1) => Ok(Value::U8(args.unsigned8()?)),
        (CellKind::Unsigned, 2) => {
            Ok(Value::U16(narrow_u(args.unsigned()?, u16::MAX as u64)? as u16))
        }
        (CellKind::Unsigned, 4) => {
            Ok(Value::U32(narrow_u(args.unsigned()?, u32::MAX as u64)? as u32))
        }
        (CellKind::Unsigned, 8) => Ok(Value::U64(args.unsigned()?)),
        (CellKind::Signed, 1) => Ok(Value::I8(narrow_i(args.signed()?, i8::MIN as i64, i8::MAX as i64)? as i8)),
        (CellKind::Signed, 2) => Ok(Value::I16(narrow_i(args.signed()?, i16::MIN as i64, i16::MAX as i64)? as i16)),
        (CellKind::Signed, 4) => Ok(Value::I32(narrow_i(args.signed()?, i32::MIN as i64, i32::MAX as i64)? as i32)),
        (CellKind::Signed, 8) => Ok(Value::I64(args.signed()?)),
        (CellKind::Float, 4) => Ok(Value::F32(
            args.rest_str()?.parse().map_err(|_| Errno::Inval)?,
        )),
        (CellKind::Float, 8) => Ok(Value::F64(
            args.rest_str()?.parse().map_err(|_| Errno::Inval)?,
        )),
        _ => Err(Errno::Inval),
    }
}

fn parse_value_msgpack<'a>(cell: &DataCell, args: &mut PackReader<'a>) -> Result<Value<'a>, Errno> {
    let kind = cell.type_code.kind().ok_or(Errno::Inval)?;
    let width = cell.byte_width();

    match (kind, width) {
        (CellKind::Char, _) => Ok(Value::Str(args.get_str()?)),
        (CellKind::Bool, 1) => Ok(Value::Bool(args.get_u8()? != 0)),
        (CellKind::Unsigned, 1) => Ok(Value::U8(args.get_u8()?)),
        (CellKind::Unsigned, 2) => Ok(Value::U16(args.get_u16()?)),
        (CellKind::Unsigned, 4) => Ok(Value::U32(args.get_u32()?)),
        (CellKind::Unsigned, 8) => Ok(Value::U64(args.get_u64()?)),
        (CellKind::Signed, 1) => Ok(Value::I8(args.get_i8()?)),
        (CellKind::Signed, 2) => Ok(Value::I16(args.get_i16()?)),
        (CellKind::Signed, 4) => Ok(Value::I32(args.get_i32()?)),
        (CellKind::Signed, 8) => Ok(Value::I64(args.get_i64()?)),
        (CellKind::Float, 4) => Ok(Value::F32(args.get_f32()?)),
        (CellKind::Float, 8) => Ok(Value::F64(args.get_f64()?)),
        _ => Err(Errno::Inval),
    }
}

fn narrow_u(value: u64, max: u64) -> Result<u64, Errno> {
    if value > max {
        Err(Errno::Inval)
    } else {
        Ok(value)
    }
}

fn narrow_i(value: i64, min: i64, max: i64) -> Result<i64, Errno> {
    if value < min || value > max {
        Err(Errno::Inval)
    } else {
        Ok(value)
    }
}

/// Format a cell's current value, comma-terminated. Scalars read the first
/// element; char arrays print up to the first nul.
fn write_value_ascii(w: &mut AsciiWriter, cell: &DataCell, timestamp: u32) -> Result<(), Errno> {
    let kind = cell.type_code.kind().ok_or(Errno::NotSup)?;
    let width = cell.byte_width() as usize;
    let mut tmp = [0u8; 8];

    match (kind, width) {
        (CellKind::Char, _) => {
            if cell.count == 1 {
                cell.sample_into(&mut tmp[..1], timestamp);
                w.write_raw(&tmp[..1]);
            } else {
                let bytes = cell.str_bytes();
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                w.write_raw(&bytes[..end]);
            }
        }
        (CellKind::Bool, 1) | (CellKind::Unsigned, 1) => {
            cell.sample_into(&mut tmp[..1], timestamp);
            let _ = write!(w, "{}", tmp[0]);
        }
        (CellKind::Signed, 1) => {
            cell.sample_into(&mut tmp[..1], timestamp);
            let _ = write!(w, "{}", tmp[0] as i8);
        }
        (CellKind::Unsigned, 2) => {
            cell.sample_into(&mut tmp[..2], timestamp);
            let _ = write!(w, "{}", u16::from_ne_bytes(tmp[..2].try_into().unwrap()));
        }
        (CellKind::Signed, 2) => {
            cell.sample_into(&mut tmp[..2], timestamp);
            let _ = write!(w, "{}", i16::from_ne_bytes(tmp[..2].try_into().unwrap()));
        }
        (CellKind::Unsigned, 4) => {
            cell.sample_into(&mut tmp[..4], timestamp);
            let _ = write!(w, "{}", u32::from_ne_bytes(tmp[..4].try_into().unwrap()));
        }
        (CellKind::Signed, 4) => {
            cell.sample_into(&mut tmp[..4], timestamp);
            let _ = write!(w, "{}", i32::from_ne_bytes(tmp[..4].try_into().unwrap()));
        }
        (CellKind::Unsigned, 8) => {
            cell.sample_into(&mut tmp, timestamp);
            let _ = write!(w, "{}", u64::from_ne_bytes(tmp));
        }
        (CellKind::Signed, 8) => {
            cell.sample_into(&mut tmp, timestamp);
            let _ = write!(w, "{}", i64::from_ne_bytes(tmp));
        }
        (CellKind::Float, 4) => {
            cell.sample_into(&mut tmp[..4], timestamp);
            let _ = write!(w, "{}", f32::from_ne_bytes(tmp[..4].try_into().unwrap()));
        }
        (CellKind::Float, 8) => {
            cell.sample_into(&mut tmp, timestamp);
            let _ = write!(w, "{}", f64::from_ne_bytes(tmp));
        }
        _ => return Err(Errno::NotSup),
    }

    let _ = w.write_char(',');
    Ok(())
}

/// Serialize a cell's current value as a 1-element payload array.
fn write_value_msgpack(w: &mut PackWriter, cell: &DataCell, timestamp: u32) -> Result<(), Errno> {
    let kind = cell.type_code.kind().ok_or(Errno::NotSup)?;
    let width = cell.byte_width() as usize;
    let mut tmp = [0u8; 8];

    w.open_array(1)?;
    match (kind, width) {
        (CellKind::Char, _) => {
            if cell.count == 1 {
                cell.sample_into(&mut tmp[..1], timestamp);
                w.put_raw(&tmp[..1])?;
            } else {
                let bytes = cell.str_bytes();
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                w.put_raw(&bytes[..end])?;
            }
        }
        (CellKind::Bool, 1) => {
            cell.sample_into(&mut tmp[..1], timestamp);
            w.put_bool(tmp[0] != 0)?;
        }
        (CellKind::Unsigned, _) => {
            cell.sample_into(&mut tmp[..width], timestamp);
            let value = match width {
                1 => tmp[0] as u64,
                2 => u16::from_ne_bytes(tmp[..2].try_into().unwrap()) as u64,
                4 => u32::from_ne_bytes(tmp[..4].try_into().unwrap()) as u64,
                _ => u64::from_ne_bytes(tmp),
            };
            w.put_uint(value)?;
        }
        (CellKind::Signed, _) => {
            cell.sample_into(&mut tmp[..width], timestamp);
            let value = match width {
                1 => tmp[0] as i8 as i64,
                2 => i16::from_ne_bytes(tmp[..2].try_into().unwrap()) as i64,
                4 => i32::from_ne_bytes(tmp[..4].try_into().unwrap()) as i64,
                _ => i64::from_ne_bytes(tmp),
            };
            w.put_int(value)?;
        }
        (CellKind::Float, 4) => {
            cell.sample_into(&mut tmp[..4], timestamp);
            w.put_f32(f32::from_ne_bytes(tmp[..4].try_into().unwrap()))?;
        }
        (CellKind::Float, 8) => {
            cell.sample_into(&mut tmp, timestamp);
            w.put_f64(f64::from_ne_bytes(tmp))?;
        }
        _ => return Err(Errno::NotSup),
    }
    Ok(())
}

/// ASCII response writer over the payload area. Overflow latches a flag
/// that surfaces as `ECANCELED`.
struct AsciiWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    overflow: bool,
}

impl<'a> AsciiWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            overflow: false,
        }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn overflowed(&self) -> bool {
        self.overflow
    }

    fn truncate(&mut self, pos: usize) {
        self.pos = pos;
        self.overflow = false;
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        if self.pos + bytes.len() > self.buf.len() {
            self.overflow = true;
            return;
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

impl core::fmt::Write for AsciiWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.write_raw(s.as_bytes());
        Ok(())
    }
}

/// Comma-separated decimal argument scanner. A single separator before each
/// field is optional, so both `P20` and `P,20` parse.
struct Scanner<'a> {
    rest: &'a [u8],
}

impl<'a> Scanner<'a> {
    fn new(args: &'a [u8]) -> Self {
        Self { rest: args }
    }

    fn skip_separator(&mut self) {
        if let Some((&first, tail)) = self.rest.split_first() {
            if first == b',' || first == b' ' {
                self.rest = tail;
            }
        }
    }

    fn unsigned(&mut self) -> Result<u64, Errno> {
        self.skip_separator();
        self.unsigned_no_skip()
    }

    fn unsigned8(&mut self) -> Result<u8, Errno> {
        u8::try_from(self.unsigned()?).map_err(|_| Errno::Inval)
    }

    fn signed(&mut self) -> Result<i64, Errno> {
        self.skip_separator();
        let negative = match self.rest.split_first() {
            Some((&b'-', tail)) => {
                self.rest = tail;
                true
            }
            Some((&b'+', tail)) => {
                self.rest = tail;
                false
            }
            _ => false,
        };
        let magnitude = self.unsigned_no_skip()?;
        if negative {
            if magnitude > i64::MAX as u64 + 1 {
                return Err(Errno::Inval);
            }
            Ok((magnitude as i64).wrapping_neg())
        } else {
            i64::try_from(magnitude).map_err(|_| Errno::Inval)
        }
    }

    fn unsigned_no_skip(&mut self) -> Result<u64, Errno> {
        let mut value: u64 = 0;
        let mut digits = 0;
        while let Some((&c, tail)) = self.rest.split_first() {
            if !c.is_ascii_digit() {
                break;
            }
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((c - b'0') as u64))
                .ok_or(Errno::Inval)?;
            self.rest = tail;
            digits += 1;
        }
        if digits == 0 {
            return Err(Errno::Inval);
        }
        Ok(value)
    }

    /// The remainder of the argument list as text.
    fn rest_str(&mut self) -> Result<&'a str, Errno> {
        self.skip_separator();
        core::str::from_utf8(self.rest).map_err(|_| Errno::Inval)
    }
}
