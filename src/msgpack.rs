//! Minimal MessagePack writer and reader for command and response bodies.
//!
//! Covers nil, booleans, integers up to 64 bits, single and double
//! precision floats, strings, raw bytes and array/map headers. Multi-byte
//! values are big-endian on the wire.

use crate::error::Errno;

const NIL: u8 = 0xC0;
const BOOL_FALSE: u8 = 0xC2;
const BOOL_TRUE: u8 = 0xC3;
const UINT8: u8 = 0xCC;
const UINT16: u8 = 0xCD;
const UINT32: u8 = 0xCE;
const UINT64: u8 = 0xCF;
const INT8: u8 = 0xD0;
const INT16: u8 = 0xD1;
const INT32: u8 = 0xD2;
const INT64: u8 = 0xD3;
const FLOAT32: u8 = 0xCA;
const FLOAT64: u8 = 0xCB;
const RAW_FIX: u8 = 0xA0;
const RAW8: u8 = 0xD9;
const RAW16: u8 = 0xDA;
const RAW32: u8 = 0xDB;
const ARRAY_FIX: u8 = 0x90;
const ARRAY16: u8 = 0xDC;
const ARRAY32: u8 = 0xDD;
const MAP_FIX: u8 = 0x80;
const MAP16: u8 = 0xDE;
const MAP32: u8 = 0xDF;

const FIXNUM_POSITIVE_MAX: u64 = 127;
const FIXNUM_NEGATIVE_MIN: i64 = -32;

/// Serializer writing into a caller-provided buffer. Overflow surfaces as
/// `ECANCELED`, matching the response-composition error policy.
pub struct PackWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> PackWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes written so far.
    pub fn offset(&self) -> usize {
        self.pos
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), Errno> {
        if self.pos + bytes.len() > self.buf.len() {
            return Err(Errno::Canceled);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    pub fn put_nil(&mut self) -> Result<(), Errno> {
        self.put(&[NIL])
    }

    pub fn put_bool(&mut self, value: bool) -> Result<(), Errno> {
        self.put(&[if value { BOOL_TRUE } else { BOOL_FALSE }])
    }

    pub fn open_array(&mut self, len: u32) -> Result<(), Errno> {
        match len {
            0..=15 => self.put(&[ARRAY_FIX | len as u8]),
            16..=65535 => {
                self.put(&[ARRAY16])?;
                self.put(&(len as u16).to_be_bytes())
            }
            _ => {
                self.put(&[ARRAY32])?;
                self.put(&len.to_be_bytes())
            }
        }
    }

    pub fn open_map(&mut self, len: u32) -> Result<(), Errno> {
        match len {
            0..=15 => self.put(&[MAP_FIX | len as u8]),
            16..=65535 => {
                self.put(&[MAP16])?;
                self.put(&(len as u16).to_be_bytes())
            }
            _ => {
                self.put(&[MAP32])?;
                self.put(&len.to_be_bytes())
            }
        }
    }

    pub fn put_uint(&mut self, value: u64) -> Result<(), Errno> {
        if value <= FIXNUM_POSITIVE_MAX {
            self.put(&[value as u8])
        } else if value <= u8::MAX as u64 {
            self.put(&[UINT8, value as u8])
        } else if value <= u16::MAX as u64 {
            self.put(&[UINT16])?;
            self.put(&(value as u16).to_be_bytes())
        } else if value <= u32::MAX as u64 {
            self.put(&[UINT32])?;
            self.put(&(value as u32).to_be_bytes())
        } else {
            self.put(&[UINT64])?;
            self.put(&value.to_be_bytes())
        }
    }

    pub fn put_int(&mut self, value: i64) -> Result<(), Errno> {
        if value >= 0 {
            return self.put_uint(value as u64);
        }
        if value >= FIXNUM_NEGATIVE_MIN {
            self.put(&[value as u8])
        } else if value >= i8::MIN as i64 {
            self.put(&[INT8, value as u8])
        } else if value >= i16::MIN as i64 {
            self.put(&[INT16])?;
            self.put(&(value as i16).to_be_bytes())
        } else if value >= i32::MIN as i64 {
            self.put(&[INT32])?;
            self.put(&(value as i32).to_be_bytes())
        } else {
            self.put(&[INT64])?;
            self.put(&value.to_be_bytes())
        }
    }

    pub fn put_f32(&mut self, value: f32) -> Result<(), Errno> {
        self.put(&[FLOAT32])?;
        self.put(&value.to_bits().to_be_bytes())
    }

    pub fn put_f64(&mut self, value: f64) -> Result<(), Errno> {
        self.put(&[FLOAT64])?;
        self.put(&value.to_bits().to_be_bytes())
    }

    pub fn put_str(&mut self, value: &str) -> Result<(), Errno> {
        self.put_raw(value.as_bytes())
    }

    pub fn put_raw(&mut self, value: &[u8]) -> Result<(), Errno> {
        match value.len() {
            0..=31 => self.put(&[RAW_FIX | value.len() as u8])?,
            32..=255 => self.put(&[RAW8, value.len() as u8])?,
            256..=65535 => {
                self.put(&[RAW16])?;
                self.put(&(value.len() as u16).to_be_bytes())?;
            }
            _ => {
                self.put(&[RAW32])?;
                self.put(&(value.len() as u32).to_be_bytes())?;
            }
        }
        self.put(value)
    }
}

/// Deserializer over a received buffer. Type mismatches and truncated input
/// surface as `EINVAL`.
pub struct PackReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PackReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Errno> {
        if self.pos + len > self.buf.len() {
            return Err(Errno::Inval);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn take1(&mut self) -> Result<u8, Errno> {
        Ok(self.take(1)?[0])
    }

    pub fn open_array(&mut self) -> Result<u32, Errno> {
        let header = self.take1()?;
        match header {
            _ if header & 0xF0 == ARRAY_FIX => Ok((header & 0x0F) as u32),
            ARRAY16 => Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()) as u32),
            ARRAY32 => Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap())),
            _ => Err(Errno::Inval),
        }
    }

    pub fn get_bool(&mut self) -> Result<bool, Errno> {
        match self.take1()? {
            BOOL_FALSE => Ok(false),
            BOOL_TRUE => Ok(true),
            _ => Err(Errno::Inval),
        }
    }

    pub fn get_u64(&mut self) -> Result<u64, Errno> {
        let header = self.take1()?;
        match header {
            _ if header & 0x80 == 0 => Ok(header as u64),
            UINT8 => Ok(self.take1()? as u64),
            UINT16 => Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()) as u64),
            UINT32 => Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()) as u64),
            UINT64 => Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap())),
            _ => Err(Errno::Inval),
        }
    }

    pub fn get_u32(&mut self) -> Result<u32, Errno> {
        u32::try_from(self.get_u64()?).map_err(|_| Errno::Inval)
    }

    pub fn get_u16(&mut self) -> Result<u16, Errno> {
        u16::try_from(self.get_u64()?).map_err(|_| Errno::Inval)
    }

    pub fn get_u8(&mut self) -> Result<u8, Errno> {
        u8::try_from(self.get_u64()?).map_err(|_| Errno::Inval)
    }

    pub fn get_i64(&mut self) -> Result<i64, Errno> {
        let header = self.take1()?;
        match header {
            _ if header & 0x80 == 0 => Ok(header as i64),
            _ if header & 0xE0 == 0xE0 => Ok(header as i8 as i64),
            UINT8 => Ok(self.take1()? as i64),
            UINT16 => Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()) as i64),
            UINT32 => Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()) as i64),
            INT8 => Ok(self.take1()? as i8 as i64),
            INT16 => Ok(i16::from_be_bytes(self.take(2)?.try_into().unwrap()) as i64),
            INT32 => Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()) as i64),
            INT64 => Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap())),
            _ => Err(Errno::Inval),
        }
    }

    pub fn get_i32(&mut self) -> Result<i32, Errno> {
        i32::try_from(self.get_i64()?).map_err(|_| Errno::Inval)
    }

    pub fn get_i16(&mut self) -> Result<i16, Errno> {
        i16::try_from(self.get_i64()?).map_err(|_| Errno::Inval)
    }

    pub fn get_i8(&mut self) -> Result<i8, Errno> {
        i8::try_from(self.get_i64()?).map_err(|_| Errno::Inval)
    }

    pub fn get_f32(&mut self) -> Result<f32, Errno> {
        match self.take1()? {
            FLOAT32 => Ok(f32::from_bits(u32::from_be_bytes(
                self.take(4)?.try_into().unwrap(),
            ))),
            _ => Err(Errno::Inval),
        }
    }

    pub fn get_f64(&mut self) -> Result<f64, Errno> {
        match self.take1()? {
            FLOAT64 => Ok(f64::from_bits(u64::from_be_bytes(
                self.take(8)?.try_into().unwrap(),
            ))),
            FLOAT32 => Ok(f32::from_bits(u32::from_be_bytes(
                self.take(4)?.try_into().unwrap(),
            )) as f64),
            _ => Err(Errno::Inval),
        }
    }

    pub fn get_raw(&mut self) -> Result<&'a [u8], Errno> {
        let header = self.take1()?;
        let len = match header {
            _ if header & 0xE0 == RAW_FIX => (header & 0x1F) as usize,
            RAW8 => self.take1()? as usize,
            RAW16 => u16::from_be_bytes(self.take(2)?.try_into().unwrap()) as usize,
            RAW32 => u32::from_be_bytes(self.take(4)?.try_into().unwrap()) as usize,
            _ => return Err(Errno::Inval),
        };
        self.take(len)
    }

    pub fn get_str(&mut self) -> Result<&'a str, Errno> {
        core::str::from_utf8(self.get_raw()?).map_err(|_| Errno::Inval)
    }
}
