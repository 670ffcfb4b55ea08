//! Wire buffer codec
//!
//! Fixed-width little-endian primitives, length-encoded integers and strings,
//! and null-terminated strings. `WireReader` walks one received payload and
//! never reads past its end; `WireWriter` grows on demand before every write.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DriverError, DriverResult};

/// Prefix byte of a NULL length-encoded value
pub const NULL_LENGTH: u8 = 0xFB;
const LENENC_U16: u8 = 0xFC;
const LENENC_U24: u8 = 0xFD;
const LENENC_U64: u8 = 0xFE;

/// Largest allocation the writer will ever request
const MAX_BUFFER_SIZE: usize = isize::MAX as usize;
const INITIAL_CAPACITY: usize = 64;

/// Number of bytes `value` occupies once length-encoded
pub fn lenenc_int_size(value: u64) -> usize {
    match value {
        0..=250 => 1,
        251..=0xFFFF => 3,
        0x1_0000..=0xFF_FFFF => 4,
        _ => 9,
    }
}

/// Read cursor over a single protocol payload
#[derive(Debug, Clone)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self { buf: buf.into() }
    }

    /// Bytes left before the end of the payload
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Look at the next byte without consuming it
    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    fn ensure(&self, requested: usize) -> DriverResult<()> {
        let remaining = self.buf.remaining();
        if remaining < requested {
            return Err(DriverError::Decode {
                requested,
                remaining,
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> DriverResult<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> DriverResult<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u24(&mut self) -> DriverResult<u32> {
        self.ensure(3)?;
        Ok(self.buf.get_uint_le(3) as u32)
    }

    pub fn read_u32(&mut self) -> DriverResult<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self) -> DriverResult<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn skip(&mut self, len: usize) -> DriverResult<()> {
        self.ensure(len)?;
        self.buf.advance(len);
        Ok(())
    }

    pub fn read_bytes(&mut self, len: usize) -> DriverResult<Bytes> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Consume everything left in the payload
    pub fn read_rest(&mut self) -> Bytes {
        let len = self.buf.len();
        self.buf.split_to(len)
    }

    /// Read a length-encoded integer; `None` is the NULL marker
    pub fn read_lenenc_int(&mut self) -> DriverResult<Option<u64>> {
        let prefix = self.read_u8()?;
        let value = match prefix {
            0..=250 => u64::from(prefix),
            NULL_LENGTH => return Ok(None),
            LENENC_U16 => u64::from(self.read_u16()?),
            LENENC_U24 => u64::from(self.read_u24()?),
            LENENC_U64 => self.read_u64()?,
            other => {
                return Err(DriverError::protocol(format!(
                    "invalid length-encoded integer prefix 0x{other:02x}"
                )))
            }
        };
        Ok(Some(value))
    }

    /// Skip a length-encoded integer without decoding it
    pub fn skip_lenenc_int(&mut self) -> DriverResult<()> {
        let prefix = self.read_u8()?;
        let width = match prefix {
            LENENC_U16 => 2,
            LENENC_U24 => 3,
            LENENC_U64 => 8,
            0xFF => {
                return Err(DriverError::protocol(
                    "invalid length-encoded integer prefix 0xff",
                ))
            }
            _ => 0,
        };
        self.skip(width)
    }

    /// Read a length-encoded byte string; `None` is SQL NULL, distinct from empty
    pub fn read_lenenc_bytes(&mut self) -> DriverResult<Option<Bytes>> {
        match self.read_lenenc_int()? {
            None => Ok(None),
            Some(len) => {
                let len = usize::try_from(len).map_err(|_| DriverError::Decode {
                    requested: usize::MAX,
                    remaining: self.remaining(),
                })?;
                self.read_bytes(len).map(Some)
            }
        }
    }

    /// Skip a length-encoded byte string
    pub fn skip_lenenc_bytes(&mut self) -> DriverResult<()> {
        if let Some(len) = self.read_lenenc_int()? {
            let len = usize::try_from(len).map_err(|_| DriverError::Decode {
                requested: usize::MAX,
                remaining: self.remaining(),
            })?;
            self.skip(len)?;
        }
        Ok(())
    }

    pub fn read_lenenc_string(&mut self) -> DriverResult<Option<String>> {
        self.read_lenenc_bytes()?.map(utf8).transpose()
    }

    /// Read up to the first NUL (or the end of the payload), dropping the NUL
    pub fn read_null_terminated_bytes(&mut self) -> Bytes {
        match self.buf.iter().position(|b| *b == 0) {
            Some(pos) => {
                let value = self.buf.split_to(pos);
                self.buf.advance(1);
                value
            }
            None => self.read_rest(),
        }
    }

    pub fn read_null_terminated_string(&mut self) -> DriverResult<String> {
        utf8(self.read_null_terminated_bytes())
    }

    pub fn read_string(&mut self, len: usize) -> DriverResult<String> {
        utf8(self.read_bytes(len)?)
    }
}

fn utf8(bytes: Bytes) -> DriverResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| DriverError::protocol(format!("invalid UTF-8 in string value: {e}")))
}

/// Growable write buffer for one outgoing message
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Current write position
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Grow by 1.5x (or to the requested size if larger) before a write
    fn grow(&mut self, additional: usize) {
        let needed = self.buf.len().saturating_add(additional);
        let capacity = self.buf.capacity();
        if needed <= capacity {
            return;
        }
        let target = (capacity + capacity / 2).max(needed).min(MAX_BUFFER_SIZE);
        self.buf.reserve(target - self.buf.len());
    }

    pub fn write_u8(&mut self, value: u8) {
        self.grow(1);
        self.buf.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.grow(2);
        self.buf.put_u16_le(value);
    }

    pub fn write_u24(&mut self, value: u32) {
        self.grow(3);
        self.buf.put_uint_le(u64::from(value & 0xFF_FFFF), 3);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.grow(4);
        self.buf.put_u32_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.grow(8);
        self.buf.put_u64_le(value);
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.grow(value.len());
        self.buf.put_slice(value);
    }

    /// Write `len` zero bytes
    pub fn write_zeros(&mut self, len: usize) {
        self.grow(len);
        self.buf.put_bytes(0, len);
    }

    pub fn write_lenenc_int(&mut self, value: u64) {
        match value {
            0..=250 => self.write_u8(value as u8),
            251..=0xFFFF => {
                self.write_u8(LENENC_U16);
                self.write_u16(value as u16);
            }
            0x1_0000..=0xFF_FFFF => {
                self.write_u8(LENENC_U24);
                self.write_u24(value as u32);
            }
            _ => {
                self.write_u8(LENENC_U64);
                self.write_u64(value);
            }
        }
    }

    /// Write the NULL marker used in place of a length-encoded value
    pub fn write_null(&mut self) {
        self.write_u8(NULL_LENGTH);
    }

    pub fn write_lenenc_bytes(&mut self, value: &[u8]) {
        self.write_lenenc_int(value.len() as u64);
        self.write_bytes(value);
    }

    pub fn write_null_terminated(&mut self, value: &[u8]) {
        self.write_bytes(value);
        self.write_u8(0);
    }
}
