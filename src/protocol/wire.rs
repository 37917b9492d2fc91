use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::DriverError;

/// Little-endian primitives shared by every message body
pub trait WireWrite {
    fn put_bool(&mut self, value: bool);
    fn put_string(&mut self, value: &str);
    fn put_uuid(&mut self, value: &Uuid);
    /// Reserve an i32 slot and return its position for [`WireWrite::patch_i32`]
    fn reserve_i32(&mut self) -> usize;
    fn patch_i32(&mut self, pos: usize, value: i32);
}

impl WireWrite for BytesMut {
    fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    fn put_string(&mut self, value: &str) {
        self.put_i32_le(value.len() as i32);
        self.extend_from_slice(value.as_bytes());
    }

    fn put_uuid(&mut self, value: &Uuid) {
        self.extend_from_slice(value.as_bytes());
    }

    fn reserve_i32(&mut self) -> usize {
        let pos = self.len();
        self.put_i32_le(0);
        pos
    }

    fn patch_i32(&mut self, pos: usize, value: i32) {
        self[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Checked reader over a response body
///
/// Every getter fails with a protocol error instead of panicking when the
/// body is shorter than the field being read.
#[derive(Debug, Clone)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn has_remaining(&self) -> bool {
        self.buf.has_remaining()
    }

    fn ensure(&self, len: usize, what: &str) -> Result<(), DriverError> {
        if self.buf.remaining() < len {
            return Err(DriverError::protocol(format!(
                "Protocol error by message underflow (field={}, required={}, remaining={})",
                what,
                len,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, DriverError> {
        self.ensure(1, "byte")?;
        Ok(self.buf.get_u8())
    }

    pub fn get_bool(&mut self) -> Result<bool, DriverError> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_i16(&mut self) -> Result<i16, DriverError> {
        self.ensure(2, "short")?;
        Ok(self.buf.get_i16_le())
    }

    pub fn get_i32(&mut self) -> Result<i32, DriverError> {
        self.ensure(4, "int")?;
        Ok(self.buf.get_i32_le())
    }

    pub fn get_i64(&mut self) -> Result<i64, DriverError> {
        self.ensure(8, "long")?;
        Ok(self.buf.get_i64_le())
    }

    /// Read an i32 size prefix, rejecting negative values
    pub fn get_size(&mut self) -> Result<usize, DriverError> {
        let size = self.get_i32()?;
        if size < 0 {
            return Err(DriverError::protocol(format!(
                "Protocol error by negative size (size={})",
                size
            )));
        }
        Ok(size as usize)
    }

    pub fn get_string(&mut self) -> Result<String, DriverError> {
        let len = self.get_size()?;
        self.ensure(len, "string")?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| DriverError::protocol("Protocol error by illegal string encoding"))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Bytes, DriverError> {
        self.ensure(len, "bytes")?;
        Ok(self.buf.split_to(len))
    }

    /// Read an i32 size followed by that many bytes
    pub fn get_sized_bytes(&mut self) -> Result<Bytes, DriverError> {
        let len = self.get_size()?;
        self.get_bytes(len)
    }

    pub fn into_inner(self) -> Bytes {
        self.buf
    }
}
