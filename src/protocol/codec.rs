use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{check_magic, ee_head_len, FrameHeader};
use super::wire::WireWrite;
use crate::error::DriverError;

/// Request ready for transmission
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub header: FrameHeader,
    pub large_statement_id: bool,
    pub body: Bytes,
}

impl RequestFrame {
    pub fn new(header: FrameHeader, large_statement_id: bool, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            large_statement_id,
            body: body.into(),
        }
    }
}

/// Response with the address-echo prefix stripped
///
/// The payload starts at the statement type field.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub payload: Bytes,
}

/// Largest response body accepted by default (bytes)
pub const DEFAULT_MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Frame codec for the node protocol
///
/// Decoding leaves any bytes past the declared body length in the source
/// buffer, so pipelined data is handed to the next call untouched. A body
/// length above `max_body_len` is rejected before any buffer grows.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    ipv6: bool,
    max_body_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(false)
    }
}

impl FrameCodec {
    pub fn new(ipv6: bool) -> Self {
        Self {
            ipv6,
            max_body_len: DEFAULT_MAX_BODY_LEN,
        }
    }

    pub fn with_max_body_len(mut self, max_body_len: usize) -> Self {
        self.max_body_len = max_body_len;
        self
    }

    pub fn max_body_len(&self) -> usize {
        self.max_body_len
    }

    pub fn ee_head_len(&self) -> usize {
        ee_head_len(self.ipv6)
    }
}

impl Decoder for FrameCodec {
    type Item = ResponseFrame;
    type Error = DriverError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let head_len = self.ee_head_len();
        if src.len() < head_len {
            return Ok(None);
        }

        check_magic(i32::from_le_bytes([src[0], src[1], src[2], src[3]]))?;

        let pos = head_len - 4;
        let body_len = i32::from_le_bytes([src[pos], src[pos + 1], src[pos + 2], src[pos + 3]]);
        if body_len < 0 {
            return Err(DriverError::protocol(format!(
                "Protocol error by negative body length (length={})",
                body_len
            )));
        }
        if body_len as usize > self.max_body_len {
            return Err(DriverError::protocol(format!(
                "Protocol error by too large body length (length={}, max={})",
                body_len, self.max_body_len
            )));
        }

        let total = head_len + body_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(head_len);
        let payload = src.split_to(body_len as usize).freeze();
        Ok(Some(ResponseFrame { payload }))
    }
}

impl Encoder<RequestFrame> for FrameCodec {
    type Error = DriverError;

    fn encode(&mut self, item: RequestFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        let head_len = self.ee_head_len();
        item.header.encode(dst, self.ipv6, item.large_statement_id);
        dst.extend_from_slice(&item.body);

        let body_len = dst.len() - start - head_len;
        dst.patch_i32(start + head_len - 4, body_len as i32);
        Ok(())
    }
}
