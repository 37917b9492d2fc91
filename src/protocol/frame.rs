use std::fmt;

use bytes::{BufMut, BytesMut};

use super::wire::WireReader;
use crate::error::{code, DriverError};

/// Fixed value opening every frame
pub const MAGIC_NUMBER: i32 = 65021048;

/// Offset added to general statement numbers from protocol version 2 on
pub const STATEMENT_NUMBER_OFFSET: i32 = 100;

/// Length of the address-echo prefix including the body length field
pub fn ee_head_len(ipv6: bool) -> usize {
    if ipv6 {
        32
    } else {
        20
    }
}

/// Total request head length
pub fn request_head_len(ipv6: bool, large_statement_id: bool) -> usize {
    ee_head_len(ipv6) + 8 + statement_id_len(large_statement_id)
}

pub fn statement_id_len(large_statement_id: bool) -> usize {
    if large_statement_id {
        8
    } else {
        4
    }
}

/// Negotiable protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(i32);

impl ProtocolVersion {
    pub const SUPPORTED: [i32; 10] = [1, 2, 3, 4, 5, 6, 8, 13, 14, 15];
    pub const LATEST: Self = Self(15);

    /// Alternative version announced by SQL connections
    pub const SQL_ALTERNATIVE: i32 = -9;

    pub fn is_supported(version: i32) -> bool {
        Self::SUPPORTED.contains(&version)
    }

    pub fn new(version: i32) -> Result<Self, DriverError> {
        if !Self::is_supported(version) {
            return Err(DriverError::config(
                code::ILLEGAL_PARAMETER,
                format!("Unsupported protocol version (version={})", version),
            ));
        }
        Ok(Self(version))
    }

    pub fn number(self) -> i32 {
        self.0
    }

    /// Statement id width for a statement on this version
    ///
    /// The very first statement on a socket is sent before any version is
    /// agreed and always uses the narrow width.
    pub fn is_statement_id_large(self, first_statement: bool) -> bool {
        !first_statement && self.0 >= 3
    }

    pub fn is_optional_request_enabled(self) -> bool {
        self.0 >= 3
    }

    pub fn is_client_id_on_login_enabled(self) -> bool {
        self.0 >= 13
    }

    pub fn is_database_id_enabled(self) -> bool {
        self.0 >= 14
    }

    fn statement_number_offset(self) -> i32 {
        if self.0 >= 2 {
            STATEMENT_NUMBER_OFFSET
        } else {
            0
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session-level statements shared by every node connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneralStatement {
    Connect = 0,
    Disconnect = 1,
    Login = 2,
    Logout = 3,
}

/// Statement type number as carried in the frame head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementType(i32);

impl StatementType {
    pub const SQL_EXECUTE: Self = Self(400);
    pub const SQL_CANCEL: Self = Self(401);

    pub fn general(statement: GeneralStatement, version: ProtocolVersion) -> Self {
        Self(statement as i32 + version.statement_number_offset())
    }

    pub fn from_number(number: i32) -> Self {
        Self(number)
    }

    pub fn number(self) -> i32 {
        self.0
    }

    /// Label used for logs and metrics
    pub fn name(self) -> &'static str {
        match self.0 {
            0 | 100 => "CONNECT",
            1 | 101 => "DISCONNECT",
            2 | 102 => "LOGIN",
            3 | 103 => "LOGOUT",
            400 => "SQL_EXECUTE",
            401 => "SQL_CANCEL",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Request frame head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub body_length: u32,
    pub statement_type: StatementType,
    pub partition_id: i32,
    pub statement_id: i64,
}

impl FrameHeader {
    pub fn new(statement_type: StatementType, partition_id: i32, statement_id: i64) -> Self {
        Self {
            body_length: 0,
            statement_type,
            partition_id,
            statement_id,
        }
    }

    /// Encode the head, leaving `body_length` as currently set
    pub fn encode(&self, dst: &mut BytesMut, ipv6: bool, large_statement_id: bool) {
        dst.put_i32_le(MAGIC_NUMBER);
        if ipv6 {
            dst.put_i64_le(0);
            dst.put_i64_le(0);
        } else {
            dst.put_i32_le(0);
        }
        dst.put_i32_le(0);
        dst.put_i32_le(-1);
        dst.put_i32_le(self.body_length as i32);
        dst.put_i32_le(self.statement_type.number());
        dst.put_i32_le(self.partition_id);
        if large_statement_id {
            dst.put_i64_le(self.statement_id);
        } else {
            dst.put_i32_le(self.statement_id as i32);
        }
    }

    /// Decode a request head, failing on a magic number mismatch
    pub fn decode(src: &[u8], ipv6: bool, large_statement_id: bool) -> Result<Self, DriverError> {
        let ee_len = ee_head_len(ipv6);
        let mut reader = WireReader::new(bytes::Bytes::copy_from_slice(src));
        check_magic(reader.get_i32()?)?;
        reader.get_bytes(ee_len - 8)?;
        let body_length = reader.get_i32()?;
        if body_length < 0 {
            return Err(DriverError::protocol(format!(
                "Protocol error by negative body length (length={})",
                body_length
            )));
        }
        let statement_type = StatementType::from_number(reader.get_i32()?);
        let partition_id = reader.get_i32()?;
        let statement_id = read_statement_id(&mut reader, large_statement_id)?;
        Ok(Self {
            body_length: body_length as u32,
            statement_type,
            partition_id,
            statement_id,
        })
    }
}

/// Encode a head with a zero body length for later backpatching
pub fn encode_header(
    statement_type: StatementType,
    partition_id: i32,
    statement_id: i64,
    first_statement: bool,
    version: ProtocolVersion,
    ipv6: bool,
) -> BytesMut {
    let large = version.is_statement_id_large(first_statement);
    let mut buf = BytesMut::with_capacity(request_head_len(ipv6, large));
    FrameHeader::new(statement_type, partition_id, statement_id).encode(&mut buf, ipv6, large);
    buf
}

pub(crate) fn check_magic(magic: i32) -> Result<(), DriverError> {
    if magic != MAGIC_NUMBER {
        return Err(DriverError::protocol(format!(
            "Protocol error by illegal magic number (expected={}, actual={})",
            MAGIC_NUMBER, magic
        )));
    }
    Ok(())
}

pub(crate) fn read_statement_id(
    reader: &mut WireReader,
    large_statement_id: bool,
) -> Result<i64, DriverError> {
    if large_statement_id {
        reader.get_i64()
    } else {
        Ok(reader.get_i32()? as i64)
    }
}

/// Outcome byte opening every response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementResult {
    Success,
    StatementError,
    NodeError,
    Deny,
    Unknown(u8),
}

impl From<u8> for StatementResult {
    fn from(value: u8) -> Self {
        match value {
            0 => StatementResult::Success,
            1 => StatementResult::StatementError,
            2 => StatementResult::NodeError,
            3 => StatementResult::Deny,
            other => StatementResult::Unknown(other),
        }
    }
}

impl fmt::Display for StatementResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatementResult::Success => write!(f, "SUCCESS"),
            StatementResult::StatementError => write!(f, "STATEMENT_ERROR"),
            StatementResult::NodeError => write!(f, "NODE_ERROR"),
            StatementResult::Deny => write!(f, "DENY"),
            StatementResult::Unknown(v) => write!(f, "UNKNOWN({})", v),
        }
    }
}
