//! Driver error taxonomy
//!
//! Every failure surfaced to callers is one of five kinds. The kind drives
//! retry decisions; the numeric code and sub code are diagnostics only.

pub mod code;

use std::collections::BTreeMap;
use std::fmt;

/// Code, symbolic name, description and contextual parameters of a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Main error code (low 24 bits of the remote code)
    pub code: i32,
    /// Finer-grained classification reported by the remote node
    pub sub_code: i32,
    /// Symbolic name reported by the remote node, if any
    pub name: Option<String>,
    /// Human readable description, including the `(key=value, ...)` suffix
    pub message: String,
    /// Contextual parameters such as peer address or partition id
    pub parameters: BTreeMap<String, String>,
}

impl ErrorDetail {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            sub_code: 0,
            name: None,
            message: message.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Symbolic name, falling back to the local code table
    pub fn symbolic_name(&self) -> Option<&str> {
        self.name.as_deref().or_else(|| code::name_of(self.code))
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.symbolic_name() {
            Some(name) => write!(f, "[{}:{}] {}", self.code, name, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// Driver errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// Capability mismatch or illegal settings; never retried
    #[error("Configuration error {0}")]
    Config(ErrorDetail),

    /// Malformed or uncorrelated frame; the connection is discarded
    #[error("Protocol error {0}")]
    Protocol(ErrorDetail),

    /// Socket failure or timeout; retried within the failover budget
    #[error("Connection error {0}")]
    Connection(ErrorDetail),

    /// Statement rejected by the remote node; never retried
    #[error("Statement error {0}")]
    Statement(ErrorDetail),

    /// Request reached a node that does not own the target
    #[error("Wrong node error {0}")]
    WrongNode(ErrorDetail),
}

impl DriverError {
    pub fn config(code: i32, message: impl Into<String>) -> Self {
        Self::Config(ErrorDetail::new(code, message))
    }

    /// Protocol violation with the corrupted-message code
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(ErrorDetail::new(code::MESSAGE_CORRUPTED, message))
    }

    pub fn connection(code: i32, message: impl Into<String>) -> Self {
        Self::Connection(ErrorDetail::new(code, message))
    }

    pub fn statement(code: i32, message: impl Into<String>) -> Self {
        Self::Statement(ErrorDetail::new(code, message))
    }

    /// Same kind and code with a replaced message
    pub fn with_message(&self, message: impl Into<String>) -> Self {
        let mut detail = self.detail().clone();
        detail.message = message.into();
        match self {
            Self::Config(_) => Self::Config(detail),
            Self::Protocol(_) => Self::Protocol(detail),
            Self::Connection(_) => Self::Connection(detail),
            Self::Statement(_) => Self::Statement(detail),
            Self::WrongNode(_) => Self::WrongNode(detail),
        }
    }

    pub fn detail(&self) -> &ErrorDetail {
        match self {
            Self::Config(d)
            | Self::Protocol(d)
            | Self::Connection(d)
            | Self::Statement(d)
            | Self::WrongNode(d) => d,
        }
    }

    pub fn code(&self) -> i32 {
        self.detail().code
    }

    pub fn message(&self) -> &str {
        &self.detail().message
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub fn is_wrong_node(&self) -> bool {
        matches!(self, Self::WrongNode(_))
    }

    /// Whether this error was produced by a remote rejection with a complete response
    pub fn is_remote_rejection(&self) -> bool {
        matches!(self, Self::Statement(_) | Self::WrongNode(_))
    }

    /// Label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Protocol(_) => "protocol",
            Self::Connection(_) => "connection",
            Self::Statement(_) => "statement",
            Self::WrongNode(_) => "wrong_node",
        }
    }
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        Self::connection(
            code::BAD_CONNECTION,
            format!("Connection problem occurred by I/O error (reason={})", e),
        )
    }
}
