//! Numeric error codes raised locally by the driver
//!
//! Remote errors carry their own codes; these cover failures detected on the
//! client side and serve as defaults when a remote payload reports code 0.

pub const INTERNAL_ERROR: i32 = 145000;
pub const EMPTY_PARAMETER: i32 = 145001;
pub const ILLEGAL_PARAMETER: i32 = 145002;
pub const ILLEGAL_PROPERTY_ENTRY: i32 = 145005;
pub const ILLEGAL_VALUE_FORMAT: i32 = 145006;
pub const BAD_STATEMENT: i32 = 145027;
pub const BAD_CONNECTION: i32 = 145028;
pub const CONNECTION_TIMEOUT: i32 = 145029;
pub const WRONG_NODE: i32 = 145030;
pub const MESSAGE_CORRUPTED: i32 = 145031;
pub const ILLEGAL_CONFIG: i32 = 145044;

pub const ALREADY_CLOSED: i32 = 147004;
pub const ILLEGAL_STATE: i32 = 147010;
pub const STATEMENT_CATEGORY_UNMATCHED: i32 = 147012;
pub const SQL_MESSAGE_CORRUPTED: i32 = 147013;

/// Symbolic name for a locally known code
pub fn name_of(code: i32) -> Option<&'static str> {
    let name = match code {
        INTERNAL_ERROR => "GS_INTERNAL_ERROR",
        EMPTY_PARAMETER => "GS_EMPTY_PARAMETER",
        ILLEGAL_PARAMETER => "GS_ILLEGAL_PARAMETER",
        ILLEGAL_PROPERTY_ENTRY => "GS_ILLEGAL_PROPERTY_ENTRY",
        ILLEGAL_VALUE_FORMAT => "GS_ILLEGAL_VALUE_FORMAT",
        BAD_STATEMENT => "GS_BAD_STATEMENT",
        BAD_CONNECTION => "GS_BAD_CONNECTION",
        CONNECTION_TIMEOUT => "GS_CONNECTION_TIMEOUT",
        WRONG_NODE => "GS_WRONG_NODE",
        MESSAGE_CORRUPTED => "GS_MESSAGE_CORRUPTED",
        ILLEGAL_CONFIG => "GS_ILLEGAL_CONFIG",
        ALREADY_CLOSED => "SQL_ALREADY_CLOSED",
        ILLEGAL_STATE => "SQL_ILLEGAL_STATE",
        STATEMENT_CATEGORY_UNMATCHED => "SQL_STATEMENT_CATEGORY_UNMATCHED",
        SQL_MESSAGE_CORRUPTED => "SQL_MESSAGE_CORRUPTED",
        _ => return None,
    };
    Some(name)
}
