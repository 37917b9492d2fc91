use std::fmt;

/// Operation carried by one SQL execute request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementOperation {
    Execute,
    Prepare,
    Query,
    Update,
    Pragma,
    Fetch,
    Close,
}

impl StatementOperation {
    /// Wire ordinal
    pub fn ordinal(self) -> i32 {
        match self {
            Self::Execute => 0,
            Self::Prepare => 1,
            Self::Query => 2,
            Self::Update => 3,
            Self::Pragma => 4,
            Self::Fetch => 5,
            Self::Close => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Execute => "EXECUTE",
            Self::Prepare => "PREPARE",
            Self::Query => "QUERY",
            Self::Update => "UPDATE",
            Self::Pragma => "PRAGMA",
            Self::Fetch => "FETCH",
            Self::Close => "CLOSE",
        }
    }

    /// Whether a result with or without a table is valid for this operation
    ///
    /// | operation | table found | no table |
    /// |-----------|-------------|----------|
    /// | EXECUTE, PRAGMA, PREPARE | yes | yes |
    /// | QUERY, FETCH | yes | no |
    /// | UPDATE, CLOSE | no | yes |
    pub fn accepts(self, table_found: bool) -> bool {
        match self {
            Self::Execute | Self::Pragma | Self::Prepare => true,
            Self::Query | Self::Fetch => table_found,
            Self::Update | Self::Close => !table_found,
        }
    }

    /// Whether a prepared statement can be prepared again to run this operation
    pub fn is_refreshable(self) -> bool {
        matches!(self, Self::Execute | Self::Query | Self::Update)
    }
}

impl fmt::Display for StatementOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the node should look up the query named by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Auto,
    /// Register a new query id
    Create,
    /// Resume a query id registered earlier on the same session
    Get,
}

impl SessionMode {
    pub fn ordinal(self) -> u8 {
        match self {
            Self::Auto => 0,
            Self::Create => 1,
            Self::Get => 2,
        }
    }
}

/// Allocate the next query id, skipping 0
pub(crate) fn next_query_id(last: &mut i64) -> i64 {
    *last = last.wrapping_add(1);
    if *last == 0 {
        *last = 1;
    }
    *last
}
