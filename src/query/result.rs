use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::operation::StatementOperation;
use crate::error::DriverError;
use crate::protocol::{WireReader, WireWrite};

/// One page of a result table as sent by the node
///
/// Schema and row bytes are opaque to the driver; a [`RowCodec`] turns
/// them into rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPage {
    /// More rows can be fetched with the same query id
    pub following_exists: bool,
    pub row_count: i32,
    pub schema: Bytes,
    /// Base offset of variable-size data within `rows`
    pub var_data_base_offset: i64,
    pub rows: Bytes,
}

/// Outcome of one SQL statement within a response
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub query_id: i64,
    pub update_count: i32,
    pub parameter_count: i32,
    pub page: Option<ResultPage>,
}

impl QueryResult {
    pub fn table_found(&self) -> bool {
        self.page.is_some()
    }

    fn read(reader: &mut WireReader, query_id: i64) -> Result<Self, DriverError> {
        let update_count = reader.get_i32()?;
        let parameter_count = reader.get_i32()?;
        let page = if reader.get_bool()? {
            let following_exists = reader.get_bool()?;
            let row_count = reader.get_i32()?;
            let schema = reader.get_sized_bytes()?;
            let mut row_set = reader.get_sized_bytes()?;
            let var_data_base_offset = if row_set.len() >= 8 {
                row_set.get_i64_le()
            } else if row_count > 0 {
                return Err(DriverError::protocol(format!(
                    "Protocol error by truncated row set (rowCount={}, size={})",
                    row_count,
                    row_set.len()
                )));
            } else {
                0
            };
            Some(ResultPage {
                following_exists,
                row_count,
                schema,
                var_data_base_offset,
                rows: row_set,
            })
        } else {
            None
        };
        Ok(Self {
            query_id,
            update_count,
            parameter_count,
            page,
        })
    }
}

/// Decoded body of a SQL execute response
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteResponse {
    pub transaction_started: bool,
    pub auto_commit: bool,
    pub results: Vec<QueryResult>,
    /// Every result matched the table expectation of the operation
    pub acceptable: bool,
    /// Environment entries reported by the node
    pub remote_env: Option<BTreeMap<String, String>>,
}

impl ExecuteResponse {
    pub fn read(
        reader: &mut WireReader,
        query_id: i64,
        operation: StatementOperation,
    ) -> Result<Self, DriverError> {
        let transaction_started = reader.get_bool()?;
        let auto_commit = reader.get_bool()?;
        let count = reader.get_size()?;

        let mut acceptable = true;
        let mut results = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let result = QueryResult::read(reader, query_id)?;
            acceptable &= operation.accepts(result.table_found());
            results.push(result);
        }

        let remote_env = if reader.has_remaining() {
            read_remote_env(reader)?
        } else {
            None
        };

        Ok(Self {
            transaction_started,
            auto_commit,
            results,
            acceptable,
            remote_env,
        })
    }
}

fn read_remote_env(reader: &mut WireReader) -> Result<Option<BTreeMap<String, String>>, DriverError> {
    let count = reader.get_i32()?;
    if count <= 0 {
        return Ok(None);
    }
    let mut env = BTreeMap::new();
    for _ in 0..count {
        let key = reader.get_string()?;
        let value = reader.get_string()?;
        env.insert(key, value);
    }
    Ok(Some(env))
}

/// Server-side SQL environment remembered across reconnects
///
/// Entries learned from responses are replayed to a new node session
/// until a response reports every known key again.
#[derive(Debug, Clone, Default)]
pub struct RemoteEnv {
    entries: BTreeMap<String, String>,
    lost: bool,
    epoch: u64,
}

impl RemoteEnv {
    /// Note the epoch of the session about to be used
    pub fn observe_epoch(&mut self, epoch: u64) {
        if self.epoch != 0 && self.epoch != epoch {
            self.lost = true;
        }
        self.epoch = epoch;
    }

    /// Entries to re-send, when the node session changed since they were learned
    pub fn pending(&self) -> Option<&BTreeMap<String, String>> {
        (self.lost && !self.entries.is_empty()).then_some(&self.entries)
    }

    pub fn accept(&mut self, env: BTreeMap<String, String>) {
        let recovered = self.lost && self.entries.keys().all(|k| env.contains_key(k));
        self.entries.extend(env);
        if recovered {
            self.lost = false;
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Encode as the value of the SQL environment request option
    pub fn export(env: &BTreeMap<String, String>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32_le(env.len() as i32);
        for (key, value) in env {
            buf.put_string(key);
            buf.put_string(value);
        }
        buf.freeze()
    }
}

/// Decoder of opaque result pages, supplied by the application
pub trait RowCodec {
    type Row;

    /// Decode the rows of one page, in order
    fn decode_page(&self, page: &ResultPage) -> Result<Vec<Self::Row>, DriverError>;
}
