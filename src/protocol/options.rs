//! Extensible per-statement options block
//!
//! Layout: i32 total size (or a single `0` when empty), then `{i16 id, value}`
//! entries ordered by id. Entries at or above [`RANGE_START_ID`] are grouped
//! per thousand, each group opened by an i16 range id and an i32 group size.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::wire::WireWrite;
use crate::error::{code, DriverError};

pub const RANGE_SIZE: i32 = 1000;
pub const RANGE_START_ID: i32 = RANGE_SIZE * 11;

/// Extension id carrying the remembered server-side SQL environment
pub const SQL_ENVIRONMENT: i32 = 14001;

/// Typed option entry
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOption {
    LegacyVersionBlock(u8),
    TransactionTimeout(i32),
    DbName(String),
    StatementTimeout(i32),
    FetchLimit(i64),
    FetchSize(i64),
    FeatureVersion(i32),
    AcceptableFeatureVersion(i32),
    ApplicationName(String),
    StoreMemoryAgingSwapRate(f64),
    TimeZoneOffset(i64),
    AuthenticationType(u8),
    ConnectionRoute(u8),
}

impl RequestOption {
    pub fn id(&self) -> i32 {
        match self {
            RequestOption::LegacyVersionBlock(_) => 0,
            RequestOption::TransactionTimeout(_) => 1,
            RequestOption::DbName(_) => 5,
            RequestOption::StatementTimeout(_) => 10001,
            RequestOption::FetchLimit(_) => 10002,
            RequestOption::FetchSize(_) => 10003,
            RequestOption::FeatureVersion(_) => 11004,
            RequestOption::AcceptableFeatureVersion(_) => 11005,
            RequestOption::ApplicationName(_) => 11009,
            RequestOption::StoreMemoryAgingSwapRate(_) => 11010,
            RequestOption::TimeZoneOffset(_) => 11011,
            RequestOption::AuthenticationType(_) => 11012,
            RequestOption::ConnectionRoute(_) => 11013,
        }
    }

    fn put_value(&self, dst: &mut BytesMut) {
        match self {
            RequestOption::LegacyVersionBlock(v)
            | RequestOption::AuthenticationType(v)
            | RequestOption::ConnectionRoute(v) => dst.put_u8(*v),
            RequestOption::TransactionTimeout(v)
            | RequestOption::StatementTimeout(v)
            | RequestOption::FeatureVersion(v)
            | RequestOption::AcceptableFeatureVersion(v) => dst.put_i32_le(*v),
            RequestOption::FetchLimit(v)
            | RequestOption::FetchSize(v)
            | RequestOption::TimeZoneOffset(v) => dst.put_i64_le(*v),
            RequestOption::DbName(v) | RequestOption::ApplicationName(v) => dst.put_string(v),
            RequestOption::StoreMemoryAgingSwapRate(v) => dst.put_f64_le(*v),
        }
    }
}

/// Options block builder
#[derive(Debug, Clone, Default)]
pub struct OptionalRequest {
    entries: BTreeMap<i32, RequestOption>,
    ext: BTreeMap<i32, Bytes>,
}

impl OptionalRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a typed entry
    pub fn put(&mut self, option: RequestOption) {
        self.entries.insert(option.id(), option);
    }

    /// Insert a pre-formatted extension entry
    pub fn put_ext(&mut self, id: i32, value: impl Into<Bytes>) -> Result<(), DriverError> {
        if id <= RANGE_START_ID || id >= i16::MAX as i32 {
            return Err(DriverError::config(
                code::ILLEGAL_PARAMETER,
                format!("Illegal extension option id (id={})", id),
            ));
        }
        self.ext.insert(id, value.into());
        Ok(())
    }

    pub fn put_feature_version(&mut self, version: i32) {
        self.put(RequestOption::LegacyVersionBlock(1));
        self.put(RequestOption::FeatureVersion(version));
    }

    pub fn put_acceptable_feature_version(&mut self, version: i32) {
        self.put(RequestOption::AcceptableFeatureVersion(version));
    }

    /// Copy every entry of `other` into this request
    pub fn merge(&mut self, other: &OptionalRequest) {
        for (id, option) in &other.entries {
            self.entries.insert(*id, option.clone());
        }
        for (id, value) in &other.ext {
            self.ext.insert(*id, value.clone());
        }
    }

    pub fn get(&self, id: i32) -> Option<&RequestOption> {
        self.entries.get(&id)
    }

    pub fn has_options(&self) -> bool {
        !self.entries.is_empty() || !self.ext.is_empty()
    }

    pub fn format(&self, dst: &mut BytesMut) {
        if !self.has_options() {
            dst.put_i32_le(0);
            return;
        }

        let head_pos = dst.reserve_i32();
        let body_pos = dst.len();

        let mut last_range_id = 0;
        let mut range_head_pos = 0;
        let mut range_body_pos = 0;

        let typed = self.entries.iter().map(|(id, v)| (*id, Entry::Typed(v)));
        let ext = self.ext.iter().map(|(id, v)| (*id, Entry::Ext(v)));
        for (id, entry) in typed.chain(ext) {
            if id >= RANGE_START_ID {
                let range_id = id / RANGE_SIZE;
                if range_id != last_range_id {
                    if last_range_id != 0 {
                        close_group(dst, range_head_pos, range_body_pos);
                    }
                    dst.put_i16_le((range_id * RANGE_SIZE) as i16);
                    range_head_pos = dst.reserve_i32();
                    range_body_pos = dst.len();
                    last_range_id = range_id;
                }
            }

            dst.put_i16_le(id as i16);
            match entry {
                Entry::Typed(option) => option.put_value(dst),
                Entry::Ext(bytes) => dst.extend_from_slice(bytes),
            }
        }

        if last_range_id != 0 {
            close_group(dst, range_head_pos, range_body_pos);
        }
        close_group(dst, head_pos, body_pos);
    }
}

enum Entry<'a> {
    Typed(&'a RequestOption),
    Ext(&'a Bytes),
}

fn close_group(dst: &mut BytesMut, head_pos: usize, body_pos: usize) {
    let size = dst.len() - body_pos;
    dst.patch_i32(head_pos, size as i32);
}
