use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::connection::ConnectionCore;
use super::cursor::ResultCursor;
use super::operation::{next_query_id, SessionMode, StatementOperation};
use super::pool::{QueryRef, SlotId};
use super::result::{ExecuteResponse, QueryResult, RemoteEnv, ResultPage, RowCodec};
use crate::error::{code, DriverError};
use crate::failover::{AttemptContext, FailoverAttempt};
use crate::heartbeat::CancelHandle;
use crate::protocol::options::SQL_ENVIRONMENT;
use crate::protocol::{OptionalRequest, RequestOption, StatementType, WireWrite};

/// Bound parameter rows sent with a prepared statement
///
/// `schema` and `rows` are produced by the application's row encoder; the
/// driver only frames them.
#[derive(Debug, Clone, PartialEq)]
pub struct InputRows {
    pub row_count: i64,
    pub schema: Bytes,
    pub rows: Bytes,
}

impl InputRows {
    fn format(&self, dst: &mut BytesMut) {
        if self.row_count <= 0 {
            dst.put_bool(false);
            return;
        }
        dst.put_bool(true);
        dst.put_i64_le(self.row_count);
        dst.put_i32_le(self.schema.len() as i32);
        dst.put_slice(&self.schema);
        dst.put_i32_le(8 + self.rows.len() as i32);
        dst.put_i64_le(0);
        dst.put_slice(&self.rows);
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Prepared {
    sql: String,
    parameter_count: i32,
}

/// Fixed fields at the start of every SQL execute request
#[derive(Debug, Clone, Copy)]
struct RequestHead {
    mode: SessionMode,
    operation: StatementOperation,
    query_id: i64,
    old_query_id: i64,
    transaction_started: bool,
    retry: bool,
}

fn encode_body(
    uuid: &Uuid,
    head: RequestHead,
    input: Option<&InputRows>,
    options: &OptionalRequest,
    sql: Option<&[String]>,
) -> Bytes {
    let mut body = BytesMut::with_capacity(128);
    body.put_uuid(uuid);
    body.put_u8(head.mode.ordinal());
    body.put_i32_le(head.operation.ordinal());
    body.put_i64_le(head.query_id);
    body.put_i64_le(head.old_query_id);
    body.put_bool(head.transaction_started);
    body.put_bool(head.retry);
    match input {
        Some(rows) => rows.format(&mut body),
        None => body.put_bool(false),
    }
    options.format(&mut body);
    match sql {
        Some(list) => {
            body.put_i32_le(list.len() as i32);
            for statement in list {
                body.put_string(statement);
            }
        }
        None => body.put_i32_le(0),
    }
    body.freeze()
}

/// Statement timeout option value: remaining millis, 0 when unbounded
fn timeout_millis(remaining: Option<Duration>) -> i32 {
    remaining.map_or(0, |t| t.as_millis().min(i32::MAX as u128) as i32)
}

/// One SQL round trip, runnable again after failover
struct SqlRequest<'a> {
    operation: StatementOperation,
    new_query: bool,
    query: &'a mut QueryRef,
    last_query_id: &'a mut i64,
    env: &'a mut RemoteEnv,
    uuid: Uuid,
    transaction_started: bool,
    database: Option<&'a str>,
    sql: &'a [String],
    prepared: Option<&'a Prepared>,
    input: Option<&'a InputRows>,
    fetch_size: i64,
    max_rows: i64,
}

impl SqlRequest<'_> {
    /// Prepare the statement again on a session that does not know it
    fn refresh(&mut self, ctx: &mut AttemptContext<'_>) -> Result<(), DriverError> {
        let prepared = match self.prepared {
            Some(p) if self.operation.is_refreshable() => p,
            _ => return Err(ctx.unrecoverable(self.operation.name())),
        };
        self.query.query_id = next_query_id(self.last_query_id);
        debug!(
            query_id = self.query.query_id,
            epoch = ctx.epoch(),
            "Preparing statement again on new node session"
        );
        let sql = std::slice::from_ref(&prepared.sql);
        self.round_trip(ctx, StatementOperation::Prepare, SessionMode::Create, 0, Some(sql))?;
        Ok(())
    }

    fn round_trip(
        &mut self,
        ctx: &mut AttemptContext<'_>,
        operation: StatementOperation,
        mode: SessionMode,
        old_query_id: i64,
        sql: Option<&[String]>,
    ) -> Result<ExecuteResponse, DriverError> {
        let query_id = self.query.query_id;
        let head = RequestHead {
            mode,
            operation,
            query_id,
            old_query_id,
            transaction_started: self.transaction_started,
            retry: ctx.is_retry(),
        };

        let mut options = OptionalRequest::new();
        options.put(RequestOption::StatementTimeout(timeout_millis(ctx.remaining())));
        options.put(RequestOption::FetchLimit(self.max_rows));
        options.put(RequestOption::FetchSize(self.fetch_size));
        if let Some(database) = self.database {
            options.put(RequestOption::DbName(database.to_string()));
        }
        if let Some(env) = self.env.pending() {
            options.put_ext(SQL_ENVIRONMENT, RemoteEnv::export(env))?;
        }

        let input = self.input.filter(|_| operation != StatementOperation::Prepare);
        let body = encode_body(&self.uuid, head, input, &options, sql);

        ctx.start_query(query_id)?;
        let partition_id = ctx.partition_id();
        let mut reader = ctx
            .session()
            .execute_statement(StatementType::SQL_EXECUTE, partition_id, body)?;
        let resp = ExecuteResponse::read(&mut reader, query_id, operation)?;
        if let Some(env) = &resp.remote_env {
            self.env.accept(env.clone());
        }
        Ok(resp)
    }
}

impl FailoverAttempt for SqlRequest<'_> {
    type Output = ExecuteResponse;

    fn operation_name(&self) -> &'static str {
        self.operation.name()
    }

    fn attempt(&mut self, ctx: &mut AttemptContext<'_>) -> Result<ExecuteResponse, DriverError> {
        self.env.observe_epoch(ctx.epoch());
        if self.query.epoch != ctx.epoch() {
            self.query.query_id = 0;
            self.query.epoch = ctx.epoch();
        }

        if self.new_query {
            let old_query_id = self.query.query_id;
            self.query.query_id = next_query_id(self.last_query_id);
            let sql = self.sql;
            return self.round_trip(ctx, self.operation, SessionMode::Create, old_query_id, Some(sql));
        }

        if self.query.query_id == 0 {
            self.refresh(ctx)?;
        }
        self.round_trip(ctx, self.operation, SessionMode::Get, 0, None)
    }

    fn is_resumable(&self) -> bool {
        self.new_query || (self.prepared.is_some() && self.operation.is_refreshable())
    }
}

/// Statement execution against one logical connection
///
/// A session owns at most one server-side query id at a time. Issuing a
/// new statement replaces it, and the replaced id is closed by the same
/// round trip. Dropping the session queues its id for closing by a later
/// session of the connection.
pub struct QuerySession {
    core: Arc<Mutex<ConnectionCore>>,
    cancel: CancelHandle,
    slot: SlotId,
    sql: Vec<String>,
    results: Vec<QueryResult>,
    result_index: usize,
    prepared: Option<Prepared>,
    input: Option<InputRows>,
    query_timeout: Option<Duration>,
    fetch_size: i64,
    max_rows: i64,
    closed: bool,
}

impl QuerySession {
    pub(crate) fn new(core: Arc<Mutex<ConnectionCore>>, cancel: CancelHandle) -> Result<Self, DriverError> {
        let (slot, defaults) = {
            let mut guard = core.lock();
            guard.check_open()?;
            let epoch = guard.executor.epoch();
            let initial = guard.pool.pull().unwrap_or(QueryRef::new(0, epoch));
            (guard.pool.register(initial), guard.defaults.clone())
        };
        Ok(Self {
            core,
            cancel,
            slot,
            sql: Vec::new(),
            results: Vec::new(),
            result_index: 0,
            prepared: None,
            input: None,
            query_timeout: defaults.query_timeout,
            fetch_size: defaults.fetch_size,
            max_rows: defaults.max_rows,
            closed: false,
        })
    }

    /// Run one statement, returning whether it produced a result table
    pub fn execute(&mut self, sql: &str) -> Result<bool, DriverError> {
        self.run_direct(StatementOperation::Execute, vec![sql.to_string()])?;
        Ok(self.last_result()?.table_found())
    }

    /// Run several statements in one round trip
    pub fn execute_all(&mut self, statements: Vec<String>) -> Result<&[QueryResult], DriverError> {
        self.run_direct(StatementOperation::Execute, statements)?;
        Ok(&self.results)
    }

    /// Run a read-only statement
    pub fn query(&mut self, sql: &str) -> Result<&QueryResult, DriverError> {
        self.run_direct(StatementOperation::Query, vec![sql.to_string()])?;
        self.last_result()
    }

    /// Run a writing statement, returning the update count
    pub fn update(&mut self, sql: &str) -> Result<i32, DriverError> {
        self.run_direct(StatementOperation::Update, vec![sql.to_string()])?;
        Ok(self.last_result()?.update_count)
    }

    pub fn pragma(&mut self, sql: &str) -> Result<bool, DriverError> {
        self.run_direct(StatementOperation::Pragma, vec![sql.to_string()])?;
        Ok(self.last_result()?.table_found())
    }

    fn run_direct(&mut self, operation: StatementOperation, statements: Vec<String>) -> Result<(), DriverError> {
        self.prepared = None;
        self.input = None;
        self.sql = statements;
        self.execute_operation(operation, true)
    }

    /// Prepare `sql` on the node, returning its parameter count
    pub fn prepare(&mut self, sql: &str) -> Result<i32, DriverError> {
        self.prepared = None;
        self.input = None;
        self.sql = vec![sql.to_string()];
        self.execute_operation(StatementOperation::Prepare, true)?;
        let parameter_count = self.results.last().map_or(0, |r| r.parameter_count);
        self.results.clear();
        self.result_index = 0;
        self.prepared = Some(Prepared {
            sql: sql.to_string(),
            parameter_count,
        });
        Ok(parameter_count)
    }

    pub fn parameter_count(&self) -> Option<i32> {
        self.prepared.as_ref().map(|p| p.parameter_count)
    }

    /// Rows bound to the next prepared execution
    pub fn set_input_rows(&mut self, input: Option<InputRows>) {
        self.input = input;
    }

    /// Run the prepared statement as `operation`
    pub fn execute_prepared(&mut self, operation: StatementOperation) -> Result<&QueryResult, DriverError> {
        if self.prepared.is_none() {
            return Err(DriverError::statement(code::ILLEGAL_STATE, "Statement not prepared"));
        }
        if !operation.is_refreshable() {
            return Err(DriverError::config(
                code::ILLEGAL_PARAMETER,
                format!("Illegal operation for prepared statement (operation={})", operation),
            ));
        }
        self.execute_operation(operation, false)?;
        self.last_result()
    }

    /// Fetch the next page of the result table registered as `query_id`
    ///
    /// Results of the statement that produced the table are kept.
    pub fn fetch_following(&mut self, query_id: i64) -> Result<ResultPage, DriverError> {
        if query_id == 0 || query_id != self.query_id() {
            return Err(DriverError::statement(
                code::ALREADY_CLOSED,
                "Unable to fetch by already closed result set",
            ));
        }

        let results = std::mem::take(&mut self.results);
        let result_index = std::mem::replace(&mut self.result_index, 0);

        let fetched = self.execute_operation(StatementOperation::Fetch, false).and_then(|_| {
            self.results
                .get(self.result_index)
                .and_then(|r| r.page.clone())
                .ok_or_else(|| {
                    DriverError::statement(
                        code::SQL_MESSAGE_CORRUPTED,
                        "Protocol error occurred on fetching results",
                    )
                })
        });

        self.results = results;
        self.result_index = result_index;
        fetched
    }

    /// Close the active query and then `query_id` when it is another live id
    ///
    /// The session stays usable; its next statement allocates a new query id.
    pub fn close_query(&mut self, query_id: i64) -> Result<(), DriverError> {
        let epoch = self.core.lock().executor.epoch();
        let own = self.query_id();
        let pending = Some(query_id)
            .filter(|&id| id != 0 && id != own)
            .map(|id| QueryRef::new(id, epoch));
        self.close_with_pending(pending)
    }

    /// Close the active query, then `pending` when given
    pub(crate) fn close_with_pending(&mut self, pending: Option<QueryRef>) -> Result<(), DriverError> {
        self.sql.clear();
        self.prepared = None;
        self.input = None;
        let result = self.close_queries(pending);
        if let Some(query) = self.core.lock().pool.get_mut(self.slot) {
            query.query_id = 0;
        }
        result
    }

    fn close_queries(&mut self, pending: Option<QueryRef>) -> Result<(), DriverError> {
        if self.query_id() != 0 {
            self.execute_operation(StatementOperation::Close, false)?;
        }
        if let Some(query) = pending.filter(|q| q.query_id != 0) {
            if let Some(current) = self.core.lock().pool.get_mut(self.slot) {
                *current = query;
            }
            self.execute_operation(StatementOperation::Close, false)?;
        }
        Ok(())
    }

    fn execute_operation(&mut self, operation: StatementOperation, new_query: bool) -> Result<(), DriverError> {
        self.check_open()?;
        self.results.clear();
        self.result_index = 0;

        let core = self.core.clone();
        let mut guard = core.lock();
        guard.check_open()?;
        let ConnectionCore {
            executor,
            pool,
            uuid,
            last_query_id,
            transaction_started,
            auto_commit,
            remote_env,
            database,
            ..
        } = &mut *guard;

        let query = pool
            .get_mut(self.slot)
            .ok_or_else(|| DriverError::statement(code::ALREADY_CLOSED, "Already closed"))?;
        executor.set_owner_mode(*auto_commit);

        let mut request = SqlRequest {
            operation,
            new_query,
            query,
            last_query_id,
            env: remote_env,
            uuid: *uuid,
            transaction_started: *transaction_started,
            database: database.as_deref(),
            sql: &self.sql,
            prepared: self.prepared.as_ref(),
            input: self.input.as_ref(),
            fetch_size: self.fetch_size,
            max_rows: self.max_rows,
        };

        let resp = match executor.execute(&mut request, self.query_timeout) {
            Ok(resp) => resp,
            Err(e) => {
                if !e.is_connection() {
                    *transaction_started = false;
                }
                return Err(e);
            }
        };

        *transaction_started = resp.transaction_started;
        *auto_commit = resp.auto_commit;
        if !resp.acceptable {
            *transaction_started = false;
            let message = if operation == StatementOperation::Query {
                "Writable query specified for read only request"
            } else {
                "Read only query specified for writable request"
            };
            return Err(DriverError::statement(code::STATEMENT_CATEGORY_UNMATCHED, message));
        }

        self.results = resp.results;
        Ok(())
    }

    pub fn results(&self) -> &[QueryResult] {
        &self.results
    }

    /// The result currently selected
    pub fn last_result(&self) -> Result<&QueryResult, DriverError> {
        self.results
            .get(self.result_index)
            .ok_or_else(|| DriverError::statement(code::ILLEGAL_STATE, "Result set not found"))
    }

    /// Select the next result of a multi-statement execution
    pub fn more_results(&mut self) -> bool {
        if self.result_index < self.results.len() {
            self.result_index += 1;
        }
        self.result_index < self.results.len()
    }

    /// Query id currently owned by this session, or 0
    pub fn query_id(&self) -> i64 {
        self.core.lock().pool.get(self.slot).map_or(0, |q| q.query_id)
    }

    /// Read the selected result table row by row, fetching pages on demand
    pub fn cursor<C: RowCodec>(&mut self, codec: C) -> Result<ResultCursor<'_, C>, DriverError> {
        let result = self.last_result()?;
        let page = result
            .page
            .clone()
            .ok_or_else(|| DriverError::statement(code::ILLEGAL_STATE, "Result set not found"))?;
        let query_id = result.query_id;
        ResultCursor::new(self, codec, page, query_id)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout
    }

    pub fn set_query_timeout(&mut self, timeout: Option<Duration>) {
        self.query_timeout = timeout.filter(|t| !t.is_zero());
    }

    pub fn set_fetch_size(&mut self, fetch_size: i64) {
        self.fetch_size = fetch_size.max(0);
    }

    pub fn set_max_rows(&mut self, max_rows: i64) {
        self.max_rows = max_rows.max(0);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the session; its query id is closed by a later session
    pub fn close(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut core = self.core.lock();
        let epoch = core.executor.epoch();
        core.pool.detach(self.slot, epoch);
    }

    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::statement(code::ALREADY_CLOSED, "Already closed"));
        }
        Ok(())
    }
}

impl Drop for QuerySession {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for QuerySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySession")
            .field("slot", &self.slot)
            .field("sql", &self.sql)
            .field("results", &self.results.len())
            .field("prepared", &self.prepared.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
