use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio_util::codec::Encoder;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{code, DriverError};
use crate::metrics::metrics;
use crate::protocol::{FrameCodec, FrameHeader, ProtocolVersion, RequestFrame, StatementType, WireWrite};
use crate::transport::NodeStream;

/// Capability injected into a transport session to observe head waits
///
/// Calls arrive on the thread driving the statement. Implementations must
/// serialize their own access to any socket handle they keep.
pub trait SessionHook: Send + Sync {
    /// A response head is about to be awaited for `statement_id`
    fn start_head_receiving(&self, _link: &mut NodeStream, _statement_id: i64) -> Result<(), DriverError> {
        Ok(())
    }

    /// The head wait finished, successfully or not
    fn end_head_receiving(&self) {}

    /// A heartbeat probe is about to be sent after `elapsed` waiting
    fn prepare_heartbeat(&self, _link: &mut NodeStream, _elapsed: Duration) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Hook for sessions that never cancel
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl SessionHook for NoopHook {}

#[derive(Debug)]
struct RunningQuery {
    partition_id: i32,
    query_id: i64,
    timeout: Option<Duration>,
    elapsed: Option<Duration>,
    cancel_requested: bool,
    cancel_sent: bool,
}

#[derive(Debug, Default)]
struct HookState {
    writer: Option<TcpStream>,
    ipv6: bool,
    statement_id: i64,
    query: Option<RunningQuery>,
}

/// Cancellation-aware hook shared by one logical connection
///
/// Tracks the running query and the statement id currently awaiting a
/// head. A cancel request is written immediately when a writer is live,
/// otherwise it stays pending until the next head wait or heartbeat.
#[derive(Debug)]
pub struct QueryHook {
    uuid: Uuid,
    version: ProtocolVersion,
    state: Mutex<HookState>,
}

impl QueryHook {
    pub fn new(uuid: Uuid, version: ProtocolVersion) -> Arc<Self> {
        Arc::new(Self {
            uuid,
            version,
            state: Mutex::new(HookState::default()),
        })
    }

    pub fn cancel_handle(self: &Arc<Self>) -> CancelHandle {
        CancelHandle { hook: self.clone() }
    }

    pub fn start_query(&self, partition_id: i32, query_id: i64, timeout: Option<Duration>) {
        self.state.lock().query = Some(RunningQuery {
            partition_id,
            query_id,
            timeout,
            elapsed: None,
            cancel_requested: false,
            cancel_sent: false,
        });
    }

    pub fn end_query(&self) {
        self.state.lock().query = None;
    }

    /// Wait time measured by heartbeats for the running query
    pub fn elapsed(&self) -> Option<Duration> {
        self.state.lock().query.as_ref().and_then(|q| q.elapsed)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state
            .lock()
            .query
            .as_ref()
            .is_some_and(|q| q.cancel_requested)
    }

    fn request_cancel(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let Some(query) = state.query.as_mut() else {
            debug!("Cancel requested without a running query");
            return Ok(());
        };
        if query.cancel_requested {
            return Ok(());
        }
        query.cancel_requested = true;

        let frame = self.cancel_frame(&state);
        let Some(frame) = frame else {
            return Ok(());
        };
        let Some(writer) = state.writer.as_mut() else {
            return Ok(());
        };
        writer.write_all(&frame).map_err(|e| send_error(e.to_string()))?;
        mark_sent(&mut state);
        Ok(())
    }

    fn flush_pending(&self, state: &mut HookState, link: &mut NodeStream) -> Result<(), DriverError> {
        let pending = state
            .query
            .as_ref()
            .is_some_and(|q| q.cancel_requested && !q.cancel_sent);
        if !pending {
            return Ok(());
        }
        if let Some(frame) = self.cancel_frame(state) {
            link.write_all(&frame)
                .and_then(|_| link.flush())
                .map_err(|e| send_error(e.to_string()))?;
            mark_sent(state);
        }
        Ok(())
    }

    fn cancel_frame(&self, state: &HookState) -> Option<BytesMut> {
        let query = state.query.as_ref()?;
        if state.statement_id == 0 {
            return None;
        }

        let mut body = BytesMut::with_capacity(24);
        body.put_uuid(&self.uuid);
        body.put_i64_le(query.query_id);

        let header = FrameHeader::new(StatementType::SQL_CANCEL, query.partition_id, state.statement_id);
        let large = self.version.is_statement_id_large(false);
        let mut buf = BytesMut::new();
        FrameCodec::new(state.ipv6)
            .encode(RequestFrame::new(header, large, body.freeze()), &mut buf)
            .ok()?;
        Some(buf)
    }
}

fn mark_sent(state: &mut HookState) {
    if let Some(query) = state.query.as_mut() {
        query.cancel_sent = true;
        debug!(query_id = query.query_id, statement_id = state.statement_id, "Cancel request sent");
    }
    metrics().cancel_requests.inc();
}

fn send_error(reason: String) -> DriverError {
    DriverError::connection(
        code::BAD_CONNECTION,
        format!("Failed to send cancel request (reason={})", reason),
    )
}

impl SessionHook for QueryHook {
    fn start_head_receiving(&self, link: &mut NodeStream, statement_id: i64) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.writer = link.out_of_band_writer();
        state.ipv6 = link.peer_addr().map(|a| a.is_ipv6()).unwrap_or(false);
        state.statement_id = statement_id;
        self.flush_pending(&mut state, link)
    }

    fn end_head_receiving(&self) {
        self.state.lock().writer = None;
    }

    fn prepare_heartbeat(&self, link: &mut NodeStream, elapsed: Duration) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if let Some(query) = state.query.as_mut() {
            query.elapsed = Some(elapsed);
            let expired = query.timeout.is_some_and(|t| !t.is_zero() && elapsed >= t);
            if expired && !query.cancel_requested {
                debug!(query_id = query.query_id, elapsed_ms = elapsed.as_millis() as u64, "Query timed out, cancelling");
                query.cancel_requested = true;
            }
        }
        self.flush_pending(&mut state, link)
    }
}

/// Thread-safe handle cancelling the running query of one connection
#[derive(Debug, Clone)]
pub struct CancelHandle {
    hook: Arc<QueryHook>,
}

impl CancelHandle {
    /// Request cancellation; delivery failures are logged, not surfaced
    pub fn cancel(&self) {
        if let Err(e) = self.hook.request_cancel() {
            warn!(error = %e, "Failed to deliver cancel request");
        }
    }
}
