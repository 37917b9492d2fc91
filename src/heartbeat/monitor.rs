use std::time::{Duration, Instant};

use tracing::info;

use crate::error::{code, DriverError};
use crate::metrics::metrics;
use crate::protocol::frame::read_statement_id;
use crate::protocol::{StatementType, WireReader};
use crate::transport::session::SPECIAL_PARTITION_ID;
use crate::transport::TransportSession;

/// How a heartbeat cycle ended
#[derive(Debug)]
pub enum HeartbeatOutcome {
    /// The head of the awaited response is now buffered
    HeadReady,
    /// The awaited response arrived while a probe was outstanding
    Resolved(WireReader),
}

impl TransportSession {
    /// Probe the node while the response to `org_id` is overdue
    ///
    /// Each round sends a CONNECT-shaped probe with a fresh statement id. A
    /// probe answer keeps the wait going; the awaited response arriving
    /// first is handed back once the probe answer has been drained. Remote
    /// statement and routing errors it carries are held until then.
    pub(crate) fn process_heartbeat(
        &mut self,
        org_type: StatementType,
        org_id: i64,
        partition_id: i32,
    ) -> Result<HeartbeatOutcome, DriverError> {
        let started = Instant::now();
        let initial = match self.statement_timeout() {
            Some(s) => s.min(self.heartbeat_timeout()),
            None => self.heartbeat_timeout(),
        };
        let probe_type = self.connect_type();
        let hook = self.hook();

        loop {
            let elapsed = started.elapsed() + initial;
            if let Some(statement_timeout) = self.statement_timeout() {
                if elapsed >= statement_timeout {
                    return Err(DriverError::connection(
                        code::CONNECTION_TIMEOUT,
                        format!(
                            "Connection timed out by statement timeout (elapsedMillis={}, statementTimeoutMillis={}, address={})",
                            elapsed.as_millis(),
                            statement_timeout.as_millis(),
                            self.address()
                        ),
                    ));
                }
            }

            hook.prepare_heartbeat(self.link(), elapsed)?;

            info!(
                statement = %org_type,
                address = %self.address(),
                partition_id,
                statement_id = org_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Heartbeat started"
            );
            metrics().heartbeats_sent.inc();

            let probe_id = self.next_statement_id();
            let body = self.probe_body();
            self.send(probe_type, SPECIAL_PARTITION_ID, probe_id, true, body)?;

            let frame = self.read_frame()?;
            let mut reader = WireReader::new(frame.payload);
            let resp_type = reader.get_i32()?;

            if resp_type == probe_type.number() {
                self.accept_probe(&mut reader, probe_id)?;
                self.record_heartbeat_received();

                match self.read_head() {
                    Ok(()) => return Ok(HeartbeatOutcome::HeadReady),
                    Err(e) if self.is_response_unacceptable() => {
                        return Err(after_heartbeat(elapsed, self.address(), &e));
                    }
                    Err(_) => continue,
                }
            }

            if resp_type != org_type.number() {
                return Err(self.illegal_statement_type());
            }

            let large = self.version().is_statement_id_large(false);
            if read_statement_id(&mut reader, large)? != org_id {
                return Err(self.illegal_statement_id());
            }
            let deferred = match self.check_result(&mut reader, partition_id) {
                Ok(()) => None,
                Err(e) if e.is_remote_rejection() => Some(e),
                Err(e) => return Err(e),
            };
            self.record_heartbeat_received();

            let frame = self.read_frame()?;
            let mut probe = WireReader::new(frame.payload);
            if probe.get_i32()? != probe_type.number() {
                return Err(self.illegal_statement_type());
            }
            self.accept_probe(&mut probe, probe_id)?;

            return match deferred {
                Some(e) => Err(e),
                None => Ok(HeartbeatOutcome::Resolved(reader)),
            };
        }
    }

    fn accept_probe(&self, reader: &mut WireReader, probe_id: i64) -> Result<(), DriverError> {
        if read_statement_id(reader, false)? != probe_id {
            return Err(self.illegal_statement_id());
        }
        self.check_result(reader, SPECIAL_PARTITION_ID).map_err(|e| {
            if matches!(e, DriverError::Protocol(_)) {
                return e;
            }
            DriverError::connection(
                code::BAD_CONNECTION,
                format!(
                    "Connection problem occurred by invalid heartbeat response (address={}, reason={})",
                    self.address(),
                    e.message()
                ),
            )
        })
    }
}

fn after_heartbeat(elapsed: Duration, address: std::net::SocketAddr, reason: &DriverError) -> DriverError {
    DriverError::connection(
        code::BAD_CONNECTION,
        format!(
            "Connection problem occurred after heartbeat (elapsedMillis={}, address={}, reason={})",
            elapsed.as_millis(),
            address,
            reason.message()
        ),
    )
}
