use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::budget::{FailureWindow, RetryBudget};
use super::topology::{ClusterInfo, TopologyProvider};
use crate::auth::{LoginInfo, LoginOutcome};
use crate::error::{code, DriverError, ErrorDetail};
use crate::heartbeat::{QueryHook, SessionHook};
use crate::metrics::metrics;
use crate::transport::{NodeConfig, TransportSession};

/// Connection-level timeouts bounding failover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverTimeouts {
    /// Bound on failover before the first login completes
    pub login: Duration,
    /// Bound on one failure window after the first login
    pub network: Duration,
    /// Head wait before a heartbeat probe
    pub heartbeat: Duration,
    /// Pause between reconnect attempts
    pub failover_interval: Duration,
}

impl Default for FailoverTimeouts {
    fn default() -> Self {
        Self {
            login: Duration::from_secs(5 * 60),
            network: Duration::from_secs(5 * 60),
            heartbeat: Duration::from_secs(60),
            failover_interval: Duration::from_secs(1),
        }
    }
}

/// One operation the executor may run several times
pub trait FailoverAttempt {
    type Output;

    /// Name used in failure messages
    fn operation_name(&self) -> &'static str;

    /// Run the operation once on the current session
    fn attempt(&mut self, ctx: &mut AttemptContext<'_>) -> Result<Self::Output, DriverError>;

    /// Whether a connection failure can be followed by another attempt
    fn is_resumable(&self) -> bool {
        true
    }
}

/// State handed to one attempt
pub struct AttemptContext<'a> {
    session: &'a mut TransportSession,
    hook: &'a QueryHook,
    budget: &'a RetryBudget,
    last_error: Option<&'a DriverError>,
    epoch: u64,
    partition_id: i32,
    login: bool,
}

impl AttemptContext<'_> {
    pub fn session(&mut self) -> &mut TransportSession {
        self.session
    }

    /// Identity of the current session; changes on every reconnect
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn retry_count(&self) -> u32 {
        self.budget.retry_count()
    }

    pub fn is_retry(&self) -> bool {
        self.budget.retry_count() > 0
    }

    /// Timeout left for this attempt
    pub fn remaining(&self) -> Option<Duration> {
        self.budget.remaining()
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    /// Arm heartbeats and cancellation for a statement carrying `query_id`
    pub fn start_query(&mut self, query_id: i64) -> Result<(), DriverError> {
        let remaining = self.budget.remaining();
        self.session.set_min_heartbeat_timeout(remaining)?;
        self.hook.start_query(self.partition_id, query_id, remaining);
        Ok(())
    }

    /// Failure for an operation that cannot continue on a new session
    pub fn unrecoverable(&self, operation: &str) -> DriverError {
        let window = FailureWindow {
            elapsed: self.budget.elapsed_at(Instant::now(), None),
            failure: Duration::ZERO,
        };
        let message = self.budget.describe(
            "Previous connection problem cannot be recovered on this operation type",
            &window,
            operation,
            self.login,
            self.last_error.map(|e| e.message()),
        );
        let code = self.last_error.map_or(code::ILLEGAL_STATE, |e| e.code());
        DriverError::Statement(ErrorDetail::new(code, message))
    }
}

/// Reconnect-and-retry loop for one logical connection
///
/// Owns the connection's node session. Attempt 0 reuses it when present;
/// every later attempt tears it down, picks the next address round-robin
/// and logs in again before the operation runs.
pub struct FailoverExecutor {
    topology: Arc<dyn TopologyProvider>,
    cluster: ClusterInfo,
    node_config: NodeConfig,
    login: LoginInfo,
    timeouts: FailoverTimeouts,
    hook: Arc<QueryHook>,
    seed: u32,
    session: Option<TransportSession>,
    epoch: u64,
    last_heartbeat_count: u64,
    last_error: Option<DriverError>,
    preferable_partition: Option<usize>,
    login_outcome: Option<LoginOutcome>,
    initialized: bool,
}

impl FailoverExecutor {
    pub fn new(
        topology: Arc<dyn TopologyProvider>,
        cluster: ClusterInfo,
        mut node_config: NodeConfig,
        login: LoginInfo,
        timeouts: FailoverTimeouts,
        hook: Arc<QueryHook>,
        uuid: &Uuid,
    ) -> Self {
        if !timeouts.heartbeat.is_zero() {
            node_config.heartbeat_timeout = timeouts.heartbeat;
        }
        Self {
            topology,
            cluster,
            node_config,
            login,
            timeouts,
            hook,
            seed: uuid.as_u128() as u32,
            session: None,
            epoch: 0,
            last_heartbeat_count: 0,
            last_error: None,
            preferable_partition: None,
            login_outcome: None,
            initialized: false,
        }
    }

    pub fn hook(&self) -> &Arc<QueryHook> {
        &self.hook
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&TransportSession> {
        self.session.as_ref()
    }

    pub fn login_outcome(&self) -> Option<LoginOutcome> {
        self.login_outcome
    }

    pub fn timeouts(&self) -> &FailoverTimeouts {
        &self.timeouts
    }

    /// Partition id statements are routed with
    pub fn preferable_partition_id(&self) -> i32 {
        self.preferable_partition.map_or(0, |p| p as i32)
    }

    /// Failure window bound, which is the login timeout until the first login succeeds
    pub fn network_timeout(&self) -> Duration {
        if self.initialized {
            self.timeouts.network
        } else {
            self.timeouts.login
        }
    }

    pub fn set_owner_mode(&mut self, owner_mode: bool) {
        self.login.set_owner_mode(owner_mode);
    }

    /// Switch from the login timeout to the network timeout
    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    /// Run `op` until it succeeds, fails permanently or the budget is spent
    pub fn execute<A: FailoverAttempt>(
        &mut self,
        op: &mut A,
        query_timeout: Option<Duration>,
    ) -> Result<A::Output, DriverError> {
        let mut budget = RetryBudget::new(
            query_timeout,
            Some(self.network_timeout()),
            self.timeouts.failover_interval,
        );

        loop {
            let result = self.run_attempt(op, &budget);
            let measured = self.hook.elapsed();
            self.hook.end_query();

            let err = match result {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };
            let reason = match &err {
                DriverError::Connection(_) => "connection",
                DriverError::WrongNode(_) => "wrong_node",
                DriverError::Protocol(_) => {
                    self.disconnect(true);
                    return Err(err);
                }
                _ => return Err(err),
            };

            self.record_failure(&mut budget, &err);

            let window = match budget.check_failure(Instant::now(), measured) {
                Ok(window) => window,
                Err(window) => {
                    return Err(err.with_message(budget.describe(
                        "Connection problem occurred",
                        &window,
                        op.operation_name(),
                        !self.initialized,
                        Some(err.message()),
                    )));
                }
            };
            if !op.is_resumable() {
                return Err(err.with_message(budget.describe(
                    "Connection problem cannot be recovered on this operation type",
                    &window,
                    op.operation_name(),
                    !self.initialized,
                    Some(err.message()),
                )));
            }

            let sleep = budget.schedule_retry(&window);
            metrics().record_failover_retry(reason);
            warn!(
                operation = op.operation_name(),
                retry_count = budget.retry_count(),
                elapsed_ms = window.elapsed.as_millis() as u64,
                error = %err,
                "Retrying after node failure"
            );
            if let Some(interval) = sleep {
                thread::sleep(interval);
            }
        }
    }

    fn run_attempt<A: FailoverAttempt>(
        &mut self,
        op: &mut A,
        budget: &RetryBudget,
    ) -> Result<A::Output, DriverError> {
        if budget.retry_count() > 0 || self.session.is_none() {
            self.reset()?;
        }

        let partition_id = self.preferable_partition_id();
        let login = !self.initialized;
        let session = self.session.as_mut().ok_or_else(|| {
            DriverError::config(code::INTERNAL_ERROR, "Internal error by missing node session")
        })?;
        let mut ctx = AttemptContext {
            session,
            hook: &self.hook,
            budget,
            last_error: self.last_error.as_ref(),
            epoch: self.epoch,
            partition_id,
            login,
        };
        op.attempt(&mut ctx)
    }

    fn record_failure(&mut self, budget: &mut RetryBudget, err: &DriverError) {
        if let Some(session) = &self.session {
            if budget.is_failing_over() && self.last_heartbeat_count != session.heartbeat_receive_count() {
                budget.reset_failure_window();
            }
        }
        self.last_error = Some(err.clone());
        self.disconnect(true);
    }

    /// Replace the session with a freshly logged-in one
    fn reset(&mut self) -> Result<(), DriverError> {
        self.disconnect(false);

        let mut config = self.node_config.clone();
        let timeout = self.network_timeout();
        if timeout < config.connect_timeout {
            config.connect_timeout = timeout;
        }
        if config.statement_timeout.map_or(true, |s| timeout < s) {
            config.statement_timeout = Some(timeout);
        }

        let address = self.next_address()?;
        let hook: Arc<dyn SessionHook> = self.hook.clone();
        let mut session = TransportSession::open(address, &config, hook)?;

        let outcome = match self.login_session(&mut session) {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(close) = session.disconnect() {
                    debug!(address = %address, error = %close, "Failed to close node connection");
                }
                self.topology.invalidate_master(&self.cluster);
                return Err(e);
            }
        };

        self.last_heartbeat_count = session.heartbeat_receive_count();
        self.login_outcome = Some(outcome);
        self.session = Some(session);
        self.epoch += 1;

        if self.epoch > 1 {
            metrics().reconnects.inc();
            info!(address = %address, epoch = self.epoch, "Reconnected to node");
        } else {
            info!(address = %address, "Connected to node");
        }
        Ok(())
    }

    fn login_session(&self, session: &mut TransportSession) -> Result<LoginOutcome, DriverError> {
        let outcome = session.login(&self.login)?;
        session.set_config(&self.node_config)?;
        Ok(outcome)
    }

    /// Advance the preferred partition round-robin and resolve its node
    ///
    /// The first pick is seeded from the connection UUID so that repeated
    /// connections spread over the cluster.
    fn next_address(&mut self) -> Result<SocketAddr, DriverError> {
        let count = self
            .topology
            .partition_count(&self.cluster)?
            .min(i32::MAX as usize - 1);
        if count == 0 {
            return Err(DriverError::config(
                code::ILLEGAL_CONFIG,
                format!("No node address available (cluster={})", self.cluster.name),
            ));
        }

        let current = self
            .preferable_partition
            .unwrap_or(self.seed as usize % count);
        let next = if current + 1 >= count { 0 } else { current + 1 };
        self.preferable_partition = Some(next);

        self.topology.node_address(&self.cluster, next)
    }

    /// Tear down the session, invalidating cached routing
    pub fn disconnect(&mut self, immediate: bool) {
        let Some(session) = self.session.take() else {
            return;
        };
        let address = session.address();
        if immediate {
            session.close_immediately();
        } else if let Err(e) = session.disconnect() {
            debug!(address = %address, error = %e, "Failed to disconnect gracefully");
        }
        self.topology.invalidate_master(&self.cluster);
    }
}

impl std::fmt::Debug for FailoverExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverExecutor")
            .field("cluster", &self.cluster)
            .field("session", &self.session)
            .field("epoch", &self.epoch)
            .field("preferable_partition", &self.preferable_partition)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}
