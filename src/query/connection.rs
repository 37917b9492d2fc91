use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pool::{QueryPool, QueryRef, DEFAULT_PENDING_CLOSE_CAPACITY};
use super::result::RemoteEnv;
use super::session::QuerySession;
use crate::auth::{AuthType, ConnectionRoute, LoginInfo, LoginOutcome, TransportCaps};
use crate::config::Config;
use crate::error::{code, DriverError};
use crate::failover::{
    AttemptContext, CachingProvider, ClusterInfo, FailoverAttempt, FailoverExecutor, FailoverTimeouts,
    FixedListProvider, TopologyProvider,
};
use crate::heartbeat::{CancelHandle, QueryHook};
use crate::protocol::ProtocolVersion;
use crate::transport::{NodeConfig, SecureSocketFactory};

/// Settings inherited by every session of a connection
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDefaults {
    /// `None` leaves statements unbounded
    pub query_timeout: Option<Duration>,
    pub fetch_size: i64,
    pub max_rows: i64,
    pub pending_close_capacity: usize,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            query_timeout: None,
            fetch_size: 0,
            max_rows: 0,
            pending_close_capacity: DEFAULT_PENDING_CLOSE_CAPACITY,
        }
    }
}

/// Everything needed to open a [`SqlConnection`]
#[derive(Clone)]
pub struct ConnectOptions {
    pub topology: Arc<dyn TopologyProvider>,
    pub cluster: ClusterInfo,
    pub login: LoginInfo,
    pub node: NodeConfig,
    pub timeouts: FailoverTimeouts,
    pub session: SessionDefaults,
}

impl ConnectOptions {
    pub fn new(topology: Arc<dyn TopologyProvider>, cluster: ClusterInfo, login: LoginInfo) -> Self {
        Self {
            topology,
            cluster,
            login,
            node: NodeConfig::default(),
            timeouts: FailoverTimeouts::default(),
            session: SessionDefaults::default(),
        }
    }

    /// Build options from a validated configuration
    pub fn from_config(config: &Config) -> Result<Self, DriverError> {
        let cluster = ClusterInfo::new(config.cluster.name.clone(), config.cluster.database.clone());
        let fixed = FixedListProvider::from_hosts(config.cluster.addresses.as_slice())?;
        let topology: Arc<dyn TopologyProvider> = Arc::new(CachingProvider::new(Arc::new(fixed)));

        let session = &config.session;
        let mut login = LoginInfo::new(config.auth.user.clone(), &config.auth.password)
            .with_auth_type(AuthType::parse(&config.auth.method)?)?
            .with_cluster_name(config.cluster.name.clone())
            .with_connection_route(ConnectionRoute::parse(&session.connection_route)?);
        if let Some(database) = &config.cluster.database {
            login = login.with_database(database.clone());
        }
        if let Some(name) = &session.application_name {
            login = login.with_application_name(name.clone());
        }
        if let Some(rate) = session.store_memory_aging_swap_rate {
            login = login.with_store_memory_aging_swap_rate(rate);
        }
        if let Some(offset) = session.time_zone_offset_ms {
            login = login.with_time_zone_offset_ms(offset);
        }
        if let Some(timeout) = session.transaction_timeout_ms {
            login = login.with_transaction_timeout(Duration::from_millis(timeout));
        }

        let transport = &config.transport;
        let secure_factory = match &transport.tls {
            Some(tls) if transport.accept_secure => Some(Arc::new(match &tls.ca_file {
                Some(path) => SecureSocketFactory::from_ca_file(Path::new(path), tls.server_name.clone())?,
                None => SecureSocketFactory::with_webpki_roots(tls.server_name.clone()),
            })),
            _ => None,
        };
        let node = NodeConfig {
            protocol_version: ProtocolVersion::new(transport.protocol_version)?,
            alternative_version: Some(ProtocolVersion::SQL_ALTERNATIVE),
            connect_timeout: Duration::from_millis(transport.connect_timeout_ms),
            statement_timeout: transport.statement_timeout_ms.map(Duration::from_millis),
            heartbeat_timeout: Duration::from_millis(transport.heartbeat_timeout_ms),
            acceptable: TransportCaps {
                plain: transport.accept_plain,
                secure: transport.accept_secure,
            },
            secure_factory,
            challenge_enabled: config.auth.challenge,
            detail_error_message: session.detail_error_message,
            max_frame_size: transport.max_frame_size,
        };

        let failover = &config.failover;
        let timeouts = FailoverTimeouts {
            login: Duration::from_millis(failover.login_timeout_ms),
            network: Duration::from_millis(failover.network_timeout_ms),
            heartbeat: Duration::from_millis(failover.heartbeat_timeout_ms),
            failover_interval: Duration::from_millis(failover.failover_interval_ms),
        };

        Ok(Self {
            topology,
            cluster,
            login,
            node,
            timeouts,
            session: SessionDefaults {
                query_timeout: Some(Duration::from_millis(session.query_timeout_ms)).filter(|t| !t.is_zero()),
                fetch_size: session.fetch_size,
                max_rows: session.max_rows,
                pending_close_capacity: session.pending_close_capacity,
            },
        })
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("cluster", &self.cluster)
            .field("user", &self.login.user())
            .field("timeouts", &self.timeouts)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// State shared by a connection and its sessions
pub(crate) struct ConnectionCore {
    pub(crate) executor: FailoverExecutor,
    pub(crate) uuid: Uuid,
    pub(crate) pool: QueryPool,
    pub(crate) last_query_id: i64,
    pub(crate) transaction_started: bool,
    pub(crate) auto_commit: bool,
    pub(crate) remote_env: RemoteEnv,
    pub(crate) database: Option<String>,
    pub(crate) defaults: SessionDefaults,
    pub(crate) closed: bool,
}

impl ConnectionCore {
    pub(crate) fn check_open(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::statement(code::ALREADY_CLOSED, "Already closed"));
        }
        Ok(())
    }
}

/// First login of a connection
struct LoginAttempt;

impl FailoverAttempt for LoginAttempt {
    type Output = ();

    fn operation_name(&self) -> &'static str {
        "LOGIN"
    }

    fn attempt(&mut self, _ctx: &mut AttemptContext<'_>) -> Result<(), DriverError> {
        Ok(())
    }
}

/// One logical SQL connection to a cluster
///
/// Owns one node session at a time through its failover executor. Query
/// sessions created from it share that node session and serialize on it.
pub struct SqlConnection {
    core: Arc<Mutex<ConnectionCore>>,
    cancel: CancelHandle,
    uuid: Uuid,
}

impl SqlConnection {
    /// Log in to a node of the cluster, failing over within the login timeout
    pub fn open(options: ConnectOptions) -> Result<Self, DriverError> {
        let ConnectOptions {
            topology,
            cluster,
            login,
            mut node,
            timeouts,
            session,
        } = options;

        let uuid = Uuid::new_v4();
        if node.alternative_version.is_none() {
            node.alternative_version = Some(ProtocolVersion::SQL_ALTERNATIVE);
        }
        let hook = QueryHook::new(uuid, node.protocol_version);
        let cancel = hook.cancel_handle();
        let database = login.database().map(str::to_string);
        let cluster_name = cluster.name.clone();

        let mut executor = FailoverExecutor::new(topology, cluster, node, login, timeouts, hook, &uuid);
        executor.execute(&mut LoginAttempt, None)?;
        executor.mark_initialized();
        info!(uuid = %uuid, cluster = %cluster_name, "SQL connection opened");

        let core = ConnectionCore {
            executor,
            uuid,
            pool: QueryPool::new(session.pending_close_capacity),
            last_query_id: 0,
            transaction_started: false,
            auto_commit: true,
            remote_env: RemoteEnv::default(),
            database,
            defaults: session,
            closed: false,
        };
        Ok(Self {
            core: Arc::new(Mutex::new(core)),
            cancel,
            uuid,
        })
    }

    /// Open a connection described by a configuration file section set
    pub fn connect(config: &Config) -> Result<Self, DriverError> {
        Self::open(ConnectOptions::from_config(config)?)
    }

    pub fn create_session(&self) -> Result<QuerySession, DriverError> {
        QuerySession::new(self.core.clone(), self.cancel.clone())
    }

    /// Handle cancelling whichever statement of this connection is running
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_transaction_started(&self) -> bool {
        self.core.lock().transaction_started
    }

    pub fn auto_commit(&self) -> bool {
        self.core.lock().auto_commit
    }

    /// Server-side SQL environment learned so far
    pub fn remote_env(&self) -> BTreeMap<String, String> {
        self.core.lock().remote_env.entries().clone()
    }

    pub fn login_outcome(&self) -> Option<LoginOutcome> {
        self.core.lock().executor.login_outcome()
    }

    /// Node sessions opened so far, counting the first login
    pub fn epoch(&self) -> u64 {
        self.core.lock().executor.epoch()
    }

    pub fn is_closed(&self) -> bool {
        self.core.lock().closed
    }

    /// Close every query id still known to the node, then disconnect
    pub fn close(&self) -> Result<(), DriverError> {
        let (pending, epoch) = {
            let mut core = self.core.lock();
            if core.closed {
                return Ok(());
            }
            let epoch = core.executor.epoch();
            core.pool.detach_all(epoch);
            let pending: Vec<QueryRef> = std::iter::from_fn(|| core.pool.pull()).collect();
            (pending, epoch)
        };

        let closed = self.close_queries(pending, epoch);

        {
            let mut core = self.core.lock();
            core.closed = true;
            core.executor.disconnect(false);
        }
        info!(uuid = %self.uuid, "SQL connection closed");

        closed.map_err(|e| e.with_message(format!("Failed to close related resources (reason={})", e.message())))
    }

    fn close_queries(&self, pending: Vec<QueryRef>, epoch: u64) -> Result<(), DriverError> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut session = QuerySession::new(self.core.clone(), self.cancel.clone())?;
        for query in pending {
            if query.epoch != epoch {
                debug!(query_id = query.query_id, "Skipping query of a previous node session");
                continue;
            }
            if let Err(e) = session.close_with_pending(Some(query)) {
                warn!(query_id = query.query_id, error = %e, "Failed to close query");
                return Err(e);
            }
        }
        session.close();
        Ok(())
    }
}

impl Drop for SqlConnection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(uuid = %self.uuid, error = %e, "Failed to close connection on drop");
        }
    }
}

impl std::fmt::Debug for SqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlConnection")
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}
