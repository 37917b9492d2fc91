use serde::Deserialize;

use crate::protocol::codec::DEFAULT_MAX_BODY_LEN;
use crate::protocol::ProtocolVersion;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Check values that deserialize fine but cannot be used
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster.name.is_empty() {
            return Err("cluster.name must not be empty".to_string());
        }
        if self.cluster.addresses.is_empty() {
            return Err("cluster.addresses must list at least one node".to_string());
        }
        if self.auth.user.is_empty() {
            return Err("auth.user must not be empty".to_string());
        }
        if !matches!(self.auth.method.as_str(), "internal" | "ldap") {
            return Err(format!("auth.method must be internal or ldap, got {}", self.auth.method));
        }
        if !ProtocolVersion::is_supported(self.transport.protocol_version) {
            return Err(format!(
                "transport.protocol_version {} is not supported",
                self.transport.protocol_version
            ));
        }
        if !self.transport.accept_plain && !self.transport.accept_secure {
            return Err("transport must accept plain or secure connections".to_string());
        }
        if self.transport.accept_secure && self.transport.tls.is_none() {
            return Err("transport.tls is required when accept_secure is set".to_string());
        }
        if !matches!(self.session.connection_route.as_str(), "default" | "public") {
            return Err(format!(
                "session.connection_route must be default or public, got {}",
                self.session.connection_route
            ));
        }
        if self.transport.max_frame_size == 0 || self.transport.max_frame_size > i32::MAX as usize {
            return Err(format!(
                "transport.max_frame_size must be between 1 and {}",
                i32::MAX
            ));
        }
        if self.session.pending_close_capacity == 0 {
            return Err("session.pending_close_capacity must be positive".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Cluster Configuration
// ============================================================================

/// Target cluster and the fixed list of its node addresses
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    /// Database used when none is named in a statement
    #[serde(default)]
    pub database: Option<String>,
    /// Node addresses as `host:port`
    #[serde(default)]
    pub addresses: Vec<String>,
}

fn default_cluster_name() -> String {
    "defaultCluster".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            database: None,
            addresses: Vec::new(),
        }
    }
}

// ============================================================================
// Authentication Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// `internal` or `ldap`
    #[serde(default = "default_auth_method")]
    pub method: String,
    /// Digest challenge authentication
    #[serde(default = "default_challenge")]
    pub challenge: bool,
}

fn default_user() -> String {
    "admin".to_string()
}

fn default_auth_method() -> String {
    "internal".to_string()
}

fn default_challenge() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            password: String::new(),
            method: default_auth_method(),
            challenge: default_challenge(),
        }
    }
}

// ============================================================================
// Transport Configuration
// ============================================================================

/// Per-socket settings
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: i32,
    /// TCP connect timeout (milliseconds); 0 waits indefinitely
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Statement timeout (milliseconds); absent disables it
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: Option<u64>,
    /// Head wait before a heartbeat probe (milliseconds)
    #[serde(default = "default_node_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_accept_plain")]
    pub accept_plain: bool,
    #[serde(default)]
    pub accept_secure: bool,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Largest response body accepted from a node (bytes)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_protocol_version() -> i32 {
    ProtocolVersion::LATEST.number()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(15_000)
}

fn default_node_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_accept_plain() -> bool {
    true
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_BODY_LEN
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            connect_timeout_ms: default_connect_timeout_ms(),
            statement_timeout_ms: default_statement_timeout_ms(),
            heartbeat_timeout_ms: default_node_heartbeat_timeout_ms(),
            accept_plain: default_accept_plain(),
            accept_secure: false,
            tls: None,
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// TLS layer settings; the bundled web PKI roots are used without a CA file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_file: Option<String>,
    /// Name verified against the node certificate instead of its IP address
    #[serde(default)]
    pub server_name: Option<String>,
}

// ============================================================================
// Failover Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    /// Bound on failover until the first login completes (milliseconds)
    #[serde(default = "default_login_timeout_ms")]
    pub login_timeout_ms: u64,
    /// Bound on one failure window afterwards (milliseconds)
    #[serde(default = "default_network_timeout_ms")]
    pub network_timeout_ms: u64,
    /// Heartbeat interval overriding the node setting (milliseconds)
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Pause between reconnect attempts (milliseconds)
    #[serde(default = "default_failover_interval_ms")]
    pub failover_interval_ms: u64,
}

fn default_login_timeout_ms() -> u64 {
    300_000
}

fn default_network_timeout_ms() -> u64 {
    300_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}

fn default_failover_interval_ms() -> u64 {
    1_000
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            login_timeout_ms: default_login_timeout_ms(),
            network_timeout_ms: default_network_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            failover_interval_ms: default_failover_interval_ms(),
        }
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Per-statement timeout (milliseconds); 0 leaves statements unbounded
    #[serde(default)]
    pub query_timeout_ms: u64,
    /// Rows per page requested from the node; 0 lets the node decide
    #[serde(default)]
    pub fetch_size: i64,
    /// Row limit per result; 0 is unlimited
    #[serde(default)]
    pub max_rows: i64,
    #[serde(default)]
    pub application_name: Option<String>,
    #[serde(default)]
    pub store_memory_aging_swap_rate: Option<f64>,
    #[serde(default)]
    pub time_zone_offset_ms: Option<i64>,
    /// `default` or `public`
    #[serde(default = "default_connection_route")]
    pub connection_route: String,
    #[serde(default)]
    pub transaction_timeout_ms: Option<u64>,
    /// Report the full remote cause chain in error messages
    #[serde(default)]
    pub detail_error_message: bool,
    /// Released query ids kept for closing by later statements
    #[serde(default = "default_pending_close_capacity")]
    pub pending_close_capacity: usize,
}

fn default_connection_route() -> String {
    "default".to_string()
}

fn default_pending_close_capacity() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 0,
            fetch_size: 0,
            max_rows: 0,
            application_name: None,
            store_memory_aging_swap_rate: None,
            time_zone_offset_ms: None,
            connection_route: default_connection_route(),
            transaction_timeout_ms: None,
            detail_error_message: false,
            pending_close_capacity: default_pending_close_capacity(),
        }
    }
}
