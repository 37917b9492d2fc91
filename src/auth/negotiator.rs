use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tracing::debug;

use super::digest::{generate_cnonce, md5_hex, sha256_hex, PasswordDigest};
use crate::error::{code, DriverError};
use crate::protocol::{OptionalRequest, ProtocolVersion, RequestOption, WireReader, WireWrite};

/// Database id used when the remote node predates database ids
pub const PUBLIC_DATABASE_ID: i64 = 0;

const DIGEST_METHOD: &str = "POST";
const DIGEST_URI: &str = "/";
const DIGEST_QOP: &str = "auth";

/// Authentication protocol negotiated on CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None = 0,
    Basic = 1,
    Challenge = 2,
}

impl AuthMode {
    /// Initial mode before the node answers
    pub fn default_mode(challenge_enabled: bool) -> Self {
        if challenge_enabled {
            AuthMode::Challenge
        } else {
            AuthMode::None
        }
    }

    /// Read an optional mode byte; absence means NONE
    fn read(reader: &mut WireReader) -> Result<Self, DriverError> {
        if !reader.has_remaining() {
            return Ok(AuthMode::None);
        }
        match reader.get_u8()? {
            0 => Ok(AuthMode::None),
            1 => Ok(AuthMode::Basic),
            2 => Ok(AuthMode::Challenge),
            other => Err(DriverError::protocol(format!(
                "Protocol error by illegal authentication mode (mode={})",
                other
            ))),
        }
    }
}

/// Credential verification mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Internal = 0,
    Ldap = 1,
}

impl AuthType {
    pub fn parse(value: &str) -> Result<Self, DriverError> {
        match value.to_ascii_uppercase().as_str() {
            "INTERNAL" => Ok(AuthType::Internal),
            "LDAP" => Ok(AuthType::Ldap),
            _ => Err(DriverError::config(
                code::ILLEGAL_PROPERTY_ENTRY,
                format!("Unknown authentication type (value={})", value),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthType::Internal => "INTERNAL",
            AuthType::Ldap => "LDAP",
        }
    }

    fn from_byte(value: u8) -> Result<Self, DriverError> {
        match value {
            0 => Ok(AuthType::Internal),
            1 => Ok(AuthType::Ldap),
            other => Err(DriverError::protocol(format!(
                "Protocol error by illegal authentication type (type={})",
                other
            ))),
        }
    }
}

/// Network route requested on login
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionRoute {
    #[default]
    Default = 0,
    Public = 1,
}

impl ConnectionRoute {
    pub fn parse(value: &str) -> Result<Self, DriverError> {
        match value.to_ascii_uppercase().as_str() {
            "" | "DEFAULT" => Ok(ConnectionRoute::Default),
            "PUBLIC" => Ok(ConnectionRoute::Public),
            _ => Err(DriverError::config(
                code::ILLEGAL_PROPERTY_ENTRY,
                format!("Unknown connection route (value={})", value),
            )),
        }
    }
}

/// Server feature level reported after login
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FeatureVersion {
    V4_0,
    V4_1,
    V4_2,
    V4_3,
    V4_5,
    V5_3,
    V5_5,
    V5_6,
}

impl FeatureVersion {
    const ALL: [FeatureVersion; 8] = [
        FeatureVersion::V4_0,
        FeatureVersion::V4_1,
        FeatureVersion::V4_2,
        FeatureVersion::V4_3,
        FeatureVersion::V4_5,
        FeatureVersion::V5_3,
        FeatureVersion::V5_5,
        FeatureVersion::V5_6,
    ];

    pub fn latest() -> Self {
        FeatureVersion::V5_6
    }

    pub fn ordinal(self) -> i32 {
        self as i32
    }

    /// Map a remote ordinal, clamping values newer than this driver knows
    pub fn remote_value_of(ordinal: i32) -> Result<Self, DriverError> {
        if ordinal < 0 {
            return Err(DriverError::protocol(format!(
                "Protocol error by negative feature version (version={})",
                ordinal
            )));
        }
        Ok(Self::ALL
            .get(ordinal as usize)
            .copied()
            .unwrap_or_else(Self::latest))
    }
}

/// Whether a user name designates an administrative account
pub fn is_admin_user(user: &str) -> bool {
    user.contains("admin") || user.contains("system") || user.contains('#')
}

/// Server-issued digest challenge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Challenge {
    challenging: bool,
    nonce: String,
    nc: String,
    opaque: String,
    base_salt: String,
    cnonce: Option<String>,
}

impl Challenge {
    /// Placeholder requesting one more round without a digest
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(
        nonce: impl Into<String>,
        nc: impl Into<String>,
        opaque: impl Into<String>,
        base_salt: impl Into<String>,
    ) -> Self {
        Self {
            challenging: true,
            nonce: nonce.into(),
            nc: nc.into(),
            opaque: opaque.into(),
            base_salt: base_salt.into(),
            cnonce: None,
        }
    }

    pub fn is_challenging(&self) -> bool {
        self.challenging
    }

    pub fn opaque(&self) -> &str {
        &self.opaque
    }

    pub fn last_cnonce(&self) -> Option<&str> {
        self.cnonce.as_deref()
    }

    /// Build the response with a fresh client nonce, remembering it
    pub fn build(&mut self, digest: &PasswordDigest) -> String {
        let cnonce = generate_cnonce();
        let secret = self.build_with(digest, &cnonce);
        self.cnonce = Some(cnonce);
        secret
    }

    /// Response for a given client nonce
    pub fn build_with(&self, digest: &PasswordDigest, cnonce: &str) -> String {
        format!(
            "#1#{}#{}",
            self.challenge_digest(digest, cnonce),
            self.crypt_secret(digest)
        )
    }

    fn challenge_digest(&self, digest: &PasswordDigest, cnonce: &str) -> String {
        let ha1 = md5_hex(&format!("{}:{}:{}", digest.challenge_base(), self.nonce, cnonce));
        let ha2 = md5_hex(&format!("{}:{}", DIGEST_METHOD, DIGEST_URI));
        md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, self.nonce, self.nc, cnonce, DIGEST_QOP, ha2
        ))
    }

    fn crypt_secret(&self, digest: &PasswordDigest) -> String {
        sha256_hex(&format!("{}:{}", self.base_salt, digest.crypt_base()))
    }
}

/// Secret field of a LOGIN request
pub fn build_secret(
    mode: AuthMode,
    challenge: Option<&mut Challenge>,
    digest: &PasswordDigest,
    auth_type: AuthType,
) -> String {
    if auth_type == AuthType::Ldap {
        return digest.password().to_string();
    }
    match challenge {
        Some(challenge) if challenge.is_challenging() => challenge.build(digest),
        _ => match mode {
            AuthMode::None | AuthMode::Challenge => String::new(),
            AuthMode::Basic => digest.basic_secret().to_string(),
        },
    }
}

fn put_challenge_request(dst: &mut BytesMut, mode: AuthMode, last: Option<&Challenge>) {
    dst.put_u8(mode as u8);
    if mode == AuthMode::None {
        return;
    }

    match last.filter(|c| c.is_challenging()) {
        Some(challenge) => {
            dst.put_bool(true);
            dst.put_string(challenge.opaque());
            dst.put_string(challenge.last_cnonce().unwrap_or_default());
        }
        None => dst.put_bool(false),
    }
}

fn read_challenge_response(
    reader: &mut WireReader,
    mode: &mut AuthMode,
    last: Option<&Challenge>,
    challenge_enabled: bool,
) -> Result<Option<Challenge>, DriverError> {
    let resp_mode = AuthMode::read(reader)?;
    if resp_mode != AuthMode::None && !challenge_enabled {
        return Err(DriverError::protocol(format!(
            "Protocol error by unexpected authentication mode (mode={:?})",
            resp_mode
        )));
    }

    if resp_mode != *mode {
        if resp_mode == AuthMode::Basic {
            *mode = resp_mode;
            return Ok(Some(Challenge::empty()));
        }
        return Err(DriverError::protocol(format!(
            "Protocol error by authentication mode mismatch (requested={:?}, responded={:?})",
            mode, resp_mode
        )));
    }
    if resp_mode == AuthMode::None {
        return Ok(None);
    }

    let resp_challenging = reader.get_bool()?;
    let challenging = last.is_some_and(|c| c.is_challenging());
    if resp_mode != AuthMode::Basic && resp_challenging == challenging {
        return Err(DriverError::protocol(format!(
            "Protocol error by unexpected challenge state (challenging={}, challenged={})",
            resp_challenging, challenging
        )));
    }

    if !resp_challenging {
        return Ok(None);
    }
    let nonce = reader.get_string()?;
    let nc = reader.get_string()?;
    let opaque = reader.get_string()?;
    let base_salt = reader.get_string()?;
    Ok(Some(Challenge::new(nonce, nc, opaque, base_salt)))
}

/// Plain and secure transport acceptance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCaps {
    pub plain: bool,
    pub secure: bool,
}

impl TransportCaps {
    pub const PLAIN: Self = Self {
        plain: true,
        secure: false,
    };

    fn intersect(self, other: Self) -> Self {
        Self {
            plain: self.plain && other.plain,
            secure: self.secure && other.secure,
        }
    }

    fn is_empty(self) -> bool {
        !self.plain && !self.secure
    }

    fn put(self, dst: &mut BytesMut) {
        let head = dst.reserve_i32();
        let body = dst.len();
        dst.put_bool(self.plain);
        dst.put_bool(self.secure);
        let size = dst.len() - body;
        dst.patch_i32(head, size as i32);
    }

    fn read(reader: &mut WireReader) -> Result<Self, DriverError> {
        if !reader.has_remaining() {
            return Ok(Self::PLAIN);
        }
        let mut body = WireReader::new(reader.get_sized_bytes()?);
        Ok(Self {
            plain: body.get_bool()?,
            secure: body.get_bool()?,
        })
    }
}

/// Credentials and session attributes sent on LOGIN
#[derive(Debug, Clone)]
pub struct LoginInfo {
    user: String,
    digest: PasswordDigest,
    database: Option<String>,
    owner_mode: bool,
    cluster_name: String,
    transaction_timeout_secs: Option<i32>,
    application_name: Option<String>,
    store_memory_aging_swap_rate: Option<f64>,
    time_zone_offset_ms: Option<i64>,
    auth_type: Option<AuthType>,
    connection_route: ConnectionRoute,
}

impl LoginInfo {
    pub fn new(user: impl Into<String>, password: &str) -> Self {
        let user = user.into();
        let digest = PasswordDigest::new(&user, password);
        Self {
            user,
            digest,
            database: None,
            owner_mode: true,
            cluster_name: String::new(),
            transaction_timeout_secs: None,
            application_name: None,
            store_memory_aging_swap_rate: None,
            time_zone_offset_ms: None,
            auth_type: None,
            connection_route: ConnectionRoute::Default,
        }
    }

    /// Request an authentication type
    ///
    /// Administrative accounts only authenticate internally, so any other
    /// type is rejected here, before a connection is attempted.
    pub fn with_auth_type(mut self, auth_type: AuthType) -> Result<Self, DriverError> {
        if auth_type != AuthType::Internal && is_admin_user(&self.user) {
            return Err(DriverError::config(
                code::ILLEGAL_PROPERTY_ENTRY,
                format!(
                    "Illegal authentication type for admin user (authentication={}, user={})",
                    auth_type.as_str(),
                    self.user
                ),
            ));
        }
        self.auth_type = Some(auth_type);
        Ok(self)
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_cluster_name(mut self, cluster_name: impl Into<String>) -> Self {
        self.cluster_name = cluster_name.into();
        self
    }

    pub fn with_owner_mode(mut self, owner_mode: bool) -> Self {
        self.owner_mode = owner_mode;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout_secs = Some(duration_to_secs(Some(timeout)));
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn with_store_memory_aging_swap_rate(mut self, rate: f64) -> Self {
        self.store_memory_aging_swap_rate = Some(rate);
        self
    }

    pub fn with_time_zone_offset_ms(mut self, offset_ms: i64) -> Self {
        self.time_zone_offset_ms = Some(offset_ms);
        self
    }

    pub fn with_connection_route(mut self, route: ConnectionRoute) -> Self {
        self.connection_route = route;
        self
    }

    /// Owner mode follows the connection's auto-commit setting on each login
    pub fn set_owner_mode(&mut self, owner_mode: bool) {
        self.owner_mode = owner_mode;
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn auth_type(&self) -> Option<AuthType> {
        self.auth_type
    }

    pub fn connection_route(&self) -> ConnectionRoute {
        self.connection_route
    }
}

/// Progress of the CONNECT/LOGIN handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Start,
    SentConnect,
    Connected,
    SentLogin,
    SentChallengeLogin,
    Authenticated,
    Failed,
}

/// Values learned from a completed login
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginOutcome {
    pub database_id: i64,
    pub feature_version: Option<FeatureVersion>,
}

/// CONNECT/LOGIN message logic for one socket
///
/// The negotiator only builds request bodies and interprets response bodies;
/// the owning transport session performs the I/O between steps.
#[derive(Debug, Clone)]
pub struct AuthNegotiator {
    version: ProtocolVersion,
    alternative_version: Option<i32>,
    challenge_enabled: bool,
    acceptable: TransportCaps,
    secure_available: bool,
    mode: AuthMode,
    remote_protocol_version: i32,
    remote_auth_type: AuthType,
    remote_feature_version: Option<FeatureVersion>,
    state: AuthState,
}

impl AuthNegotiator {
    pub fn new(
        version: ProtocolVersion,
        alternative_version: Option<i32>,
        acceptable: TransportCaps,
        secure_available: bool,
        challenge_enabled: bool,
    ) -> Self {
        Self {
            version,
            alternative_version,
            challenge_enabled,
            acceptable,
            secure_available,
            mode: AuthMode::default_mode(challenge_enabled),
            remote_protocol_version: 0,
            remote_auth_type: AuthType::Internal,
            remote_feature_version: None,
            state: AuthState::Start,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn remote_protocol_version(&self) -> i32 {
        self.remote_protocol_version
    }

    pub fn remote_feature_version(&self) -> Option<FeatureVersion> {
        self.remote_feature_version
    }

    pub fn fail(&mut self) {
        self.state = AuthState::Failed;
    }

    pub fn set_alternative_version(&mut self, alternative_version: Option<i32>) {
        self.alternative_version = alternative_version;
    }

    /// CONNECT-shaped body, also used for heartbeat probes
    pub fn probe_body(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(16);
        body.put_i32_le(self.alternative_version.unwrap_or_else(|| self.version.number()));
        self.acceptable.put(&mut body);
        body
    }

    pub fn connect_request(&mut self) -> BytesMut {
        self.state = AuthState::SentConnect;
        self.probe_body()
    }

    /// Interpret the CONNECT response
    ///
    /// Returns true when the stream must now be wrapped in TLS.
    pub fn accept_connect_response(&mut self, reader: &mut WireReader) -> Result<bool, DriverError> {
        self.mode = AuthMode::read(reader)?;

        if reader.has_remaining() {
            let version = reader.get_i32()?;
            if version == 0
                || (self.remote_protocol_version != 0 && version != self.remote_protocol_version)
            {
                return Err(DriverError::protocol(format!(
                    "Protocol error by illegal remote version (version={})",
                    version
                )));
            }
            self.remote_protocol_version = version;
        }

        if reader.has_remaining() {
            self.remote_auth_type = AuthType::from_byte(reader.get_u8()?)?;
        }

        let remote = TransportCaps::read(reader)?;
        let next = self.acceptable.intersect(remote);
        if next.is_empty() {
            return Err(DriverError::config(
                code::ILLEGAL_CONFIG,
                format!(
                    "Requested security options not supported (requested={{plain:{}, secure:{}}}, supported={{plain:{}, secure:{}}})",
                    self.acceptable.plain, self.acceptable.secure, remote.plain, remote.secure
                ),
            ));
        }

        self.state = AuthState::Connected;
        if !self.secure_available {
            return Ok(false);
        }
        self.secure_available = false;
        if next.secure {
            self.acceptable = TransportCaps {
                plain: false,
                secure: true,
            };
            Ok(true)
        } else {
            self.acceptable = TransportCaps::PLAIN;
            Ok(false)
        }
    }

    fn resolve_auth_type(&self, login: &LoginInfo, address: &str) -> Result<AuthType, DriverError> {
        let specified = login.auth_type;
        let non_internal = specified.is_some_and(|t| t != AuthType::Internal);

        if self.remote_auth_type == AuthType::Internal || specified == Some(AuthType::Internal) {
            if let (true, Some(t)) = (non_internal, specified) {
                return Err(DriverError::config(
                    code::ILLEGAL_CONFIG,
                    format!(
                        "Unavailable authentication type for target node (authentication={}, user={}, address={})",
                        t.as_str(),
                        login.user,
                        address
                    ),
                ));
            }
            return Ok(AuthType::Internal);
        }

        if is_admin_user(&login.user) {
            if let (true, Some(t)) = (non_internal, specified) {
                return Err(DriverError::config(
                    code::ILLEGAL_PROPERTY_ENTRY,
                    format!(
                        "Illegal authentication type for admin user (authentication={}, user={})",
                        t.as_str(),
                        login.user
                    ),
                ));
            }
            return Ok(AuthType::Internal);
        }

        Ok(self.remote_auth_type)
    }

    /// LOGIN body for one round; `challenge` is the previous round's answer
    pub fn login_request(
        &mut self,
        login: &LoginInfo,
        mut challenge: Option<&mut Challenge>,
        statement_timeout: Option<Duration>,
        address: &str,
    ) -> Result<BytesMut, DriverError> {
        let auth_type = self.resolve_auth_type(login, address)?;
        let mut body = BytesMut::with_capacity(256);

        if self.version.is_optional_request_enabled() {
            let mut request = OptionalRequest::new();
            if let Some(secs) = login.transaction_timeout_secs {
                request.put(RequestOption::TransactionTimeout(secs));
            }
            if let Some(database) = &login.database {
                request.put(RequestOption::DbName(database.clone()));
            }
            if let Some(name) = &login.application_name {
                request.put(RequestOption::ApplicationName(name.clone()));
            }
            if let Some(rate) = login.store_memory_aging_swap_rate {
                request.put(RequestOption::StoreMemoryAgingSwapRate(rate));
            }
            if let Some(offset) = login.time_zone_offset_ms {
                request.put(RequestOption::TimeZoneOffset(offset));
            }
            if auth_type != AuthType::Internal {
                request.put(RequestOption::AuthenticationType(auth_type as u8));
            }
            if login.connection_route == ConnectionRoute::Public {
                request.put(RequestOption::ConnectionRoute(ConnectionRoute::Public as u8));
            }
            request.put_acceptable_feature_version(FeatureVersion::latest().ordinal());
            request.format(&mut body);
        }

        let secret = build_secret(self.mode, challenge.as_deref_mut(), &login.digest, auth_type);
        body.put_string(&login.user);
        body.put_string(&secret);
        body.put_i32_le(duration_to_secs(statement_timeout));
        body.put_bool(login.owner_mode);
        body.put_string(&login.cluster_name);
        put_challenge_request(&mut body, self.mode, challenge.as_deref());

        self.state = if challenge.is_some() {
            AuthState::SentChallengeLogin
        } else {
            AuthState::SentLogin
        };
        debug!(user = %login.user, mode = ?self.mode, auth_type = auth_type.as_str(), "Login request built");
        Ok(body)
    }

    /// Interpret the challenge section of a LOGIN response
    ///
    /// `Some` means another LOGIN round is required.
    pub fn accept_login_response(
        &mut self,
        reader: &mut WireReader,
        last: Option<&Challenge>,
    ) -> Result<Option<Challenge>, DriverError> {
        let mut mode = self.mode;
        let next = read_challenge_response(reader, &mut mode, last, self.challenge_enabled);
        self.mode = mode;
        next
    }

    /// Read the trailing fields of the final LOGIN response
    pub fn accept_login_result(&mut self, reader: &mut WireReader) -> Result<LoginOutcome, DriverError> {
        let database_id = if reader.has_remaining() {
            reader.get_i64()?
        } else if self.version.is_database_id_enabled() {
            return Err(DriverError::protocol("Protocol error by lack of database ID"));
        } else {
            PUBLIC_DATABASE_ID
        };

        if reader.has_remaining() {
            self.remote_feature_version = Some(FeatureVersion::remote_value_of(reader.get_i32()?)?);
        }

        self.state = AuthState::Authenticated;
        Ok(LoginOutcome {
            database_id,
            feature_version: self.remote_feature_version,
        })
    }
}

/// Whole seconds for a timeout field; no timeout maps to the maximum
pub(crate) fn duration_to_secs(timeout: Option<Duration>) -> i32 {
    match timeout {
        Some(d) => d.as_secs().min(i32::MAX as u64) as i32,
        None => i32::MAX,
    }
}
