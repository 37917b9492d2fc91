use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info};

use super::remote::read_remote_error;
use super::stream::{is_timeout, NodeStream};
use super::tls::SecureSocketFactory;
use crate::auth::{AuthNegotiator, LoginInfo, LoginOutcome, TransportCaps, FeatureVersion};
use crate::error::{code, DriverError};
use crate::heartbeat::{HeartbeatOutcome, SessionHook};
use crate::metrics::metrics;
use crate::protocol::codec::DEFAULT_MAX_BODY_LEN;
use crate::protocol::frame::read_statement_id;
use crate::protocol::{
    FrameCodec, FrameHeader, GeneralStatement, OptionalRequest, ProtocolVersion, RequestFrame,
    ResponseFrame, StatementResult, StatementType, WireReader,
};

/// Partition id used by session-level statements
pub const SPECIAL_PARTITION_ID: i32 = 0;

const READ_CHUNK_SIZE: usize = 8192;

/// Per-socket settings
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Client protocol version
    pub protocol_version: ProtocolVersion,
    /// Version announced on CONNECT instead of the protocol version
    pub alternative_version: Option<i32>,
    /// TCP connect timeout; zero waits indefinitely
    pub connect_timeout: Duration,
    /// Statement timeout; `None` disables it
    pub statement_timeout: Option<Duration>,
    /// Head wait before a heartbeat probe is sent
    pub heartbeat_timeout: Duration,
    /// Transports this client accepts
    pub acceptable: TransportCaps,
    /// TLS layer applied when both sides accept secure transport
    pub secure_factory: Option<Arc<SecureSocketFactory>>,
    /// Enable digest challenge authentication
    pub challenge_enabled: bool,
    /// Report the full remote cause chain in error messages
    pub detail_error_message: bool,
    /// Largest response body accepted from the node (bytes)
    pub max_frame_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::LATEST,
            alternative_version: None,
            connect_timeout: Duration::from_secs(10),
            statement_timeout: None,
            heartbeat_timeout: Duration::from_secs(10),
            acceptable: TransportCaps::PLAIN,
            secure_factory: None,
            challenge_enabled: true,
            detail_error_message: false,
            max_frame_size: DEFAULT_MAX_BODY_LEN,
        }
    }
}

/// One socket to one node
///
/// Frames statements, correlates responses by statement id and keeps any
/// bytes read past the current frame for the next one.
pub struct TransportSession {
    stream: NodeStream,
    codec: FrameCodec,
    read_buf: BytesMut,
    address: SocketAddr,
    version: ProtocolVersion,
    negotiator: AuthNegotiator,
    statement_timeout: Option<Duration>,
    max_heartbeat_timeout: Duration,
    heartbeat_timeout: Duration,
    statement_id: i64,
    heartbeat_receive_count: u64,
    response_unacceptable: bool,
    detail_error_message: bool,
    hook: Arc<dyn SessionHook>,
}

impl TransportSession {
    /// Connect a socket and run the CONNECT exchange
    pub fn open(
        address: SocketAddr,
        config: &NodeConfig,
        hook: Arc<dyn SessionHook>,
    ) -> Result<Self, DriverError> {
        debug!(address = %address, "Connecting to node");
        let connected = if config.connect_timeout.is_zero() {
            TcpStream::connect(address)
        } else {
            TcpStream::connect_timeout(&address, config.connect_timeout)
        };
        let tcp = connected
            .and_then(|s| s.set_nodelay(true).map(|_| s))
            .map_err(|e| {
                DriverError::connection(
                    code::BAD_CONNECTION,
                    format!("Failed to connect (address={}, reason={})", address, e),
                )
            })?;

        let negotiator = AuthNegotiator::new(
            config.protocol_version,
            config.alternative_version,
            config.acceptable,
            config.secure_factory.is_some(),
            config.challenge_enabled,
        );
        metrics().active_sessions.inc();
        let mut session = Self {
            stream: NodeStream::Plain(tcp),
            codec: FrameCodec::new(address.is_ipv6()).with_max_body_len(config.max_frame_size),
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            address,
            version: config.protocol_version,
            negotiator,
            statement_timeout: None,
            max_heartbeat_timeout: config.heartbeat_timeout,
            heartbeat_timeout: config.heartbeat_timeout,
            statement_id: 0,
            heartbeat_receive_count: 0,
            response_unacceptable: false,
            detail_error_message: config.detail_error_message,
            hook,
        };
        session.set_config(config)?;
        session.connect(config.secure_factory.as_deref())?;
        Ok(session)
    }

    fn connect(&mut self, secure: Option<&SecureSocketFactory>) -> Result<(), DriverError> {
        let body = self.negotiator.connect_request().freeze();
        let mut resp = self.execute_statement(self.connect_type(), SPECIAL_PARTITION_ID, body)?;
        let upgrade = self.negotiator.accept_connect_response(&mut resp)?;
        if let (true, Some(factory)) = (upgrade, secure) {
            let tcp = self.stream.tcp().try_clone()?;
            self.stream = factory.upgrade(tcp)?;
        }
        Ok(())
    }

    /// Apply timeouts and the announced version
    pub fn set_config(&mut self, config: &NodeConfig) -> Result<(), DriverError> {
        self.statement_timeout = config.statement_timeout;
        self.max_heartbeat_timeout = config.heartbeat_timeout;
        self.heartbeat_timeout = config.heartbeat_timeout;
        self.detail_error_message = config.detail_error_message;
        self.negotiator.set_alternative_version(config.alternative_version);
        self.apply_read_timeout()
    }

    /// Shorten the heartbeat interval to at most `timeout` for the next statement
    pub fn set_min_heartbeat_timeout(&mut self, timeout: Option<Duration>) -> Result<(), DriverError> {
        let corrected = match timeout {
            Some(t) if !t.is_zero() => t.min(self.max_heartbeat_timeout),
            _ => self.max_heartbeat_timeout,
        };
        if corrected == self.heartbeat_timeout {
            return Ok(());
        }
        self.heartbeat_timeout = corrected;
        self.apply_read_timeout()
    }

    fn apply_read_timeout(&mut self) -> Result<(), DriverError> {
        let timeout = match self.statement_timeout {
            Some(s) => s.min(self.heartbeat_timeout),
            None => self.heartbeat_timeout,
        };
        let timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self.stream.set_read_timeout(timeout).map_err(|e| {
            DriverError::connection(
                code::BAD_CONNECTION,
                format!(
                    "Failed to change connection setting (address={}, reason={})",
                    self.address, e
                ),
            )
        })
    }

    /// Run the LOGIN exchange, with a second round when the node challenges
    pub fn login(&mut self, login: &LoginInfo) -> Result<LoginOutcome, DriverError> {
        let result = self.login_rounds(login);
        match &result {
            Ok(outcome) => info!(
                address = %self.address,
                user = %login.user(),
                database_id = outcome.database_id,
                "Logged in to node"
            ),
            Err(_) => self.negotiator.fail(),
        }
        result
    }

    fn login_rounds(&mut self, login: &LoginInfo) -> Result<LoginOutcome, DriverError> {
        let address = self.address.to_string();
        let login_type = StatementType::general(GeneralStatement::Login, self.version);

        let body = self
            .negotiator
            .login_request(login, None, self.statement_timeout, &address)?;
        let mut resp = self.execute_statement(login_type, SPECIAL_PARTITION_ID, body.freeze())?;

        if let Some(mut challenge) = self.negotiator.accept_login_response(&mut resp, None)? {
            let body = self.negotiator.login_request(
                login,
                Some(&mut challenge),
                self.statement_timeout,
                &address,
            )?;
            resp = self.execute_statement(login_type, SPECIAL_PARTITION_ID, body.freeze())?;
            self.negotiator.accept_login_response(&mut resp, Some(&challenge))?;
        }

        self.negotiator.accept_login_result(&mut resp)
    }

    pub fn logout(&mut self) -> Result<(), DriverError> {
        let logout_type = StatementType::general(GeneralStatement::Logout, self.version);
        let body = self.empty_options();
        self.execute_statement(logout_type, SPECIAL_PARTITION_ID, body)?;
        Ok(())
    }

    /// Send DISCONNECT without awaiting a response, then close the socket
    pub fn disconnect(mut self) -> Result<(), DriverError> {
        let disconnect_type = StatementType::general(GeneralStatement::Disconnect, self.version);
        let body = self.empty_options();
        let statement_id = self.next_statement_id();
        self.send(disconnect_type, SPECIAL_PARTITION_ID, statement_id, false, body)?;
        debug!(address = %self.address, "Disconnected from node");
        Ok(())
    }

    /// Drop the socket without notifying the node
    pub fn close_immediately(self) {
        debug!(address = %self.address, "Closing node connection");
    }

    fn empty_options(&self) -> Bytes {
        let mut body = BytesMut::new();
        if self.version.is_optional_request_enabled() {
            OptionalRequest::new().format(&mut body);
        }
        body.freeze()
    }

    /// Send one statement and return its correlated response body
    ///
    /// The returned reader is positioned after the statement-result byte.
    pub fn execute_statement(
        &mut self,
        statement_type: StatementType,
        partition_id: i32,
        body: Bytes,
    ) -> Result<WireReader, DriverError> {
        if partition_id < 0 {
            return Err(DriverError::config(
                code::INTERNAL_ERROR,
                format!(
                    "Internal error by illegal partition ID (partitionId={}, address={})",
                    partition_id, self.address
                ),
            ));
        }

        let started = Instant::now();
        let first = statement_type == self.connect_type();
        let statement_id = self.next_statement_id();
        debug!(
            statement = %statement_type,
            address = %self.address,
            partition_id,
            statement_id,
            "Statement I/O started"
        );
        self.send(statement_type, partition_id, statement_id, first, body)?;
        metrics()
            .statements_sent
            .with_label_values(&[statement_type.name()])
            .inc();

        let hook = self.hook.clone();
        hook.start_head_receiving(&mut self.stream, statement_id)?;
        let head = self.read_head();
        hook.end_head_receiving();

        let result = match head {
            Ok(()) => self
                .read_frame()
                .and_then(|frame| self.accept_response(frame, statement_type, statement_id, first, partition_id)),
            Err(e) if self.response_unacceptable || first => Err(e),
            Err(_) => match self.process_heartbeat(statement_type, statement_id, partition_id)? {
                HeartbeatOutcome::HeadReady => self
                    .read_frame()
                    .and_then(|frame| self.accept_response(frame, statement_type, statement_id, first, partition_id)),
                HeartbeatOutcome::Resolved(reader) => Ok(reader),
            },
        };

        metrics()
            .statement_latency
            .observe(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            metrics().remote_errors.with_label_values(&[e.kind()]).inc();
        }
        debug!(
            statement = %statement_type,
            address = %self.address,
            statement_id,
            ok = result.is_ok(),
            "Statement I/O finished"
        );
        result
    }

    fn accept_response(
        &mut self,
        frame: ResponseFrame,
        statement_type: StatementType,
        statement_id: i64,
        first: bool,
        partition_id: i32,
    ) -> Result<WireReader, DriverError> {
        let mut reader = WireReader::new(frame.payload);
        if reader.get_i32()? != statement_type.number() {
            return Err(self.illegal_statement_type());
        }
        let large = self.version.is_statement_id_large(first);
        if read_statement_id(&mut reader, large)? != statement_id {
            return Err(self.illegal_statement_id());
        }
        self.check_result(&mut reader, partition_id)?;
        Ok(reader)
    }

    /// Consume the result byte, decoding a remote error when it is not SUCCESS
    pub(crate) fn check_result(&self, reader: &mut WireReader, partition_id: i32) -> Result<(), DriverError> {
        let result = StatementResult::from(reader.get_u8()?);
        if result == StatementResult::Success {
            return Ok(());
        }
        Err(read_remote_error(
            result,
            reader,
            &self.address.to_string(),
            partition_id,
            self.detail_error_message,
        ))
    }

    pub(crate) fn illegal_statement_type(&self) -> DriverError {
        DriverError::protocol(format!(
            "Protocol error by illegal statement type (address={})",
            self.address
        ))
    }

    pub(crate) fn illegal_statement_id(&self) -> DriverError {
        DriverError::protocol(format!(
            "Protocol error by illegal statement ID (address={})",
            self.address
        ))
    }

    /// Allocate the next statement id, skipping 0
    pub(crate) fn next_statement_id(&mut self) -> i64 {
        self.statement_id = self.statement_id.wrapping_add(1);
        if self.statement_id == 0 {
            self.statement_id = 1;
        }
        self.statement_id
    }

    pub(crate) fn send(
        &mut self,
        statement_type: StatementType,
        partition_id: i32,
        statement_id: i64,
        first: bool,
        body: Bytes,
    ) -> Result<(), DriverError> {
        let header = FrameHeader::new(statement_type, partition_id, statement_id);
        let large = self.version.is_statement_id_large(first);
        let mut buf = BytesMut::with_capacity(64 + body.len());
        self.codec.encode(RequestFrame::new(header, large, body), &mut buf)?;

        self.stream
            .write_all(&buf)
            .and_then(|_| self.stream.flush())
            .map_err(|e| {
                DriverError::connection(
                    code::BAD_CONNECTION,
                    format!("Failed to send message (address={}, reason={})", self.address, e),
                )
            })
    }

    /// Wait until a complete address-echo head is buffered
    pub(crate) fn read_head(&mut self) -> Result<(), DriverError> {
        let head_len = self.codec.ee_head_len();
        while self.read_buf.len() < head_len {
            self.fill(head_len)?;
        }
        Ok(())
    }

    /// Read one complete frame, leaving any excess buffered
    pub(crate) fn read_frame(&mut self) -> Result<ResponseFrame, DriverError> {
        loop {
            match self.codec.decode(&mut self.read_buf) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => self.fill(self.expected_frame_len())?,
                Err(e) => {
                    self.response_unacceptable = true;
                    return Err(e);
                }
            }
        }
    }

    /// Declared length of the buffered frame, or the head length when unknown
    fn expected_frame_len(&self) -> usize {
        let head_len = self.codec.ee_head_len();
        if self.read_buf.len() < head_len {
            return head_len;
        }
        let pos = head_len - 4;
        let body_len = i32::from_le_bytes([
            self.read_buf[pos],
            self.read_buf[pos + 1],
            self.read_buf[pos + 2],
            self.read_buf[pos + 3],
        ]);
        head_len + body_len.max(0) as usize
    }

    fn fill(&mut self, total: usize) -> Result<(), DriverError> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.response_unacceptable = true;
                    return Err(DriverError::connection(
                        code::BAD_CONNECTION,
                        format!("Connection unexpectedly terminated (address={})", self.address),
                    ));
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let timeout = is_timeout(&e);
                    if !timeout || !self.read_buf.is_empty() {
                        self.response_unacceptable = true;
                    }
                    let received = self.read_buf.len();
                    return Err(if timeout {
                        DriverError::connection(
                            code::CONNECTION_TIMEOUT,
                            format!(
                                "Connection timed out on receiving (receivedSize={}, totalSize={}, address={}, reason={})",
                                received, total, self.address, e
                            ),
                        )
                    } else {
                        DriverError::connection(
                            code::BAD_CONNECTION,
                            format!(
                                "Connection problem occurred on receiving (receivedSize={}, totalSize={}, address={}, reason={})",
                                received, total, self.address, e
                            ),
                        )
                    });
                }
            }
        }
    }

    pub(crate) fn connect_type(&self) -> StatementType {
        StatementType::general(GeneralStatement::Connect, self.version)
    }

    pub(crate) fn probe_body(&self) -> Bytes {
        self.negotiator.probe_body().freeze()
    }

    pub(crate) fn hook(&self) -> Arc<dyn SessionHook> {
        self.hook.clone()
    }

    pub(crate) fn link(&mut self) -> &mut NodeStream {
        &mut self.stream
    }

    pub(crate) fn is_response_unacceptable(&self) -> bool {
        self.response_unacceptable
    }

    pub(crate) fn record_heartbeat_received(&mut self) {
        self.heartbeat_receive_count += 1;
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn heartbeat_receive_count(&self) -> u64 {
        self.heartbeat_receive_count
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn is_secure(&self) -> bool {
        self.stream.is_secure()
    }

    pub fn remote_protocol_version(&self) -> i32 {
        self.negotiator.remote_protocol_version()
    }

    pub fn remote_feature_version(&self) -> Option<FeatureVersion> {
        self.negotiator.remote_feature_version()
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.stream.shutdown();
        metrics().active_sessions.dec();
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("address", &self.address)
            .field("version", &self.version)
            .field("statement_id", &self.statement_id)
            .field("heartbeat_receive_count", &self.heartbeat_receive_count)
            .finish_non_exhaustive()
    }
}
