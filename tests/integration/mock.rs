//! Scripted node speaking the wire protocol over loopback
//!
//! Connections are served one at a time in accept order. CONNECT, LOGIN and
//! heartbeat probes are answered by the node itself; every SQL execute
//! request is handed to the test's handler, which decides the reply.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use gridwire::protocol::{WireReader, WireWrite, MAGIC_NUMBER};

pub const CONNECT: i32 = 100;
pub const DISCONNECT: i32 = 101;
pub const LOGIN: i32 = 102;
pub const SQL_EXECUTE: i32 = 400;
pub const SQL_CANCEL: i32 = 401;

const EE_HEAD_LEN: usize = 20;
const REMOTE_VERSION: i32 = 15;

/// Authentication the node asks for on CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScript {
    None,
    Challenge,
}

/// One request frame as received
#[derive(Debug, Clone)]
pub struct Frame {
    /// Accept order of the connection, from 0
    pub connection: usize,
    pub statement_type: i32,
    pub partition_id: i32,
    pub statement_id: i64,
    pub body: Bytes,
}

/// Decoded SQL execute request
#[derive(Debug, Clone)]
pub struct SqlRequest {
    pub connection: usize,
    pub statement_id: i64,
    pub mode: u8,
    pub operation: i32,
    pub query_id: i64,
    pub old_query_id: i64,
    pub transaction_started: bool,
    pub retry: bool,
    pub input_rows: i64,
    pub sql: Vec<String>,
}

/// Decoded LOGIN request
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub user: String,
    pub secret: String,
    pub owner_mode: bool,
    pub cluster: String,
    pub mode: u8,
    pub challenged: bool,
    pub opaque: Option<String>,
}

/// What the node does with one SQL execute request
pub enum Reply {
    Success(BytesMut),
    /// Answer the client's next heartbeat probe, then the request
    AfterHeartbeat(BytesMut),
    /// Answer the request ahead of the client's next heartbeat probe
    BeforeHeartbeatAnswer(BytesMut),
    /// Wait for the cancel frame of the request, then answer it
    AfterCancel(BytesMut),
    /// Keep the connection open and answer nothing, probes included
    Stall,
    /// Drop the connection without answering
    Hangup,
}

/// One result in a SQL execute response
#[derive(Debug, Clone)]
pub enum ResultShape {
    Update(i32),
    Prepared(i32),
    Table { following: bool, rows: Vec<i64> },
}

pub struct MockNode {
    address: SocketAddr,
    frames: Arc<Mutex<Vec<Frame>>>,
    sql: Arc<Mutex<Vec<SqlRequest>>>,
}

impl MockNode {
    pub fn spawn<F>(auth: AuthScript, handler: F) -> Self
    where
        F: FnMut(&SqlRequest) -> Reply + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind mock node");
        let address = listener.local_addr().expect("Failed to read mock node address");
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sql = Arc::new(Mutex::new(Vec::new()));

        let node = Self {
            address,
            frames: frames.clone(),
            sql: sql.clone(),
        };
        thread::spawn(move || {
            let mut handler = handler;
            for (connection, stream) in listener.incoming().enumerate() {
                let Ok(stream) = stream else { break };
                let mut served = Connection {
                    index: connection,
                    stream,
                    auth,
                    login_round: 0,
                    frames: &frames,
                    sql: &sql,
                };
                served.serve(&mut handler);
            }
        });
        node
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    /// Shared view of the recorded frames, for watching from another thread
    pub fn frames_handle(&self) -> Arc<Mutex<Vec<Frame>>> {
        self.frames.clone()
    }

    pub fn frames_of(&self, statement_type: i32) -> Vec<Frame> {
        self.frames
            .lock()
            .iter()
            .filter(|f| f.statement_type == statement_type)
            .cloned()
            .collect()
    }

    pub fn sql_requests(&self) -> Vec<SqlRequest> {
        self.sql.lock().clone()
    }

    /// Poll the recorded frames until `predicate` holds, for up to two seconds
    pub fn wait_for(&self, predicate: impl Fn(&[Frame]) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if predicate(&self.frames.lock()) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

struct Connection<'a> {
    index: usize,
    stream: TcpStream,
    auth: AuthScript,
    login_round: u32,
    frames: &'a Mutex<Vec<Frame>>,
    sql: &'a Mutex<Vec<SqlRequest>>,
}

impl Connection<'_> {
    fn serve<F>(&mut self, handler: &mut F)
    where
        F: FnMut(&SqlRequest) -> Reply,
    {
        let _ = self.stream.set_read_timeout(Some(Duration::from_secs(10)));
        loop {
            let Some(frame) = self.next_frame() else { return };
            match frame.statement_type {
                CONNECT => {
                    let body = self.connect_reply();
                    self.respond(&frame, body);
                }
                LOGIN => {
                    self.login_round += 1;
                    let body = self.login_reply();
                    self.respond(&frame, body);
                }
                DISCONNECT | SQL_CANCEL => {}
                SQL_EXECUTE => {
                    let request = parse_sql(&frame);
                    self.sql.lock().push(request.clone());
                    match handler(&request) {
                        Reply::Success(body) => self.respond(&frame, body),
                        Reply::AfterHeartbeat(body) => {
                            let Some(probe) = self.next_frame() else { return };
                            assert_eq!(probe.statement_type, CONNECT, "expected heartbeat probe");
                            let probe_body = self.connect_reply();
                            self.respond(&probe, probe_body);
                            thread::sleep(Duration::from_millis(50));
                            self.respond(&frame, body);
                        }
                        Reply::BeforeHeartbeatAnswer(body) => {
                            let Some(probe) = self.next_frame() else { return };
                            assert_eq!(probe.statement_type, CONNECT, "expected heartbeat probe");
                            self.respond(&frame, body);
                            let probe_body = self.connect_reply();
                            self.respond(&probe, probe_body);
                        }
                        Reply::AfterCancel(body) => {
                            let Some(cancel) = self.next_frame() else { return };
                            assert_eq!(cancel.statement_type, SQL_CANCEL, "expected cancel frame");
                            self.respond(&frame, body);
                        }
                        Reply::Stall => {
                            while self.next_frame().is_some() {}
                            return;
                        }
                        Reply::Hangup => return,
                    }
                }
                _ => return,
            }
        }
    }

    /// Read and record one request frame; `None` once the client goes away
    fn next_frame(&mut self) -> Option<Frame> {
        let mut head = [0u8; EE_HEAD_LEN];
        self.stream.read_exact(&mut head).ok()?;
        let mut head_buf = &head[..];
        assert_eq!(head_buf.get_i32_le(), MAGIC_NUMBER);
        head_buf.advance(12);
        let body_len = head_buf.get_i32_le() as usize;

        let mut payload = vec![0u8; body_len];
        self.stream.read_exact(&mut payload).ok()?;
        let mut payload = Bytes::from(payload);
        let statement_type = payload.get_i32_le();
        let partition_id = payload.get_i32_le();
        let statement_id = if statement_type == CONNECT {
            i64::from(payload.get_i32_le())
        } else {
            payload.get_i64_le()
        };

        let frame = Frame {
            connection: self.index,
            statement_type,
            partition_id,
            statement_id,
            body: payload,
        };
        self.frames.lock().push(frame.clone());
        Some(frame)
    }

    fn respond(&mut self, request: &Frame, body: BytesMut) {
        let mut payload = BytesMut::new();
        payload.put_i32_le(request.statement_type);
        if request.statement_type == CONNECT {
            payload.put_i32_le(request.statement_id as i32);
        } else {
            payload.put_i64_le(request.statement_id);
        }
        payload.put_u8(0);
        payload.extend_from_slice(&body);

        let mut out = BytesMut::with_capacity(EE_HEAD_LEN + payload.len());
        out.put_i32_le(MAGIC_NUMBER);
        out.put_i32_le(0);
        out.put_i32_le(0);
        out.put_i32_le(-1);
        out.put_i32_le(payload.len() as i32);
        out.extend_from_slice(&payload);
        let _ = self.stream.write_all(&out).and_then(|_| self.stream.flush());
    }

    fn connect_reply(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u8(match self.auth {
            AuthScript::None => 0,
            AuthScript::Challenge => 2,
        });
        body.put_i32_le(REMOTE_VERSION);
        body.put_u8(0);
        body.put_i32_le(2);
        body.put_bool(true);
        body.put_bool(false);
        body
    }

    fn login_reply(&self) -> BytesMut {
        let mut body = BytesMut::new();
        match (self.auth, self.login_round) {
            (AuthScript::None, _) => {
                body.put_u8(0);
                body.put_i64_le(0);
            }
            (AuthScript::Challenge, 1) => {
                body.put_u8(2);
                body.put_bool(true);
                body.put_string("nonce");
                body.put_string("00000001");
                body.put_string("opaque");
                body.put_string("salt");
            }
            (AuthScript::Challenge, _) => {
                body.put_u8(2);
                body.put_bool(false);
                body.put_i64_le(0);
            }
        }
        body
    }
}

fn skip_options(reader: &mut WireReader) {
    let size = reader.get_i32().unwrap();
    reader.get_bytes(size as usize).unwrap();
}

fn parse_sql(frame: &Frame) -> SqlRequest {
    let mut reader = WireReader::new(frame.body.clone());
    reader.get_bytes(16).unwrap();
    let mode = reader.get_u8().unwrap();
    let operation = reader.get_i32().unwrap();
    let query_id = reader.get_i64().unwrap();
    let old_query_id = reader.get_i64().unwrap();
    let transaction_started = reader.get_bool().unwrap();
    let retry = reader.get_bool().unwrap();
    let input_rows = if reader.get_bool().unwrap() {
        let count = reader.get_i64().unwrap();
        reader.get_sized_bytes().unwrap();
        reader.get_sized_bytes().unwrap();
        count
    } else {
        0
    };
    skip_options(&mut reader);
    let count = reader.get_i32().unwrap();
    let sql = (0..count).map(|_| reader.get_string().unwrap()).collect();

    SqlRequest {
        connection: frame.connection,
        statement_id: frame.statement_id,
        mode,
        operation,
        query_id,
        old_query_id,
        transaction_started,
        retry,
        input_rows,
        sql,
    }
}

pub fn parse_login(frame: &Frame) -> LoginRequest {
    let mut reader = WireReader::new(frame.body.clone());
    skip_options(&mut reader);
    let user = reader.get_string().unwrap();
    let secret = reader.get_string().unwrap();
    reader.get_i32().unwrap();
    let owner_mode = reader.get_bool().unwrap();
    let cluster = reader.get_string().unwrap();
    let mode = reader.get_u8().unwrap();
    let (challenged, opaque) = if mode != 0 && reader.get_bool().unwrap() {
        let opaque = reader.get_string().unwrap();
        reader.get_string().unwrap();
        (true, Some(opaque))
    } else {
        (false, None)
    };
    LoginRequest {
        user,
        secret,
        owner_mode,
        cluster,
        mode,
        challenged,
        opaque,
    }
}

/// Body of a SQL execute response
pub fn sql_response(transaction_started: bool, auto_commit: bool, results: &[ResultShape]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_bool(transaction_started);
    body.put_bool(auto_commit);
    body.put_i32_le(results.len() as i32);
    for result in results {
        match result {
            ResultShape::Update(count) => {
                body.put_i32_le(*count);
                body.put_i32_le(0);
                body.put_bool(false);
            }
            ResultShape::Prepared(parameters) => {
                body.put_i32_le(0);
                body.put_i32_le(*parameters);
                body.put_bool(false);
            }
            ResultShape::Table { following, rows } => {
                body.put_i32_le(-1);
                body.put_i32_le(0);
                body.put_bool(true);
                body.put_bool(*following);
                body.put_i32_le(rows.len() as i32);
                body.put_string("sch");
                body.put_i32_le(8 + 8 * rows.len() as i32);
                body.put_i64_le(0);
                for row in rows {
                    body.put_i64_le(*row);
                }
            }
        }
    }
    body
}

/// Auto-commit response carrying the given results
pub fn ok(results: &[ResultShape]) -> Reply {
    Reply::Success(sql_response(false, true, results))
}

/// Response carrying trailing environment entries
pub fn with_env(mut body: BytesMut, entries: &[(&str, &str)]) -> BytesMut {
    body.put_i32_le(entries.len() as i32);
    for (key, value) in entries {
        body.put_string(key);
        body.put_string(value);
    }
    body
}
