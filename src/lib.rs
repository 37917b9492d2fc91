//! Blocking client driver for a clustered SQL node protocol
//!
//! Layers, leaves first: wire framing ([`protocol`]), the CONNECT/LOGIN
//! handshake ([`auth`]), heartbeats and cancellation ([`heartbeat`]), one
//! socket per node ([`transport`]), reconnect-and-retry across nodes
//! ([`failover`]) and SQL statement sessions ([`query`]).

pub mod auth;
pub mod config;
pub mod error;
pub mod failover;
pub mod heartbeat;
pub mod metrics;
pub mod protocol;
pub mod query;
pub mod transport;

pub use error::{DriverError, ErrorDetail};
pub use query::{ConnectOptions, QuerySession, ResultCursor, RowCodec, SqlConnection};
