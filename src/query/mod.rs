//! SQL statement sessions over a failover-aware node connection
//!
//! A [`SqlConnection`] logs in once and hands out [`QuerySession`]s. Each
//! session runs prepare/execute/fetch/close round trips keyed by a query
//! id, pages through result tables with a [`ResultCursor`] and survives
//! node failover where the operation allows it.

pub mod connection;
pub mod cursor;
pub mod operation;
pub mod pool;
pub mod result;
pub mod session;

pub use connection::{ConnectOptions, SessionDefaults, SqlConnection};
pub use cursor::ResultCursor;
pub use operation::{SessionMode, StatementOperation};
pub use pool::{QueryPool, QueryRef, SlotId, DEFAULT_PENDING_CLOSE_CAPACITY};
pub use result::{ExecuteResponse, QueryResult, RemoteEnv, ResultPage, RowCodec};
pub use session::{InputRows, QuerySession};
