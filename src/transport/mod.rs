//! Node socket ownership and statement round trips

pub mod remote;
pub mod session;
pub mod stream;
pub mod tls;

pub use session::{NodeConfig, TransportSession, SPECIAL_PARTITION_ID};
pub use stream::NodeStream;
pub use tls::SecureSocketFactory;
