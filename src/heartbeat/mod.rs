//! Liveness probes and cancellation during long head waits

pub mod hook;
pub mod monitor;

pub use hook::{CancelHandle, NoopHook, QueryHook, SessionHook};
pub use monitor::HeartbeatOutcome;
