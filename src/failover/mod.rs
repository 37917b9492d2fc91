//! Node failover
//!
//! Connection failures are retried against the next node within a time
//! budget derived from the caller's query timeout. Routing failures
//! invalidate cached topology before the retry.

pub mod budget;
pub mod executor;
pub mod topology;

pub use budget::{FailureWindow, RetryBudget, TIMEOUT_RESOLUTION};
pub use executor::{AttemptContext, FailoverAttempt, FailoverExecutor, FailoverTimeouts};
pub use topology::{CachingProvider, ClusterInfo, FixedListProvider, TopologyProvider};
