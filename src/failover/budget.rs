//! Time budget shared by the attempts of one operation

use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Smallest per-attempt timeout handed to a retried statement
pub const TIMEOUT_RESOLUTION: Duration = Duration::from_secs(1);

/// Timing of one failed attempt, as measured by the budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureWindow {
    /// Time spent on the operation so far
    pub elapsed: Duration,
    /// Time since the first failover of the current failure window
    pub failure: Duration,
}

/// Remaining time and retry count of one operation
///
/// Created from the caller's query timeout when an operation starts and
/// consumed across reconnect attempts; it is never reset mid-operation.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    query_timeout: Option<Duration>,
    network_timeout: Option<Duration>,
    failover_interval: Duration,
    remaining: Option<Duration>,
    started: Instant,
    failover_start: Option<Instant>,
    retry_count: u32,
}

impl RetryBudget {
    pub fn new(
        query_timeout: Option<Duration>,
        network_timeout: Option<Duration>,
        failover_interval: Duration,
    ) -> Self {
        Self::starting_at(Instant::now(), query_timeout, network_timeout, failover_interval)
    }

    pub fn starting_at(
        started: Instant,
        query_timeout: Option<Duration>,
        network_timeout: Option<Duration>,
        failover_interval: Duration,
    ) -> Self {
        let query_timeout = query_timeout.filter(|t| !t.is_zero());
        Self {
            query_timeout,
            network_timeout: network_timeout.filter(|t| !t.is_zero()),
            failover_interval,
            remaining: query_timeout,
            started,
            failover_start: None,
            retry_count: 0,
        }
    }

    /// Timeout granted to the next attempt
    pub fn remaining(&self) -> Option<Duration> {
        self.remaining
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout
    }

    pub fn failover_interval(&self) -> Duration {
        self.failover_interval
    }

    pub fn is_failing_over(&self) -> bool {
        self.failover_start.is_some()
    }

    /// The node answered heartbeats since the last failure; start a new window
    pub fn reset_failure_window(&mut self) {
        self.failover_start = None;
    }

    pub fn elapsed_at(&self, now: Instant, measured: Option<Duration>) -> Duration {
        now.saturating_duration_since(self.started)
            .max(measured.unwrap_or_default())
    }

    /// Measure a failed attempt
    ///
    /// `measured` is the wait reported by heartbeats for the running
    /// query. Returns `Err` with the same window once either the query
    /// timeout or, within one failure window, the network timeout is spent.
    pub fn check_failure(
        &mut self,
        now: Instant,
        measured: Option<Duration>,
    ) -> Result<FailureWindow, FailureWindow> {
        let elapsed = self.elapsed_at(now, measured);
        let failure = match self.failover_start {
            Some(start) => now.saturating_duration_since(start),
            None => {
                self.failover_start = Some(now);
                Duration::ZERO
            }
        };
        let window = FailureWindow { elapsed, failure };

        let query_spent = self.query_timeout.is_some_and(|t| elapsed > t);
        let network_spent = self.network_timeout.is_some_and(|t| failure > t);
        if query_spent || network_spent {
            return Err(window);
        }
        Ok(window)
    }

    /// Shrink the next attempt's timeout and count the retry
    ///
    /// Returns how long to wait before reconnecting; the first retry
    /// reconnects immediately.
    pub fn schedule_retry(&mut self, window: &FailureWindow) -> Option<Duration> {
        if let Some(query_timeout) = self.query_timeout {
            let left = query_timeout
                .saturating_sub(window.elapsed)
                .saturating_sub(self.failover_interval);
            self.remaining = Some(left.max(TIMEOUT_RESOLUTION));
        }
        let sleep = (self.retry_count > 0).then_some(self.failover_interval);
        self.retry_count += 1;
        sleep
    }

    /// Describe a failure with the budget state, for error messages
    pub fn describe(
        &self,
        message: &str,
        window: &FailureWindow,
        operation: &str,
        login: bool,
        reason: Option<&str>,
    ) -> String {
        let mut out = String::from(message);
        let _ = write!(
            out,
            " (retryCount={}, elapsedMillis={}",
            self.retry_count,
            window.elapsed.as_millis()
        );
        if !window.failure.is_zero() {
            let _ = write!(out, ", failureMillis={}", window.failure.as_millis());
        }
        let _ = write!(
            out,
            ", queryTimeoutMillis={}, {}={}, operation={}",
            format_timeout(self.query_timeout),
            if login { "loginTimeoutMillis" } else { "networkTimeoutMillis" },
            format_timeout(self.network_timeout),
            operation
        );
        if let Some(reason) = reason {
            let _ = write!(out, ", reason={}", reason);
        }
        out.push(')');
        out
    }
}

fn format_timeout(timeout: Option<Duration>) -> String {
    match timeout {
        Some(t) => t.as_millis().to_string(),
        None => "(not bounded)".to_string(),
    }
}
