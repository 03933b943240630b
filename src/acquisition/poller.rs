//! Blocking status poller.
//!
//! Repeatedly calls `pl_exp_check_status` until the device reports a terminal
//! state. A failing status query counts as a failed readout. The loop is bounded
//! by an optional attempt count and wall-clock timeout and checks a
//! [`CancelToken`] on every iteration.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::cancel::CancelToken;
use crate::device::{CameraHandle, PvcamDevice, SequenceStatus};
use crate::error::DeviceError;

/// Time allowed for readout on top of the exposure itself.
pub const DEFAULT_READOUT_MARGIN: Duration = Duration::from_secs(30);

/// Pause between status queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bounds on the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep between queries. Zero busy-polls.
    pub interval: Duration,
    /// Give up after this many queries.
    pub max_attempts: Option<u32>,
    /// Give up after this much wall-clock time.
    pub timeout: Option<Duration>,
}

impl PollPolicy {
    /// Poll until a terminal state, however long it takes.
    pub fn unbounded() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: None,
            timeout: None,
        }
    }

    /// Timeout of `exposure` plus [`DEFAULT_READOUT_MARGIN`].
    pub fn for_exposure(exposure: Duration) -> Self {
        Self {
            timeout: Some(exposure.saturating_add(DEFAULT_READOUT_MARGIN)),
            ..Self::unbounded()
        }
    }

    /// Replace the interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Replace the attempt bound.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Replace the wall-clock bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.timeout.is_some_and(|limit| elapsed >= limit)
    }
}

/// A terminal status and how it was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledStatus {
    /// `ReadoutComplete` or `ReadoutFailed`.
    pub status: SequenceStatus,
    /// Status queries made.
    pub attempts: u32,
    /// Bytes reported by the last successful query.
    pub bytes_arrived: u32,
    /// Set when the query call itself failed.
    pub fault: Option<DeviceError>,
}

/// Polling stopped before a terminal state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PollError {
    /// The policy's attempt or time bound was reached.
    #[error("no terminal status after {attempts} polls ({elapsed:?})")]
    Timeout {
        /// Status queries made.
        attempts: u32,
        /// Time since the first query.
        elapsed: Duration,
    },

    /// The cancel token was set.
    #[error("polling cancelled after {attempts} polls")]
    Cancelled {
        /// Status queries made before the cancel was seen.
        attempts: u32,
    },
}

/// Block until the exposure on `handle` completes or fails.
pub fn poll_until_terminal(
    device: &dyn PvcamDevice,
    handle: CameraHandle,
    policy: &PollPolicy,
    cancel: &CancelToken,
) -> Result<PolledStatus, PollError> {
    let started = Instant::now();
    let mut attempts: u32 = 0;
    let mut bytes_arrived: u32 = 0;
    let mut last_status = None;

    loop {
        if cancel.is_cancelled() {
            tracing::warn!(attempts, "Status polling cancelled");
            return Err(PollError::Cancelled { attempts });
        }
        let elapsed = started.elapsed();
        if policy.exhausted(attempts, elapsed) {
            tracing::error!(attempts, ?elapsed, "Status polling timed out");
            return Err(PollError::Timeout { attempts, elapsed });
        }

        attempts += 1;
        match device.check_status(handle) {
            Err(e) => {
                tracing::error!(attempts, code = e.code, "Status query failed: {}", e);
                return Ok(PolledStatus {
                    status: SequenceStatus::ReadoutFailed,
                    attempts,
                    bytes_arrived,
                    fault: Some(e),
                });
            }
            Ok(report) => {
                let status = report.status();
                bytes_arrived = report.bytes_arrived;
                if last_status != Some(status) {
                    tracing::debug!(?status, raw = report.raw, bytes_arrived, "Status changed");
                    last_status = Some(status);
                }
                if status.is_terminal() {
                    return Ok(PolledStatus {
                        status,
                        attempts,
                        bytes_arrived,
                        fault: None,
                    });
                }
            }
        }

        if !policy.interval.is_zero() {
            thread::sleep(policy.interval);
        }
    }
}
