//! Dead-connection detection.

use std::time::Duration;

use tokio::time::Instant;

/// Tracks the deadline by which the next heartbeat must arrive.
///
/// The deadline is rearmed by [`reset`](Self::reset) on every heartbeat and
/// dropped by [`clear`](Self::clear) when the transport goes away. With no
/// timeout configured the monitor never arms.
#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    pub fn reset(&mut self) {
        self.deadline = self.timeout.map(|timeout| Instant::now() + timeout);
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Sleep until `deadline`, or forever if there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
