//! Caller-controlled limits on external inventory and engine calls.

use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::errors::{LcaError, Result};

/// Owner side of a cancellation flag shared with running pipelines.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal(self.sender.subscribe())
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Deadline and cancellation of a run, observed by every external call.
#[derive(Debug, Clone, Default)]
pub struct CallGuard {
    deadline: Option<Instant>,
    signal: Option<CancelSignal>,
}

impl CallGuard {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancel(mut self, signal: CancelSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Fails when the run was cancelled or its deadline has passed.
    pub fn check(&self, flow: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(LcaError::Cancelled {
                flow: flow.to_string(),
            });
        }
        if matches!(self.remaining(), Some(remaining) if remaining.is_zero()) {
            return Err(LcaError::TimedOut {
                flow: flow.to_string(),
            });
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal
            .as_ref()
            .map(CancelSignal::is_cancelled)
            .unwrap_or(false)
    }

    /// Time left before the deadline; `None` when the run is unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}
