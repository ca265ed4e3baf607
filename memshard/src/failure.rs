//! Per-server failure accounting and shunning.
//!
//! Failures are counted in a rolling window of `failure_timeout`. When a
//! server accumulates `max_failures` errors inside one window it is
//! shunned until `failure_timeout` has elapsed from the first error of
//! that window. Shunning gates only the connector: routing never changes
//! (keys are not rehashed away from a failed server), so requests for a
//! shunned server fail fast instead of being silently relocated.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default)]
struct Window {
    count: u32,
    started: Option<Instant>,
    shun_until: Option<Instant>,
}

/// Rolling failure counters for every configured server.
///
/// All methods take `now` explicitly so the windowing logic is testable
/// without sleeping.
#[derive(Debug)]
pub(crate) struct FailureTracker {
    /// 0 disables tracking entirely.
    max_failures: u32,
    window: Duration,
    slots: Vec<Window>,
    names: Vec<String>,
}

impl FailureTracker {
    pub(crate) fn new(max_failures: u32, window: Duration, names: Vec<String>) -> Self {
        FailureTracker {
            max_failures,
            window,
            slots: vec![Window::default(); names.len()],
            names,
        }
    }

    /// May the connector touch this server right now?
    ///
    /// An expired shun is cleared here; the counters themselves reset on
    /// the next successful connect.
    pub(crate) fn may_connect(&mut self, index: usize, now: Instant) -> bool {
        if self.max_failures == 0 {
            return true;
        }
        let slot = &mut self.slots[index];
        match slot.shun_until {
            Some(until) if now < until => false,
            Some(_) => {
                debug!(server = %self.names[index], "shun expired, allowing reconnect");
                slot.shun_until = None;
                true
            }
            None => true,
        }
    }

    /// Record one error from this server's engine or connector.
    pub(crate) fn record_failure(&mut self, index: usize, now: Instant) {
        if self.max_failures == 0 {
            return;
        }
        let slot = &mut self.slots[index];
        match slot.started {
            Some(started) if now.duration_since(started) <= self.window => {
                slot.count += 1;
            }
            _ => {
                slot.started = Some(now);
                slot.count = 1;
            }
        }
        if slot.count >= self.max_failures && slot.shun_until.is_none() {
            // The shun runs out one window after the first failure, not
            // after the last.
            let until = slot.started.map(|s| s + self.window);
            slot.shun_until = until;
            warn!(
                server = %self.names[index],
                failures = slot.count,
                "shunning server after repeated failures"
            );
        }
    }

    /// Record a successful connect; clears the window.
    pub(crate) fn record_success(&mut self, index: usize) {
        if self.max_failures == 0 {
            return;
        }
        let slot = &mut self.slots[index];
        slot.count = 0;
        slot.started = None;
        slot.shun_until = None;
    }
}
