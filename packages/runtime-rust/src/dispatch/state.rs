//! Lifecycle state and in-flight accounting for dispatchers and runtimes.
//!
//! State lives in an `ArcSwap` so readers never take a lock; transitions are
//! serialized by the owner. In-flight invocations are counted with RAII
//! guards, so the count stays accurate even when a handler panics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Lifecycle of a dispatcher or service runtime.
///
/// State machine: Created -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Built but not started; nothing is admitted.
    Created,
    /// Admitting and executing messages.
    Running,
    /// No longer admitting; finishing queued and in-flight work.
    Draining,
    /// Terminal. Not reusable.
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Lock-free shared lifecycle cell.
#[derive(Debug)]
pub struct StateCell(ArcSwap<LifecycleState>);

impl StateCell {
    #[must_use]
    pub fn new() -> Self {
        Self(ArcSwap::from_pointee(LifecycleState::Created))
    }

    #[must_use]
    pub fn get(&self) -> LifecycleState {
        **self.0.load()
    }

    pub fn set(&self, state: LifecycleState) {
        self.0.store(Arc::new(state));
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DispatchStats
// ---------------------------------------------------------------------------

/// Counters for one dispatcher. Every admitted message ends up counted in
/// exactly one of `handled` or `failed`.
#[derive(Debug, Default)]
pub struct DispatchStats {
    admitted: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

/// Point-in-time copy of `DispatchStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchSnapshot {
    pub admitted: u64,
    pub handled: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub peak_in_flight: u64,
}

impl DispatchSnapshot {
    /// Admitted messages that have not reached a terminal outcome yet.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.admitted.saturating_sub(self.handled + self.failed)
    }
}

impl DispatchStats {
    pub(crate) fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo `record_admitted` for an envelope the queue refused.
    pub(crate) fn revoke_admitted(&self) {
        self.admitted.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Creates an RAII guard that counts one executing handler invocation.
    ///
    /// The counter is incremented on creation and decremented when the guard
    /// is dropped, even if the handler panics.
    #[must_use]
    pub fn in_flight_guard(self: &Arc<Self>) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard {
            stats: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn snapshot(&self) -> DispatchSnapshot {
        // Outcomes before admissions, so a snapshot never shows more
        // outcomes than admitted messages.
        let handled = self.handled.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        DispatchSnapshot {
            admitted: self.admitted.load(Ordering::SeqCst),
            handled,
            failed,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    stats: Arc<DispatchStats>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
