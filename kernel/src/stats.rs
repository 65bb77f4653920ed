//! System statistics and the simulated clock.
//!
//! `total_ticks` is the clock every scheduling decision reads; it only
//! moves forward, either one tick at a time under the machine loop or in a
//! single jump while the processor idles.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct Statistics {
    total_ticks: AtomicU64,
    system_ticks: AtomicU64,
    idle_ticks: AtomicU64,
    context_switches: AtomicU64,
    preempt_requests: AtomicU64,
    threads_forked: AtomicU64,
    threads_destroyed: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            total_ticks: AtomicU64::new(0),
            system_ticks: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
            preempt_requests: AtomicU64::new(0),
            threads_forked: AtomicU64::new(0),
            threads_destroyed: AtomicU64::new(0),
        }
    }

    /// Current tick count; monotonically non-decreasing.
    pub fn total_ticks(&self) -> u64 {
        self.total_ticks.load(Ordering::SeqCst)
    }

    pub(crate) fn advance_system(&self, ticks: u64) {
        self.total_ticks.fetch_add(ticks, Ordering::SeqCst);
        self.system_ticks.fetch_add(ticks, Ordering::SeqCst);
    }

    pub(crate) fn advance_idle(&self, ticks: u64) {
        self.total_ticks.fetch_add(ticks, Ordering::SeqCst);
        self.idle_ticks.fetch_add(ticks, Ordering::SeqCst);
    }

    pub(crate) fn note_context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_preempt_request(&self) {
        self.preempt_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_fork(&self) {
        self.threads_forked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_destroyed(&self) {
        self.threads_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_ticks: self.total_ticks.load(Ordering::SeqCst),
            system_ticks: self.system_ticks.load(Ordering::SeqCst),
            idle_ticks: self.idle_ticks.load(Ordering::SeqCst),
            context_switches: self.context_switches.load(Ordering::Relaxed),
            preempt_requests: self.preempt_requests.load(Ordering::Relaxed),
            threads_forked: self.threads_forked.load(Ordering::Relaxed),
            threads_destroyed: self.threads_destroyed.load(Ordering::Relaxed),
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_ticks: u64,
    pub system_ticks: u64,
    pub idle_ticks: u64,
    pub context_switches: u64,
    pub preempt_requests: u64,
    pub threads_forked: u64,
    pub threads_destroyed: u64,
}
