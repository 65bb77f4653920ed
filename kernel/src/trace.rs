//! Scheduling event sink.
//!
//! Every interesting scheduler transition is pushed onto a lock-free queue
//! as a typed event, alongside the textual log line. The sink feeds nothing
//! back into scheduling decisions; it exists so a harness can drain the
//! exact history of a simulation and assert on it.

use crate::scheduler::thread::ThreadId;
use crossbeam_queue::SegQueue;

/// One recorded scheduling transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedEvent {
    /// Thread inserted into the ready queue with the given ordering key.
    Enqueued { tick: u64, tid: ThreadId, key: f64 },

    /// Thread removed from the ready queue and stamped as dispatched.
    Dispatched { tick: u64, tid: ThreadId },

    /// A waking thread beat the running thread's live remaining time and a
    /// preemption was requested from the interrupt controller.
    PreemptRequested {
        tick: u64,
        tid: ThreadId,
        candidate_key: f64,
        running_remaining: f64,
    },

    /// A blocking thread folded its measured burst into its estimate.
    EstimateUpdated {
        tick: u64,
        tid: ThreadId,
        previous: f64,
        measured: f64,
        estimate: f64,
    },

    /// Control of the processor moved between two threads.
    Switched { tick: u64, from: ThreadId, to: ThreadId },

    /// The processor had nothing to run and slept until the next event.
    Idled { from_tick: u64, to_tick: u64 },

    /// A finished thread's carcass was reclaimed.
    Destroyed { tid: ThreadId },
}

pub struct SchedTrace {
    events: SegQueue<SchedEvent>,
}

impl SchedTrace {
    pub fn new() -> Self {
        Self {
            events: SegQueue::new(),
        }
    }

    pub fn emit(&self, event: SchedEvent) {
        self.events.push(event);
    }

    /// Remove and return everything recorded so far, oldest first.
    pub fn drain(&self) -> Vec<SchedEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.events.pop() {
            out.push(event);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for SchedTrace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_order() {
        let trace = SchedTrace::new();
        trace.emit(SchedEvent::Dispatched { tick: 1, tid: 7 });
        trace.emit(SchedEvent::Destroyed { tid: 7 });

        let events = trace.drain();
        assert_eq!(
            events,
            vec![
                SchedEvent::Dispatched { tick: 1, tid: 7 },
                SchedEvent::Destroyed { tid: 7 },
            ]
        );
        assert!(trace.is_empty());
    }
}
