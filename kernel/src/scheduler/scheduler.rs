//! Choosing the next thread to run and dispatching to it.
//!
//! Every routine here assumes interrupts are already disabled: on a single
//! simulated processor that is the mutual exclusion. Locks cannot provide
//! it; waiting on a busy lock would call back into the scheduler and loop
//! forever. Each entry point asserts the level instead.

use crate::interrupt::{IntLevel, MachineStatus};
use crate::kernel::Kernel;
use crate::scheduler::queue::{ReadyEntry, ReadyQueue};
use crate::scheduler::switch::{self, Resumption};
use crate::scheduler::thread::{ThreadId, ThreadState};
use crate::sched_assert;
use crate::trace::SchedEvent;
use spin::Mutex;
use std::sync::Arc;

pub struct Scheduler {
    ready: Mutex<ReadyQueue>,
    current: Mutex<ThreadId>,
    to_be_destroyed: Mutex<Option<ThreadId>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            ready: Mutex::new(ReadyQueue::new()),
            current: Mutex::new(0),
            to_be_destroyed: Mutex::new(None),
        }
    }

    /// Thread currently bound to the processor. While the current thread
    /// sleeps with nothing else runnable this still names it: the binding
    /// changes only at a dispatch.
    pub fn current(&self) -> ThreadId {
        *self.current.lock()
    }

    pub(crate) fn set_current(&self, tid: ThreadId) {
        *self.current.lock() = tid;
    }

    pub fn ready_len(&self) -> usize {
        self.ready.lock().len()
    }

    pub(crate) fn ready_snapshot(&self) -> Vec<ReadyEntry> {
        self.ready.lock().entries().to_vec()
    }

    pub(crate) fn to_be_destroyed_id(&self) -> Option<ThreadId> {
        *self.to_be_destroyed.lock()
    }

    /// Mark a thread runnable and queue it by its predicted remaining
    /// time. A thread arriving from `Blocked` or `JustCreated` may deserve
    /// the processor more than the thread holding it, so those arrivals
    /// run the preemption check first; a running thread re-queueing itself
    /// is already surrendering and does not.
    pub fn ready_to_run(&self, kernel: &Kernel, tid: ThreadId) {
        sched_assert!(
            kernel.interrupt.level() == IntLevel::Off,
            "ready_to_run with interrupts enabled"
        );

        let status = kernel.with_thread(tid, |t| t.status());
        if matches!(status, ThreadState::Blocked | ThreadState::JustCreated) {
            self.check_preempt(kernel, tid);
        }

        let key = kernel.with_thread_mut(tid, |t| {
            t.set_status(ThreadState::Ready);
            t.predictor().key()
        });

        let tick = kernel.now();
        log::debug!("tick {}: thread {} enqueued, key {:.2}", tick, tid, key);
        kernel.trace.emit(SchedEvent::Enqueued { tick, tid, key });

        self.ready.lock().insert(key, tid);
    }

    /// Decide whether `candidate` should preempt the running thread, and
    /// if so ask the interrupt controller to arrange a yield at the next
    /// safe point. Never switches synchronously.
    pub fn check_preempt(&self, kernel: &Kernel, candidate: ThreadId) {
        if kernel.interrupt.status() == MachineStatus::Idle {
            // Nothing is running; the idle loop will pick the candidate up.
            return;
        }

        let now = kernel.now();
        let running = self.current();
        // Unclamped: an overrun incumbent goes negative and loses to any
        // queued candidate.
        let remaining = kernel.with_thread(running, |t| t.predictor().live_remaining(now));
        let key = kernel.with_thread(candidate, |t| t.predictor().key());

        if key < remaining {
            log::debug!(
                "tick {}: thread {} (key {:.2}) preempts thread {} (remaining {:.2})",
                now,
                candidate,
                key,
                running,
                remaining
            );
            kernel.trace.emit(SchedEvent::PreemptRequested {
                tick: now,
                tid: candidate,
                candidate_key: key,
                running_remaining: remaining,
            });
            kernel.stats.note_preempt_request();
            kernel.interrupt.preempt();
        }
    }

    /// Pop the front of the ready queue and stamp its dispatch time.
    pub fn find_next_to_run(&self, kernel: &Kernel) -> Option<ThreadId> {
        sched_assert!(
            kernel.interrupt.level() == IntLevel::Off,
            "find_next_to_run with interrupts enabled"
        );

        let entry = self.ready.lock().remove_front()?;
        let tick = kernel.now();
        kernel.with_thread_mut(entry.tid, |t| t.predictor_mut().note_dispatch(tick));

        log::debug!("tick {}: thread {} dispatched", tick, entry.tid);
        kernel.trace.emit(SchedEvent::Dispatched {
            tick,
            tid: entry.tid,
        });

        Some(entry.tid)
    }

    /// Dispatch to `next`. If `next` is already the current thread (it
    /// still has the smallest key after re-queueing itself, or it was the
    /// sole thread and just woke) there is nothing to switch.
    ///
    /// Otherwise hand the processor over. A finishing caller cannot free
    /// the stack it is running on, so it parks its carcass in the
    /// destruction slot and never resumes; the thread that next returns
    /// from a switch drains the slot.
    pub fn run(&self, kernel: &Kernel, next: ThreadId, finishing: bool) {
        sched_assert!(
            kernel.interrupt.level() == IntLevel::Off,
            "run with interrupts enabled"
        );

        let old = self.current();

        if next == old {
            sched_assert!(!finishing, "finishing thread re-selected itself");
            kernel.with_thread_mut(next, |t| {
                t.set_status(ThreadState::Running);
                t.check_overflow();
            });
            return;
        }

        if finishing {
            let mut slot = self.to_be_destroyed.lock();
            sched_assert!(
                slot.is_none(),
                "destruction slot already holds thread {:?}",
                *slot
            );
            *slot = Some(old);
        }

        let (old_link, next_link) = {
            let mut table = kernel.threads_mut();

            let old_thread = match table.get_mut(&old) {
                Some(t) => t,
                None => panic!("[sched] unknown thread id {}", old),
            };
            if old_thread.space().is_some() {
                old_thread.save_user_state(&kernel.machine);
            }
            if let Some(space) = old_thread.space() {
                space.save_state(&kernel.machine);
            }
            old_thread.check_overflow();
            let old_link = Arc::clone(old_thread.link());

            let next_thread = match table.get_mut(&next) {
                Some(t) => t,
                None => panic!("[sched] unknown thread id {}", next),
            };
            next_thread.set_status(ThreadState::Running);
            let next_link = Arc::clone(next_thread.link());

            (old_link, next_link)
        };

        self.set_current(next);
        kernel.stats.note_context_switch();
        let tick = kernel.now();
        log::debug!("tick {}: switching {} -> {}", tick, old, next);
        kernel.trace.emit(SchedEvent::Switched {
            tick,
            from: old,
            to: next,
        });

        if switch::raw_switch(&old_link, &next_link, finishing) == Resumption::Exiting {
            // Finishing thread: unwind without touching the kernel again.
            return;
        }

        // Back on this thread's stack, possibly much later.
        sched_assert!(
            kernel.interrupt.level() == IntLevel::Off,
            "interrupts re-enabled across a context switch"
        );
        self.check_to_be_destroyed(kernel);

        let mut table = kernel.threads_mut();
        let me = match table.get_mut(&old) {
            Some(t) => t,
            None => panic!("[sched] unknown thread id {}", old),
        };
        if me.space().is_some() {
            me.restore_user_state(&kernel.machine);
        }
        if let Some(space) = me.space() {
            space.restore_state(&kernel.machine);
        }
    }

    /// Reclaim a thread that finished on the far side of the last switch.
    /// It could not be freed earlier: until the switch completed, the
    /// processor was still running on its stack.
    pub fn check_to_be_destroyed(&self, kernel: &Kernel) {
        let victim = self.to_be_destroyed.lock().take();
        if let Some(tid) = victim {
            let mut thread = kernel.remove_thread(tid);
            let host = thread.take_host();

            log::debug!("reclaiming finished thread {} ({})", tid, thread.name());
            kernel.trace.emit(SchedEvent::Destroyed { tid });
            kernel.stats.note_destroyed();

            drop(thread);
            if let Some(host) = host {
                let _ = host.join();
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::scheduler::predictor::BurstPredictor;
    use crate::scheduler::thread::Thread;

    // Registers a thread without arming a backing host thread; fine for
    // tests that never dispatch it.
    fn plant_thread(kernel: &Kernel, name: &str, estimate: f64) -> ThreadId {
        let tid = kernel.alloc_tid();
        kernel.insert_thread(Box::new(Thread::new(name, tid, estimate)));
        tid
    }

    fn preempt_events(kernel: &Kernel) -> Vec<SchedEvent> {
        kernel
            .trace
            .drain()
            .into_iter()
            .filter(|e| matches!(e, SchedEvent::PreemptRequested { .. }))
            .collect()
    }

    #[test]
    fn waking_shorter_thread_requests_preemption() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();

        // Running thread predicted to need 100 ticks, dispatched at tick 0.
        kernel.with_thread_mut(0, |t| *t.predictor_mut() = BurstPredictor::new(100.0));
        kernel.run_ticks(40);

        let candidate = plant_thread(&kernel, "waker", 30.0);
        let old = kernel.interrupt.set_level(IntLevel::Off);
        kernel.scheduler.check_preempt(&kernel, candidate);
        kernel.interrupt.set_level(old);

        let events = preempt_events(&kernel);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SchedEvent::PreemptRequested {
                tick,
                tid,
                candidate_key,
                running_remaining,
            } => {
                assert_eq!(*tick, 40);
                assert_eq!(*tid, candidate);
                assert_eq!(*candidate_key, 30.0);
                assert_eq!(*running_remaining, 60.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(kernel.interrupt.preempt_pending());
    }

    #[test]
    fn longer_thread_does_not_preempt() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();

        kernel.with_thread_mut(0, |t| *t.predictor_mut() = BurstPredictor::new(100.0));
        kernel.run_ticks(40);

        let candidate = plant_thread(&kernel, "waker", 70.0);
        let old = kernel.interrupt.set_level(IntLevel::Off);
        kernel.scheduler.check_preempt(&kernel, candidate);
        kernel.interrupt.set_level(old);

        assert!(preempt_events(&kernel).is_empty());
        assert!(!kernel.interrupt.preempt_pending());

        // The decision not to preempt implies the candidate's key was no
        // better than the incumbent's live remaining time.
        let remaining = kernel.with_thread(0, |t| t.predictor().live_remaining(kernel.now()));
        let key = kernel.with_thread(candidate, |t| t.predictor().key());
        assert!(key >= remaining);
    }

    #[test]
    fn overrun_incumbent_loses_to_nobody() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();

        // Estimate 10, but it has been running 50 ticks: live key is -40.
        kernel.with_thread_mut(0, |t| *t.predictor_mut() = BurstPredictor::new(10.0));
        kernel.run_ticks(50);

        let candidate = plant_thread(&kernel, "waker", 0.0);
        let old = kernel.interrupt.set_level(IntLevel::Off);
        kernel.scheduler.check_preempt(&kernel, candidate);
        kernel.interrupt.set_level(old);

        assert!(preempt_events(&kernel).is_empty());
    }

    #[test]
    fn ready_to_run_orders_by_key() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();

        let a = plant_thread(&kernel, "a", 30.0);
        let b = plant_thread(&kernel, "b", 10.0);
        let c = plant_thread(&kernel, "c", 20.0);

        let old = kernel.interrupt.set_level(IntLevel::Off);
        for tid in [a, b, c] {
            kernel.scheduler.ready_to_run(&kernel, tid);
        }
        kernel.interrupt.take_preempt_request();

        let order: Vec<ThreadId> =
            std::iter::from_fn(|| kernel.scheduler.find_next_to_run(&kernel)).collect();
        kernel.interrupt.set_level(old);

        assert_eq!(order, vec![b, c, a]);
    }

    #[test]
    fn dispatch_stamps_the_start_tick() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        kernel.run_ticks(25);

        let tid = plant_thread(&kernel, "w", 5.0);
        let old = kernel.interrupt.set_level(IntLevel::Off);
        kernel.scheduler.ready_to_run(&kernel, tid);
        kernel.interrupt.take_preempt_request();
        let next = kernel.scheduler.find_next_to_run(&kernel);
        kernel.interrupt.set_level(old);

        assert_eq!(next, Some(tid));
        assert_eq!(kernel.with_thread(tid, |t| t.predictor().run_start()), 25.0);
    }

    #[test]
    #[should_panic(expected = "interrupts enabled")]
    fn ready_to_run_with_interrupts_enabled_is_fatal() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let tid = plant_thread(&kernel, "w", 0.0);
        kernel.scheduler.ready_to_run(&kernel, tid);
    }
}
