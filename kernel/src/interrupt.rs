//! Simulated interrupt controller.
//!
//! Owns the interrupt-enable level (the kernel's only mutual exclusion),
//! the queue of pending timer events, and the preemption-request flag the
//! scheduler writes. Time moves in two ways: the machine loop advances one
//! tick at a time while a thread runs, and `idle` jumps straight to the
//! next pending event when nothing is runnable.

use crate::kernel::Kernel;
use crate::sched_assert;
use crate::trace::SchedEvent;
use spin::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Interrupt-enable level. Scheduler entry points require `Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntLevel {
    Off,
    On,
}

/// What the processor is doing, as far as the controller can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    /// Nothing runnable; the clock is jumping between pending events.
    Idle,
    /// A thread holds the processor.
    System,
}

struct PendingInterrupt {
    due: u64,
    seq: u64,
    label: &'static str,
    handler: Box<dyn FnOnce(&Kernel) + Send>,
}

pub struct Interrupt {
    level: Mutex<IntLevel>,
    status: Mutex<MachineStatus>,
    pending: Mutex<Vec<PendingInterrupt>>,
    pending_seq: AtomicU64,
    yield_requested: AtomicBool,
    in_handler: AtomicBool,
}

impl Interrupt {
    pub fn new() -> Self {
        Self {
            level: Mutex::new(IntLevel::Off),
            status: Mutex::new(MachineStatus::System),
            pending: Mutex::new(Vec::new()),
            pending_seq: AtomicU64::new(0),
            yield_requested: AtomicBool::new(false),
            in_handler: AtomicBool::new(false),
        }
    }

    pub fn level(&self) -> IntLevel {
        *self.level.lock()
    }

    /// Change the interrupt level, returning the previous one so callers
    /// can restore it.
    pub fn set_level(&self, level: IntLevel) -> IntLevel {
        sched_assert!(
            !(level == IntLevel::On && self.in_handler.load(Ordering::SeqCst)),
            "interrupts enabled inside an interrupt handler"
        );
        let mut current = self.level.lock();
        let old = *current;
        *current = level;
        old
    }

    pub fn enable(&self) {
        self.set_level(IntLevel::On);
    }

    pub fn status(&self) -> MachineStatus {
        *self.status.lock()
    }

    /// Ask for the running thread to yield at the next safe point. The
    /// scheduler never switches from inside a wake-up; it only leaves this
    /// request behind.
    pub fn preempt(&self) {
        log::trace!("preemption requested");
        self.yield_requested.store(true, Ordering::SeqCst);
    }

    pub fn preempt_pending(&self) -> bool {
        self.yield_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn take_preempt_request(&self) -> bool {
        self.yield_requested.swap(false, Ordering::SeqCst)
    }

    /// Arrange for `handler` to fire `delay` ticks from now. Handlers run
    /// with interrupts off; equal due times fire in scheduling order.
    pub fn schedule(
        &self,
        kernel: &Kernel,
        delay: u64,
        label: &'static str,
        handler: impl FnOnce(&Kernel) + Send + 'static,
    ) {
        sched_assert!(delay > 0, "interrupt scheduled with zero delay");

        let due = kernel.now() + delay;
        let seq = self.pending_seq.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.pending.lock();
        let at = pending.partition_point(|p| p.due <= due);
        pending.insert(
            at,
            PendingInterrupt {
                due,
                seq,
                label,
                handler: Box::new(handler),
            },
        );
        log::trace!("scheduled {} (#{}) for tick {}", label, seq, due);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Advance the clock one tick, fire whatever came due, and service a
    /// pending preemption request. Tick boundaries are the safe points:
    /// the running thread's stack is quiescent here.
    pub fn one_tick(&self, kernel: &Kernel) {
        sched_assert!(
            self.level() == IntLevel::On,
            "the machine only runs with interrupts enabled"
        );

        kernel.stats.advance_system(1);

        let old = self.set_level(IntLevel::Off);
        self.fire_due(kernel);
        self.set_level(old);

        if self.take_preempt_request() {
            kernel.yield_now();
        }
    }

    /// Nothing is runnable: jump the clock to the next pending event and
    /// fire it. Must be called with interrupts off and the ready queue
    /// empty. If no event is pending the machine would sleep forever,
    /// which is a wedged simulation, not a wait.
    pub fn idle(&self, kernel: &Kernel) {
        sched_assert!(
            self.level() == IntLevel::Off,
            "idle with interrupts enabled"
        );

        let now = kernel.now();
        let due = match self.pending.lock().first().map(|p| p.due) {
            Some(due) => due,
            None => {
                log::error!("tick {}: idle with no pending interrupts", now);
                panic!("[sched] machine idle with no pending interrupts");
            }
        };

        *self.status.lock() = MachineStatus::Idle;
        if due > now {
            kernel.stats.advance_idle(due - now);
            log::debug!("tick {}: processor idle until tick {}", now, due);
            kernel.trace.emit(SchedEvent::Idled {
                from_tick: now,
                to_tick: due,
            });
        }
        self.fire_due(kernel);
        *self.status.lock() = MachineStatus::System;
    }

    fn fire_due(&self, kernel: &Kernel) {
        loop {
            let event = {
                let mut pending = self.pending.lock();
                if pending.first().map_or(false, |p| p.due <= kernel.now()) {
                    Some(pending.remove(0))
                } else {
                    None
                }
            };
            let event = match event {
                Some(event) => event,
                None => break,
            };

            log::trace!("tick {}: firing {} (#{})", kernel.now(), event.label, event.seq);
            self.in_handler.store(true, Ordering::SeqCst);
            (event.handler)(kernel);
            self.in_handler.store(false, Ordering::SeqCst);
        }
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use std::sync::atomic::AtomicU64 as TestCounter;
    use std::sync::Arc;

    #[test]
    fn set_level_returns_the_previous_level() {
        let interrupt = Interrupt::new();
        assert_eq!(interrupt.set_level(IntLevel::On), IntLevel::Off);
        assert_eq!(interrupt.set_level(IntLevel::Off), IntLevel::On);
        assert_eq!(interrupt.level(), IntLevel::Off);
    }

    #[test]
    fn events_fire_when_their_tick_arrives() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let fired = Arc::new(TestCounter::new(0));

        let at = Arc::clone(&fired);
        kernel
            .interrupt
            .schedule(&kernel, 3, "probe", move |kernel| {
                at.store(kernel.now(), Ordering::SeqCst);
            });

        kernel.run_ticks(2);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(kernel.interrupt.pending_count(), 1);

        kernel.run_ticks(1);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(kernel.interrupt.pending_count(), 0);
    }

    #[test]
    fn equal_due_times_fire_in_scheduling_order() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let order = Arc::new(spin::Mutex::new(Vec::new()));

        for tag in [1u64, 2, 3] {
            let order = Arc::clone(&order);
            kernel
                .interrupt
                .schedule(&kernel, 2, "tie", move |_| order.lock().push(tag));
        }

        kernel.run_ticks(2);
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn idle_jumps_to_the_next_event() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let fired = Arc::new(TestCounter::new(0));

        let at = Arc::clone(&fired);
        kernel
            .interrupt
            .schedule(&kernel, 50, "wake", move |kernel| {
                at.store(kernel.now(), Ordering::SeqCst);
            });

        let old = kernel.interrupt.set_level(IntLevel::Off);
        kernel.interrupt.idle(&kernel);
        kernel.interrupt.set_level(old);

        assert_eq!(kernel.now(), 50);
        assert_eq!(fired.load(Ordering::SeqCst), 50);
        assert_eq!(kernel.stats.snapshot().idle_ticks, 50);
    }

    #[test]
    #[should_panic(expected = "zero delay")]
    fn zero_delay_is_fatal() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        kernel.interrupt.schedule(&kernel, 0, "bad", |_| {});
    }

    #[test]
    #[should_panic(expected = "no pending interrupts")]
    fn idle_with_nothing_pending_is_fatal() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let _old = kernel.interrupt.set_level(IntLevel::Off);
        kernel.interrupt.idle(&kernel);
    }
}
