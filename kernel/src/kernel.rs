//! Kernel wiring: one instance per simulation.
//!
//! The kernel owns every collaborator (scheduler, interrupt controller,
//! statistics clock, machine) and the registry that owns every thread
//! control block. Scheduler queues and slots refer to threads by id; the
//! registry is the single place a control block lives.
//!
//! Operations a thread performs on itself (`yield_now`, `sleep`, `finish`)
//! are kernel methods acting on the current thread, because they touch all
//! of the collaborators at once and the caller's control block is owned by
//! the registry.

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::interrupt::{IntLevel, Interrupt, MachineStatus};
use crate::machine::{AddrSpace, Machine};
use crate::sched_assert;
use crate::scheduler::thread::{Thread, ThreadEntry, ThreadId, ThreadState};
use crate::scheduler::Scheduler;
use crate::stats::Statistics;
use crate::trace::{SchedEvent, SchedTrace};
use hashbrown::HashMap;
use spin::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub struct Kernel {
    pub interrupt: Interrupt,
    pub scheduler: Scheduler,
    pub stats: Statistics,
    pub machine: Machine,
    pub trace: SchedTrace,
    config: KernelConfig,
    threads: Mutex<HashMap<ThreadId, Box<Thread>>>,
    next_tid: AtomicU64,
    me: Weak<Kernel>,
}

impl Kernel {
    /// Boot a kernel. The calling thread becomes the bootstrap thread: it
    /// is current, running, and owns no simulated stack.
    pub fn new(config: KernelConfig) -> Result<Arc<Self>, KernelError> {
        config.validate()?;

        let kernel = Arc::new_cyclic(|me| Kernel {
            interrupt: Interrupt::new(),
            scheduler: Scheduler::new(),
            stats: Statistics::new(),
            machine: Machine::new(),
            trace: SchedTrace::new(),
            config,
            threads: Mutex::new(HashMap::new()),
            next_tid: AtomicU64::new(0),
            me: me.clone(),
        });

        let tid = kernel.alloc_tid();
        let main = Thread::bootstrap("main", tid, config.initial_burst_estimate);
        kernel.scheduler.set_current(tid);
        kernel.insert_thread(Box::new(main));
        kernel.interrupt.enable();

        log::info!("kernel up, bootstrap thread {}", tid);
        Ok(kernel)
    }

    /// Current tick of the simulated clock.
    pub fn now(&self) -> u64 {
        self.stats.total_ticks()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Fork a new thread running `entry(arg)`.
    pub fn fork(&self, name: &str, entry: ThreadEntry, arg: usize) -> Result<ThreadId, KernelError> {
        let thread = Box::new(Thread::new(
            name,
            self.alloc_tid(),
            self.config.initial_burst_estimate,
        ));
        thread.fork(self, entry, arg)
    }

    /// Give up the processor but stay runnable. The caller's burst keeps
    /// accumulating; its queue key becomes what is predicted to remain.
    /// May dispatch right back to the caller if it still has the smallest
    /// key.
    pub fn yield_now(&self) {
        let old_level = self.interrupt.set_level(IntLevel::Off);
        self.assert_current_caller();

        let me = self.scheduler.current();
        let now = self.now();
        self.with_thread_mut(me, |t| t.predictor_mut().note_yield(now));
        log::debug!("tick {}: thread {} yields", now, me);

        self.scheduler.ready_to_run(self, me);
        let next = match self.scheduler.find_next_to_run(self) {
            Some(next) => next,
            None => panic!("[sched] ready queue empty immediately after re-enqueue"),
        };
        self.scheduler.run(self, next, false);

        self.interrupt.set_level(old_level);
    }

    /// Block the caller until something calls `ready_to_run` on it. Must
    /// be entered with interrupts already off: the decision to sleep and
    /// the sleep itself have to be atomic, or the wake-up can slip in
    /// between and be lost.
    ///
    /// With `finishing` the caller is dying: no predictor update, and the
    /// switch-out parks its carcass for the next thread to reclaim.
    pub fn sleep(&self, finishing: bool) {
        sched_assert!(
            self.interrupt.level() == IntLevel::Off,
            "sleep with interrupts enabled"
        );
        self.assert_current_caller();

        let me = self.scheduler.current();
        if !finishing {
            let now = self.now();
            let sample = self.with_thread_mut(me, |t| t.predictor_mut().note_block(now));
            log::debug!(
                "tick {}: thread {} blocks; estimate {:.2} -> {:.2} (measured {:.2})",
                now,
                me,
                sample.previous,
                sample.estimate,
                sample.measured
            );
            self.trace.emit(SchedEvent::EstimateUpdated {
                tick: now,
                tid: me,
                previous: sample.previous,
                measured: sample.measured,
                estimate: sample.estimate,
            });
        }
        self.with_thread_mut(me, |t| t.set_status(ThreadState::Blocked));

        let next = loop {
            match self.scheduler.find_next_to_run(self) {
                Some(next) => break next,
                None => self.interrupt.idle(self),
            }
        };
        self.scheduler.run(self, next, finishing);
    }

    /// Terminate the calling thread. Its control block and stack are
    /// reclaimed by whichever thread comes out of the next switch; the
    /// caller never runs again.
    pub fn finish(&self) {
        self.interrupt.set_level(IntLevel::Off);
        self.assert_current_caller();
        log::debug!(
            "tick {}: thread {} finishing",
            self.now(),
            self.scheduler.current()
        );
        self.sleep(true);
    }

    /// Block the caller for `ticks` simulated ticks: schedule the wake
    /// interrupt, then sleep on it.
    pub fn sleep_for(&self, ticks: u64) {
        let old_level = self.interrupt.set_level(IntLevel::Off);
        self.assert_current_caller();

        let me = self.scheduler.current();
        self.interrupt.schedule(self, ticks, "timed wake", move |kernel| {
            kernel.scheduler.ready_to_run(kernel, me);
        });
        self.sleep(false);

        self.interrupt.set_level(old_level);
    }

    /// First-dispatch hook, run exactly once per forked thread: reclaim
    /// whatever thread died getting here, then turn interrupts on.
    pub(crate) fn begin(&self) {
        self.assert_current_caller();
        self.scheduler.check_to_be_destroyed(self);
        self.interrupt.enable();
    }

    /// Advance the machine one simulated tick.
    pub fn tick(&self) {
        self.interrupt.one_tick(self);
    }

    /// Burn `ticks` ticks of simulated processor time on the calling
    /// thread. Due interrupts fire along the way and may preempt it.
    pub fn run_ticks(&self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    pub fn live_threads(&self) -> usize {
        self.threads.lock().len()
    }

    /// Attach a user address space to a thread; from then on its context
    /// switches save and restore user registers and space state.
    pub fn attach_space(&self, tid: ThreadId, space: AddrSpace) {
        self.with_thread_mut(tid, |t| t.set_space(space));
    }

    pub(crate) fn alloc_tid(&self) -> ThreadId {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn handle(&self) -> Arc<Kernel> {
        match self.me.upgrade() {
            Some(kernel) => kernel,
            None => panic!("[sched] kernel dropped while still in use"),
        }
    }

    pub(crate) fn insert_thread(&self, thread: Box<Thread>) {
        let tid = thread.id();
        let previous = self.threads.lock().insert(tid, thread);
        sched_assert!(previous.is_none(), "duplicate thread id {}", tid);
    }

    pub(crate) fn remove_thread(&self, tid: ThreadId) -> Box<Thread> {
        sched_assert!(
            tid != self.scheduler.current(),
            "destroying the running thread {}",
            tid
        );
        match self.threads.lock().remove(&tid) {
            Some(thread) => thread,
            None => panic!("[sched] unknown thread id {}", tid),
        }
    }

    pub(crate) fn with_thread<R>(&self, tid: ThreadId, f: impl FnOnce(&Thread) -> R) -> R {
        let table = self.threads.lock();
        match table.get(&tid) {
            Some(thread) => f(thread),
            None => panic!("[sched] unknown thread id {}", tid),
        }
    }

    pub(crate) fn with_thread_mut<R>(&self, tid: ThreadId, f: impl FnOnce(&mut Thread) -> R) -> R {
        let mut table = self.threads.lock();
        match table.get_mut(&tid) {
            Some(thread) => f(thread),
            None => panic!("[sched] unknown thread id {}", tid),
        }
    }

    pub(crate) fn threads_mut(&self) -> MutexGuard<'_, HashMap<ThreadId, Box<Thread>>> {
        self.threads.lock()
    }

    fn assert_current_caller(&self) {
        let current = self.scheduler.current();
        let host = self.with_thread(current, |t| t.host_id());
        sched_assert!(
            host == Some(std::thread::current().id()),
            "operation issued by a thread that is not current (current is thread {})",
            current
        );
    }

    /// Assert the cross-component invariants. Meant to be called from a
    /// quiescent point, typically a test harness between operations.
    pub fn self_check(&self) {
        let current = self.scheduler.current();
        let ready = self.scheduler.ready_snapshot();
        let condemned = self.scheduler.to_be_destroyed_id();
        let idle = self.interrupt.status() == MachineStatus::Idle;
        let table = self.threads.lock();

        let running: Vec<ThreadId> = table
            .values()
            .filter(|t| t.status() == ThreadState::Running)
            .map(|t| t.id())
            .collect();
        if idle {
            sched_assert!(
                running.is_empty(),
                "threads {:?} running while the processor idles",
                running
            );
        } else {
            sched_assert!(
                running.len() == 1 && running[0] == current,
                "running set {:?} does not match current thread {}",
                running,
                current
            );
        }

        sched_assert!(
            !ready.iter().any(|e| e.tid == current),
            "current thread {} is in the ready queue",
            current
        );

        if let Some(victim) = condemned {
            sched_assert!(victim != current, "current thread {} awaits destruction", current);
            if let Some(thread) = table.get(&victim) {
                sched_assert!(
                    thread.status() == ThreadState::Blocked,
                    "condemned thread {} is {}",
                    victim,
                    thread.status()
                );
            }
        }

        for entry in &ready {
            match table.get(&entry.tid) {
                Some(thread) => sched_assert!(
                    thread.status() == ThreadState::Ready,
                    "queued thread {} is {}",
                    entry.tid,
                    thread.status()
                ),
                None => panic!("[sched] queued thread {} is not registered", entry.tid),
            }
        }

        for thread in table.values() {
            let p = thread.predictor();
            sched_assert!(
                p.accumulated() >= 0.0 && p.estimate() >= 0.0 && p.key() >= 0.0,
                "thread {} predictor went negative",
                thread.id()
            );
        }

        for pair in ready.windows(2) {
            let ordered = match pair[0].key.total_cmp(&pair[1].key) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => pair[0].seq < pair[1].seq,
                std::cmp::Ordering::Greater => false,
            };
            sched_assert!(
                ordered,
                "ready queue out of order at threads {} and {}",
                pair[0].tid,
                pair[1].tid
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_leaves_a_running_bootstrap_thread() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        assert_eq!(kernel.live_threads(), 1);
        assert_eq!(kernel.scheduler.current(), 0);
        assert_eq!(kernel.interrupt.level(), IntLevel::On);
        assert_eq!(kernel.now(), 0);
        kernel.self_check();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = KernelConfig {
            initial_burst_estimate: f64::NAN,
            ..KernelConfig::default()
        };
        assert!(Kernel::new(config).is_err());
    }

    #[test]
    fn yield_with_empty_queue_redispatches_the_caller() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        kernel.run_ticks(5);
        kernel.yield_now();

        assert_eq!(kernel.scheduler.current(), 0);
        assert_eq!(
            kernel.with_thread(0, |t| t.status()),
            ThreadState::Running
        );
        kernel.self_check();
    }

    #[test]
    fn timed_sleep_idles_the_clock_forward() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        kernel.run_ticks(5);
        kernel.sleep_for(20);

        assert_eq!(kernel.now(), 25);
        assert_eq!(kernel.interrupt.level(), IntLevel::On);
        assert_eq!(kernel.stats.snapshot().idle_ticks, 20);
        let idled = kernel
            .trace
            .drain()
            .into_iter()
            .any(|e| e == SchedEvent::Idled { from_tick: 5, to_tick: 25 });
        assert!(idled);
        kernel.self_check();
    }

    #[test]
    fn sleeping_updates_the_estimate() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        kernel.run_ticks(100);
        kernel.sleep_for(50);

        // One 100-tick burst folded into an initial estimate of zero.
        assert_eq!(kernel.with_thread(0, |t| t.predictor().estimate()), 50.0);
        kernel.self_check();
    }

    #[test]
    #[should_panic(expected = "sleep with interrupts enabled")]
    fn sleeping_with_interrupts_enabled_is_fatal() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        kernel.sleep(false);
    }
}
