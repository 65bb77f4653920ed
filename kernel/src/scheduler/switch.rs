//! Context-switch primitive.
//!
//! Each simulated thread is backed by a parked host thread; exactly one of
//! them holds the processor grant at any instant. Switching hands the grant
//! to the next thread and suspends the caller until the grant comes back.
//! A finishing thread hands the grant over and is never suspended: it
//! returns `Exiting`, unwinds through the trampoline and disappears, so no
//! post-switch kernel code ever runs on it.
//!
//! Must only be invoked with interrupts disabled; the caller re-checks the
//! level on resumption.

use crate::kernel::Kernel;
use crate::scheduler::thread::{ThreadId, INITIAL_ARG_SLOT};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, PoisonError};
use std::sync::Arc;

/// Outcome of a switch, observed by the thread that called it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resumption {
    /// The grant came back; the thread continues where it left off.
    Resumed,
    /// The caller is finishing and must unwind without touching the kernel.
    Exiting,
}

/// Per-thread processor grant.
pub(crate) struct SwitchLink {
    granted: Mutex<bool>,
    resume: Condvar,
}

impl SwitchLink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            granted: Mutex::new(false),
            resume: Condvar::new(),
        })
    }

    fn grant(&self) {
        let mut granted = self.granted.lock().unwrap_or_else(PoisonError::into_inner);
        *granted = true;
        self.resume.notify_one();
    }

    fn wait(&self) {
        let mut granted = self.granted.lock().unwrap_or_else(PoisonError::into_inner);
        while !*granted {
            granted = self
                .resume
                .wait(granted)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *granted = false;
    }
}

/// Hand the processor from `old` to `next`.
pub(crate) fn raw_switch(old: &SwitchLink, next: &SwitchLink, finishing: bool) -> Resumption {
    next.grant();
    if finishing {
        return Resumption::Exiting;
    }
    old.wait();
    Resumption::Resumed
}

/// Entry point of every forked thread's backing host thread.
///
/// Parks until the first dispatch, then runs the begin hook, the forked
/// function and the finish path. A panic in the body would leave the
/// simulation wedged with nobody holding the grant, so it aborts instead.
pub(crate) fn thread_root(kernel: Arc<Kernel>, tid: ThreadId, link: Arc<SwitchLink>) {
    link.wait();

    kernel.with_thread_mut(tid, |t| t.set_host_id(std::thread::current().id()));
    kernel.begin();

    let (entry, arg) = kernel.with_thread_mut(tid, |t| {
        (t.take_entry(), t.machine_state()[INITIAL_ARG_SLOT])
    });
    let entry = match entry {
        Some(entry) => entry,
        None => panic!("[sched] thread {} dispatched without an entry function", tid),
    };

    if catch_unwind(AssertUnwindSafe(|| entry(&kernel, arg))).is_err() {
        log::error!("thread {} panicked; aborting the simulation", tid);
        std::process::abort();
    }

    kernel.finish();
}
