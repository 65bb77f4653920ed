//! Thread control block and fork path.

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::machine::{AddrSpace, Machine, NUM_TOTAL_REGS};
use crate::scheduler::predictor::BurstPredictor;
use crate::scheduler::switch::{self, SwitchLink};
use crate::scheduler::thread::stack::Stack;
use crate::scheduler::thread::state::{validate_transition, ThreadState};
use crate::sched_assert;
use std::sync::Arc;
use std::thread::JoinHandle;

pub type ThreadId = u64;

/// Function a forked thread runs, with its single word-sized argument.
pub type ThreadEntry = fn(&Arc<Kernel>, usize);

/// Number of saved machine-state register slots per thread.
pub const MACHINE_STATE_SLOTS: usize = 8;

pub const PC_SLOT: usize = 0;
pub const SP_SLOT: usize = 1;
pub const FP_SLOT: usize = 2;
pub const STARTUP_PC_SLOT: usize = 3;
pub const INITIAL_PC_SLOT: usize = 4;
pub const INITIAL_ARG_SLOT: usize = 5;
pub const WHEN_DONE_PC_SLOT: usize = 6;

/// Per-thread control block. Owned by the kernel's thread registry; the
/// scheduler's queues and slots refer to threads by id only.
pub struct Thread {
    id: ThreadId,
    name: Box<str>,
    status: ThreadState,
    stack: Option<Stack>,
    machine_state: [usize; MACHINE_STATE_SLOTS],
    user_registers: [i32; NUM_TOTAL_REGS],
    space: Option<AddrSpace>,
    predictor: BurstPredictor,
    entry: Option<ThreadEntry>,
    link: Arc<SwitchLink>,
    host: Option<JoinHandle<()>>,
    host_id: Option<std::thread::ThreadId>,
}

impl Thread {
    pub fn new(name: &str, id: ThreadId, initial_estimate: f64) -> Self {
        Self {
            id,
            name: name.into(),
            status: ThreadState::JustCreated,
            stack: None,
            machine_state: [0; MACHINE_STATE_SLOTS],
            user_registers: [0; NUM_TOTAL_REGS],
            space: None,
            predictor: BurstPredictor::new(initial_estimate),
            entry: None,
            link: SwitchLink::new(),
            host: None,
            host_id: None,
        }
    }

    /// Control block for the thread the kernel boots on. It is already
    /// running on the host's own stack, so it has no simulated stack and
    /// no entry function.
    pub(crate) fn bootstrap(name: &str, id: ThreadId, initial_estimate: f64) -> Self {
        let mut thread = Self::new(name, id, initial_estimate);
        thread.status = ThreadState::Running;
        thread.host_id = Some(std::thread::current().id());
        thread
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ThreadState {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: ThreadState) {
        sched_assert!(
            validate_transition(self.status, status),
            "thread {} ({}): illegal transition {} -> {}",
            self.id,
            self.name,
            self.status,
            status
        );
        self.status = status;
    }

    pub fn predictor(&self) -> &BurstPredictor {
        &self.predictor
    }

    pub(crate) fn predictor_mut(&mut self) -> &mut BurstPredictor {
        &mut self.predictor
    }

    pub fn machine_state(&self) -> &[usize; MACHINE_STATE_SLOTS] {
        &self.machine_state
    }

    pub fn space(&self) -> Option<&AddrSpace> {
        self.space.as_ref()
    }

    pub(crate) fn set_space(&mut self, space: AddrSpace) {
        self.space = Some(space);
    }

    pub(crate) fn link(&self) -> &Arc<SwitchLink> {
        &self.link
    }

    pub(crate) fn take_entry(&mut self) -> Option<ThreadEntry> {
        self.entry.take()
    }

    pub(crate) fn take_host(&mut self) -> Option<JoinHandle<()>> {
        self.host.take()
    }

    pub(crate) fn host_id(&self) -> Option<std::thread::ThreadId> {
        self.host_id
    }

    pub(crate) fn set_host_id(&mut self, id: std::thread::ThreadId) {
        self.host_id = Some(id);
    }

    /// Fork this thread: allocate its stack, seed the initial machine
    /// state so the first dispatch lands in the trampoline (begin, entry
    /// function, finish), register it and put it on the ready queue.
    pub fn fork(
        mut self: Box<Self>,
        kernel: &Kernel,
        entry: ThreadEntry,
        arg: usize,
    ) -> Result<ThreadId, KernelError> {
        let tid = self.id;
        log::debug!(
            "forking thread {} ({}) entry {:#x} arg {}",
            tid,
            self.name,
            entry as usize,
            arg
        );

        self.stack_allocate(kernel, entry, arg)?;
        kernel.insert_thread(self);
        kernel.stats.note_fork();

        let old_level = kernel.interrupt.set_level(crate::interrupt::IntLevel::Off);
        kernel.scheduler.ready_to_run(kernel, tid);
        kernel.interrupt.set_level(old_level);

        Ok(tid)
    }

    /// Allocate and seed the execution stack, and arm the backing host
    /// thread, parked until the first dispatch.
    fn stack_allocate(
        &mut self,
        kernel: &Kernel,
        entry: ThreadEntry,
        arg: usize,
    ) -> Result<(), KernelError> {
        let stack = Stack::new(kernel.config().stack_words)?;

        self.machine_state[PC_SLOT] = entry as usize;
        self.machine_state[SP_SLOT] = stack.top_addr();
        self.machine_state[INITIAL_PC_SLOT] = entry as usize;
        self.machine_state[INITIAL_ARG_SLOT] = arg;

        self.stack = Some(stack);
        self.entry = Some(entry);

        let kernel = kernel.handle();
        let link = Arc::clone(&self.link);
        let tid = self.id;
        let host = std::thread::Builder::new()
            .name(format!("vireo-{}-{}", tid, self.name))
            .spawn(move || switch::thread_root(kernel, tid, link))?;
        self.host = Some(host);

        Ok(())
    }

    /// Fatal if the fencepost at the far end of the stack was overwritten.
    /// The bootstrap thread has no simulated stack and nothing to check.
    pub fn check_overflow(&self) {
        if let Some(stack) = &self.stack {
            sched_assert!(
                stack.check_fencepost(),
                "thread {} ({}) overflowed its stack",
                self.id,
                self.name
            );
        }
    }

    /// Capture the machine's user-mode registers into this thread.
    pub(crate) fn save_user_state(&mut self, machine: &Machine) {
        for i in 0..NUM_TOTAL_REGS {
            self.user_registers[i] = machine.read_register(i);
        }
    }

    /// Load this thread's saved user-mode registers back into the machine.
    pub(crate) fn restore_user_state(&self, machine: &Machine) {
        for i in 0..NUM_TOTAL_REGS {
            machine.write_register(i, self.user_registers[i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_thread_is_just_created_with_a_clean_predictor() {
        let t = Thread::new("worker", 3, 0.0);
        assert_eq!(t.id(), 3);
        assert_eq!(t.name(), "worker");
        assert_eq!(t.status(), ThreadState::JustCreated);
        assert_eq!(t.predictor().key(), 0.0);
        assert!(t.space().is_none());
    }

    #[test]
    fn check_overflow_ignores_the_missing_bootstrap_stack() {
        let t = Thread::bootstrap("main", 0, 0.0);
        t.check_overflow();
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn illegal_transition_is_fatal() {
        let mut t = Thread::new("worker", 1, 0.0);
        t.set_status(ThreadState::Running);
    }

    #[test]
    fn user_registers_round_trip_through_the_machine() {
        let machine = Machine::new();
        let mut t = Thread::new("user", 2, 0.0);

        machine.write_register(0, 11);
        machine.write_register(7, -5);
        t.save_user_state(&machine);

        machine.write_register(0, 99);
        machine.write_register(7, 99);
        t.restore_user_state(&machine);

        assert_eq!(machine.read_register(0), 11);
        assert_eq!(machine.read_register(7), -5);
    }
}
