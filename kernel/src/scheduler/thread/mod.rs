//! Thread control blocks, lifecycle states and simulated stacks.

pub mod stack;
pub mod state;
mod thread;

pub use self::state::{validate_transition, ThreadState};
pub use self::thread::{
    Thread, ThreadEntry, ThreadId, FP_SLOT, INITIAL_ARG_SLOT, INITIAL_PC_SLOT,
    MACHINE_STATE_SLOTS, PC_SLOT, SP_SLOT, STARTUP_PC_SLOT, WHEN_DONE_PC_SLOT,
};
