//! vireo-kernel: a deterministic simulation of a small operating-system
//! kernel built around a preemptive shortest-remaining-time-first thread
//! scheduler.
//!
//! The kernel runs as an ordinary process. Time is a tick counter advanced
//! by the machine loop ([`Kernel::run_ticks`]) or by the idle path, so
//! every scheduling decision is exactly reproducible. Each simulated
//! thread is backed by a parked host thread and exactly one of them runs
//! at any instant; the switch primitive hands control between them.
//!
//! ```
//! use std::sync::Arc;
//! use vireo_kernel::{Kernel, KernelConfig};
//!
//! fn worker(kernel: &Arc<Kernel>, rounds: usize) {
//!     for _ in 0..rounds {
//!         kernel.run_ticks(3);
//!         kernel.yield_now();
//!     }
//! }
//!
//! let kernel = Kernel::new(KernelConfig::default()).unwrap();
//! kernel.fork("worker", worker, 2).unwrap();
//! while kernel.live_threads() > 1 {
//!     kernel.yield_now();
//! }
//! ```

pub mod config;
pub mod error;
pub mod interrupt;
pub mod kernel;
pub mod logger;
pub mod machine;
pub mod scheduler;
pub mod stats;
pub mod trace;

pub use config::KernelConfig;
pub use error::KernelError;
pub use interrupt::{IntLevel, MachineStatus};
pub use kernel::Kernel;
pub use machine::AddrSpace;
pub use scheduler::thread::{ThreadEntry, ThreadId, ThreadState};
pub use scheduler::Scheduler;
pub use trace::SchedEvent;
