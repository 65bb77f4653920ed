//! Demo simulation: fork a few workers, let them compete for the
//! processor, and print the statistics once only the bootstrap thread is
//! left.

use std::sync::Arc;
use vireo_kernel::{logger, Kernel, KernelConfig, KernelError};

fn worker(kernel: &Arc<Kernel>, rounds: usize) {
    for _ in 0..rounds {
        kernel.run_ticks(5);
        kernel.yield_now();
    }
    kernel.sleep_for(10);
}

fn main() -> Result<(), KernelError> {
    logger::init();

    let kernel = Kernel::new(KernelConfig::default())?;
    kernel.fork("worker-a", worker, 3)?;
    kernel.fork("worker-b", worker, 5)?;

    // The bootstrap thread stays out of the way: burn a tick so pending
    // wake-ups fire, then sleep to let the workers run.
    while kernel.live_threads() > 1 {
        kernel.run_ticks(1);
        kernel.sleep_for(5);
    }

    let stats = kernel.stats.snapshot();
    log::info!(
        "simulation done at tick {}: {} context switches, {} preempt requests, {} forked, {} reclaimed",
        stats.total_ticks,
        stats.context_switches,
        stats.preempt_requests,
        stats.threads_forked,
        stats.threads_destroyed
    );
    Ok(())
}
