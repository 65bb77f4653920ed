//! Simple logger for the simulation.
//!
//! Writes level-tagged lines to stderr through the `log` facade. Nothing in
//! the kernel depends on the sink being installed; without `init` the
//! macros are no-ops.

use log::{Level, LevelFilter, Metadata, Record};
use std::sync::Once;

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let level_str = match record.level() {
                Level::Error => "ERROR",
                Level::Warn => "WARN ",
                Level::Info => "INFO ",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            };
            eprintln!("[{}] {}", level_str, record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;
static INIT: Once = Once::new();

/// Install the stderr logger at `Debug` verbosity. Idempotent.
pub fn init() {
    init_with_level(LevelFilter::Debug);
}

/// Install the stderr logger at the given verbosity. Idempotent; the first
/// caller wins the filter level.
pub fn init_with_level(filter: LevelFilter) {
    INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(filter);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init();
        init_with_level(LevelFilter::Trace);
        log::debug!("logger smoke test");
    }
}
