//! Kernel logging facility.
//!
//! Routes the `log` crate's macros to the serial console. Log levels are
//! chosen by build profile: debug builds log at `Debug`, release at `Info`.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance.
pub static LOGGER: Logger = Logger::new();

/// Serializes log lines so concurrent records do not interleave.
pub struct Logger {
    inner: Mutex<()>,
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats records as "[LEVEL] message".
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // The timer handler logs; mask interrupts so it cannot deadlock
            // against a base-level holder of this lock.
            x86_64::instructions::interrupts::without_interrupts(|| {
                let _guard = self.inner.lock();
                crate::serial_println!("[{}] {}", record.level(), record.args());
            });
        }
    }

    fn flush(&self) {}
}

/// Installs the logger. Must be called once, before anything logs.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| {
            log::set_max_level(
                #[cfg(debug_assertions)]
                LevelFilter::Debug,
                #[cfg(not(debug_assertions))]
                LevelFilter::Info,
            )
        })
        .expect("logger initialization failed");
}
