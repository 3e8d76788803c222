//! Kernel logging facade (spec 9, "Diagnostics").
//!
//! The kernel never formats straight to a UART directly; every subsystem
//! logs through the `log` crate, the way `kerncore`-style Hubris crates do.
//! Under `cfg(test)` records are buffered in memory so tests can assert on
//! them; in a real `no_std` build they are handed to whatever `LogSink` the
//! platform layer installs (a serial port, a ring buffer, etc - that
//! transport is outside this core's scope, spec 1).

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Platform hook a real boot sequence installs via [`set_sink`]. Out of
/// scope here (spec 1); this core only defines the seam.
pub trait LogSink: Send {
    fn write_line(&mut self, level: Level, line: &str);
}

struct KernelLogger {
    sink: Mutex<Option<Box<dyn LogSink>>>,
    #[cfg(test)]
    buffer: Mutex<Vec<String>>,
}

static LOGGER: KernelLogger = KernelLogger {
    sink: Mutex::new(None),
    #[cfg(test)]
    buffer: Mutex::new(Vec::new()),
};

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        #[cfg(test)]
        {
            use alloc::format;
            self.buffer
                .lock()
                .push(format!("[{}] {}", record.level(), record.args()));
        }
        if let Some(sink) = self.sink.lock().as_mut() {
            use alloc::format;
            let line = format!("{}", record.args());
            sink.write_line(record.level(), &line);
        }
    }

    fn flush(&self) {}
}

/// Installs the global logger. Idempotent; call once during boot.
pub fn init(max_level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(max_level);
}

/// Installs (or replaces) the platform's log transport.
pub fn set_sink(sink: Box<dyn LogSink>) {
    *LOGGER.sink.lock() = Some(sink);
}

/// Test-only: drains every record buffered so far.
#[cfg(test)]
pub fn take_buffered() -> Vec<String> {
    core::mem::take(&mut *LOGGER.buffer.lock())
}
