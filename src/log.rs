//! The runtime's logging backend.
//!
//! Every layer logs through the `log` facade; this module provides the
//! default sink behind it: a line-per-record stderr writer with the
//! monotonic timestamp, level, and target.
//!
//! Example:
//! ```no_run
//! strand::log::init();
//! log::info!("runtime starting");
//! ```

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

/// [`Log`] trait implementation writing to stderr.
pub struct StderrLogger {
    level: LevelFilter,
}

impl StderrLogger {
    #[inline(always)]
    pub const fn new(level: LevelFilter) -> Self {
        StderrLogger { level }
    }
}

impl Log for StderrLogger {
    #[inline(always)]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let ms = crate::clock::monotonic_ms();
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = writeln!(
            out,
            "[{:>6}.{:03}] {:<5} {}: {}",
            ms / 1_000,
            ms % 1_000,
            record.level(),
            record.target(),
            record.args(),
        );
    }

    #[inline(always)]
    fn flush(&self) {}
}

/// Installs the stderr backend, once. The level is taken from the
/// `STRAND_LOG` environment variable (`error`..`trace`), defaulting to `info`.
/// Safe to call from every entry point; only the first call wins.
pub fn init() {
    static INSTALLED: OnceCell<()> = OnceCell::new();
    INSTALLED.get_or_init(|| {
        let level = std::env::var("STRAND_LOG")
            .ok()
            .and_then(|v| v.parse::<LevelFilter>().ok())
            .unwrap_or(LevelFilter::Info);
        if log::set_boxed_logger(Box::new(StderrLogger::new(level))).is_ok() {
            log::set_max_level(level);
        }
    });
}
