//! A minimal `log` backend printing to stderr, for the command-line tools.

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct StderrLogger {
    max_level: LevelFilter,
}

impl StderrLogger {
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Install this as the global logger. Call once, early.
    pub fn init(self) -> Result<(), SetLoggerError> {
        let max_level = self.max_level;
        log::set_logger(Box::leak(Box::new(self)))?;
        log::set_max_level(max_level);
        Ok(())
    }

    /// Map a `-v` count to a level: warnings by default, then info, debug and trace
    pub fn level_for(verbosity: u8) -> LevelFilter {
        match verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Format: "[LEVEL] target: message"
        let _ = writeln!(
            std::io::stderr().lock(),
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

#[test]
fn test_levels() {
    let logger = StderrLogger::new(StderrLogger::level_for(1));
    let info = Metadata::builder().level(log::Level::Info).build();
    let debug = Metadata::builder().level(log::Level::Debug).build();
    assert!(logger.enabled(&info));
    assert!(!logger.enabled(&debug));
    assert_eq!(StderrLogger::level_for(9), LevelFilter::Trace);
}
