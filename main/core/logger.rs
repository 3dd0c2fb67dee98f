//! The engine's logger. Records are stamped with the current virtual time
//! and the host the emitting worker is running, pulled from the thread-local
//! worker context.

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::core::worker::Worker;

struct UmbraLogger {
    filter: LevelFilter,
}

impl Log for UmbraLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.filter
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let sim_time = match Worker::current_time() {
            Some(t) => {
                let t = t.to_abs_simtime();
                format!("{}.{:09}", t.as_secs(), t.subsec_nanos())
            }
            None => "n/a".to_string(),
        };

        let host = match Worker::active_host_info() {
            Some(info) => format!("{}~{}", info.name, info.default_ip),
            None => "n/a".to_string(),
        };

        let level = match record.level() {
            Level::Error => "error",
            Level::Warn => "warning",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };

        eprintln!(
            "{sim_time} [{level}] [{host}] [{}] {}",
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        use std::io::Write;
        let _ = std::io::stderr().flush();
    }
}

pub fn init(filter: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(UmbraLogger { filter }))?;
    log::set_max_level(filter);
    Ok(())
}
