//! Console logger behind the `log` facade, used by embedding binaries that
//! do not bring their own subscriber.

use std::io::{self, Write};

use chrono::prelude::*;
use colored::*;
use log::{Level, Log, Metadata, Record, SetLoggerError};

struct Logger {
    level: Level,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} {:<5} {:<10} {}",
            Local::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            record.level(),
            record.target().cyan(),
            record.args()
        );
        let line = match record.level() {
            Level::Error => line.red(),
            Level::Warn => line.yellow(),
            Level::Info => line.normal(),
            Level::Debug => line.dimmed(),
            Level::Trace => line.white().dimmed(),
        };
        writeln!(io::stdout(), "{line}").ok();
    }

    fn flush(&self) {}
}

/// Initialize the logger at the given level. `RUST_LOG` wins over the
/// configured level when set.
pub fn init(level: Level) -> Result<(), SetLoggerError> {
    let level = env_level().unwrap_or(level);
    log::set_boxed_logger(Box::new(Logger { level }))?;
    log::set_max_level(level.to_level_filter());

    Ok(())
}

/// Level from the `RUST_LOG` environment variable, if present and valid.
pub fn env_level() -> Option<Level> {
    std::env::var("RUST_LOG").ok()?.parse().ok()
}
