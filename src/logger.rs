//! Process-wide logging sink.
//!
//! Renders `"[{datetime}] [{level}] ({prefix}): {msg}"` to stdout and, in
//! daemon mode, to the log file as well. The prefix identifies the node role
//! (`EP` by default, `RP` on the root complex, with a `d` suffix in daemon
//! mode). The sink stays re-targetable at runtime because the daemon option
//! fires in the middle of CLI parsing, after logging has already started;
//! init-once sinks cannot do that. Level comes from `RUST_LOG` (default
//! `info`).

use std::fs::File;
use std::io::Write;

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

const DEFAULT_PREFIX: &str = "EP";

struct SinkState {
    prefix: String,
    file: Option<File>,
}

struct DaemonLogger {
    state: Mutex<SinkState>,
}

static LOGGER: DaemonLogger = DaemonLogger {
    state: Mutex::new(SinkState {
        prefix: String::new(),
        file: None,
    }),
};

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "Error",
        Level::Warn => "Warn",
        Level::Info => "Info",
        Level::Debug => "Debug",
        Level::Trace => "Trace",
    }
}

fn format_line(prefix: &str, level: Level, msg: impl std::fmt::Display) -> String {
    format!(
        "[{}] [{}] ({}): {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        level_name(level),
        prefix,
        msg
    )
}

impl Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut state = self.state.lock();
        let line = format_line(&state.prefix, record.level(), record.args());
        {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(line.as_bytes());
            let _ = out.flush();
        }
        if let Some(file) = state.file.as_mut() {
            let _ = file.write_all(line.as_bytes());
            let _ = file.flush();
        }
    }

    fn flush(&self) {}
}

fn level_from_env() -> LevelFilter {
    match std::env::var("RUST_LOG").ok().as_deref() {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        Some("off") => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Install the sink. Safe to call more than once; later calls are no-ops.
pub fn init() {
    {
        let mut state = LOGGER.state.lock();
        if state.prefix.is_empty() {
            state.prefix = DEFAULT_PREFIX.to_string();
        }
    }
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level_from_env());
    }
}

/// Current role prefix.
pub fn prefix() -> String {
    LOGGER.state.lock().prefix.clone()
}

pub fn set_prefix(prefix: &str) {
    LOGGER.state.lock().prefix = prefix.to_string();
}

/// Add a file target next to stdout. Replaces any previous file target.
pub fn log_to_file(file: File) {
    LOGGER.state.lock().file = Some(file);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format() {
        let line = format_line("RPd", Level::Info, "hello there");
        assert!(line.starts_with('['));
        assert!(line.ends_with("] [Info] (RPd): hello there\n"));
    }

    #[test]
    fn prefix_round_trip() {
        init();
        set_prefix("RP");
        assert_eq!(prefix(), "RP");
        set_prefix(DEFAULT_PREFIX);
        assert_eq!(prefix(), DEFAULT_PREFIX);
    }
}
