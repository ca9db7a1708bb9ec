use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;
use log::{Level, Metadata, Record};
use serde::Serialize;

use crate::config::LogFormat;

#[derive(Debug, Serialize, Clone)]
pub struct LogMessage {
    level: String,
    target: String,
    message: String,
    timestamp: String,
}

impl LogMessage {
    fn from_record(record: &Record) -> Self {
        Self {
            level: record.level().to_string(),
            target: record.target().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        }
    }

    fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Text => format!(
                "{} [{}] {}: {}",
                self.timestamp, self.level, self.target, self.message
            ),
            LogFormat::Json => serde_json::to_string(self).unwrap_or_else(|e| {
                format!("{{\"level\":\"ERROR\",\"message\":\"unserializable log: {}\"}}", e)
            }),
        }
    }
}

static LOGGER: ConsoleLogger = ConsoleLogger::new();

/// Stderr logger with local timestamps. The level lives in the `log` facade's
/// max level, so both can be changed after installation.
struct ConsoleLogger {
    installed: AtomicBool,
    json: AtomicBool,
}

impl ConsoleLogger {
    const fn new() -> Self {
        Self {
            installed: AtomicBool::new(false),
            json: AtomicBool::new(false),
        }
    }

    fn format(&self) -> LogFormat {
        if self.json.load(Ordering::Relaxed) {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }

    fn set_format(&self, format: LogFormat) {
        self.json
            .store(format == LogFormat::Json, Ordering::Relaxed);
    }
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let line = LogMessage::from_record(record).render(self.format());
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Installs the console logger, or reconfigures it when it is already
/// installed. Falls back to env_logger when another logger claimed the facade.
pub fn setup_logging(level: Level, format: LogFormat) {
    LOGGER.set_format(format);
    if LOGGER.installed.load(Ordering::Acquire) || log::set_logger(&LOGGER).is_ok() {
        LOGGER.installed.store(true, Ordering::Release);
        log::set_max_level(level.to_level_filter());
    } else {
        let _ = env_logger::builder()
            .filter_level(level.to_level_filter())
            .try_init();
    }
    log::debug!("Logging set to {} ({:?})", level, format);
}
