#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! JSON-lines logging for the cardata crates.
//!
//! Each call to [`JsonLogger::log`] emits one object per line, either to an
//! append-only file or to stderr. Records under the logger's threshold are
//! discarded before serialisation.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Severity, ordered so that `Debug < Info < Warn < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-epoch and per-batch detail.
    Debug,
    /// Lifecycle milestones.
    Info,
    /// Recoverable problems such as skipped records or retries.
    Warn,
    /// Failures that end a run.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

/// One log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// RFC 3339 time with millisecond precision.
    #[serde(with = "millis")]
    pub ts: DateTime<Utc>,
    /// Emitting component.
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Event name or short description.
    pub message: String,
    /// Structured context, flattened into the line.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LogRecord {
    /// Timestamped record without fields.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            fields: Map::new(),
        }
    }

    /// Merges an object's entries into the record fields; any other non-null
    /// value is kept under `data`.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        match metadata {
            Value::Null => {}
            Value::Object(entries) => {
                for (key, value) in entries {
                    self.fields.insert(key, value);
                }
            }
            scalar => {
                self.fields.insert("data".to_owned(), scalar);
            }
        }
        self
    }
}

mod millis {
    use super::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

enum Destination {
    File { path: PathBuf, file: File },
    Stderr,
}

impl Destination {
    fn emit(&mut self, line: &[u8]) -> io::Result<()> {
        match self {
            Self::File { file, .. } => {
                file.write_all(line)?;
                file.flush()
            }
            Self::Stderr => {
                let mut handle = io::stderr().lock();
                handle.write_all(line)?;
                handle.flush()
            }
        }
    }
}

/// Level-filtered JSON-lines logger, safe to share across threads.
pub struct JsonLogger {
    threshold: LogLevel,
    path: Option<PathBuf>,
    out: Mutex<Destination>,
}

impl fmt::Debug for JsonLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLogger")
            .field("threshold", &self.threshold)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl JsonLogger {
    /// Appends to `path`, creating the file and missing directories. Logs
    /// every level until [`JsonLogger::with_min_level`] narrows it.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        Ok(Self {
            threshold: LogLevel::Debug,
            path: Some(path.clone()),
            out: Mutex::new(Destination::File { path, file }),
        })
    }

    /// Logs `info` and above to stderr.
    #[must_use]
    pub fn console() -> Self {
        Self {
            threshold: LogLevel::Info,
            path: None,
            out: Mutex::new(Destination::Stderr),
        }
    }

    /// Discards records less severe than `level`.
    #[must_use]
    pub const fn with_min_level(mut self, level: LogLevel) -> Self {
        self.threshold = level;
        self
    }

    /// Serialises and writes `record` unless it falls under the threshold.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        if record.level < self.threshold {
            return Ok(());
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut out = self.out.lock();
        out.emit(&line).with_context(|| match &*out {
            Destination::File { path, .. } => format!("writing log file {}", path.display()),
            Destination::Stderr => "writing log to stderr".to_owned(),
        })
    }

    /// Backing file, `None` for the console logger.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn logger_in(dir: &tempfile::TempDir, name: &str) -> JsonLogger {
        JsonLogger::new(dir.path().join("logs").join(name)).unwrap()
    }

    #[test]
    fn each_record_is_one_flat_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger_in(&dir, "run.log");
        let record = LogRecord::new("pipeline", LogLevel::Info, "pipeline.stream.start")
            .with_metadata(json!({ "topic": "car-data", "offset": 42 }));
        logger.log(&record).unwrap();

        let text = std::fs::read_to_string(logger.path().unwrap()).unwrap();
        assert!(text.ends_with('\n'));
        let line: Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(line["level"], "info");
        assert_eq!(line["topic"], "car-data");
        assert_eq!(line["offset"], 42);

        let parsed: LogRecord = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(parsed.message, "pipeline.stream.start");
        assert_eq!(parsed.fields.len(), 2);
    }

    #[test]
    fn threshold_discards_quieter_records() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger_in(&dir, "warn.log").with_min_level(LogLevel::Warn);
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            logger
                .log(&LogRecord::new("pipeline", level, level.to_string()))
                .unwrap();
        }
        let text = std::fs::read_to_string(logger.path().unwrap()).unwrap();
        let messages: Vec<_> = text
            .lines()
            .map(|line| serde_json::from_str::<LogRecord>(line).unwrap().message)
            .collect();
        assert_eq!(messages, ["warn", "error"]);
    }

    #[test]
    fn non_object_metadata_is_kept_under_data() {
        let record = LogRecord::new("m", LogLevel::Debug, "x").with_metadata(json!([1, 2]));
        assert_eq!(record.fields["data"], json!([1, 2]));
        let untouched = LogRecord::new("m", LogLevel::Debug, "x").with_metadata(Value::Null);
        assert!(untouched.fields.is_empty());
        assert!(JsonLogger::console().path().is_none());
    }
}
