use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};

/// Builder for pipeline telemetry sinks.
pub struct PipelineTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    console: bool,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl PipelineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            console: false,
            min_level: LogLevel::Info,
            event_publisher: None,
        }
    }

    /// Writes JSON lines to a file.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Writes JSON lines to stderr when no log path is set.
    #[must_use]
    pub const fn console(mut self) -> Self {
        self.console = true;
        self
    }

    /// Minimum level written by the logger.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the lifecycle event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<PipelineTelemetry> {
        let logger = match (self.log_path, self.console) {
            (Some(path), _) => Some(JsonLogger::new(path)?.with_min_level(self.min_level)),
            (None, true) => Some(JsonLogger::console().with_min_level(self.min_level)),
            (None, false) => None,
        };
        Ok(PipelineTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared by the pipeline stages.
#[derive(Clone)]
pub struct PipelineTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for PipelineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineTelemetry")
            .field("module", &self.inner.module)
            .field("logger", &self.inner.logger)
            .finish_non_exhaustive()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl PipelineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> PipelineTelemetryBuilder {
        PipelineTelemetryBuilder::new(module)
    }

    /// Handle that records nothing.
    #[must_use]
    pub fn silent() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: "cardata".into(),
                logger: None,
                publisher: None,
            }),
        }
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Logs like [`Self::log`] but reports a failed write on stderr instead of returning it.
    pub fn note(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Err(err) = self.log(level, message, metadata) {
            eprintln!("telemetry log failed: {err:?}");
        }
    }

    /// Emits a lifecycle event.
    pub async fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(publisher) = &self.inner.publisher {
            publisher
                .publish(EventRecord::new(&self.inner.module, event_type, payload))
                .await?;
        }
        Ok(())
    }

    /// Logs at info level and emits the same payload as an event.
    ///
    /// Used for mode-boundary progress messages; failures of either sink are
    /// reported on stderr and never abort the run.
    pub async fn milestone(&self, event_type: &str, payload: Value) {
        self.note(LogLevel::Info, event_type, payload.clone());
        if let Err(err) = self.event(event_type, payload).await {
            eprintln!("telemetry event publish failed: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[tokio::test]
    async fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("pipeline.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = PipelineTelemetry::builder("cardata")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .milestone("pipeline.train.complete", json!({ "samples": 3 }))
            .await;
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("pipeline.train.complete"));
        assert_eq!(bus.events_of_type("pipeline.train.complete").len(), 1);
    }

    #[test]
    fn note_writes_through_the_level_filter() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("notes.log");
        let telemetry = PipelineTelemetry::builder("cardata")
            .log_path(&path)
            .min_level(LogLevel::Warn)
            .build()
            .unwrap();
        telemetry.note(LogLevel::Debug, "pipeline.train.epoch", json!({ "epoch": 1 }));
        telemetry.note(LogLevel::Warn, "pipeline.publish.retry", json!({ "attempt": 1 }));
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("pipeline.publish.retry"));
        PipelineTelemetry::silent().note(LogLevel::Error, "ignored", Value::Null);
    }

    #[tokio::test]
    async fn silent_handle_is_a_no_op() {
        let telemetry = PipelineTelemetry::silent();
        telemetry
            .log(LogLevel::Error, "ignored", Value::Null)
            .unwrap();
        telemetry.event("ignored", Value::Null).await.unwrap();
    }
}
