use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    config::PublisherConfig,
    error::{PipelineResult, TransportError},
    model::{BatchObserver, InferenceOutput},
    telemetry::PipelineTelemetry,
};

#[cfg(feature = "kafka")]
pub use crate::stream::kafka::KafkaResultSink;

/// Destination for published results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Hands one message to the transport.
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TransportError>;
    /// Blocks until every sent message has been handed off.
    async fn flush(&self) -> Result<(), TransportError>;
}

/// Connects the Kafka result producer.
pub fn open_kafka_sink(
    servers: &str,
    properties: &IndexMap<String, String>,
) -> PipelineResult<Arc<dyn ResultSink>> {
    #[cfg(feature = "kafka")]
    {
        Ok(Arc::new(KafkaResultSink::new(servers, properties)?))
    }
    #[cfg(not(feature = "kafka"))]
    {
        let _ = (servers, properties);
        Err(crate::error::ConfigError::FeatureDisabled("kafka result sink").into())
    }
}

/// Message captured by [`MemoryResultSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Destination topic.
    pub topic: String,
    /// Message key.
    pub key: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    sent: Vec<SentMessage>,
    flushes: usize,
    failures_remaining: usize,
    send_attempts: usize,
}

/// In-memory sink with optional transient send failures.
#[derive(Debug, Clone, Default)]
pub struct MemoryResultSink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemoryResultSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` send attempts.
    #[must_use]
    pub fn failing(count: usize) -> Self {
        let sink = Self::default();
        sink.state.lock().failures_remaining = count;
        sink
    }

    /// Messages delivered so far.
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    /// Payloads decoded as UTF-8 text.
    #[must_use]
    pub fn payload_texts(&self) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .map(|message| String::from_utf8_lossy(&message.payload).into_owned())
            .collect()
    }

    /// Calls to [`ResultSink::flush`].
    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    /// Calls to [`ResultSink::send`], failed ones included.
    #[must_use]
    pub fn send_attempts(&self) -> usize {
        self.state.lock().send_attempts
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.send_attempts += 1;
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                attempts: 1,
                message: "injected failure".into(),
            });
        }
        state.sent.push(SentMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.state.lock().flushes += 1;
        Ok(())
    }
}

/// Retry behaviour for a single message.
///
/// Delivery is at-least-once: a retried message may already have reached the
/// broker, so consumers should de-duplicate on the message key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Attempts per message, at least one.
    pub max_attempts: u32,
    /// Wait before the first retry; doubled for each later retry.
    pub retry_backoff: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::from(&PublisherConfig::default())
    }
}

impl From<&PublisherConfig> for DeliveryPolicy {
    fn from(config: &PublisherConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl DeliveryPolicy {
    /// Wait before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1_u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_backoff.saturating_mul(factor)
    }
}

/// Batch observer that serialises reconstructions and sends them to a topic.
pub struct ResultPublisher {
    sink: Arc<dyn ResultSink>,
    topic: String,
    policy: DeliveryPolicy,
    telemetry: PipelineTelemetry,
    published: u64,
    batches: u64,
}

impl ResultPublisher {
    /// Publisher for `topic` over `sink`.
    pub fn new(sink: Arc<dyn ResultSink>, topic: impl Into<String>, policy: DeliveryPolicy) -> Self {
        Self {
            sink,
            topic: topic.into(),
            policy,
            telemetry: PipelineTelemetry::silent(),
            published: 0,
            batches: 0,
        }
    }

    /// Logs retries through `telemetry`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: PipelineTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Messages sent.
    #[must_use]
    pub const fn published(&self) -> u64 {
        self.published
    }

    /// Batches observed.
    #[must_use]
    pub const fn batches(&self) -> u64 {
        self.batches
    }

    /// Sends one payload, retrying per the delivery policy.
    pub async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut attempt = 1;
        loop {
            match self.sink.send(&self.topic, key, payload).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= self.policy.max_attempts => {
                    return Err(TransportError::Publish {
                        topic: self.topic.clone(),
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    let wait = self.policy.backoff(attempt);
                    self.telemetry.note(
                        LogLevel::Warn,
                        "pipeline.publish.retry",
                        json!({
                            "topic": self.topic,
                            "key": key,
                            "attempt": attempt,
                            "backoff_ms": u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                            "error": err.to_string(),
                        }),
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Flushes the underlying sink.
    pub async fn flush(&self) -> Result<(), TransportError> {
        self.sink.flush().await
    }
}

#[async_trait]
impl BatchObserver for ResultPublisher {
    async fn on_batch_end(
        &mut self,
        _batch: usize,
        outputs: &[InferenceOutput],
    ) -> PipelineResult<()> {
        for output in outputs {
            let key = output.offset.to_string();
            self.publish(&key, output.to_text().as_bytes()).await?;
            self.published += 1;
        }
        self.batches += 1;
        Ok(())
    }
}
