//! Streaming sources and the lazy decode/normalize adapter.

/// In-process sources (finite queue and channel-backed).
pub mod memory;

/// rdkafka-backed sources for TRAIN and PREDICT.
#[cfg(feature = "kafka")]
pub mod kafka;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    config::{DecodeFailurePolicy, RunSettings, StreamConfig},
    decoder::RecordDecoder,
    error::{PipelineResult, TransportError},
    normalizer::{FeatureNormalizer, NormalizedRecord},
    orchestrator::Mode,
    record::RawMessage,
    telemetry::PipelineTelemetry,
};

pub use memory::{ChannelSource, MemorySource};

/// Pull-based message source.
///
/// `Ok(None)` ends the stream: the partition is exhausted in TRAIN mode, or
/// the idle timeout elapsed in PREDICT mode.
#[async_trait]
pub trait RecordSource: Send {
    /// Waits for the next message.
    async fn next_message(&mut self) -> Result<Option<RawMessage>, TransportError>;
}

#[async_trait]
impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    async fn next_message(&mut self) -> Result<Option<RawMessage>, TransportError> {
        (**self).next_message().await
    }
}

/// Opens the Kafka source matching `mode`.
pub fn open_kafka_source(
    mode: Mode,
    settings: &RunSettings,
    config: &StreamConfig,
) -> PipelineResult<Box<dyn RecordSource>> {
    #[cfg(feature = "kafka")]
    {
        let source: Box<dyn RecordSource> = match mode {
            Mode::Train => Box::new(kafka::KafkaTrainSource::new(
                &settings.servers,
                &settings.topic,
                settings.offset,
                config,
            )?),
            Mode::Predict => Box::new(kafka::KafkaPredictSource::new(
                &settings.servers,
                &settings.topic,
                config,
            )?),
        };
        Ok(source)
    }
    #[cfg(not(feature = "kafka"))]
    {
        let _ = (mode, settings, config);
        Err(crate::error::ConfigError::FeatureDisabled("kafka source").into())
    }
}

/// Counters maintained while a stream is consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Messages received from the source.
    pub read: u64,
    /// Messages decoded into records.
    pub decoded: u64,
    /// Messages dropped by the skip policy.
    pub skipped: u64,
}

/// Lazily maps decode and normalize over a source, one message at a time.
pub struct FeatureStream<S> {
    source: S,
    decoder: RecordDecoder,
    normalizer: FeatureNormalizer,
    policy: DecodeFailurePolicy,
    telemetry: PipelineTelemetry,
    stats: StreamStats,
}

impl<S: RecordSource> FeatureStream<S> {
    /// Wraps `source`.
    pub fn new(
        source: S,
        decoder: RecordDecoder,
        normalizer: FeatureNormalizer,
        policy: DecodeFailurePolicy,
    ) -> Self {
        Self {
            source,
            decoder,
            normalizer,
            policy,
            telemetry: PipelineTelemetry::silent(),
            stats: StreamStats::default(),
        }
    }

    /// Reports skipped messages through `telemetry`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: PipelineTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Next normalized record, or `None` once the source ends.
    pub async fn next_record(&mut self) -> PipelineResult<Option<NormalizedRecord>> {
        loop {
            let Some(message) = self.source.next_message().await? else {
                return Ok(None);
            };
            self.stats.read += 1;
            match self.decoder.decode(&message) {
                Ok(record) => {
                    self.stats.decoded += 1;
                    return Ok(Some(self.normalizer.normalize_at(&record, message.offset)));
                }
                Err(err) => match self.policy {
                    DecodeFailurePolicy::Abort => return Err(err.into()),
                    DecodeFailurePolicy::Skip => {
                        self.stats.skipped += 1;
                        self.telemetry.note(
                            LogLevel::Warn,
                            "pipeline.decode.skipped",
                            json!({
                                "partition": message.partition,
                                "offset": message.offset,
                                "error": err.to_string(),
                            }),
                        );
                    }
                },
            }
        }
    }

    /// Counters so far.
    #[must_use]
    pub const fn stats(&self) -> StreamStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::PipelineError, record::Record};

    fn framed(decoder: &RecordDecoder, flag: &str) -> Vec<u8> {
        let record = Record::from_features([50.0; 18], flag);
        decoder.encode(&record, 1).unwrap()
    }

    fn stream(
        payloads: Vec<Vec<u8>>,
        policy: DecodeFailurePolicy,
    ) -> FeatureStream<MemorySource> {
        FeatureStream::new(
            MemorySource::from_payloads(payloads),
            RecordDecoder::with_default_schema().unwrap(),
            FeatureNormalizer::default(),
            policy,
        )
    }

    #[tokio::test]
    async fn yields_records_in_delivery_order() {
        let decoder = RecordDecoder::with_default_schema().unwrap();
        let mut stream = stream(
            vec![framed(&decoder, "false"), framed(&decoder, "true")],
            DecodeFailurePolicy::Abort,
        );
        let first = stream.next_record().await.unwrap().unwrap();
        let second = stream.next_record().await.unwrap().unwrap();
        assert_eq!((first.offset, second.offset), (0, 1));
        assert!(first.is_healthy() && !second.is_healthy());
        assert!(stream.next_record().await.unwrap().is_none());
        assert_eq!(stream.stats().decoded, 2);
    }

    #[tokio::test]
    async fn skip_policy_continues_past_malformed_messages() {
        let decoder = RecordDecoder::with_default_schema().unwrap();
        let mut stream = stream(
            vec![vec![0, 1], framed(&decoder, "false")],
            DecodeFailurePolicy::Skip,
        );
        let record = stream.next_record().await.unwrap().unwrap();
        assert_eq!(record.offset, 1);
        assert_eq!(
            stream.stats(),
            StreamStats {
                read: 2,
                decoded: 1,
                skipped: 1
            }
        );
    }

    #[tokio::test]
    async fn skipped_messages_are_logged() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stream.log");
        let telemetry = PipelineTelemetry::builder("cardata")
            .log_path(&path)
            .build()
            .unwrap();
        let mut stream = stream(vec![vec![0, 1]], DecodeFailurePolicy::Skip).with_telemetry(telemetry);
        assert!(stream.next_record().await.unwrap().is_none());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("pipeline.decode.skipped"));
        assert!(content.contains("\"level\":\"warn\""));
    }

    #[tokio::test]
    async fn abort_policy_surfaces_decode_error() {
        let decoder = RecordDecoder::with_default_schema().unwrap();
        let mut stream = stream(
            vec![vec![0, 1], framed(&decoder, "false")],
            DecodeFailurePolicy::Abort,
        );
        let err = stream.next_record().await.unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }
}
