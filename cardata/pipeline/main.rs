//! Mode orchestration: wires source, model, artifact store and publisher for one run.

use std::{fmt, str::FromStr, sync::Arc};

use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    config::{PipelineConfig, RunSettings},
    decoder::RecordDecoder,
    error::{ConfigError, PipelineResult},
    model::{Autoencoder, BatchObserver, TrainingSummary},
    normalizer::{FeatureNormalizer, NormalizedRecord},
    publisher::{DeliveryPolicy, ResultPublisher, ResultSink},
    storage::{ModelArtifactStore, ObjectStore},
    stream::{FeatureStream, RecordSource, StreamStats},
    telemetry::PipelineTelemetry,
};

/// Run mode, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Fit a fresh model and upload it.
    Train,
    /// Download a model and score the live stream.
    Predict,
}

impl Mode {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Predict => "predict",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "predict" => Ok(Self::Predict),
            _ => Err(ConfigError::InvalidMode(raw.to_string())),
        }
    }
}

/// Counters and outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Mode that ran.
    pub mode: Mode,
    /// Messages pulled from the source.
    pub records_read: u64,
    /// Messages decoded.
    pub records_decoded: u64,
    /// Messages dropped by the skip policy.
    pub records_skipped: u64,
    /// Decoded records excluded because they are flagged as failures.
    pub failures_filtered: u64,
    /// Records trained on (TRAIN) or scored (PREDICT).
    pub records_used: u64,
    /// Observer batches completed (PREDICT).
    pub batches_published: u64,
    /// Bucket used for the artifact.
    pub bucket: String,
    /// Object key of the uploaded artifact (TRAIN).
    pub artifact_key: Option<String>,
    /// Training outcome (TRAIN).
    pub training: Option<TrainingSummary>,
}

impl RunReport {
    fn new(mode: Mode, bucket: &str, stats: StreamStats, failures_filtered: u64) -> Self {
        Self {
            mode,
            records_read: stats.read,
            records_decoded: stats.decoded,
            records_skipped: stats.skipped,
            failures_filtered,
            records_used: 0,
            batches_published: 0,
            bucket: bucket.to_string(),
            artifact_key: None,
            training: None,
        }
    }
}

/// Builder for [`PipelineOrchestrator`].
#[derive(Default)]
pub struct PipelineOrchestratorBuilder {
    config: Option<PipelineConfig>,
    settings: Option<RunSettings>,
    source: Option<Box<dyn RecordSource>>,
    object_store: Option<Arc<dyn ObjectStore>>,
    result_sink: Option<Arc<dyn ResultSink>>,
    telemetry: Option<PipelineTelemetry>,
}

impl PipelineOrchestratorBuilder {
    /// Pipeline configuration; defaults apply when unset.
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Invocation values (required).
    #[must_use]
    pub fn settings(mut self, settings: RunSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Message source for the selected mode (required).
    #[must_use]
    pub fn source(mut self, source: Box<dyn RecordSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Object store holding model artifacts (required).
    #[must_use]
    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    /// Result destination (required in PREDICT mode).
    #[must_use]
    pub fn result_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.result_sink = Some(sink);
        self
    }

    /// Telemetry handle; silent when unset.
    #[must_use]
    pub fn telemetry(mut self, telemetry: PipelineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Validates configuration and loads the record schema.
    pub fn build(self) -> PipelineResult<PipelineOrchestrator> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let settings = self
            .settings
            .ok_or_else(|| ConfigError::Invalid("run settings are required".into()))?;
        let source = self
            .source
            .ok_or_else(|| ConfigError::Invalid("a record source is required".into()))?;
        let object_store = self
            .object_store
            .ok_or_else(|| ConfigError::Invalid("an object store is required".into()))?;
        if settings.mode == Mode::Predict && self.result_sink.is_none() {
            return Err(ConfigError::Invalid("predict mode requires a result sink".into()).into());
        }
        let decoder = RecordDecoder::from_config(&config.decoder)?;
        Ok(PipelineOrchestrator {
            normalizer: FeatureNormalizer::new(config.scaling.clone()),
            config,
            settings,
            source,
            object_store,
            result_sink: self.result_sink,
            telemetry: self.telemetry.unwrap_or_else(PipelineTelemetry::silent),
            decoder,
        })
    }
}

/// Runs one TRAIN or PREDICT pass over explicitly injected services.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    settings: RunSettings,
    source: Box<dyn RecordSource>,
    object_store: Arc<dyn ObjectStore>,
    result_sink: Option<Arc<dyn ResultSink>>,
    telemetry: PipelineTelemetry,
    decoder: RecordDecoder,
    normalizer: FeatureNormalizer,
}

impl PipelineOrchestrator {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> PipelineOrchestratorBuilder {
        PipelineOrchestratorBuilder::default()
    }

    /// Mode this orchestrator will run.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.settings.mode
    }

    /// Executes the run to completion.
    pub async fn run(self) -> PipelineResult<RunReport> {
        let artifacts = ModelArtifactStore::open(
            Arc::clone(&self.object_store),
            &self.config.storage,
            &self.settings.bucket_suffix,
        )
        .await?;
        match self.settings.mode {
            Mode::Train => self.train(artifacts).await,
            Mode::Predict => self.predict(artifacts).await,
        }
    }

    async fn train(self, artifacts: ModelArtifactStore) -> PipelineResult<RunReport> {
        let Self {
            config,
            settings,
            source,
            telemetry,
            decoder,
            normalizer,
            ..
        } = self;
        telemetry
            .milestone(
                "pipeline.stream.start",
                json!({
                    "mode": Mode::Train,
                    "topic": settings.topic,
                    "partition": config.stream.partition,
                    "offset": settings.offset,
                }),
            )
            .await;

        let mut stream = FeatureStream::new(source, decoder, normalizer, config.decoder.on_error)
            .with_telemetry(telemetry.clone());
        let mut samples = Vec::new();
        let mut failures = 0_u64;
        while let Some(record) = stream.next_record().await? {
            if record.is_healthy() {
                samples.push(record.features);
            } else {
                failures += 1;
            }
        }

        let mut model = Autoencoder::new(&config.model)?;
        let summary = model.fit_with(&samples, |epoch, loss| {
            telemetry.note(
                LogLevel::Debug,
                "pipeline.train.epoch",
                json!({ "epoch": epoch, "loss": loss }),
            );
        })?;
        telemetry
            .milestone(
                "pipeline.train.complete",
                json!({
                    "samples": summary.samples,
                    "epochs": summary.epochs,
                    "final_loss": summary.final_loss(),
                    "failures_filtered": failures,
                }),
            )
            .await;

        let artifact = model.to_artifact(&settings.model_file, Some(summary.clone()));
        let key = artifacts.save(&artifact).await?;
        telemetry
            .milestone(
                "pipeline.model.stored",
                json!({ "bucket": artifacts.bucket(), "key": key }),
            )
            .await;

        let mut report = RunReport::new(Mode::Train, artifacts.bucket(), stream.stats(), failures);
        report.records_used = u64::try_from(summary.samples).unwrap_or(u64::MAX);
        report.artifact_key = Some(key);
        report.training = Some(summary);
        Ok(report)
    }

    async fn predict(self, artifacts: ModelArtifactStore) -> PipelineResult<RunReport> {
        let Self {
            config,
            settings,
            source,
            result_sink,
            telemetry,
            decoder,
            normalizer,
            ..
        } = self;
        let sink = result_sink
            .ok_or_else(|| ConfigError::Invalid("predict mode requires a result sink".into()))?;

        let artifact = artifacts.load(&settings.model_file).await?;
        let model = Autoencoder::from_artifact(&artifact, &config.model)?;
        telemetry
            .milestone(
                "pipeline.model.downloaded",
                json!({
                    "bucket": artifacts.bucket(),
                    "key": settings.model_file,
                    "path": artifacts.local_path(&settings.model_file),
                }),
            )
            .await;

        let mut publisher = ResultPublisher::new(
            sink,
            settings.result_topic.clone(),
            DeliveryPolicy::from(&config.publisher),
        )
        .with_telemetry(telemetry.clone());
        telemetry
            .milestone(
                "pipeline.stream.start",
                json!({
                    "mode": Mode::Predict,
                    "topic": settings.topic,
                    "group_id": config.stream.group_id,
                    "stream_timeout_ms": config.stream.stream_timeout_ms,
                }),
            )
            .await;

        let mut stream = FeatureStream::new(source, decoder, normalizer, config.decoder.on_error)
            .with_telemetry(telemetry.clone());
        let scored = score_stream(&model, &mut stream, &mut publisher).await;
        // Flush once whether or not scoring succeeded, so sent results are not lost.
        let flushed = publisher.flush().await;
        let (scored, failures) = scored?;
        flushed?;

        telemetry
            .milestone(
                "pipeline.predict.complete",
                json!({
                    "scored": scored,
                    "published": publisher.published(),
                    "batches": publisher.batches(),
                    "failures_filtered": failures,
                }),
            )
            .await;

        let mut report = RunReport::new(Mode::Predict, artifacts.bucket(), stream.stats(), failures);
        report.records_used = scored;
        report.batches_published = publisher.batches();
        Ok(report)
    }
}

/// Scores healthy records batch by batch; returns `(scored, failures_filtered)`.
async fn score_stream<S: RecordSource>(
    model: &Autoencoder,
    stream: &mut FeatureStream<S>,
    observer: &mut dyn BatchObserver,
) -> PipelineResult<(u64, u64)> {
    let batch_size = model.batch_size().max(1);
    let mut batch: Vec<NormalizedRecord> = Vec::with_capacity(batch_size);
    let mut batch_index = 0;
    let mut scored = 0_u64;
    let mut failures = 0_u64;

    while let Some(record) = stream.next_record().await? {
        if !record.is_healthy() {
            failures += 1;
            continue;
        }
        batch.push(record);
        if batch.len() == batch_size {
            scored += count(model.infer_batch(batch_index, &batch, observer).await?);
            batch.clear();
            batch_index += 1;
        }
    }
    if !batch.is_empty() {
        scored += count(model.infer_batch(batch_index, &batch, observer).await?);
    }
    Ok((scored, failures))
}

fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}
