use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::{
    error::ConfigError,
    model::{Activation, LayerConfig},
    normalizer::FEATURE_DIM,
    orchestrator::Mode,
    record::FEATURE_FIELDS,
    storage::is_plain_file_name,
};

/// Complete, validated pipeline configuration.
///
/// Defaults reproduce the production deployment; a TOML file only needs to
/// name the values it overrides.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Record decoding.
    pub decoder: DecoderConfig,
    /// Per-field scaling ranges.
    pub scaling: ScalingConfig,
    /// Autoencoder topology and training hyperparameters.
    pub model: ModelConfig,
    /// Queue consumer settings.
    pub stream: StreamConfig,
    /// Result republishing.
    pub publisher: PublisherConfig,
    /// Object storage.
    pub storage: StorageConfig,
}

impl PipelineConfig {
    /// Loads configuration from a TOML file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        if let Some(schema) = &config.decoder.schema_path {
            if schema.is_relative() {
                let base = path.parent().unwrap_or_else(|| Path::new("."));
                config.decoder.schema_path = Some(base.join(schema));
            }
        }
        Ok(config)
    }

    /// Parses configuration from TOML text and validates it.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let document: PipelineConfigSerde =
            toml::from_str(raw).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        let scaling = ScalingConfig::default().with_overrides(&document.scaling)?;
        let config = Self {
            decoder: document.decoder,
            scaling,
            model: document.model,
            stream: document.stream,
            publisher: document.publisher,
            storage: document.storage,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scaling.validate()?;
        self.model.validate()?;
        if self.publisher.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "publisher.max_attempts must be at least 1".into(),
            ));
        }
        if self.storage.artifact_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage.artifact_dir is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineConfigSerde {
    #[serde(default)]
    decoder: DecoderConfig,
    #[serde(default)]
    scaling: IndexMap<String, [f64; 2]>,
    #[serde(default)]
    model: ModelConfig,
    #[serde(default)]
    stream: StreamConfig,
    #[serde(default)]
    publisher: PublisherConfig,
    #[serde(default)]
    storage: StorageConfig,
}

/// What to do with a message that fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecodeFailurePolicy {
    /// Terminate the run with the decode error.
    #[default]
    Abort,
    /// Log, count, and continue with the next message.
    Skip,
}

/// Record decoder settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    /// Alternate `.avsc` file; the embedded `cardata-v1` schema when unset.
    #[serde(default)]
    pub schema_path: Option<PathBuf>,
    /// Reject frames whose first byte is not the zero magic byte.
    #[serde(default)]
    pub verify_magic_byte: bool,
    /// Decode failure handling.
    #[serde(default)]
    pub on_error: DecodeFailurePolicy,
}

/// Closed scaling domain of one feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldRange {
    /// Value mapped to -1.0.
    pub min: f64,
    /// Value mapped to 1.0.
    pub max: f64,
}

impl FieldRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// Scaling ranges for the 18 features, in feature order.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingConfig {
    ranges: [FieldRange; FEATURE_DIM],
}

impl Default for ScalingConfig {
    fn default() -> Self {
        const TIRE: FieldRange = FieldRange::new(20.0, 35.0);
        const ACCEL: FieldRange = FieldRange::new(0.0, 7.0);
        Self {
            ranges: [
                FieldRange::new(23.0, 102.0),
                FieldRange::new(15.0, 40.0),
                FieldRange::new(0.0, 200.0),
                FieldRange::new(0.0, 100.0),
                FieldRange::new(180.0, 260.0),
                FieldRange::new(80.0, 84.0),
                FieldRange::new(0.0, 50.0),
                FieldRange::new(0.0, 7500.0),
                FieldRange::new(0.0, 1.0),
                TIRE,
                TIRE,
                TIRE,
                TIRE,
                ACCEL,
                ACCEL,
                ACCEL,
                ACCEL,
                FieldRange::new(1000.0, 2000.0),
            ],
        }
    }
}

impl ScalingConfig {
    /// Builds a validated configuration from explicit ranges.
    pub fn new(ranges: [FieldRange; FEATURE_DIM]) -> Result<Self, ConfigError> {
        let config = Self { ranges };
        config.validate()?;
        Ok(config)
    }

    /// Range of the feature at `index`.
    #[must_use]
    pub const fn range(&self, index: usize) -> FieldRange {
        self.ranges[index]
    }

    /// All ranges in feature order.
    #[must_use]
    pub const fn ranges(&self) -> &[FieldRange; FEATURE_DIM] {
        &self.ranges
    }

    fn with_overrides(mut self, overrides: &IndexMap<String, [f64; 2]>) -> Result<Self, ConfigError> {
        for (name, [min, max]) in overrides {
            let index = FEATURE_FIELDS
                .iter()
                .position(|field| field == name)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown scaling field '{name}'")))?;
            self.ranges[index] = FieldRange::new(*min, *max);
        }
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, range) in FEATURE_FIELDS.iter().zip(self.ranges.iter()) {
            if !range.min.is_finite() || !range.max.is_finite() || range.max <= range.min {
                return Err(ConfigError::Invalid(format!(
                    "scaling range for '{name}' must satisfy min < max, got [{}, {}]",
                    range.min, range.max
                )));
            }
        }
        Ok(())
    }
}

/// Autoencoder topology and training hyperparameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Dense layers after the input, in order; the last must emit 18 units.
    #[serde(default = "default_layers")]
    pub layers: Vec<LayerConfig>,
    /// Training epochs (no early stopping).
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Samples per batch for both fit and infer.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Adam step size.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Adam first-moment decay.
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    /// Adam second-moment decay.
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    /// Adam numerical stabiliser.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// L1 activity penalty on the first layer's activations.
    #[serde(default = "default_l1_activity")]
    pub l1_activity: f64,
    /// Weight initialisation seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            layers: default_layers(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_epsilon(),
            l1_activity: default_l1_activity(),
            seed: default_seed(),
        }
    }
}

impl ModelConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.layers.is_empty() {
            return Err(ConfigError::Invalid("model.layers must not be empty".into()));
        }
        if self.layers.iter().any(|layer| layer.units == 0) {
            return Err(ConfigError::Invalid("model layers need at least one unit".into()));
        }
        if self.layers.last().map(|layer| layer.units) != Some(FEATURE_DIM) {
            return Err(ConfigError::Invalid(format!(
                "last model layer must have {FEATURE_DIM} units to reconstruct its input"
            )));
        }
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "model.epochs and model.batch_size must be positive".into(),
            ));
        }
        if !(self.learning_rate > 0.0 && self.epsilon > 0.0) {
            return Err(ConfigError::Invalid(
                "model.learning_rate and model.epsilon must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(ConfigError::Invalid("adam betas must lie in [0, 1)".into()));
        }
        if self.l1_activity < 0.0 {
            return Err(ConfigError::Invalid("model.l1_activity must not be negative".into()));
        }
        Ok(())
    }
}

/// Consumer offset reset policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from the oldest retained message.
    #[default]
    Earliest,
    /// Start from new messages only.
    Latest,
}

impl OffsetReset {
    /// librdkafka property value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

/// Queue consumer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    /// Consumer group joined in PREDICT mode.
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Partition read in TRAIN mode.
    #[serde(default)]
    pub partition: i32,
    /// Idle timeout in milliseconds before PREDICT ends; negative blocks forever.
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: i64,
    /// `session.timeout.ms`.
    #[serde(default = "default_consumer_timeout_ms")]
    pub session_timeout_ms: u64,
    /// `max.poll.interval.ms`.
    #[serde(default = "default_consumer_timeout_ms")]
    pub max_poll_interval_ms: u64,
    /// `auto.offset.reset`.
    #[serde(default)]
    pub offset_reset: OffsetReset,
    /// `enable.partition.eof` for PREDICT mode.
    #[serde(default)]
    pub partition_eof: bool,
    /// Extra librdkafka properties (security settings and the like).
    #[serde(default)]
    pub properties: IndexMap<String, String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            partition: 0,
            stream_timeout_ms: default_stream_timeout_ms(),
            session_timeout_ms: default_consumer_timeout_ms(),
            max_poll_interval_ms: default_consumer_timeout_ms(),
            offset_reset: OffsetReset::default(),
            partition_eof: false,
            properties: IndexMap::new(),
        }
    }
}

impl StreamConfig {
    /// Idle timeout, `None` when the stream should block indefinitely.
    #[must_use]
    pub fn stream_timeout(&self) -> Option<Duration> {
        u64::try_from(self.stream_timeout_ms)
            .ok()
            .map(Duration::from_millis)
    }
}

/// Result republishing settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublisherConfig {
    /// Send attempts per message; 1 disables retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, doubled on each further retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Object storage settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Prefix joined with the bucket suffix argument.
    #[serde(default = "default_bucket_prefix")]
    pub bucket_prefix: String,
    /// Local directory holding saved and downloaded artifacts.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    /// Credentials document for the remote object store.
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    /// Remote object store endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket_prefix: default_bucket_prefix(),
            artifact_dir: default_artifact_dir(),
            credentials_path: default_credentials_path(),
            endpoint: default_endpoint(),
        }
    }
}

impl StorageConfig {
    /// Bucket name for a deployment suffix.
    #[must_use]
    pub fn bucket_name(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.bucket_prefix)
    }
}

/// Values supplied per invocation on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    /// Queue bootstrap servers.
    pub servers: String,
    /// Input topic.
    pub topic: String,
    /// Starting offset for TRAIN mode.
    pub offset: i64,
    /// Topic receiving reconstruction output.
    pub result_topic: String,
    /// TRAIN or PREDICT.
    pub mode: Mode,
    /// Model file name, also the object key.
    pub model_file: String,
    /// Suffix of the storage bucket name.
    pub bucket_suffix: String,
}

impl RunSettings {
    /// Validates raw positional values.
    pub fn parse(
        servers: &str,
        topic: &str,
        offset: &str,
        result_topic: &str,
        mode: &str,
        model_file: &str,
        bucket_suffix: &str,
    ) -> Result<Self, ConfigError> {
        let mode = Mode::from_str(mode)?;
        let offset = offset
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|value| *value >= 0)
            .ok_or_else(|| ConfigError::InvalidOffset(offset.to_string()))?;
        let model_file = model_file.trim();
        if !is_plain_file_name(model_file) {
            return Err(ConfigError::Invalid(format!(
                "model file must be a plain file name without directories, got '{model_file}'"
            )));
        }
        Ok(Self {
            servers: servers.to_string(),
            topic: topic.to_string(),
            offset,
            result_topic: result_topic.to_string(),
            mode,
            model_file: model_file.to_string(),
            bucket_suffix: bucket_suffix.to_string(),
        })
    }
}

fn default_layers() -> Vec<LayerConfig> {
    vec![
        LayerConfig::new(14, Activation::Tanh),
        LayerConfig::new(7, Activation::Relu),
        LayerConfig::new(7, Activation::Tanh),
        LayerConfig::new(FEATURE_DIM, Activation::Relu),
    ]
}

const fn default_epochs() -> usize {
    100
}

const fn default_batch_size() -> usize {
    1
}

const fn default_learning_rate() -> f64 {
    1e-3
}

const fn default_beta1() -> f64 {
    0.9
}

const fn default_beta2() -> f64 {
    0.999
}

const fn default_epsilon() -> f64 {
    1e-7
}

const fn default_l1_activity() -> f64 {
    1e-7
}

const fn default_seed() -> u64 {
    42
}

fn default_group_id() -> String {
    "cg-report-8".into()
}

const fn default_stream_timeout_ms() -> i64 {
    30_000
}

const fn default_consumer_timeout_ms() -> u64 {
    30_000
}

const fn default_max_attempts() -> u32 {
    1
}

const fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_bucket_prefix() -> String {
    "tf-models_".into()
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("./credentials/credentials.json")
}

fn default_endpoint() -> String {
    "https://storage.googleapis.com".into()
}
