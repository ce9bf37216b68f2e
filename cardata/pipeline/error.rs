use std::path::PathBuf;

use thiserror::Error;

/// Failure to turn a raw queue message into a [`crate::record::Record`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload shorter than the framing prefix.
    #[error("payload of {len} bytes is shorter than the {prefix}-byte framing prefix")]
    Truncated {
        /// Received payload length.
        len: usize,
        /// Expected prefix length.
        prefix: usize,
    },
    /// Framing prefix present but not recognised.
    #[error("unexpected framing magic byte {0:#04x}")]
    Framing(u8),
    /// Avro datum could not be read.
    #[error("avro decode failed: {0}")]
    Avro(#[from] apache_avro::Error),
    /// Schema does not describe the expected record layout.
    #[error("schema mismatch: {0}")]
    Schema(String),
    /// Bytes left over after the record datum.
    #[error("{len} trailing byte(s) after the record datum")]
    TrailingBytes {
        /// Unread byte count.
        len: usize,
    },
    /// Decoded datum lacks a field.
    #[error("decoded record is missing field '{0}'")]
    MissingField(&'static str),
    /// Decoded field has the wrong Avro type.
    #[error("field '{field}' expected {expected}, found {found}")]
    FieldType {
        /// Field name.
        field: &'static str,
        /// Expected Avro type.
        expected: &'static str,
        /// Observed value kind.
        found: String,
    },
}

/// Invalid invocation or configuration; raised before any I/O.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Mode argument is neither `train` nor `predict`.
    #[error("mode is invalid, must be either 'train' or 'predict': {0}")]
    InvalidMode(String),
    /// Offset argument is not a non-negative integer.
    #[error("offset must be a non-negative integer: {0}")]
    InvalidOffset(String),
    /// Configuration file could not be read.
    #[error("reading config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Configuration file is not valid TOML for the expected layout.
    #[error("parsing config {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A value is out of its accepted domain.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// The requested transport was compiled out.
    #[error("{0} requires the 'kafka' feature; recompile with --features kafka")]
    FeatureDisabled(&'static str),
}

/// Object storage failure; always fatal for the run.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Credentials absent or unusable.
    #[error("missing storage credentials: {0}")]
    MissingCredentials(String),
    /// Bucket does not exist or is not visible.
    #[error("bucket '{0}' not found")]
    MissingBucket(String),
    /// Blob does not exist in the bucket.
    #[error("object '{key}' not found in bucket '{bucket}'")]
    MissingBlob {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },
    /// Object key that is not a plain relative name.
    #[error("object key '{0}' must be a relative name without '.', '..' or root components")]
    InvalidKey(String),
    /// Local filesystem failure.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    /// Remote service failure.
    #[error("storage request failed: {0}")]
    Http(String),
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Queue connect, receive or publish failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Client could not be created or subscribed.
    #[error("queue connection failed: {0}")]
    Connect(String),
    /// Error while polling for the next message.
    #[error("queue receive failed: {0}")]
    Receive(String),
    /// Message could not be delivered.
    #[error("publish to '{topic}' failed after {attempts} attempt(s): {message}")]
    Publish {
        /// Destination topic.
        topic: String,
        /// Attempts made.
        attempts: u32,
        /// Last transport error.
        message: String,
    },
    /// Pending messages could not be flushed.
    #[error("flush failed: {0}")]
    Flush(String),
}

/// Model training, inference or artifact failure.
#[derive(Debug, Error)]
pub enum ModelError {
    /// No samples survived filtering.
    #[error("training set is empty; no non-failure records were read")]
    EmptyTrainingSet,
    /// Layer or weight shapes disagree.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// Artifact written by an unknown format version.
    #[error("unsupported artifact format version {0}")]
    UnsupportedFormat(u32),
    /// Artifact document could not be (de)serialised.
    #[error("artifact serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Top-level error returned by a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// See [`DecodeError`].
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// See [`ConfigError`].
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// See [`StorageError`].
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// See [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// See [`ModelError`].
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
