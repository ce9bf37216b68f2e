#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms
)]
#![warn(missing_docs)]

//! Cardata pipeline: streams vehicle telemetry through an autoencoder that
//! is either trained on healthy traffic or used to score live traffic.

/// Error taxonomy shared by every stage.
#[path = "../error.rs"]
pub mod error;

/// Immutable pipeline configuration and TOML loading.
#[path = "../config.rs"]
pub mod config;

/// Structured logging and lifecycle events.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Raw queue messages and decoded telemetry records.
#[path = "../record.rs"]
pub mod record;

/// Avro record decoding with framing removal.
#[path = "../decoder.rs"]
pub mod decoder;

/// Min-max feature scaling.
#[path = "../normalizer.rs"]
pub mod normalizer;

/// Streaming sources for TRAIN and PREDICT.
#[path = "../stream/main.rs"]
pub mod stream;

/// Autoencoder model, optimizer and artifact format.
#[path = "../model/main.rs"]
pub mod model;

/// Object storage and model artifact persistence.
#[path = "../storage.rs"]
pub mod storage;

/// Inference result republishing.
#[path = "../publisher.rs"]
pub mod publisher;

/// TRAIN/PREDICT orchestration entry point.
#[path = "../main.rs"]
pub mod orchestrator;

pub use config::{DecodeFailurePolicy, PipelineConfig, RunSettings};
pub use decoder::RecordDecoder;
pub use error::{ConfigError, DecodeError, ModelError, PipelineError, StorageError, TransportError};
pub use model::{Autoencoder, BatchObserver, InferenceOutput, ModelArtifact, TrainingSummary};
pub use normalizer::{FeatureNormalizer, FeatureVector, NormalizedRecord, FEATURE_DIM};
pub use orchestrator::{Mode, PipelineOrchestrator, PipelineOrchestratorBuilder, RunReport};
pub use publisher::{DeliveryPolicy, MemoryResultSink, ResultPublisher, ResultSink};
pub use record::{RawMessage, Record};
pub use storage::{FsObjectStore, GcsObjectStore, ModelArtifactStore, ObjectStore};
pub use stream::{ChannelSource, FeatureStream, MemorySource, RecordSource};
pub use telemetry::{PipelineTelemetry, PipelineTelemetryBuilder};
