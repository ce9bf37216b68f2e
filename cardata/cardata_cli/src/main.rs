use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use cardata_pipeline::{
    publisher::open_kafka_sink, stream::open_kafka_source, ConfigError, FsObjectStore,
    GcsObjectStore, Mode, ObjectStore, PipelineConfig, PipelineError, PipelineOrchestrator,
    PipelineTelemetry, RunReport, RunSettings,
};
use clap::{CommandFactory, Parser};
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;
use tokio::runtime::Runtime;

#[cfg(feature = "kafka")]
const TRANSPORT_NOTE: &str = "Kafka transport: enabled.";
#[cfg(not(feature = "kafka"))]
const TRANSPORT_NOTE: &str = "Kafka transport: not compiled in. Rebuild with \
`cargo build -p cardata --features kafka`; without it every run exits with a usage error.";

#[derive(Parser, Debug)]
#[command(
    name = "cardata",
    version,
    about = "Trains or runs the vehicle telemetry anomaly autoencoder",
    after_help = TRANSPORT_NOTE
)]
struct Cli {
    /// Kafka bootstrap servers.
    servers: String,
    /// Input topic carrying framed Avro records.
    topic: String,
    /// Partition offset TRAIN starts from.
    offset: String,
    /// Topic receiving reconstructed vectors in PREDICT mode.
    result_topic: String,
    /// `train` or `predict`.
    mode: String,
    /// Model file name, also the object key in the bucket.
    model_file: String,
    /// Appended to the bucket prefix to form the bucket name.
    bucket_suffix: String,
    /// Pipeline configuration (TOML).
    #[arg(long)]
    config: Option<PathBuf>,
    /// JSON-lines log file; logs go to stderr otherwise.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// JSONL file receiving lifecycle events.
    #[arg(long)]
    event_log: Option<PathBuf>,
    /// Use a directory of buckets instead of Google Cloud Storage.
    #[arg(long)]
    storage_root: Option<PathBuf>,
    /// Log per-epoch training loss.
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let outcome = Runtime::new()
        .context("starting tokio runtime")
        .and_then(|runtime| runtime.block_on(run(cli)));
    match outcome {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(text) => println!("{text}"),
                Err(err) => eprintln!("failed to render run report: {err}"),
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            if is_usage_error(&err) {
                let _ = Cli::command().print_help();
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn is_usage_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ConfigError>().is_some()
        || matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::Config(_)))
}

async fn run(cli: Cli) -> Result<RunReport> {
    let settings = RunSettings::parse(
        &cli.servers,
        &cli.topic,
        &cli.offset,
        &cli.result_topic,
        &cli.mode,
        &cli.model_file,
        &cli.bucket_suffix,
    )?;
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading pipeline config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let telemetry = build_telemetry(&cli)?;
    let store: Arc<dyn ObjectStore> = match &cli.storage_root {
        Some(root) => Arc::new(FsObjectStore::new(root)),
        None => Arc::new(
            GcsObjectStore::from_config(&config.storage).context("opening object storage")?,
        ),
    };
    let source = open_kafka_source(settings.mode, &settings, &config.stream)
        .context("opening record source")?;

    let mut builder = PipelineOrchestrator::builder()
        .source(source)
        .object_store(store)
        .telemetry(telemetry);
    if settings.mode == Mode::Predict {
        let sink = open_kafka_sink(&settings.servers, &config.stream.properties)
            .context("opening result producer")?;
        builder = builder.result_sink(sink);
    }
    let mode = settings.mode;
    let orchestrator = builder.config(config).settings(settings).build()?;
    orchestrator
        .run()
        .await
        .with_context(|| format!("{mode} run failed"))
}

fn build_telemetry(cli: &Cli) -> Result<PipelineTelemetry> {
    let mut builder = PipelineTelemetry::builder("cardata");
    builder = match &cli.log_file {
        Some(path) => builder.log_path(path),
        None => builder.console(),
    };
    if cli.verbose {
        builder = builder.min_level(LogLevel::Debug);
    }
    if let Some(path) = &cli.event_log {
        let publisher = FileEventPublisher::new(path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        builder = builder.event_publisher(Arc::new(publisher));
    }
    builder.build().context("building telemetry")
}
