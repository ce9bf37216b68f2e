use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use cardata_pipeline::{
    config::ModelConfig, ChannelSource, DecodeFailurePolicy, DecodeError, FsObjectStore,
    MemoryResultSink, MemorySource, Mode, ObjectStore, PipelineConfig, PipelineError,
    PipelineOrchestrator, PipelineTelemetry, RawMessage, Record, RecordDecoder, RunSettings,
    StorageError,
};
use shared_event_bus::MemoryEventBus;

const BUCKET: &str = "tf-models_test";
const MODEL_FILE: &str = "car-autoencoder.json";

/// Filesystem store that counts reads and writes.
struct CountingStore {
    inner: FsObjectStore,
    puts: AtomicUsize,
    gets: AtomicUsize,
}

impl CountingStore {
    async fn with_bucket(root: &Path) -> Arc<Self> {
        let inner = FsObjectStore::new(root);
        inner.create_bucket(BUCKET).await.unwrap();
        Arc::new(Self {
            inner,
            puts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        self.inner.bucket_exists(bucket).await
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(bucket, key, bytes).await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(bucket, key).await
    }
}

fn settings(mode: &str) -> RunSettings {
    RunSettings::parse(
        "broker:9092",
        "car-data",
        "0",
        "car-results",
        mode,
        MODEL_FILE,
        "test",
    )
    .unwrap()
}

fn config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.storage.artifact_dir = dir.join("local-models");
    config.model = ModelConfig {
        epochs: 3,
        ..ModelConfig::default()
    };
    config
}

fn reading(step: usize) -> [f64; 18] {
    let wobble = (step % 5) as f64;
    [
        60.0 + wobble,
        25.0,
        100.0 + wobble,
        80.0,
        220.0,
        82.0,
        30.0,
        3000.0,
        0.4,
        28.0,
        28.0,
        29.0,
        29.0,
        3.0,
        3.5,
        3.0,
        3.5,
        1500.0,
    ]
}

fn payloads(flags: &[&str]) -> Vec<Vec<u8>> {
    let decoder = RecordDecoder::with_default_schema().unwrap();
    flags
        .iter()
        .enumerate()
        .map(|(step, flag)| {
            decoder
                .encode(&Record::from_features(reading(step), *flag), 7)
                .unwrap()
        })
        .collect()
}

async fn train(dir: &Path, store: Arc<CountingStore>, flags: &[&str]) -> cardata_pipeline::RunReport {
    PipelineOrchestrator::builder()
        .config(config(dir))
        .settings(settings("train"))
        .source(Box::new(MemorySource::from_payloads(payloads(flags))))
        .object_store(store)
        .build()
        .unwrap()
        .run()
        .await
        .unwrap()
}

#[tokio::test]
async fn train_uploads_artifact_under_expected_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = CountingStore::with_bucket(&dir.path().join("buckets")).await;
    let bus = Arc::new(MemoryEventBus::new(64));
    let telemetry = PipelineTelemetry::builder("cardata")
        .event_publisher(bus.clone())
        .build()
        .unwrap();

    let report = PipelineOrchestrator::builder()
        .config(config(dir.path()))
        .settings(settings("train"))
        .source(Box::new(MemorySource::from_payloads(payloads(&["false"; 100]))))
        .object_store(store.clone())
        .telemetry(telemetry)
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.mode, Mode::Train);
    assert_eq!(report.records_used, 100);
    assert_eq!(report.bucket, BUCKET);
    assert_eq!(report.artifact_key.as_deref(), Some(MODEL_FILE));
    assert!(dir.path().join("buckets").join(BUCKET).join(MODEL_FILE).is_file());
    assert!(dir.path().join("local-models").join(MODEL_FILE).is_file());
    assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    assert_eq!(store.gets.load(Ordering::SeqCst), 0, "train must never download");

    for milestone in [
        "pipeline.stream.start",
        "pipeline.train.complete",
        "pipeline.model.stored",
    ] {
        assert_eq!(bus.events_of_type(milestone).len(), 1, "{milestone}");
    }
}

#[tokio::test]
async fn failure_records_never_reach_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let store = CountingStore::with_bucket(dir.path()).await;
    let report = train(dir.path(), store, &["false", "true", "false", "true", "true"]).await;
    assert_eq!(report.records_decoded, 5);
    assert_eq!(report.failures_filtered, 3);
    assert_eq!(report.records_used, 2);
    assert_eq!(report.training.unwrap().samples, 2);
}

#[tokio::test]
async fn train_without_healthy_records_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = CountingStore::with_bucket(dir.path()).await;
    let err = PipelineOrchestrator::builder()
        .config(config(dir.path()))
        .settings(settings("train"))
        .source(Box::new(MemorySource::from_payloads(payloads(&["true"; 4]))))
        .object_store(store.clone())
        .build()
        .unwrap()
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Model(_)));
    assert_eq!(store.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn predict_scores_healthy_records_and_flushes_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = CountingStore::with_bucket(dir.path()).await;
    train(dir.path(), store.clone(), &["false"; 10]).await;
    let puts_after_train = store.puts.load(Ordering::SeqCst);

    let sink = MemoryResultSink::new();
    let report = PipelineOrchestrator::builder()
        .config(config(dir.path()))
        .settings(settings("predict"))
        .source(Box::new(MemorySource::from_payloads(payloads(&[
            "false", "true", "false",
        ]))))
        .object_store(store.clone())
        .result_sink(Arc::new(sink.clone()))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.mode, Mode::Predict);
    assert_eq!(report.records_used, 2);
    assert_eq!(report.failures_filtered, 1);
    assert_eq!(report.batches_published, 2);
    assert!(report.training.is_none(), "predict must never fit");
    assert_eq!(store.puts.load(Ordering::SeqCst), puts_after_train);
    assert_eq!(store.gets.load(Ordering::SeqCst), 1);

    let sent = sink.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|message| message.topic == "car-results"));
    assert_eq!(sent[0].key, "0");
    assert_eq!(sent[1].key, "2");
    for text in sink.payload_texts() {
        assert!(text.starts_with('[') && text.ends_with(']'));
        assert_eq!(text.trim_start_matches('[').trim_end_matches(']').split(' ').count(), 18);
    }
    assert_eq!(sink.flush_count(), 1);
}

#[tokio::test]
async fn predict_on_idle_stream_terminates_and_flushes_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = CountingStore::with_bucket(dir.path()).await;
    train(dir.path(), store.clone(), &["false"; 4]).await;

    let (sender, source) = ChannelSource::channel(8, Some(Duration::from_millis(50)));
    let sink = MemoryResultSink::new();
    let report = PipelineOrchestrator::builder()
        .config(config(dir.path()))
        .settings(settings("predict"))
        .source(Box::new(source))
        .object_store(store)
        .result_sink(Arc::new(sink.clone()))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();
    drop(sender);

    assert_eq!(report.records_read, 0);
    assert_eq!(report.records_used, 0);
    assert!(sink.sent().is_empty());
    assert_eq!(sink.flush_count(), 1);
}

#[tokio::test]
async fn predict_without_uploaded_model_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let store = CountingStore::with_bucket(dir.path()).await;
    let sink = MemoryResultSink::new();
    let err = PipelineOrchestrator::builder()
        .config(config(dir.path()))
        .settings(settings("predict"))
        .source(Box::new(MemorySource::from_payloads(payloads(&["false"]))))
        .object_store(store)
        .result_sink(Arc::new(sink.clone()))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Storage(StorageError::MissingBlob { .. })
    ));
    assert_eq!(sink.flush_count(), 0);
}

#[tokio::test]
async fn short_message_aborts_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let store = CountingStore::with_bucket(dir.path()).await;
    let mut messages = payloads(&["false", "false"]);
    messages.insert(1, vec![0, 0, 0]);

    let err = PipelineOrchestrator::builder()
        .config(config(dir.path()))
        .settings(settings("train"))
        .source(Box::new(MemorySource::from_payloads(messages)))
        .object_store(store)
        .build()
        .unwrap()
        .run()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Decode(DecodeError::Truncated { len: 3, .. })
    ));
}

#[tokio::test]
async fn skip_policy_trains_on_the_remaining_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = CountingStore::with_bucket(dir.path()).await;
    let mut config = config(dir.path());
    config.decoder.on_error = DecodeFailurePolicy::Skip;
    let mut messages: Vec<RawMessage> = payloads(&["false", "false"])
        .into_iter()
        .zip(0_i64..)
        .map(|(payload, offset)| RawMessage::new(payload, 0, offset))
        .collect();
    messages.push(RawMessage::new(vec![0, 0, 0, 0, 7, 0xff], 0, 2));

    let report = PipelineOrchestrator::builder()
        .config(config)
        .settings(settings("train"))
        .source(Box::new(MemorySource::new(messages)))
        .object_store(store)
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(report.records_read, 3);
    assert_eq!(report.records_skipped, 1);
    assert_eq!(report.records_used, 2);
}

#[tokio::test]
async fn predict_scores_trailing_partial_batch_then_flushes_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = CountingStore::with_bucket(dir.path()).await;
    train(dir.path(), store.clone(), &["false"; 6]).await;

    let mut config = config(dir.path());
    config.model.batch_size = 2;
    let sink = MemoryResultSink::new();
    let report = PipelineOrchestrator::builder()
        .config(config)
        .settings(settings("predict"))
        .source(Box::new(MemorySource::from_payloads(payloads(&[
            "false", "false", "false",
        ]))))
        .object_store(store)
        .result_sink(Arc::new(sink.clone()))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.records_used, 3);
    assert_eq!(report.batches_published, 2);
    let keys: Vec<_> = sink.sent().into_iter().map(|message| message.key).collect();
    assert_eq!(keys, ["0", "1", "2"]);
    assert_eq!(sink.flush_count(), 1);
}
