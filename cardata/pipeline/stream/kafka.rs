use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    message::BorrowedMessage,
    producer::{FutureProducer, FutureRecord, Producer},
    ClientConfig, Message, Offset, TopicPartitionList,
};

use super::RecordSource;
use crate::{
    config::StreamConfig, error::TransportError, publisher::ResultSink, record::RawMessage,
};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Copies user properties, leaving the keys this module owns untouched.
fn apply_properties(client: &mut ClientConfig, properties: &IndexMap<String, String>) {
    for (key, value) in properties {
        match key.as_str() {
            "bootstrap.servers" | "group.id" | "enable.partition.eof" => {}
            _ => {
                client.set(key, value);
            }
        }
    }
}

fn to_raw(message: &BorrowedMessage<'_>) -> RawMessage {
    RawMessage {
        payload: message.payload().unwrap_or_default().to_vec(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
    }
}

/// Reads one partition from an explicit offset until end-of-partition.
pub struct KafkaTrainSource {
    consumer: StreamConsumer,
}

impl KafkaTrainSource {
    /// Assigns `topic`/`config.partition` starting at `offset`.
    pub fn new(
        servers: &str,
        topic: &str,
        offset: i64,
        config: &StreamConfig,
    ) -> Result<Self, TransportError> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", servers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "true");
        apply_properties(&mut client, &config.properties);
        let consumer: StreamConsumer = client
            .create()
            .map_err(|err| TransportError::Connect(format!("creating consumer: {err}")))?;

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, config.partition, Offset::Offset(offset))
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        consumer
            .assign(&assignment)
            .map_err(|err| TransportError::Connect(format!("assigning {topic}: {err}")))?;
        Ok(Self { consumer })
    }
}

#[async_trait]
impl RecordSource for KafkaTrainSource {
    async fn next_message(&mut self) -> Result<Option<RawMessage>, TransportError> {
        match self.consumer.recv().await {
            Ok(message) => Ok(Some(to_raw(&message))),
            Err(KafkaError::PartitionEOF(_)) => Ok(None),
            Err(err) => Err(TransportError::Receive(err.to_string())),
        }
    }
}

/// Consumer-group subscription that ends after an idle timeout.
pub struct KafkaPredictSource {
    consumer: StreamConsumer,
    idle_timeout: Option<Duration>,
}

impl KafkaPredictSource {
    /// Joins `config.group_id` and subscribes to `topic`.
    pub fn new(servers: &str, topic: &str, config: &StreamConfig) -> Result<Self, TransportError> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", servers)
            .set("group.id", &config.group_id)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string())
            .set("auto.offset.reset", config.offset_reset.as_str())
            .set("enable.partition.eof", config.partition_eof.to_string());
        apply_properties(&mut client, &config.properties);
        let consumer: StreamConsumer = client
            .create()
            .map_err(|err| TransportError::Connect(format!("creating consumer: {err}")))?;
        consumer
            .subscribe(&[topic])
            .map_err(|err| TransportError::Connect(format!("subscribing {topic}: {err}")))?;
        Ok(Self {
            consumer,
            idle_timeout: config.stream_timeout(),
        })
    }

    fn convert(
        result: Result<BorrowedMessage<'_>, KafkaError>,
    ) -> Result<Option<RawMessage>, TransportError> {
        match result {
            Ok(message) => Ok(Some(to_raw(&message))),
            Err(KafkaError::PartitionEOF(_)) => Ok(None),
            Err(err) => Err(TransportError::Receive(err.to_string())),
        }
    }
}

#[async_trait]
impl RecordSource for KafkaPredictSource {
    async fn next_message(&mut self) -> Result<Option<RawMessage>, TransportError> {
        match self.idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, self.consumer.recv()).await {
                Ok(result) => Self::convert(result),
                Err(_) => Ok(None),
            },
            None => Self::convert(self.consumer.recv().await),
        }
    }
}

/// Producer publishing inference results.
pub struct KafkaResultSink {
    producer: FutureProducer,
}

impl KafkaResultSink {
    /// Connects a producer to `servers`.
    pub fn new(
        servers: &str,
        properties: &IndexMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", servers)
            .set("message.timeout.ms", "30000");
        apply_properties(&mut client, properties);
        let producer = client
            .create()
            .map_err(|err| TransportError::Connect(format!("creating producer: {err}")))?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl ResultSink for KafkaResultSink {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TransportError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        self.producer
            .send(record, Duration::ZERO)
            .await
            .map(|_| ())
            .map_err(|(err, _)| TransportError::Publish {
                topic: topic.to_string(),
                attempts: 1,
                message: err.to_string(),
            })
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.producer
            .flush(FLUSH_TIMEOUT)
            .map_err(|err| TransportError::Flush(err.to_string()))
    }
}
