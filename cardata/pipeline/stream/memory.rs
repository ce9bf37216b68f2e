use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::RecordSource;
use crate::{error::TransportError, record::RawMessage};

/// Finite in-memory source; ends when the queue is drained.
#[derive(Debug, Default)]
pub struct MemorySource {
    pending: VecDeque<RawMessage>,
}

impl MemorySource {
    /// Source over prepared messages.
    #[must_use]
    pub fn new(messages: impl IntoIterator<Item = RawMessage>) -> Self {
        Self {
            pending: messages.into_iter().collect(),
        }
    }

    /// Source over payloads on partition 0 with offsets 0, 1, 2, ...
    #[must_use]
    pub fn from_payloads(payloads: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self::new(
            payloads
                .into_iter()
                .zip(0_i64..)
                .map(|(payload, offset)| RawMessage::new(payload, 0, offset)),
        )
    }

    /// Messages not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn next_message(&mut self) -> Result<Option<RawMessage>, TransportError> {
        Ok(self.pending.pop_front())
    }
}

/// Channel-backed source with the PREDICT idle-timeout semantics.
///
/// The stream ends when the sender side is dropped or when no message arrives
/// within the idle timeout.
#[derive(Debug)]
pub struct ChannelSource {
    receiver: mpsc::Receiver<RawMessage>,
    idle_timeout: Option<Duration>,
}

impl ChannelSource {
    /// Creates a bounded channel and its source end.
    #[must_use]
    pub fn channel(
        capacity: usize,
        idle_timeout: Option<Duration>,
    ) -> (mpsc::Sender<RawMessage>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            sender,
            Self {
                receiver,
                idle_timeout,
            },
        )
    }
}

#[async_trait]
impl RecordSource for ChannelSource {
    async fn next_message(&mut self) -> Result<Option<RawMessage>, TransportError> {
        match self.idle_timeout {
            Some(idle) => Ok(tokio::time::timeout(idle, self.receiver.recv())
                .await
                .unwrap_or(None)),
            None => Ok(self.receiver.recv().await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_source_drains_in_order() {
        let mut source = MemorySource::from_payloads(vec![vec![1], vec![2]]);
        assert_eq!(source.next_message().await.unwrap().unwrap().payload, vec![1]);
        assert_eq!(source.remaining(), 1);
        assert_eq!(source.next_message().await.unwrap().unwrap().offset, 1);
        assert!(source.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn channel_source_ends_after_idle_timeout() {
        let (sender, mut source) = ChannelSource::channel(4, Some(Duration::from_millis(30)));
        sender.send(RawMessage::new(vec![9], 0, 5)).await.unwrap();
        assert_eq!(source.next_message().await.unwrap().unwrap().offset, 5);
        // Sender is still alive; only the idle timeout can end the stream.
        assert!(source.next_message().await.unwrap().is_none());
        drop(sender);
    }

    #[tokio::test]
    async fn channel_source_ends_when_sender_drops() {
        let (sender, mut source) = ChannelSource::channel(1, None);
        drop(sender);
        assert!(source.next_message().await.unwrap().is_none());
    }
}
