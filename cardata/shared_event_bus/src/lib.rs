#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Lifecycle events emitted at pipeline mode boundaries.
//!
//! Publishers are cheap to share behind an `Arc<dyn EventPublisher>`; the
//! in-memory bus keeps a bounded history that tests can inspect, the file
//! publisher appends one JSON document per line.

use std::{
    collections::VecDeque,
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{fs::File, io::AsyncWriteExt, sync::broadcast};
use uuid::Uuid;

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique event id.
    pub id: Uuid,
    /// Component that emitted the event.
    pub source: String,
    /// Dotted event name, e.g. `pipeline.model.stored`.
    pub event_type: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Event-specific fields.
    #[serde(default)]
    pub payload: Value,
}

impl EventRecord {
    /// Stamps a new event with a fresh id and the current time.
    #[must_use]
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Whether this event has the given type.
    #[must_use]
    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}

/// Sink for lifecycle events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Records one event.
    async fn publish(&self, event: EventRecord) -> Result<()>;
}

/// Live feed of published events.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Receiver for events published after this call.
    async fn subscribe(&self) -> Result<broadcast::Receiver<EventRecord>>;
}

#[derive(Debug)]
struct BusState {
    history: Mutex<VecDeque<EventRecord>>,
    live: broadcast::Sender<EventRecord>,
    retain: usize,
}

/// In-process bus that broadcasts events and retains the most recent ones.
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    state: Arc<BusState>,
}

impl MemoryEventBus {
    /// Bus keeping the last `retain` events (at least one).
    #[must_use]
    pub fn new(retain: usize) -> Self {
        let retain = retain.max(1);
        let (live, _) = broadcast::channel(retain);
        Self {
            state: Arc::new(BusState {
                history: Mutex::new(VecDeque::with_capacity(retain)),
                live,
                retain,
            }),
        }
    }

    /// Retained events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.state.history.lock().iter().cloned().collect()
    }

    /// Retained events of one type, oldest first.
    #[must_use]
    pub fn events_of_type(&self, event_type: &str) -> Vec<EventRecord> {
        self.state
            .history
            .lock()
            .iter()
            .filter(|event| event.is(event_type))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        {
            let mut history = self.state.history.lock();
            if history.len() == self.state.retain {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // Having no live subscriber is normal.
        let _ = self.state.live.send(event);
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for MemoryEventBus {
    async fn subscribe(&self) -> Result<broadcast::Receiver<EventRecord>> {
        Ok(self.state.live.subscribe())
    }
}

/// Appends events as JSON lines to a file kept open for the publisher's lifetime.
#[derive(Debug)]
pub struct FileEventPublisher {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
}

impl FileEventPublisher {
    /// Opens `path` for appending, creating it and its parent directories.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating event log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(File::from_std(file)),
        })
    }

    /// Event log location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventPublisher for FileEventPublisher {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
