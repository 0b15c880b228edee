//! Log fan-out: one producer feed, many per-subscriber channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Per-subscriber channel capacity. A subscriber whose buffer is full misses
/// entries instead of blocking the producer.
pub const SUBSCRIBER_BUFFER: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

/// One observable event on a session's log stream. Transient, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub source: String,
}

impl LogEntry {
    pub fn info(session_id: &str, message: impl Into<String>) -> Self {
        Self::new(session_id, LogLevel::Info, message)
    }

    pub fn error(session_id: &str, message: impl Into<String>) -> Self {
        Self::new(session_id, LogLevel::Error, message)
    }

    fn new(session_id: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
            source: "runner".to_string(),
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<LogEntry>,
}

type SubscriberTable = Arc<Mutex<HashMap<String, Vec<Subscriber>>>>;

/// Single-producer-feed, multi-consumer broadcast. `publish` writes to an
/// internal channel and never blocks; a fan-out task copies each entry to
/// every live subscriber of that session with a non-blocking send.
pub struct LogRouter {
    feed: mpsc::UnboundedSender<LogEntry>,
    subscribers: SubscriberTable,
    next_id: AtomicU64,
}

impl LogRouter {
    pub fn new() -> Self {
        let (feed, mut rx) = mpsc::unbounded_channel::<LogEntry>();
        let subscribers: SubscriberTable = Arc::new(Mutex::new(HashMap::new()));

        let table = subscribers.clone();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let table = table.lock().expect("subscriber table poisoned");
                if let Some(subs) = table.get(&entry.session_id) {
                    for sub in subs {
                        // Full or closed channels miss the entry.
                        let _ = sub.tx.try_send(entry.clone());
                    }
                }
            }
        });

        Self {
            feed,
            subscribers,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a private, ordered channel for one session's entries.
    /// Entries published before the subscription are not replayed.
    pub fn subscribe(&self, session_id: &str) -> (u64, mpsc::Receiver<LogEntry>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut table = self.subscribers.lock().expect("subscriber table poisoned");
        table
            .entry(session_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    /// Remove and close one subscriber channel. The session's table entry is
    /// pruned when its last subscriber leaves.
    pub fn unsubscribe(&self, session_id: &str, id: u64) {
        let mut table = self.subscribers.lock().expect("subscriber table poisoned");
        if let Some(subs) = table.get_mut(session_id) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                table.remove(session_id);
            }
        }
    }

    /// Hand the entry to the fan-out task. Never blocks the caller.
    pub fn publish(&self, entry: LogEntry) {
        let _ = self.feed.send(entry);
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let table = self.subscribers.lock().expect("subscriber table poisoned");
        table.get(session_id).map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for LogRouter {
    fn default() -> Self {
        Self::new()
    }
}
