//! In-memory session registry with TTL-bounded entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::info;

use crate::error::{Error, Result};

/// One unit of remote work: a workspace snapshot plus lifecycle bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub workspace_path: String,
    pub metadata: HashMap<String, String>,
    pub state: Map<String, Value>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

/// Thread-safe session storage. All mutations take the write lock for their
/// whole duration; reads share the read lock. Expiry is enforced at read
/// time, so the sweeper only bounds memory growth.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: chrono::Duration,
}

impl SessionRegistry {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Create a session with a fresh 128-bit random id and a TTL-bound expiry.
    pub async fn create(
        &self,
        workspace_path: String,
        metadata: HashMap<String, String>,
    ) -> Session {
        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().simple().to_string(),
            workspace_path,
            metadata,
            state: Map::new(),
            status: "created".to_string(),
            created_at: now,
            updated_at: now,
            expires_at: now + self.ttl,
            version: 1,
        };

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id.clone(), session.clone());
        info!(session_id = %session.id, "created session");
        session
    }

    /// An expired session is indistinguishable from an absent one.
    pub async fn get(&self, id: &str) -> Result<Session> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        if Utc::now() > session.expires_at {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(session.clone())
    }

    /// Replace state wholesale (snapshot) or merge per key, last writer wins
    /// (delta). Bumps version and timestamps, sets status to "synced".
    pub async fn sync(
        &self,
        id: &str,
        delta: Option<Map<String, Value>>,
        snapshot: Option<Map<String, Value>>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        if Utc::now() > session.expires_at {
            return Err(Error::Expired(id.to_string()));
        }

        if let Some(snapshot) = snapshot {
            session.state = snapshot;
        } else if let Some(delta) = delta {
            for (key, value) in delta {
                session.state.insert(key, value);
            }
        }

        session.status = "synced".to_string();
        session.updated_at = Utc::now();
        session.version += 1;
        Ok(())
    }

    /// Apply `updates` as a delta only if the stored version still matches
    /// `expected_version`. Check and mutation happen under one write-lock
    /// acquisition, so a conflicting write cannot slip in between.
    pub async fn compare_and_sync(
        &self,
        id: &str,
        expected_version: u64,
        updates: Map<String, Value>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        if Utc::now() > session.expires_at {
            return Err(Error::Expired(id.to_string()));
        }
        if session.version != expected_version {
            return Err(Error::VersionConflict {
                expected: expected_version,
                actual: session.version,
            });
        }

        for (key, value) in updates {
            session.state.insert(key, value);
        }
        session.status = "synced".to_string();
        session.updated_at = Utc::now();
        session.version += 1;
        Ok(())
    }

    /// Free-form status overwrite.
    pub async fn update_status(&self, id: &str, status: String) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        session.status = status;
        session.updated_at = Utc::now();
        session.version += 1;
        Ok(())
    }

    /// Non-expired sessions, in no particular order.
    pub async fn list(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let now = Utc::now();
        sessions
            .values()
            .filter(|s| now <= s.expires_at)
            .cloned()
            .collect()
    }

    /// Unconditional removal, idempotent.
    pub async fn delete(&self, id: &str) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(id).is_some() {
            info!(session_id = %id, "deleted session");
        }
    }

    /// Drop every entry past its expiry. Returns the number removed.
    pub async fn sweep_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let now = Utc::now();
        let before = sessions.len();
        sessions.retain(|_, s| now <= s.expires_at);
        before - sessions.len()
    }

    /// Background sweep on a fixed interval.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let removed = self.sweep_expired().await;
                if removed > 0 {
                    info!(removed, "swept expired sessions");
                }
            }
        })
    }
}
