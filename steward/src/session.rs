//! Session persistence contract.
//!
//! A thread's state serializes as an ordered log of typed entries plus
//! session metadata with parent/child linking. The core does not prescribe
//! a storage engine; [`InMemorySessionStore`] is the reference
//! implementation and the test double for persistent backends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Session kind in the parent/child tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    /// A top-level run.
    #[default]
    Root,
    /// Spawned by a parent session.
    Subagent,
    /// Forked from a parent session.
    Branch,
}

/// Session metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    /// Session id.
    pub id: String,
    /// Parent session, for subagents and branches.
    pub parent_session_id: Option<String>,
    /// Session kind.
    pub session_type: SessionType,
    /// Total tokens used.
    pub tokens: u64,
    /// Total cost in dollars.
    pub cost: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl SessionMeta {
    /// Create a root session.
    #[must_use]
    pub fn root() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_session_id: None,
            session_type: SessionType::Root,
            tokens: 0,
            cost: 0.0,
            created_at: Utc::now(),
        }
    }

    /// Create a child of `parent`.
    #[must_use]
    pub fn child_of(parent: &str, session_type: SessionType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_session_id: Some(parent.to_owned()),
            session_type,
            tokens: 0,
            cost: 0.0,
            created_at: Utc::now(),
        }
    }
}

/// Entry kinds in the serialized log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryKind {
    /// A conversation message.
    Message,
    /// A tool call request.
    ToolCall,
    /// A tool result.
    ToolResult,
    /// A checkpoint marker.
    Checkpoint,
}

/// One serialized log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Entry kind.
    #[serde(rename = "type")]
    pub kind: LogEntryKind,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Entry payload.
    pub data: Value,
}

impl LogEntry {
    /// Create an entry timestamped now.
    #[must_use]
    pub fn new(kind: LogEntryKind, data: Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Storage contract for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session.
    async fn create_session(&self, meta: SessionMeta) -> Result<()>;

    /// Fetch one session's metadata.
    async fn get_session(&self, id: &str) -> Result<Option<SessionMeta>>;

    /// Append a log entry to a session.
    async fn append_entry(&self, session_id: &str, entry: LogEntry) -> Result<()>;

    /// A session's entries in append order.
    async fn entries(&self, session_id: &str) -> Result<Vec<LogEntry>>;

    /// Update a session's running totals.
    async fn update_usage(&self, session_id: &str, tokens: u64, cost: f64) -> Result<()>;

    /// Direct children of a session.
    async fn child_sessions(&self, id: &str) -> Result<Vec<SessionMeta>>;

    /// The session and all its descendants, breadth-first.
    async fn session_tree(&self, id: &str) -> Result<Vec<SessionMeta>>;
}

/// Shared handle to a session store.
pub type SharedSessionStore = Arc<dyn SessionStore>;

#[derive(Debug, Default)]
struct StoreInner {
    sessions: HashMap<String, SessionMeta>,
    entries: HashMap<String, Vec<LogEntry>>,
    /// Insertion order, so child listings are deterministic.
    order: Vec<String>,
}

/// In-memory session store.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    inner: Mutex<StoreInner>,
}

impl InMemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, meta: SessionMeta) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.sessions.contains_key(&meta.id) {
            return Err(Error::invalid_request(format!(
                "session '{}' already exists",
                meta.id
            )));
        }
        inner.order.push(meta.id.clone());
        inner.entries.insert(meta.id.clone(), Vec::new());
        inner.sessions.insert(meta.id.clone(), meta);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionMeta>> {
        Ok(self.inner.lock().await.sessions.get(id).cloned())
    }

    async fn append_entry(&self, session_id: &str, entry: LogEntry) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .entries
            .get_mut(session_id)
            .ok_or_else(|| Error::invalid_request(format!("unknown session '{session_id}'")))?
            .push(entry);
        Ok(())
    }

    async fn entries(&self, session_id: &str) -> Result<Vec<LogEntry>> {
        self.inner
            .lock()
            .await
            .entries
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::invalid_request(format!("unknown session '{session_id}'")))
    }

    async fn update_usage(&self, session_id: &str, tokens: u64, cost: f64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let meta = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::invalid_request(format!("unknown session '{session_id}'")))?;
        meta.tokens = tokens;
        meta.cost = cost;
        Ok(())
    }

    async fn child_sessions(&self, id: &str) -> Result<Vec<SessionMeta>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|sid| inner.sessions.get(sid))
            .filter(|meta| meta.parent_session_id.as_deref() == Some(id))
            .cloned()
            .collect())
    }

    async fn session_tree(&self, id: &str) -> Result<Vec<SessionMeta>> {
        let inner = self.inner.lock().await;
        let root = inner
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::invalid_request(format!("unknown session '{id}'")))?;

        let mut tree = vec![root];
        let mut frontier = std::collections::VecDeque::from([id.to_owned()]);
        while let Some(current) = frontier.pop_front() {
            for sid in &inner.order {
                let Some(meta) = inner.sessions.get(sid) else {
                    continue;
                };
                if meta.parent_session_id.as_deref() == Some(current.as_str()) {
                    tree.push(meta.clone());
                    frontier.push_back(meta.id.clone());
                }
            }
        }
        Ok(tree)
    }
}
