//! Document-store seam.
//!
//! Everything the engine knows about games and teams arrives as loosely typed
//! documents from an external real-time store. The store offers two
//! primitives: a one-shot query, and a push subscription that redelivers the
//! complete result set every time a matching document changes upstream.
//!
//! ```text
//!  MemoryStore ─┐
//!               ├──▶ DocumentStore::get_documents()  (one-shot)
//!  RemoteStore ─┘    DocumentStore::listen()         (push, full result set)
//! ```

pub mod memory;
pub mod query;
pub mod remote;

pub use memory::MemoryStore;
pub use query::{Filter, FilterOp, OrderBy, Query};
pub use remote::RemoteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Scheduled (upcoming or live) games.
pub const SCHEDULE_COLLECTION: &str = "games_schedule";
/// Games already played, with final scores.
pub const PLAYED_COLLECTION: &str = "games_played";
/// Team metadata, one document per team id.
pub const TEAMS_COLLECTION: &str = "teams";

/// A single loosely typed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Document {
    /// Build a document from a JSON object. Non-object values give an empty
    /// field map.
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Document {
            id: id.into(),
            fields,
        }
    }

    /// Look up a field by dotted path, e.g. `teams.homeId`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid store url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed store payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("store protocol error: {0}")]
    Protocol(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Every delivery on a subscription is either the full current result set or
/// a transient error. Errors never end the subscription by themselves.
pub type Delivery = Result<Vec<Document>, StoreError>;

/// A live push subscription. Dropping it (or calling [`Subscription::cancel`])
/// stops deliveries and tears down any background connection.
pub struct Subscription {
    rx: mpsc::Receiver<Delivery>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Delivery>, task: Option<JoinHandle<()>>) -> Self {
        Subscription { rx, task }
    }

    /// Wait for the next delivery. `None` means the subscription has ended.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Trait that every document store backend must implement.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run a query once and return the matching documents.
    async fn get_documents(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Open a push subscription. The first delivery carries the current result
    /// set; each later delivery replaces it entirely.
    async fn listen(&self, query: &Query) -> Result<Subscription, StoreError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
