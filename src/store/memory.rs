//! In-process document store with live listeners.
//!
//! Backs the test-suite and the binary's offline `--seed-file` mode. Every
//! mutation re-evaluates the listeners on the touched collection and pushes
//! them their full, freshly computed result set, the same contract the remote
//! gateway honours.
//!
//! For tests it also counts one-shot queries per collection, can delay them,
//! and can fail the queries selected by a predicate.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Delivery, Document, DocumentStore, Query, StoreError, Subscription};

type FailRule = Box<dyn Fn(&Query) -> bool + Send + Sync>;

struct Listener {
    query: Query,
    tx: mpsc::Sender<Delivery>,
}

#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    listeners: Mutex<Vec<Listener>>,
    query_counts: Mutex<HashMap<String, usize>>,
    fail_rule: RwLock<Option<FailRule>>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a JSON object mapping collection names to arrays of
    /// `{"id", "fields"}` documents.
    pub fn from_seed_json(text: &str) -> Result<Self, StoreError> {
        let seed: HashMap<String, Vec<Document>> = serde_json::from_str(text)?;
        let store = Self::new();
        *store
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner) = seed;
        Ok(store)
    }

    /// Insert or replace a document (matched by id).
    pub fn insert(&self, collection: &str, doc: Document) {
        {
            let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
            let docs = collections.entry(collection.to_string()).or_default();
            match docs.iter_mut().find(|d| d.id == doc.id) {
                Some(existing) => *existing = doc,
                None => docs.push(doc),
            }
        }
        self.notify(collection);
    }

    pub fn remove(&self, collection: &str, id: &str) -> bool {
        let removed = {
            let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
            match collections.get_mut(collection) {
                Some(docs) => {
                    let before = docs.len();
                    docs.retain(|d| d.id != id);
                    docs.len() != before
                }
                None => false,
            }
        };
        if removed {
            self.notify(collection);
        }
        removed
    }

    pub fn replace_collection(&self, collection: &str, docs: Vec<Document>) {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection.to_string(), docs);
        self.notify(collection);
    }

    /// Fail every subsequent query (one-shot or listen) the rule selects.
    pub fn fail_when(&self, rule: impl Fn(&Query) -> bool + Send + Sync + 'static) {
        *self.fail_rule.write().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(rule));
    }

    pub fn clear_failures(&self) {
        *self.fail_rule.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Delay every one-shot query by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(latency);
    }

    /// Number of one-shot queries issued against a collection so far.
    pub fn query_count(&self, collection: &str) -> usize {
        self.query_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_queries(&self) -> usize {
        self.query_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    /// Live listeners on a collection.
    pub fn listener_count(&self, collection: &str) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|l| l.query.collection == collection && !l.tx.is_closed())
            .count()
    }

    /// Deliver a transient error to every listener on a collection.
    pub fn push_error(&self, collection: &str, message: &str) {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter().filter(|l| l.query.collection == collection) {
            let _ = listener
                .tx
                .try_send(Err(StoreError::Unavailable(message.to_string())));
        }
    }

    fn is_failing(&self, query: &Query) -> bool {
        self.fail_rule
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|rule| rule(query))
    }

    fn evaluate(&self, query: &Query) -> Vec<Document> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        match collections.get(&query.collection) {
            Some(docs) => query.apply(docs),
            None => Vec::new(),
        }
    }

    fn notify(&self, collection: &str) {
        let docs: Vec<Document> = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .cloned()
            .unwrap_or_default();

        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| !l.tx.is_closed());
        for listener in listeners.iter().filter(|l| l.query.collection == collection) {
            let results = listener.query.apply(&docs);
            if let Err(e) = listener.tx.try_send(Ok(results)) {
                warn!("MemoryStore listener on '{}' dropped a delivery: {}", collection, e);
            }
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        "MemoryStore"
    }

    async fn get_documents(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        *self
            .query_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(query.collection.clone())
            .or_default() += 1;

        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.is_failing(query) {
            return Err(StoreError::Unavailable(format!(
                "injected failure for '{}'",
                query.collection
            )));
        }
        Ok(self.evaluate(query))
    }

    async fn listen(&self, query: &Query) -> Result<Subscription, StoreError> {
        if self.is_failing(query) {
            return Err(StoreError::Unavailable(format!(
                "injected failure for '{}'",
                query.collection
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        let initial = self.evaluate(query);
        debug!(
            "MemoryStore: listener on '{}' starts with {} documents",
            query.collection,
            initial.len()
        );
        let _ = tx.try_send(Ok(initial));
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| !l.tx.is_closed());
        listeners.push(Listener {
            query: query.clone(),
            tx,
        });
        Ok(Subscription::new(rx, None))
    }
}
