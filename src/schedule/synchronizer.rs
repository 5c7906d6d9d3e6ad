//! Live schedule synchronizer.
//!
//! Holds a push subscription on `games_schedule` over a rolling window
//! [now − past, now + future] ordered by start time. Every delivery is the
//! full result set and replaces the published [`ScheduleSnapshot`] wholesale.
//!
//! ```text
//!  DocumentStore::listen ──deliveries──▶ sync task ──Arc swap──▶ watch<Arc<ScheduleSnapshot>>
//!         ▲                                  │
//!         └──── reopened every `roll` ───────┘   (and after a stream end, with backoff)
//! ```
//!
//! A failed delivery keeps the last good snapshot and is surfaced through
//! [`ScheduleSynchronizer::last_error`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::decode;
use crate::models::{Game, GameId, Matchup};
use crate::store::{Document, DocumentStore, Query, StoreError, SCHEDULE_COLLECTION};

const MAX_RETRY: Duration = Duration::from_secs(30);

/// One published view of the schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleSnapshot {
    /// Game ids in delivery order (ascending start time)
    pub game_ids: Vec<GameId>,
    pub games: HashMap<GameId, Game>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
}

impl ScheduleSnapshot {
    /// Normalize one delivery. Documents without `gameId` are dropped and a
    /// repeated game id keeps its first occurrence.
    pub fn from_documents(
        docs: &[Document],
        window: (DateTime<Utc>, DateTime<Utc>),
        received_at: DateTime<Utc>,
    ) -> Self {
        let mut game_ids = Vec::with_capacity(docs.len());
        let mut games = HashMap::with_capacity(docs.len());
        for doc in docs {
            let Some(game) = decode::schedule_game(doc) else {
                debug!("Dropping schedule document '{}' without gameId", doc.id);
                continue;
            };
            if games.contains_key(&game.id) {
                debug!("Duplicate game {} in delivery, keeping the first", game.id);
                continue;
            }
            game_ids.push(game.id);
            games.insert(game.id, game);
        }
        ScheduleSnapshot {
            game_ids,
            games,
            window_start: Some(window.0),
            window_end: Some(window.1),
            received_at: Some(received_at),
        }
    }

    pub fn game(&self, id: GameId) -> Option<&Game> {
        self.games.get(&id)
    }

    pub fn matchup(&self, id: GameId) -> Option<Matchup> {
        self.game(id)?.teams
    }

    /// Games in delivery order.
    pub fn games_in_order(&self) -> Vec<&Game> {
        self.game_ids.iter().filter_map(|id| self.games.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.game_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.game_ids.is_empty()
    }
}

/// Bounds and timing of the subscription window.
#[derive(Debug, Clone, Copy)]
pub struct SyncWindow {
    pub past: chrono::Duration,
    pub future: chrono::Duration,
    /// Reopen the subscription with fresh bounds this often
    pub roll: Duration,
    /// First retry delay after the subscription fails; doubles up to 30s
    pub retry: Duration,
}

impl Default for SyncWindow {
    fn default() -> Self {
        SyncWindow {
            past: chrono::Duration::hours(3),
            future: chrono::Duration::hours(48),
            roll: Duration::from_secs(30 * 60),
            retry: Duration::from_secs(1),
        }
    }
}

impl SyncWindow {
    pub fn bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - self.past, now + self.future)
    }

    pub fn query(&self, now: DateTime<Utc>) -> Query {
        let (start, end) = self.bounds(now);
        Query::collection(SCHEDULE_COLLECTION)
            .where_gte("startTime", decode::timestamp_value(start))
            .where_lte("startTime", decode::timestamp_value(end))
            .order_by("startTime")
    }
}

struct Shared {
    snapshot: watch::Sender<Arc<ScheduleSnapshot>>,
    loading: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn set_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    fn publish(&self, snapshot: ScheduleSnapshot) {
        self.set_error(None);
        self.snapshot.send_replace(Arc::new(snapshot));
        self.loading.store(false, Ordering::Release);
    }

    fn fail(&self, error: &StoreError) {
        self.set_error(Some(error.to_string()));
    }
}

pub struct ScheduleSynchronizer {
    store: Arc<dyn DocumentStore>,
    window: SyncWindow,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleSynchronizer {
    pub fn new(store: Arc<dyn DocumentStore>, window: SyncWindow) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(ScheduleSnapshot::default()));
        ScheduleSynchronizer {
            store,
            window,
            shared: Arc::new(Shared {
                snapshot,
                loading: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Open the subscription in a background task. No-op while running.
    pub fn start(&self) {
        let empty = self.snapshot().is_empty();
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        if empty {
            self.shared.loading.store(true, Ordering::Release);
        }
        info!(
            "Schedule sync starting on {} (window -{}h/+{}h, roll {:?})",
            self.store.name(),
            self.window.past.num_hours(),
            self.window.future.num_hours(),
            self.window.roll
        );
        *task = Some(tokio::spawn(sync_loop(
            Arc::clone(&self.store),
            self.window,
            Arc::clone(&self.shared),
        )));
    }

    /// Cancel the subscription. The last snapshot stays readable.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
            info!("Schedule sync stopped");
        }
        self.shared.loading.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn snapshot(&self) -> Arc<ScheduleSnapshot> {
        Arc::clone(&self.shared.snapshot.borrow())
    }

    /// Receiver notified on every snapshot swap.
    pub fn watch(&self) -> watch::Receiver<Arc<ScheduleSnapshot>> {
        self.shared.snapshot.subscribe()
    }

    /// Most recent delivery error, cleared by the next good delivery.
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.loading.load(Ordering::Acquire)
    }
}

impl Drop for ScheduleSynchronizer {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

async fn sync_loop(store: Arc<dyn DocumentStore>, window: SyncWindow, shared: Arc<Shared>) {
    let mut retry = window.retry;

    loop {
        let now = Utc::now();
        let bounds = window.bounds(now);
        let query = window.query(now);

        let mut subscription = match store.listen(&query).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("[{}] Schedule subscription failed: {}", store.name(), e);
                shared.fail(&e);
                tokio::time::sleep(retry).await;
                retry = (retry * 2).min(MAX_RETRY);
                continue;
            }
        };
        debug!("[{}] Schedule window {} .. {}", store.name(), bounds.0, bounds.1);

        let reopen = tokio::time::sleep(window.roll);
        tokio::pin!(reopen);
        let mut ended = false;

        loop {
            tokio::select! {
                _ = &mut reopen => {
                    debug!("[{}] Rolling schedule window", store.name());
                    break;
                }
                delivery = subscription.next() => match delivery {
                    Some(Ok(docs)) => {
                        retry = window.retry;
                        let snapshot = ScheduleSnapshot::from_documents(&docs, bounds, Utc::now());
                        debug!("[{}] Schedule delivery: {} games", store.name(), snapshot.len());
                        shared.publish(snapshot);
                    }
                    Some(Err(e)) => {
                        warn!("[{}] Schedule delivery error: {}", store.name(), e);
                        shared.fail(&e);
                    }
                    None => {
                        warn!("[{}] Schedule subscription ended", store.name());
                        ended = true;
                        break;
                    }
                }
            }
        }

        subscription.cancel();
        if ended {
            tokio::time::sleep(retry).await;
            retry = (retry * 2).min(MAX_RETRY);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn game_doc(id: &str, game_id: i64, start: DateTime<Utc>) -> Document {
        Document::new(
            id,
            json!({
                "gameId": game_id,
                "startTime": decode::timestamp_value(start),
                "teams": {"homeId": game_id * 10, "awayId": game_id * 10 + 1}
            }),
        )
    }

    fn fast_window() -> SyncWindow {
        SyncWindow {
            retry: Duration::from_millis(10),
            ..SyncWindow::default()
        }
    }

    async fn eventually(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 1s");
    }

    #[test]
    fn test_snapshot_drops_and_dedupes() {
        let now = Utc::now();
        let docs = vec![
            game_doc("a", 1, now),
            Document::new("b", json!({"startTime": decode::timestamp_value(now)})),
            game_doc("c", 2, now),
            game_doc("d", 1, now + chrono::Duration::hours(1)),
        ];
        let snap = ScheduleSnapshot::from_documents(&docs, (now, now), now);
        assert_eq!(snap.game_ids, vec![1, 2]);
        assert_eq!(snap.game(1).unwrap().start_time.unwrap().timestamp(), now.timestamp());
        assert_eq!(snap.matchup(2), Some(Matchup { home_id: 20, away_id: 21 }));
    }

    #[test]
    fn test_window_bounds() {
        let now = Utc::now();
        let (start, end) = SyncWindow::default().bounds(now);
        assert_eq!((now - start).num_seconds(), 10_800);
        assert_eq!((end - now).num_seconds(), 172_800);
    }

    #[tokio::test]
    async fn test_every_delivery_replaces_the_set() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        store.insert(SCHEDULE_COLLECTION, game_doc("a", 1, now + chrono::Duration::hours(2)));
        store.insert(SCHEDULE_COLLECTION, game_doc("b", 2, now + chrono::Duration::hours(1)));
        // outside the window
        store.insert(SCHEDULE_COLLECTION, game_doc("old", 3, now - chrono::Duration::hours(5)));
        store.insert(SCHEDULE_COLLECTION, game_doc("far", 4, now + chrono::Duration::hours(60)));

        let sync = ScheduleSynchronizer::new(store.clone(), fast_window());
        assert!(sync.snapshot().is_empty());
        sync.start();
        assert!(sync.is_loading());

        let mut rx = sync.watch();
        rx.wait_for(|s| s.len() == 2).await.unwrap();
        assert_eq!(sync.snapshot().game_ids, vec![2, 1], "ordered by start time");
        assert!(!sync.is_loading());

        store.remove(SCHEDULE_COLLECTION, "b");
        rx.wait_for(|s| s.game_ids == vec![1]).await.unwrap();
        sync.stop();
    }

    #[tokio::test]
    async fn test_string_start_times_fall_inside_window() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        store.insert(
            SCHEDULE_COLLECTION,
            Document::new(
                "rfc",
                json!({"gameId": 1, "startTime": (now + chrono::Duration::hours(2)).to_rfc3339()}),
            ),
        );
        let naive = (now + chrono::Duration::hours(1)).format("%Y-%m-%d %H:%M:%S").to_string();
        store.insert(
            SCHEDULE_COLLECTION,
            Document::new("naive", json!({"gameId": 2, "startTime": naive})),
        );
        let stale = (now - chrono::Duration::hours(6)).to_rfc3339();
        store.insert(
            SCHEDULE_COLLECTION,
            Document::new("stale", json!({"gameId": 3, "startTime": stale})),
        );

        let sync = ScheduleSynchronizer::new(store.clone(), fast_window());
        sync.start();
        sync.watch().wait_for(|s| s.len() == 2).await.unwrap();
        assert_eq!(sync.snapshot().game_ids, vec![2, 1]);
        sync.stop();
    }

    #[tokio::test]
    async fn test_error_keeps_last_snapshot() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        store.insert(SCHEDULE_COLLECTION, game_doc("a", 1, now));
        let sync = ScheduleSynchronizer::new(store.clone(), fast_window());
        sync.start();
        sync.watch().wait_for(|s| s.len() == 1).await.unwrap();

        store.push_error(SCHEDULE_COLLECTION, "upstream hiccup");
        eventually(|| sync.last_error().is_some()).await;
        assert_eq!(sync.snapshot().len(), 1);
        assert!(sync.is_running());

        store.insert(SCHEDULE_COLLECTION, game_doc("b", 2, now));
        eventually(|| sync.snapshot().len() == 2).await;
        assert!(sync.last_error().is_none());
        sync.stop();
    }

    #[tokio::test]
    async fn test_failed_listen_is_retried() {
        let store = Arc::new(MemoryStore::new());
        store.insert(SCHEDULE_COLLECTION, game_doc("a", 1, Utc::now()));
        store.fail_when(|q| q.collection == SCHEDULE_COLLECTION);

        let sync = ScheduleSynchronizer::new(store.clone(), fast_window());
        sync.start();
        eventually(|| sync.last_error().is_some()).await;
        assert!(sync.is_loading());

        store.clear_failures();
        eventually(|| sync.snapshot().len() == 1).await;
        sync.stop();
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_cancels() {
        let store = Arc::new(MemoryStore::new());
        let sync = ScheduleSynchronizer::new(store.clone(), fast_window());
        sync.start();
        sync.start();
        eventually(|| store.listener_count(SCHEDULE_COLLECTION) == 1).await;

        sync.stop();
        sync.stop();
        eventually(|| store.listener_count(SCHEDULE_COLLECTION) == 0).await;
        assert!(!sync.is_running());
    }

    #[tokio::test]
    async fn test_window_reopens_without_losing_state() {
        let store = Arc::new(MemoryStore::new());
        store.insert(SCHEDULE_COLLECTION, game_doc("a", 1, Utc::now()));
        let sync = ScheduleSynchronizer::new(
            store.clone(),
            SyncWindow {
                roll: Duration::from_millis(20),
                ..fast_window()
            },
        );
        sync.start();
        sync.watch().wait_for(|s| s.len() == 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(sync.snapshot().len(), 1);
        assert_eq!(store.listener_count(SCHEDULE_COLLECTION), 1);
        sync.stop();
    }
}
