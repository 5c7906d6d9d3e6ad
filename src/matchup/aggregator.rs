//! Per-game detail aggregation.
//!
//! `bind(game_id)` answers from the [`MatchCache`] when it can. Otherwise it
//! fans out three independent groups against the document store:
//!
//! ```text
//!            ┌─ detail        games_schedule where gameId == id          (limit 1)
//!  bind() ───┼─ recent form   games_played  where team_id_home == team   (limit 10)
//!            │                games_played  where team_id_away == team   (limit 10)   × 2 teams
//!            └─ head-to-head  games_played  home == a && away == b       (limit 25)
//!                             games_played  home == b && away == a       (limit 25)
//! ```
//!
//! Each group publishes into the handle's state once all of its sub-queries
//! have resolved. A failing sub-query contributes an empty result set to the
//! published state, but that group is left out of the cache so a later bind
//! retries it. The
//! recent-form and head-to-head groups need the team ids: when the schedule
//! snapshot already knows them the three groups start together, otherwise the
//! two history groups wait for the detail.

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::decode;
use crate::matchup::cache::{CacheEntry, MatchCache};
use crate::models::{GameId, HeadToHeadRecord, MatchDetail, Matchup, RecentForm, TeamId};
use crate::schedule::ScheduleSnapshot;
use crate::store::{Document, DocumentStore, Query, StoreError, PLAYED_COLLECTION, SCHEDULE_COLLECTION};

/// Per-direction cap for recent-form queries.
pub const RECENT_QUERY_LIMIT: usize = 10;
/// Per-direction cap for head-to-head queries.
pub const H2H_QUERY_LIMIT: usize = 25;
/// Entries kept in every recent-form and head-to-head list.
pub const HISTORY_LEN: usize = 5;

/// What a bound game knows so far. Each part stays `None` until its group
/// has resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchDetailState {
    pub detail: Option<MatchDetail>,
    /// The detail lookup finished, even if it found nothing
    pub detail_resolved: bool,
    pub recent: Option<RecentForm>,
    pub head_to_head: Option<Vec<HeadToHeadRecord>>,
}

impl MatchDetailState {
    pub fn is_complete(&self) -> bool {
        self.detail_resolved && self.recent.is_some() && self.head_to_head.is_some()
    }
}

/// Live view of one bound game. Dropping the handle tears the binding down.
pub struct MatchDetailHandle {
    game_id: GameId,
    state: watch::Receiver<MatchDetailState>,
    alive: Arc<AtomicBool>,
}

impl MatchDetailHandle {
    pub fn game_id(&self) -> GameId {
        self.game_id
    }

    /// Receiver notified whenever a group publishes.
    pub fn state(&self) -> watch::Receiver<MatchDetailState> {
        self.state.clone()
    }

    pub fn current(&self) -> MatchDetailState {
        self.state.borrow().clone()
    }

    /// Stop accepting results. Fetches already in flight still finish but
    /// their results are discarded.
    pub fn stop(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Wait until every part has resolved or `timeout` passes, then return
    /// whatever is known.
    pub async fn wait_complete(&mut self, timeout: Duration) -> MatchDetailState {
        let _ = tokio::time::timeout(timeout, self.state.wait_for(MatchDetailState::is_complete)).await;
        self.current()
    }
}

impl Drop for MatchDetailHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Write side of a binding. Every commit checks liveness first.
struct Binding {
    game_id: GameId,
    state: watch::Sender<MatchDetailState>,
    alive: Arc<AtomicBool>,
}

impl Binding {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn commit(&self, update: impl FnOnce(&mut MatchDetailState)) -> bool {
        if !self.is_alive() {
            debug!("Game {} binding torn down, discarding result", self.game_id);
            return false;
        }
        self.state.send_modify(update);
        true
    }
}

#[derive(Clone)]
pub struct MatchDetailAggregator {
    store: Arc<dyn DocumentStore>,
    cache: Arc<MatchCache>,
    schedule: Option<watch::Receiver<Arc<ScheduleSnapshot>>>,
}

impl MatchDetailAggregator {
    pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<MatchCache>) -> Self {
        MatchDetailAggregator {
            store,
            cache,
            schedule: None,
        }
    }

    /// Look up team ids in the live schedule so history fetches can start
    /// without waiting for the detail.
    pub fn with_schedule(mut self, schedule: watch::Receiver<Arc<ScheduleSnapshot>>) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn cache(&self) -> &Arc<MatchCache> {
        &self.cache
    }

    fn known_matchup(&self, game_id: GameId) -> Option<Matchup> {
        self.schedule.as_ref()?.borrow().matchup(game_id)
    }

    /// Bind a game. A cache hit fills the state before this returns; missing
    /// parts are fetched in the background.
    pub fn bind(&self, game_id: GameId) -> MatchDetailHandle {
        let (tx, rx) = watch::channel(MatchDetailState::default());
        let alive = Arc::new(AtomicBool::new(true));
        let handle = MatchDetailHandle {
            game_id,
            state: rx,
            alive: Arc::clone(&alive),
        };
        let binding = Binding {
            game_id,
            state: tx,
            alive,
        };

        if let Some(entry) = self.cache.get(game_id) {
            debug!("Cache hit for game {}", game_id);
            binding.commit(|s| {
                s.detail = Some(entry.detail.clone());
                s.detail_resolved = true;
                s.recent = entry.recent.clone();
                s.head_to_head = entry.head_to_head.clone();
            });
            if !entry.is_complete() {
                let this = self.clone();
                tokio::spawn(async move { this.backfill(binding, entry).await });
            }
            return handle;
        }

        let this = self.clone();
        let known = self.known_matchup(game_id);
        tokio::spawn(async move { this.aggregate(binding, known).await });
        handle
    }

    async fn aggregate(self, binding: Binding, known: Option<Matchup>) {
        let (detail, recent, head_to_head) = match known {
            Some(matchup) => {
                tokio::join!(
                    self.detail_group(&binding),
                    self.recent_group(&binding, Some(matchup)),
                    self.head_to_head_group(&binding, Some(matchup))
                )
            }
            None => {
                let detail = self.detail_group(&binding).await;
                let matchup = detail.as_ref().and_then(MatchDetail::matchup);
                let (recent, head_to_head) = tokio::join!(
                    self.recent_group(&binding, matchup),
                    self.head_to_head_group(&binding, matchup)
                );
                (detail, recent, head_to_head)
            }
        };

        if !binding.is_alive() {
            return;
        }
        if let Some(detail) = detail {
            self.cache.insert(CacheEntry {
                detail,
                recent,
                head_to_head,
            });
        }
    }

    async fn backfill(self, binding: Binding, entry: Arc<CacheEntry>) {
        let game_id = entry.detail.game_id;
        let matchup = entry.detail.matchup();
        let recent = async {
            match entry.recent {
                Some(_) => None,
                None => Some(self.recent_group(&binding, matchup).await),
            }
        };
        let head_to_head = async {
            match entry.head_to_head {
                Some(_) => None,
                None => Some(self.head_to_head_group(&binding, matchup).await),
            }
        };
        let (recent, head_to_head) = tokio::join!(recent, head_to_head);

        if !binding.is_alive() {
            return;
        }
        if let Some(recent) = recent.flatten() {
            self.cache.store_recent(game_id, recent);
        }
        if let Some(head_to_head) = head_to_head.flatten() {
            self.cache.store_head_to_head(game_id, head_to_head);
        }
    }

    async fn detail_group(&self, binding: &Binding) -> Option<MatchDetail> {
        let detail = match self.fetch_detail(binding.game_id).await {
            Ok(detail) => detail,
            Err(e) => {
                warn!("[{}] Detail fetch for game {} failed: {}", self.store.name(), binding.game_id, e);
                None
            }
        };
        binding.commit(|s| {
            s.detail = detail.clone();
            s.detail_resolved = true;
        });
        detail
    }

    /// Publishes the merged form and returns it for caching only when every
    /// sub-query succeeded.
    async fn recent_group(&self, binding: &Binding, matchup: Option<Matchup>) -> Option<RecentForm> {
        let (recent, complete) = match matchup {
            Some(m) => {
                let ((home, home_ok), (away, away_ok)) =
                    tokio::join!(self.recent_form_of(m.home_id), self.recent_form_of(m.away_id));
                (RecentForm { home, away }, home_ok && away_ok)
            }
            None => (RecentForm::default(), true),
        };
        binding.commit(|s| s.recent = Some(recent.clone()));
        complete.then_some(recent)
    }

    async fn head_to_head_group(
        &self,
        binding: &Binding,
        matchup: Option<Matchup>,
    ) -> Option<Vec<HeadToHeadRecord>> {
        let (history, complete) = match matchup {
            Some(m) => self.head_to_head_of(m.home_id, m.away_id).await,
            None => (Vec::new(), true),
        };
        binding.commit(|s| s.head_to_head = Some(history.clone()));
        complete.then_some(history)
    }

    /// The schedule document for a game id, or `None` when there is none.
    pub async fn fetch_detail(&self, game_id: GameId) -> Result<Option<MatchDetail>, StoreError> {
        let query = Query::collection(SCHEDULE_COLLECTION)
            .where_eq("gameId", game_id.into())
            .limit(1);
        let docs = self.store.get_documents(&query).await?;
        Ok(docs.iter().find_map(decode::match_detail))
    }

    /// Last results of one team, most recent first.
    pub async fn fetch_recent_form(&self, team_id: TeamId) -> Vec<bool> {
        self.recent_form_of(team_id).await.0
    }

    /// Last meetings between two teams in either direction, most recent first.
    pub async fn fetch_head_to_head(&self, a: TeamId, b: TeamId) -> Vec<HeadToHeadRecord> {
        self.head_to_head_of(a, b).await.0
    }

    async fn recent_form_of(&self, team_id: TeamId) -> (Vec<bool>, bool) {
        let queries = ["team_id_home", "team_id_away"].map(|side| {
            Query::collection(PLAYED_COLLECTION)
                .where_eq(side, team_id.into())
                .order_by_desc("game_date")
                .limit(RECENT_QUERY_LIMIT)
        });
        let (docs, complete) = self.query_all(&queries).await;
        (recent_form_from(team_id, &docs), complete)
    }

    async fn head_to_head_of(&self, a: TeamId, b: TeamId) -> (Vec<HeadToHeadRecord>, bool) {
        let queries = [(a, b), (b, a)].map(|(home, away)| {
            Query::collection(PLAYED_COLLECTION)
                .where_eq("team_id_home", home.into())
                .where_eq("team_id_away", away.into())
                .order_by_desc("game_date")
                .limit(H2H_QUERY_LIMIT)
        });
        let (docs, complete) = self.query_all(&queries).await;
        (head_to_head_from(&docs), complete)
    }

    /// Union of every query's results, and whether all of them succeeded.
    /// A failed query contributes nothing.
    async fn query_all(&self, queries: &[Query]) -> (Vec<Document>, bool) {
        let results = join_all(queries.iter().map(|q| self.store.get_documents(q))).await;
        let mut docs = Vec::new();
        let mut complete = true;
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(found) => docs.extend(found),
                Err(e) => {
                    warn!(
                        "[{}] Query on '{}' failed, treating as empty: {}",
                        self.store.name(),
                        query.collection,
                        e
                    );
                    complete = false;
                }
            }
        }
        (docs, complete)
    }
}

/// Outcomes of the team's five most recent dated games across both sources.
pub fn recent_form_from<'a>(
    team_id: TeamId,
    docs: impl IntoIterator<Item = &'a Document>,
) -> Vec<bool> {
    let mut seen = HashSet::new();
    let mut games: Vec<_> = docs
        .into_iter()
        .filter_map(decode::played_game)
        .filter(|g| g.home_id == team_id || g.away_id == team_id)
        .filter(|g| g.played_at.is_some())
        .filter(|g| seen.insert(g.id.clone()))
        .collect();
    games.sort_by(|a, b| b.played_at.cmp(&a.played_at));
    games
        .iter()
        .take(HISTORY_LEN)
        .map(|g| g.won_by(team_id))
        .collect()
}

/// Union of both directions, deduplicated by document id, newest first with
/// undated meetings last.
pub fn head_to_head_from<'a>(docs: impl IntoIterator<Item = &'a Document>) -> Vec<HeadToHeadRecord> {
    let mut seen = HashSet::new();
    let mut records: Vec<HeadToHeadRecord> = docs
        .into_iter()
        .filter_map(decode::head_to_head)
        .filter(|r| seen.insert(r.id.clone()))
        .collect();
    records.sort_by(|a, b| match (a.start_time, b.start_time) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    records.truncate(HISTORY_LEN);
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    const HOME: TeamId = 1610612738;
    const AWAY: TeamId = 1610612752;
    const OTHER: TeamId = 1610612747;

    fn played(id: &str, home: TeamId, away: TeamId, pts: (i64, i64), day: u32) -> Document {
        Document::new(
            id,
            json!({
                "team_id_home": home,
                "team_id_away": away,
                "pts_home": pts.0,
                "pts_away": pts.1,
                "game_date": format!("2025-01-{:02} 19:30:00", day),
            }),
        )
    }

    fn seeded() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.insert(
            SCHEDULE_COLLECTION,
            Document::new(
                "sched-1",
                json!({
                    "gameId": 1,
                    "teams": {"homeId": HOME, "awayId": AWAY},
                    "venue": "TD Garden",
                    "predictions": {"winProbability": {"home": 0.642, "away": 0.358}}
                }),
            ),
        );
        // HOME: W(2) L(3) W(4) W(5) L(6) W(7) L(8) across both sides
        let games = [
            played("p2", HOME, OTHER, (110, 100), 2),
            played("p3", OTHER, HOME, (101, 99), 3),
            played("p4", HOME, AWAY, (120, 90), 4),
            played("p5", AWAY, HOME, (88, 97), 5),
            played("p6", HOME, OTHER, (100, 100), 6),
            played("p7", OTHER, HOME, (95, 105), 7),
            played("p8", HOME, AWAY, (90, 91), 8),
        ];
        for doc in games {
            store.insert(PLAYED_COLLECTION, doc);
        }
        Arc::new(store)
    }

    fn aggregator(store: &Arc<MemoryStore>) -> MatchDetailAggregator {
        MatchDetailAggregator::new(store.clone(), Arc::new(MatchCache::new()))
    }

    #[tokio::test]
    async fn test_bind_aggregates_all_groups() {
        let store = seeded();
        let agg = aggregator(&store);
        let mut handle = agg.bind(1);
        let state = handle.wait_complete(Duration::from_secs(1)).await;

        let detail = state.detail.unwrap();
        assert_eq!(detail.venue.as_deref(), Some("TD Garden"));
        assert_eq!(detail.predictions.home_win_text(), "64%");

        let recent = state.recent.unwrap();
        // newest first: p8 L, p7 W, p6 draw = L, p5 W, p4 W
        assert_eq!(recent.home, vec![false, true, false, true, true]);
        // AWAY: p8 W, p5 L, p4 L
        assert_eq!(recent.away, vec![true, false, false]);

        let h2h: Vec<_> = state.head_to_head.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(h2h, vec!["p8", "p5", "p4"]);

        let cached = agg.cache().get(1).unwrap();
        assert!(cached.is_complete());
    }

    #[tokio::test]
    async fn test_cache_hit_issues_no_queries() {
        let store = seeded();
        let agg = aggregator(&store);
        agg.bind(1).wait_complete(Duration::from_secs(1)).await;
        let before = store.total_queries();

        let handle = agg.bind(1);
        let state = handle.current();
        assert!(state.is_complete(), "cache hit fills the state synchronously");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.total_queries(), before);
    }

    #[tokio::test]
    async fn test_cache_hit_backfills_missing_history() {
        let store = seeded();
        let agg = aggregator(&store);
        let detail = agg.fetch_detail(1).await.unwrap().unwrap();
        agg.cache().store_detail(detail);

        let mut handle = agg.bind(1);
        assert!(handle.current().detail.is_some());
        assert!(handle.current().recent.is_none());
        let state = handle.wait_complete(Duration::from_secs(1)).await;
        assert_eq!(state.recent.unwrap().home.len(), HISTORY_LEN);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(agg.cache().get(1).unwrap().is_complete());
        assert_eq!(store.query_count(SCHEDULE_COLLECTION), 1, "detail is not refetched");
    }

    #[tokio::test]
    async fn test_failing_subquery_contributes_empty() {
        let store = seeded();
        // away-side recent-form queries fail; head-to-head queries filter on
        // team_id_home first and still succeed
        store.fail_when(|q| {
            q.collection == PLAYED_COLLECTION
                && q.filters.len() == 1
                && q.filters[0].field == "team_id_away"
        });
        let agg = aggregator(&store);
        let state = agg.bind(1).wait_complete(Duration::from_secs(1)).await;

        // HOME only from home-side games: p8 L, p6 L, p4 W, p2 W
        assert_eq!(state.recent.as_ref().unwrap().home, vec![false, false, true, true]);
        // AWAY only from its home-side game p5
        assert_eq!(state.recent.as_ref().unwrap().away, vec![false]);
        assert_eq!(state.head_to_head.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_known_matchup_survives_failed_detail() {
        let store = seeded();
        store.fail_when(|q| q.collection == SCHEDULE_COLLECTION);
        let mut snapshot = ScheduleSnapshot::default();
        let game = crate::models::Game {
            id: 1,
            start_time: None,
            teams: Some(Matchup {
                home_id: HOME,
                away_id: AWAY,
            }),
            venue: None,
            predictions: None,
        };
        snapshot.game_ids.push(1);
        snapshot.games.insert(1, game);
        let (_tx, rx) = watch::channel(Arc::new(snapshot));

        let agg = aggregator(&store).with_schedule(rx);
        let state = agg.bind(1).wait_complete(Duration::from_secs(1)).await;
        assert!(state.detail_resolved);
        assert!(state.detail.is_none());
        assert_eq!(state.recent.unwrap().home.len(), HISTORY_LEN);
        assert_eq!(state.head_to_head.unwrap().len(), 3);
        assert!(agg.cache().is_empty(), "nothing cached without a detail");
    }

    #[tokio::test]
    async fn test_failed_history_is_not_cached() {
        let store = seeded();
        store.fail_when(|q| q.collection == PLAYED_COLLECTION);
        let agg = aggregator(&store);

        let state = agg.bind(1).wait_complete(Duration::from_secs(1)).await;
        assert_eq!(state.recent, Some(RecentForm::default()));
        assert_eq!(state.head_to_head, Some(vec![]));
        let cached = agg.cache().get(1).unwrap();
        assert!(cached.recent.is_none());
        assert!(cached.head_to_head.is_none());

        store.clear_failures();
        let mut handle = agg.bind(1);
        let state = handle.wait_complete(Duration::from_secs(1)).await;
        assert_eq!(state.recent.unwrap().home, vec![false, true, false, true, true]);
        assert_eq!(state.head_to_head.unwrap().len(), 3);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(agg.cache().get(1).unwrap().is_complete());
        assert_eq!(store.query_count(SCHEDULE_COLLECTION), 1, "detail came from the cache");
    }

    #[tokio::test]
    async fn test_recent_form_orders_mixed_date_encodings() {
        let store = Arc::new(MemoryStore::new());
        // eleven older losses as strings crowd the per-query limit unless the
        // newer object-encoded win sorts ahead of them
        for day in 1..=11u32 {
            store.insert(PLAYED_COLLECTION, played(&format!("old{}", day), HOME, OTHER, (90, 100), day));
        }
        let newest = chrono::NaiveDate::from_ymd_opt(2025, 2, 1)
            .and_then(|d| d.and_hms_opt(19, 30, 0))
            .unwrap()
            .and_utc();
        store.insert(
            PLAYED_COLLECTION,
            Document::new(
                "new",
                json!({
                    "team_id_home": HOME,
                    "team_id_away": OTHER,
                    "pts_home": 110,
                    "pts_away": 100,
                    "game_date": decode::timestamp_value(newest),
                }),
            ),
        );
        let agg = aggregator(&store);
        let form = agg.fetch_recent_form(HOME).await;
        assert_eq!(form, vec![true, false, false, false, false]);
    }

    #[tokio::test]
    async fn test_unknown_game_resolves_empty() {
        let store = seeded();
        let agg = aggregator(&store);
        let state = agg.bind(999).wait_complete(Duration::from_secs(1)).await;
        assert!(state.is_complete());
        assert!(state.detail.is_none());
        assert_eq!(state.recent, Some(RecentForm::default()));
        assert_eq!(state.head_to_head, Some(vec![]));
        assert_eq!(store.query_count(PLAYED_COLLECTION), 0);
    }

    #[tokio::test]
    async fn test_torn_down_binding_is_ignored() {
        let store = seeded();
        store.set_latency(Duration::from_millis(30));
        let agg = aggregator(&store);

        let handle = agg.bind(1);
        let rx = handle.state();
        handle.stop();
        assert!(!handle.is_active());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*rx.borrow(), MatchDetailState::default());
        assert!(agg.cache().is_empty());
        assert!(store.total_queries() > 0, "fetches still ran to completion");
    }

    #[test]
    fn test_head_to_head_dedupes_and_sorts() {
        let mut undated = played("x", HOME, AWAY, (1, 2), 1);
        undated.fields.remove("game_date");
        let docs = vec![
            played("a", HOME, AWAY, (100, 90), 3),
            undated,
            played("b", AWAY, HOME, (100, 90), 9),
            played("a", HOME, AWAY, (100, 90), 3),
            played("c", HOME, AWAY, (100, 90), 5),
            played("d", AWAY, HOME, (100, 90), 1),
            played("e", HOME, AWAY, (100, 90), 7),
            played("f", AWAY, HOME, (100, 90), 2),
        ];
        let ids: Vec<_> = head_to_head_from(&docs).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "e", "c", "a", "f"]);
    }

    #[test]
    fn test_recent_form_drops_undated_and_caps() {
        let mut undated = played("u", HOME, OTHER, (120, 80), 30);
        undated.fields.remove("game_date");
        let mut docs = vec![undated];
        for day in 1..=8 {
            docs.push(played(&format!("g{}", day), HOME, OTHER, (100 + day as i64, 100), day));
        }
        let form = recent_form_from(HOME, &docs);
        assert_eq!(form, vec![true; HISTORY_LEN]);

        // the flag wins over points
        let mut flagged = played("w", HOME, OTHER, (80, 120), 9);
        flagged.fields.insert("wl_home".into(), json!("W"));
        assert_eq!(recent_form_from(HOME, &[flagged]), vec![true]);
    }
}
