//! In-memory match cache for instant detail lookups.
//!
//! Once a game's detail has been aggregated it is kept here for the rest of
//! the process, so revisiting the same game answers synchronously without a
//! single store query. There is no eviction: a session only ever looks at a
//! bounded number of games.
//!
//! Entries are immutable `Arc<CacheEntry>` snapshots. A write builds a new
//! entry and swaps it in under a short lock, so a reader holding an entry never
//! observes a half-updated one.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::models::{GameId, HeadToHeadRecord, MatchDetail, RecentForm};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub detail: MatchDetail,
    /// Present once the recent-form group has resolved
    pub recent: Option<RecentForm>,
    /// Present once the head-to-head group has resolved
    pub head_to_head: Option<Vec<HeadToHeadRecord>>,
}

impl CacheEntry {
    pub fn new(detail: MatchDetail) -> Self {
        CacheEntry {
            detail,
            recent: None,
            head_to_head: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.recent.is_some() && self.head_to_head.is_some()
    }
}

/// Thread-safe match cache keyed by game id.
#[derive(Default)]
pub struct MatchCache {
    entries: RwLock<HashMap<GameId, Arc<CacheEntry>>>,
}

impl MatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, game_id: GameId) -> Option<Arc<CacheEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&game_id)
            .cloned()
    }

    /// Replace the whole entry for its game id.
    pub fn insert(&self, entry: CacheEntry) {
        let game_id = entry.detail.game_id;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(game_id, Arc::new(entry));
    }

    /// Store a freshly fetched detail, keeping whatever recent form and
    /// head-to-head were already cached for that game.
    pub fn store_detail(&self, detail: MatchDetail) {
        self.update(detail.game_id, |existing| match existing {
            Some(prev) => Some(CacheEntry {
                detail,
                recent: prev.recent.clone(),
                head_to_head: prev.head_to_head.clone(),
            }),
            None => Some(CacheEntry::new(detail)),
        });
    }

    /// Attach recent form to a cached detail. No-op when the detail is not cached.
    pub fn store_recent(&self, game_id: GameId, recent: RecentForm) {
        self.update(game_id, |existing| {
            existing.map(|prev| CacheEntry {
                recent: Some(recent),
                ..prev.clone()
            })
        });
    }

    /// Attach head-to-head history to a cached detail. No-op when the detail is
    /// not cached.
    pub fn store_head_to_head(&self, game_id: GameId, history: Vec<HeadToHeadRecord>) {
        self.update(game_id, |existing| {
            existing.map(|prev| CacheEntry {
                head_to_head: Some(history),
                ..prev.clone()
            })
        });
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("MatchCache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, game_id: GameId, f: impl FnOnce(Option<&CacheEntry>) -> Option<CacheEntry>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = f(entries.get(&game_id).map(Arc::as_ref)) {
            entries.insert(game_id, Arc::new(next));
        }
    }
}
