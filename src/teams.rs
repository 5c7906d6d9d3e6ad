//! Team metadata directory.
//!
//! Loaded once from the `teams` collection and kept for the process lifetime.
//! Concurrent `load_if_needed()` calls share one fetch: the first caller flips
//! the phase from `Idle` to `Loading` and everyone else sees the load in
//! flight. Lookups are pure reads of the current map snapshot.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::decode;
use crate::models::{TeamId, TeamMeta};
use crate::store::{DocumentStore, Query, TEAMS_COLLECTION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Idle,
    Loading,
    Loaded,
}

/// Outcome of one `load_if_needed()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    AlreadyLoaded,
    /// Another caller is fetching; await [`TeamDirectory::wait_loaded`] for it.
    InFlight,
    Loaded(usize),
    Failed,
}

pub struct TeamDirectory {
    store: Arc<dyn DocumentStore>,
    teams: RwLock<Arc<HashMap<TeamId, TeamMeta>>>,
    phase: watch::Sender<LoadPhase>,
}

/// Puts the phase back to `Idle` if a load ends without committing, including
/// when the loading future is dropped mid-fetch.
struct LoadingGuard<'a> {
    phase: &'a watch::Sender<LoadPhase>,
    committed: bool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.phase.send_replace(LoadPhase::Idle);
        }
    }
}

impl TeamDirectory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        let (phase, _) = watch::channel(LoadPhase::Idle);
        TeamDirectory {
            store,
            teams: RwLock::new(Arc::new(HashMap::new())),
            phase,
        }
    }

    /// Fetch the team collection unless it is loaded or already being loaded.
    pub async fn load_if_needed(&self) -> LoadStatus {
        let mut previous = LoadPhase::Idle;
        let claimed = self.phase.send_if_modified(|phase| {
            previous = *phase;
            if *phase == LoadPhase::Idle {
                *phase = LoadPhase::Loading;
                true
            } else {
                false
            }
        });
        if !claimed {
            return match previous {
                LoadPhase::Loaded => LoadStatus::AlreadyLoaded,
                _ => LoadStatus::InFlight,
            };
        }

        let mut guard = LoadingGuard {
            phase: &self.phase,
            committed: false,
        };

        let query = Query::collection(TEAMS_COLLECTION);
        let docs = match self.store.get_documents(&query).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!("[{}] Team directory load failed: {}", self.store.name(), e);
                return LoadStatus::Failed;
            }
        };

        let mut map = HashMap::with_capacity(docs.len());
        for doc in &docs {
            match decode::team(doc) {
                Some(team) => {
                    map.insert(team.id, team);
                }
                None => debug!("Skipping malformed team document '{}'", doc.id),
            }
        }
        let count = map.len();

        *self.teams.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
        guard.committed = true;
        self.phase.send_replace(LoadPhase::Loaded);
        info!("Team directory loaded: {} teams", count);
        LoadStatus::Loaded(count)
    }

    /// Wait for an in-flight load to settle. Returns whether the directory is
    /// loaded afterwards.
    pub async fn wait_loaded(&self) -> bool {
        let mut rx = self.phase.subscribe();
        let loaded = match rx.wait_for(|phase| *phase != LoadPhase::Loading).await {
            Ok(phase) => *phase == LoadPhase::Loaded,
            Err(_) => false,
        };
        loaded
    }

    /// Forget the loaded state so the next `load_if_needed()` refetches. The
    /// current map stays readable until the new one replaces it. Has no effect
    /// while a load is in flight.
    pub fn invalidate(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == LoadPhase::Loaded {
                *phase = LoadPhase::Idle;
                true
            } else {
                false
            }
        });
    }

    pub fn phase(&self) -> LoadPhase {
        *self.phase.borrow()
    }

    pub fn is_loaded(&self) -> bool {
        self.phase() == LoadPhase::Loaded
    }

    /// The whole map as one immutable snapshot.
    pub fn snapshot(&self) -> Arc<HashMap<TeamId, TeamMeta>> {
        Arc::clone(&self.teams.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn team(&self, id: TeamId) -> Option<TeamMeta> {
        self.snapshot().get(&id).cloned()
    }

    /// All teams ordered by id.
    pub fn all(&self) -> Vec<TeamMeta> {
        let mut teams: Vec<TeamMeta> = self.snapshot().values().cloned().collect();
        teams.sort_by_key(|t| t.id);
        teams
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self, id: TeamId) -> Option<String> {
        self.lookup(id, |t| Some(t.name.clone()))
    }

    pub fn code(&self, id: TeamId) -> Option<String> {
        self.lookup(id, |t| Some(t.code.clone()))
    }

    pub fn abbreviation(&self, id: TeamId) -> Option<String> {
        self.lookup(id, |t| Some(t.abbreviation.clone()))
    }

    pub fn arena(&self, id: TeamId) -> Option<String> {
        self.lookup(id, |t| t.arena.clone())
    }

    pub fn city(&self, id: TeamId) -> Option<String> {
        self.lookup(id, |t| t.city.clone())
    }

    /// `None` when the team is unknown.
    pub fn is_league_member(&self, id: TeamId) -> Option<bool> {
        self.lookup(id, |t| Some(t.league_member))
    }

    fn lookup<T>(&self, id: TeamId, f: impl FnOnce(&TeamMeta) -> Option<T>) -> Option<T> {
        let teams = self.teams.read().unwrap_or_else(PoisonError::into_inner);
        teams.get(&id).and_then(f)
    }
}
