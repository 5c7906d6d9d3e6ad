//! Greedy feed selection: one representative game per team.
//!
//! Walks candidates in ascending start order and keeps a game only when it
//! brings at least one not-yet-covered team of the target universe. The result
//! is the earliest game for every team, with no game that adds nothing.
//! Games that started more than 2.5h ago are dropped before selection.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::models::{GameId, TeamId};
use crate::schedule::ScheduleSnapshot;

/// How long after its start a game is still eligible.
pub fn cutoff() -> chrono::Duration {
    chrono::Duration::minutes(150)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub game_id: GameId,
    pub start: DateTime<Utc>,
    pub home_id: TeamId,
    pub away_id: TeamId,
}

impl Candidate {
    pub fn involves(&self, team_id: TeamId) -> bool {
        self.home_id == team_id || self.away_id == team_id
    }

    /// Still eligible at `now`: `now <= start + 2.5h`.
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        now <= self.start + cutoff()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetUniverse {
    AllTeams,
    Favorites(HashSet<TeamId>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeagueFilter {
    /// Both teams belong to the primary league
    Member,
    /// Neither team does
    NonMember,
    #[default]
    Any,
}

impl LeagueFilter {
    /// `home`/`away` are the membership flags; `None` for an unknown team.
    pub fn admits(&self, home: Option<bool>, away: Option<bool>) -> bool {
        match self {
            LeagueFilter::Member => home == Some(true) && away == Some(true),
            LeagueFilter::NonMember => home == Some(false) && away == Some(false),
            LeagueFilter::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayGroup {
    pub date: NaiveDate,
    pub games: Vec<Candidate>,
}

/// Candidates from a schedule snapshot, stably sorted by start. Games with an
/// unknown start or unknown teams are skipped.
pub fn candidates_from_snapshot(snapshot: &ScheduleSnapshot) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = snapshot
        .games_in_order()
        .into_iter()
        .filter_map(|game| {
            let teams = game.teams?;
            Some(Candidate {
                game_id: game.id,
                start: game.start_time?,
                home_id: teams.home_id,
                away_id: teams.away_id,
            })
        })
        .collect();
    candidates.sort_by_key(|c| c.start);
    candidates
}

/// Greedy minimal cover. `candidates` must be sorted ascending by start.
pub fn select(
    candidates: &[Candidate],
    universe: &TargetUniverse,
    now: DateTime<Utc>,
) -> Vec<Candidate> {
    let current: Vec<&Candidate> = candidates.iter().filter(|c| c.is_current(now)).collect();

    let targets: HashSet<TeamId> = {
        let present = current.iter().flat_map(|c| [c.home_id, c.away_id]);
        match universe {
            TargetUniverse::AllTeams => present.collect(),
            TargetUniverse::Favorites(favorites) => {
                present.filter(|id| favorites.contains(id)).collect()
            }
        }
    };

    let mut covered: HashSet<TeamId> = HashSet::with_capacity(targets.len());
    let mut picked = Vec::new();
    for candidate in current {
        if covered.len() == targets.len() {
            break;
        }
        let introduced: Vec<TeamId> = [candidate.home_id, candidate.away_id]
            .into_iter()
            .filter(|id| targets.contains(id) && !covered.contains(id))
            .collect();
        if !introduced.is_empty() {
            covered.extend(introduced);
            picked.push(*candidate);
        }
    }
    picked
}

/// Bucket games by calendar day in `tz`. Days ascend, and games within a day
/// ascend by start.
pub fn group_by_day<Tz: TimeZone>(games: &[Candidate], tz: &Tz) -> Vec<DayGroup> {
    let mut days: BTreeMap<NaiveDate, Vec<Candidate>> = BTreeMap::new();
    for game in games {
        let date = game.start.with_timezone(tz).date_naive();
        days.entry(date).or_default().push(*game);
    }
    days.into_iter()
        .map(|(date, mut games)| {
            games.sort_by_key(|g| g.start);
            DayGroup { date, games }
        })
        .collect()
}

/// Full feed pipeline: league filter, favorites pre-filter, greedy selection,
/// day grouping. `membership` answers the league flag of a team id.
pub fn build_feed<Tz: TimeZone>(
    snapshot: &ScheduleSnapshot,
    universe: &TargetUniverse,
    league: LeagueFilter,
    membership: impl Fn(TeamId) -> Option<bool>,
    now: DateTime<Utc>,
    tz: &Tz,
) -> Vec<DayGroup> {
    let candidates: Vec<Candidate> = candidates_from_snapshot(snapshot)
        .into_iter()
        .filter(|c| league.admits(membership(c.home_id), membership(c.away_id)))
        .filter(|c| match universe {
            TargetUniverse::AllTeams => true,
            TargetUniverse::Favorites(favorites) => {
                favorites.iter().any(|id| c.involves(*id))
            }
        })
        .collect();
    group_by_day(&select(&candidates, universe, now), tz)
}
