use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::matchup::predictions::PredictionSet;

pub type GameId = i64;
pub type TeamId = i64;

/// Home and away team ids of one game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Matchup {
    pub home_id: TeamId,
    pub away_id: TeamId,
}

impl Matchup {
    pub fn ids(&self) -> [TeamId; 2] {
        [self.home_id, self.away_id]
    }
}

/// A scheduled game, normalized from a `games_schedule` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: GameId,
    pub start_time: Option<DateTime<Utc>>,
    /// `None` when the document carried neither the nested nor the flat ids
    pub teams: Option<Matchup>,
    pub venue: Option<String>,
    pub predictions: Option<PredictionSet>,
}

/// Team metadata. Loaded once by the team directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMeta {
    pub id: TeamId,
    pub name: String,
    /// Short code, e.g. "BOS". Empty when the store has none.
    pub code: String,
    pub abbreviation: String,
    pub primary_color: Option<String>,
    pub secondary_color: Option<String>,
    /// Member of the primary league (stored as `nba_team`)
    pub league_member: bool,
    pub city: Option<String>,
    pub arena: Option<String>,
    pub country: Option<String>,
    pub logo: Option<String>,
}

/// Consolidated detail for one scheduled game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDetail {
    /// Store document id
    pub doc_id: String,
    pub game_id: GameId,
    pub home_id: Option<TeamId>,
    pub away_id: Option<TeamId>,
    pub start_time: Option<DateTime<Utc>>,
    pub venue: Option<String>,
    pub predictions: PredictionSet,
}

impl MatchDetail {
    pub fn matchup(&self) -> Option<Matchup> {
        Some(Matchup {
            home_id: self.home_id?,
            away_id: self.away_id?,
        })
    }
}

/// A finished game from `games_played`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayedGame {
    pub id: String,
    pub home_id: TeamId,
    pub away_id: TeamId,
    pub home_points: Option<i64>,
    pub away_points: Option<i64>,
    /// Explicit `wl_home` flag, when present
    pub home_won: Option<bool>,
    pub away_won: Option<bool>,
    pub played_at: Option<DateTime<Utc>>,
    pub venue: Option<String>,
}

impl PlayedGame {
    /// Whether `team_id` won this game.
    ///
    /// The explicit W/L flag for the team's side wins. Without it, points
    /// decide: the side with strictly more points won. Equal or missing points
    /// count as a loss for both sides.
    pub fn won_by(&self, team_id: TeamId) -> bool {
        let is_home = self.home_id == team_id;
        let flag = if is_home { self.home_won } else { self.away_won };
        if let Some(won) = flag {
            return won;
        }
        let home = self.home_points.unwrap_or(0);
        let away = self.away_points.unwrap_or(0);
        if is_home {
            home > away
        } else {
            away > home
        }
    }
}

/// One past meeting between two teams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadToHeadRecord {
    pub id: String,
    pub home_id: TeamId,
    pub away_id: TeamId,
    pub home_score: Option<i64>,
    pub away_score: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub venue: Option<String>,
}

impl From<PlayedGame> for HeadToHeadRecord {
    fn from(game: PlayedGame) -> Self {
        HeadToHeadRecord {
            id: game.id,
            home_id: game.home_id,
            away_id: game.away_id,
            home_score: game.home_points,
            away_score: game.away_points,
            start_time: game.played_at,
            venue: game.venue,
        }
    }
}

/// Last-five results for both sides of a game, most recent first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentForm {
    pub home: Vec<bool>,
    pub away: Vec<bool>,
}
