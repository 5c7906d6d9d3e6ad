//! Tolerant decoding and rendering of the optional `predictions` payload.
//!
//! ```text
//! predictions: {
//!   winProbability:      { home: 0.642, away: 0.358 },
//!   expectedMargin:      { teamId: 1610612738, value: 4.5 },
//!   pointsRange:         { home: { min: 104, max: 118 }, away: { min: 98, max: 111 } },
//!   overtimeProbability: 6.5
//! }
//! ```
//!
//! Every field is independently optional. A mistyped or missing branch leaves
//! only that branch unknown; it never fails the whole payload. Absent values
//! render as a placeholder, never as zero.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decode;
use crate::models::TeamId;

/// Placeholder for an unknown win probability.
pub const MISSING_PERCENT: &str = "-";
/// Placeholder for the other unknown values.
pub const MISSING_VALUE: &str = "–";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WinProbability {
    pub home: Option<f64>,
    pub away: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectedMargin {
    /// Team expected to win by `value` points
    pub team_id: Option<TeamId>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRange {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsRange {
    pub home: ScoreRange,
    pub away: ScoreRange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionSet {
    pub win_probability: WinProbability,
    pub expected_margin: ExpectedMargin,
    pub points_range: PointsRange,
    /// Already a percentage (6.5 means 6.5%)
    pub overtime_probability: Option<f64>,
}

impl PredictionSet {
    /// Decode the payload. Returns `None` only when it is absent or not an
    /// object; otherwise every branch is decoded on its own.
    pub fn parse(value: Option<&Value>) -> Option<Self> {
        let obj = value?.as_object()?;

        let win_probability = obj
            .get("winProbability")
            .and_then(Value::as_object)
            .map(|win| WinProbability {
                home: decode::float(win.get("home")),
                away: decode::float(win.get("away")),
            })
            .unwrap_or_default();

        let expected_margin = obj
            .get("expectedMargin")
            .and_then(Value::as_object)
            .map(|em| ExpectedMargin {
                team_id: decode::int(em.get("teamId")),
                value: decode::float(em.get("value")),
            })
            .unwrap_or_default();

        // Both sides must be objects, otherwise the whole range is unknown
        let points_range = obj
            .get("pointsRange")
            .and_then(Value::as_object)
            .and_then(|pr| {
                let home = pr.get("home")?.as_object()?;
                let away = pr.get("away")?.as_object()?;
                Some(PointsRange {
                    home: ScoreRange {
                        min: decode::int(home.get("min")),
                        max: decode::int(home.get("max")),
                    },
                    away: ScoreRange {
                        min: decode::int(away.get("min")),
                        max: decode::int(away.get("max")),
                    },
                })
            })
            .unwrap_or_default();

        Some(PredictionSet {
            win_probability,
            expected_margin,
            points_range,
            overtime_probability: decode::float(obj.get("overtimeProbability")),
        })
    }

    pub fn is_empty(&self) -> bool {
        *self == PredictionSet::default()
    }

    pub fn home_win_text(&self) -> String {
        percent_text(self.win_probability.home)
    }

    pub fn away_win_text(&self) -> String {
        percent_text(self.win_probability.away)
    }

    pub fn home_range_text(&self) -> String {
        range_text(&self.points_range.home)
    }

    pub fn away_range_text(&self) -> String {
        range_text(&self.points_range.away)
    }

    pub fn overtime_text(&self) -> String {
        match self.overtime_probability {
            Some(p) => format!("{:.1}%", p),
            None => MISSING_VALUE.to_string(),
        }
    }

    /// `"+4.5 Celtics"`. The team name comes from `team_name`; unknown teams
    /// are rendered as "Team".
    pub fn expected_margin_text(&self, team_name: impl Fn(TeamId) -> Option<String>) -> String {
        let (Some(value), Some(team_id)) = (self.expected_margin.value, self.expected_margin.team_id)
        else {
            return MISSING_VALUE.to_string();
        };
        let name = team_name(team_id).unwrap_or_else(|| "Team".to_string());
        let sign = if value >= 0.0 { "+" } else { "" };
        format!("{}{:.1} {}", sign, value, name)
    }

    /// All rendered strings at once, for API consumers.
    pub fn texts(&self, team_name: impl Fn(TeamId) -> Option<String>) -> PredictionTexts {
        PredictionTexts {
            home_win: self.home_win_text(),
            away_win: self.away_win_text(),
            home_range: self.home_range_text(),
            away_range: self.away_range_text(),
            overtime: self.overtime_text(),
            expected_margin: self.expected_margin_text(team_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PredictionTexts {
    pub home_win: String,
    pub away_win: String,
    pub home_range: String,
    pub away_range: String,
    pub overtime: String,
    pub expected_margin: String,
}

/// `round(p * 100)` as an integer percent, half away from zero.
pub fn percent_text(p: Option<f64>) -> String {
    match p {
        Some(p) => format!("{}%", (p * 100.0).round() as i64),
        None => MISSING_PERCENT.to_string(),
    }
}

fn range_text(range: &ScoreRange) -> String {
    match (range.min, range.max) {
        (Some(lo), Some(hi)) => format!("{} - {}", lo, hi),
        _ => MISSING_VALUE.to_string(),
    }
}
