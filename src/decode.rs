//! Tolerant readers for loosely typed document fields.
//!
//! Upstream writers are not consistent: the same numeric field may arrive as an
//! integer, a float, or a numeric string, and timestamps come in several
//! encodings. Each reader tries the known representations in turn and returns
//! `None` when none of them fit. Nothing downstream of this module touches raw
//! `serde_json::Value`s.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{json, Value};

use crate::matchup::predictions::PredictionSet;
use crate::models::{Game, HeadToHeadRecord, MatchDetail, Matchup, PlayedGame, TeamMeta};
use crate::store::Document;

/// `"yyyy-MM-dd HH:mm:ss"`, always UTC.
const PLAYED_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const NAIVE_ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

// ── Primitive readers ────────────────────────────────────────────────────────

/// Read an integer. Integral encodings win; floats are truncated toward zero.
pub fn int(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    value
        .as_i64()
        .or_else(|| value.as_u64().and_then(|v| i64::try_from(v).ok()))
        .or_else(|| {
            value
                .as_f64()
                .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                .map(|f| f.trunc() as i64)
        })
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Read a floating-point number, accepting integral encodings as well.
pub fn float(value: Option<&Value>) -> Option<f64> {
    let value = value?;
    value
        .as_i64()
        .map(|v| v as f64)
        .or_else(|| value.as_f64())
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .filter(|f: &f64| f.is_finite())
}

/// Read a non-empty string.
pub fn text(value: Option<&Value>) -> Option<String> {
    value?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn flag(value: Option<&Value>) -> Option<bool> {
    value?.as_bool()
}

/// Read a timestamp from any of the encodings the store is known to emit:
/// `{"seconds", "nanos"}` (or `_seconds`/`_nanoseconds`), epoch seconds,
/// RFC 3339, or the played-games `"yyyy-MM-dd HH:mm:ss"` string (UTC).
pub fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::Object(obj) => {
            let seconds = int(obj.get("seconds").or_else(|| obj.get("_seconds")))?;
            let nanos = int(obj.get("nanos").or_else(|| obj.get("_nanoseconds"))).unwrap_or(0);
            let nanos = u32::try_from(nanos).ok()?;
            Utc.timestamp_opt(seconds, nanos).single()
        }
        Value::Number(n) => Utc.timestamp_opt(n.as_i64()?, 0).single(),
        Value::String(s) => parse_time_string(s),
        _ => None,
    }
}

fn parse_time_string(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    [PLAYED_DATE_FORMAT, NAIVE_ISO_FORMAT]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// The canonical encoding used when the engine writes a timestamp into a query.
pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    json!({
        "seconds": at.timestamp(),
        "nanos": at.timestamp_subsec_nanos(),
    })
}

// ── Document decoders ────────────────────────────────────────────────────────

/// Home/away ids from the nested `teams` object, falling back to the legacy
/// flat `team_id_home`/`team_id_away` fields. Both ids must be present.
fn matchup(doc: &Document) -> Option<Matchup> {
    let nested = int(doc.get("teams.homeId")).zip(int(doc.get("teams.awayId")));
    let flat = || int(doc.get("team_id_home")).zip(int(doc.get("team_id_away")));
    nested
        .or_else(flat)
        .map(|(home_id, away_id)| Matchup { home_id, away_id })
}

/// Decode a `games_schedule` document. Documents without `gameId` are dropped.
pub fn schedule_game(doc: &Document) -> Option<Game> {
    let id = int(doc.get("gameId"))?;
    Some(Game {
        id,
        start_time: timestamp(doc.get("startTime")),
        teams: matchup(doc),
        venue: text(doc.get("venue")),
        predictions: PredictionSet::parse(doc.get("predictions")),
    })
}

/// Decode the detail view of a `games_schedule` document.
pub fn match_detail(doc: &Document) -> Option<MatchDetail> {
    let game_id = int(doc.get("gameId"))?;
    let teams = matchup(doc);
    Some(MatchDetail {
        doc_id: doc.id.clone(),
        game_id,
        home_id: teams.map(|t| t.home_id),
        away_id: teams.map(|t| t.away_id),
        start_time: timestamp(doc.get("startTime")),
        venue: text(doc.get("venue")),
        predictions: PredictionSet::parse(doc.get("predictions")).unwrap_or_default(),
    })
}

/// `"W"`/`"L"` outcome flags, case-insensitive. Anything else is unknown.
fn outcome_flag(value: Option<&Value>) -> Option<bool> {
    let s = value?.as_str()?.trim();
    if s.eq_ignore_ascii_case("w") {
        Some(true)
    } else if s.eq_ignore_ascii_case("l") {
        Some(false)
    } else {
        None
    }
}

/// Decode a `games_played` document. Both team ids are required.
pub fn played_game(doc: &Document) -> Option<PlayedGame> {
    Some(PlayedGame {
        id: doc.id.clone(),
        home_id: int(doc.get("team_id_home"))?,
        away_id: int(doc.get("team_id_away"))?,
        home_points: int(doc.get("pts_home")),
        away_points: int(doc.get("pts_away")),
        home_won: outcome_flag(doc.get("wl_home")),
        away_won: outcome_flag(doc.get("wl_away")),
        played_at: timestamp(doc.get("game_date")),
        venue: text(doc.get("venue")),
    })
}

pub fn head_to_head(doc: &Document) -> Option<HeadToHeadRecord> {
    played_game(doc).map(HeadToHeadRecord::from)
}

/// Decode a `teams` document. The id comes from the document id, with an
/// `id` field as fallback; `name` is required.
pub fn team(doc: &Document) -> Option<TeamMeta> {
    let id = doc
        .id
        .trim()
        .parse::<i64>()
        .ok()
        .or_else(|| int(doc.get("id")))?;
    let name = text(doc.get("name"))?;
    let code = text(doc.get("code")).unwrap_or_default();
    Some(TeamMeta {
        id,
        name,
        abbreviation: text(doc.get("abbreviation")).unwrap_or_else(|| code.clone()),
        code,
        primary_color: text(doc.get("primaryColor")),
        secondary_color: text(doc.get("secondaryColor")),
        league_member: flag(doc.get("nba_team")).unwrap_or(false),
        city: text(doc.get("city")),
        arena: text(doc.get("arena")),
        country: text(doc.get("country")),
        logo: text(doc.get("logo")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_int_representations() {
        assert_eq!(int(Some(&json!(42))), Some(42));
        assert_eq!(int(Some(&json!(42.9))), Some(42));
        assert_eq!(int(Some(&json!("17"))), Some(17));
        assert_eq!(int(Some(&json!("abc"))), None);
        assert_eq!(int(Some(&json!(null))), None);
        assert_eq!(int(Some(&json!({"x": 1}))), None);
        assert_eq!(int(None), None);
    }

    #[test]
    fn test_float_representations() {
        assert_eq!(float(Some(&json!(3))), Some(3.0));
        assert_eq!(float(Some(&json!(0.642))), Some(0.642));
        assert_eq!(float(Some(&json!(true))), None);
    }

    #[test]
    fn test_text_skips_empty() {
        assert_eq!(text(Some(&json!("  "))), None);
        assert_eq!(text(Some(&json!("TD Garden"))), Some("TD Garden".to_string()));
        assert_eq!(text(Some(&json!(5))), None);
    }

    #[test]
    fn test_timestamp_encodings() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 19, 30, 0).unwrap();
        let secs = expected.timestamp();
        assert_eq!(timestamp(Some(&json!({"seconds": secs, "nanos": 0}))), Some(expected));
        assert_eq!(timestamp(Some(&json!({"_seconds": secs}))), Some(expected));
        assert_eq!(timestamp(Some(&json!(secs))), Some(expected));
        assert_eq!(timestamp(Some(&json!("2024-03-01T19:30:00Z"))), Some(expected));
        assert_eq!(timestamp(Some(&json!("2024-03-01 19:30:00"))), Some(expected));
        assert_eq!(timestamp(Some(&json!("yesterday"))), None);
    }

    #[test]
    fn test_timestamp_value_round_trips() {
        let at = Utc.with_ymd_and_hms(2025, 1, 5, 0, 0, 0).unwrap();
        assert_eq!(timestamp(Some(&timestamp_value(at))), Some(at));
    }

    #[test]
    fn test_schedule_game_nested_teams() {
        let doc = Document::new(
            "abc",
            json!({
                "gameId": 10,
                "startTime": {"seconds": 1_700_000_000, "nanos": 0},
                "teams": {"homeId": 1, "awayId": 2},
                "venue": "Arena"
            }),
        );
        let game = schedule_game(&doc).unwrap();
        assert_eq!(game.id, 10);
        assert_eq!(game.teams, Some(Matchup { home_id: 1, away_id: 2 }));
        assert_eq!(game.venue.as_deref(), Some("Arena"));
        assert!(game.start_time.is_some());
        assert!(game.predictions.is_none());
    }

    #[test]
    fn test_schedule_game_legacy_flat_teams() {
        let doc = Document::new("abc", json!({"gameId": 11, "team_id_home": 3, "team_id_away": 4}));
        let game = schedule_game(&doc).unwrap();
        assert_eq!(game.teams, Some(Matchup { home_id: 3, away_id: 4 }));
    }

    #[test]
    fn test_schedule_game_without_id_is_dropped() {
        let doc = Document::new("abc", json!({"teams": {"homeId": 1, "awayId": 2}}));
        assert!(schedule_game(&doc).is_none());
    }

    #[test]
    fn test_played_game_outcome_flags() {
        let doc = Document::new(
            "p1",
            json!({
                "team_id_home": 1, "team_id_away": 2,
                "pts_home": 101, "pts_away": 99,
                "wl_home": "w", "wl_away": "L",
                "game_date": "2024-01-02 01:00:00"
            }),
        );
        let game = played_game(&doc).unwrap();
        assert_eq!(game.home_won, Some(true));
        assert_eq!(game.away_won, Some(false));
        assert_eq!(game.home_points, Some(101));
        assert!(game.played_at.is_some());
    }

    #[test]
    fn test_team_decode_defaults() {
        let doc = Document::new("1610612738", json!({"name": "Celtics", "code": "BOS"}));
        let team = team(&doc).unwrap();
        assert_eq!(team.id, 1610612738);
        assert_eq!(team.abbreviation, "BOS");
        assert!(!team.league_member);

        let nameless = Document::new("5", json!({"code": "X"}));
        assert!(super::team(&nameless).is_none());
    }
}
