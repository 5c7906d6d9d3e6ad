use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use crate::matchup::{MatchDetailAggregator, MatchDetailState, PredictionTexts};
use crate::models::{GameId, TeamId, TeamMeta};
use crate::schedule::{build_feed, DayGroup, LeagueFilter, ScheduleSynchronizer, TargetUniverse};
use crate::teams::{LoadStatus, TeamDirectory};

#[derive(Clone)]
pub struct AppState {
    pub schedule: Arc<ScheduleSynchronizer>,
    pub teams: Arc<TeamDirectory>,
    pub aggregator: MatchDetailAggregator,
    /// Upper bound on how long a detail request waits for its groups
    pub detail_timeout: Duration,
}

/// Build the Axum router for the read-only engine API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/games", get(games_handler))
        .route("/api/games/:id", get(game_detail_handler))
        .route("/api/feed", get(feed_handler))
        .route("/api/teams", get(teams_handler))
        .route("/api/teams/reload", post(reload_teams_handler))
        .route("/api/teams/:id", get(team_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

#[derive(Debug, Serialize)]
struct Health {
    games: usize,
    loading: bool,
    last_error: Option<String>,
    teams_loaded: bool,
    teams: usize,
    cached_details: usize,
}

/// GET /api/health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(Health {
        games: state.schedule.snapshot().len(),
        loading: state.schedule.is_loading(),
        last_error: state.schedule.last_error(),
        teams_loaded: state.teams.is_loaded(),
        teams: state.teams.len(),
        cached_details: state.aggregator.cache().len(),
    })
}

/// GET /api/games
async fn games_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.schedule.snapshot();
    let games: Vec<_> = snapshot.games_in_order().into_iter().cloned().collect();
    Json(games)
}

#[derive(Debug, Default, Deserialize)]
struct FeedParams {
    /// Comma-separated favorite team ids; absent means every team
    favorites: Option<String>,
    #[serde(default)]
    league: LeagueFilter,
    /// Local offset from UTC used for day grouping
    #[serde(default)]
    tz_offset_minutes: i32,
}

fn parse_favorites(raw: &str) -> Result<HashSet<TeamId>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<TeamId>().map_err(|_| format!("invalid team id '{}'", s)))
        .collect()
}

/// GET /api/feed?favorites=1,2&league=member&tz_offset_minutes=-300
async fn feed_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FeedParams>,
) -> Result<Json<Vec<DayGroup>>, (StatusCode, String)> {
    let universe = match params.favorites.as_deref() {
        Some(raw) => TargetUniverse::Favorites(
            parse_favorites(raw).map_err(|e| (StatusCode::BAD_REQUEST, e))?,
        ),
        None => TargetUniverse::AllTeams,
    };
    let tz = params
        .tz_offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("tz_offset_minutes {} out of range", params.tz_offset_minutes),
            )
        })?;

    let snapshot = state.schedule.snapshot();
    let teams = state.teams.snapshot();
    let feed = build_feed(
        &snapshot,
        &universe,
        params.league,
        |id| teams.get(&id).map(|t| t.league_member),
        Utc::now(),
        &tz,
    );
    Ok(Json(feed))
}

#[derive(Debug, Serialize)]
struct GameDetailResponse {
    game_id: GameId,
    complete: bool,
    #[serde(flatten)]
    state: MatchDetailState,
    texts: Option<PredictionTexts>,
}

/// GET /api/games/:id
async fn game_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<GameId>,
) -> Result<Json<GameDetailResponse>, (StatusCode, String)> {
    let mut handle = state.aggregator.bind(game_id);
    let detail_state = handle.wait_complete(state.detail_timeout).await;

    if detail_state.detail_resolved && detail_state.detail.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("game {} not found", game_id)));
    }

    let texts = detail_state
        .detail
        .as_ref()
        .map(|d| d.predictions.texts(|id| state.teams.name(id)));
    Ok(Json(GameDetailResponse {
        game_id,
        complete: detail_state.is_complete(),
        state: detail_state,
        texts,
    }))
}

/// GET /api/teams
async fn teams_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.teams.all())
}

/// GET /api/teams/:id
async fn team_handler(
    State(state): State<Arc<AppState>>,
    Path(team_id): Path<TeamId>,
) -> Result<Json<TeamMeta>, (StatusCode, String)> {
    state
        .teams
        .team(team_id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("team {} not found", team_id)))
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    loaded: bool,
    teams: usize,
}

/// POST /api/teams/reload
async fn reload_teams_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReloadResponse>, (StatusCode, String)> {
    state.teams.invalidate();
    let loaded = match state.teams.load_if_needed().await {
        LoadStatus::Loaded(_) | LoadStatus::AlreadyLoaded => true,
        LoadStatus::InFlight => state.teams.wait_loaded().await,
        LoadStatus::Failed => false,
    };
    if !loaded {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "team directory reload failed".to_string(),
        ));
    }
    Ok(Json(ReloadResponse {
        loaded,
        teams: state.teams.len(),
    }))
}
