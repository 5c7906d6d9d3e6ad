use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use matchday_engine::api::{self, AppState};
use matchday_engine::config::Config;
use matchday_engine::matchup::{MatchCache, MatchDetailAggregator};
use matchday_engine::schedule::ScheduleSynchronizer;
use matchday_engine::store::{DocumentStore, MemoryStore, RemoteStore};
use matchday_engine::teams::{LoadStatus, TeamDirectory};

fn build_store(config: &Config) -> Result<Arc<dyn DocumentStore>> {
    if let Some(path) = &config.seed_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        let store = MemoryStore::from_seed_json(&text)
            .with_context(|| format!("parsing seed file {}", path.display()))?;
        info!("Offline mode: serving seed file {}", path.display());
        return Ok(Arc::new(store));
    }

    let api_url = config.store_api_url.as_deref().context("STORE_API_URL is not set")?;
    let ws_url = config.store_ws_url.as_deref().context("STORE_WS_URL is not set")?;
    let store = RemoteStore::new(api_url, ws_url, config.store_api_key.clone())?;
    info!("Using document gateway at {}", api_url);
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let store = build_store(&config)?;

    // Team metadata loads once, in the background
    let teams = Arc::new(TeamDirectory::new(Arc::clone(&store)));
    {
        let teams = Arc::clone(&teams);
        tokio::spawn(async move {
            if teams.load_if_needed().await == LoadStatus::Failed {
                warn!("Team directory unavailable, retry with POST /api/teams/reload");
            }
        });
    }

    let schedule = Arc::new(ScheduleSynchronizer::new(
        Arc::clone(&store),
        config.sync_window(),
    ));
    schedule.start();

    let aggregator = MatchDetailAggregator::new(Arc::clone(&store), Arc::new(MatchCache::new()))
        .with_schedule(schedule.watch());

    let state = AppState {
        schedule: Arc::clone(&schedule),
        teams,
        aggregator,
        detail_timeout: config.detail_timeout(),
    };
    let app = api::router(state);
    let addr: SocketAddr = config.api_addr.parse()?;
    info!("API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    schedule.stop();
    Ok(())
}
