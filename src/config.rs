use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::schedule::SyncWindow;

/// Live game schedule sync and matchup insight engine
#[derive(Parser, Debug, Clone)]
#[command(name = "matchday-engine", version, about)]
pub struct Config {
    /// Document gateway base URL for one-shot queries
    #[arg(long, env = "STORE_API_URL")]
    pub store_api_url: Option<String>,

    /// Document gateway WebSocket base URL for push subscriptions
    #[arg(long, env = "STORE_WS_URL")]
    pub store_ws_url: Option<String>,

    /// Document gateway API key
    #[arg(long, env = "STORE_API_KEY")]
    pub store_api_key: Option<String>,

    /// Serve from a local JSON seed file instead of the gateway
    #[arg(long, env = "SEED_FILE")]
    pub seed_file: Option<PathBuf>,

    /// HTTP API listen address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    pub api_addr: String,

    /// Hours of already-started games kept in the schedule window
    #[arg(long, env = "WINDOW_PAST_HOURS", default_value = "3")]
    pub window_past_hours: i64,

    /// Hours of upcoming games kept in the schedule window
    #[arg(long, env = "WINDOW_FUTURE_HOURS", default_value = "48")]
    pub window_future_hours: i64,

    /// Reopen the schedule subscription with fresh window bounds this often
    #[arg(long, env = "WINDOW_ROLL_SECS", default_value = "1800")]
    pub window_roll_secs: u64,

    /// How long `/api/games/{id}` waits for the detail groups
    #[arg(long, env = "DETAIL_TIMEOUT_SECS", default_value = "5")]
    pub detail_timeout_secs: u64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.seed_file.is_none() {
            if self.store_api_url.is_none() {
                anyhow::bail!("STORE_API_URL is required unless --seed-file is given.");
            }
            if self.store_ws_url.is_none() {
                anyhow::bail!("STORE_WS_URL is required unless --seed-file is given.");
            }
        }
        if self.api_addr.parse::<SocketAddr>().is_err() {
            anyhow::bail!("api_addr '{}' is not a valid socket address", self.api_addr);
        }
        if self.window_past_hours < 0 {
            anyhow::bail!("window_past_hours must not be negative");
        }
        if self.window_future_hours <= 0 {
            anyhow::bail!("window_future_hours must be positive");
        }
        if self.window_roll_secs < 60 {
            anyhow::bail!("window_roll_secs must be at least 60");
        }
        if self.detail_timeout_secs == 0 {
            anyhow::bail!("detail_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn sync_window(&self) -> SyncWindow {
        SyncWindow {
            past: chrono::Duration::hours(self.window_past_hours),
            future: chrono::Duration::hours(self.window_future_hours),
            roll: Duration::from_secs(self.window_roll_secs),
            ..SyncWindow::default()
        }
    }

    pub fn detail_timeout(&self) -> Duration {
        Duration::from_secs(self.detail_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("matchday-engine").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults_match_schedule_window() {
        let config = parse(&["--seed-file", "seed.json"]);
        config.validate().unwrap();
        let window = config.sync_window();
        assert_eq!(window.past.num_hours(), 3);
        assert_eq!(window.future.num_hours(), 48);
        assert_eq!(window.roll, Duration::from_secs(1800));
        assert_eq!(config.detail_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_gateway_urls_required_without_seed() {
        let config = parse(&["--store-api-url", "https://docs.example.com"]);
        assert!(config.validate().is_err());

        let config = parse(&[
            "--store-api-url",
            "https://docs.example.com",
            "--store-ws-url",
            "wss://docs.example.com",
        ]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(parse(&["--seed-file", "s", "--api-addr", "nope"]).validate().is_err());
        assert!(parse(&["--seed-file", "s", "--window-future-hours", "0"]).validate().is_err());
        assert!(parse(&["--seed-file", "s", "--window-roll-secs", "5"]).validate().is_err());
        assert!(parse(&["--seed-file", "s", "--detail-timeout-secs", "0"]).validate().is_err());
    }
}
