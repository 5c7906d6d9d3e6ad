//! Live game schedule synchronization and matchup insight aggregation.
//!
//! ```text
//!  DocumentStore ──▶ ScheduleSynchronizer ──▶ coverage (feed selection)
//!        │                   │
//!        │                   ▼
//!        ├──────────▶ MatchDetailAggregator ──▶ MatchCache
//!        └──────────▶ TeamDirectory
//! ```

pub mod api;
pub mod config;
pub mod decode;
pub mod matchup;
pub mod models;
pub mod schedule;
pub mod store;
pub mod teams;
