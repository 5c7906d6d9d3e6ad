//! Live schedule view and the feed selection built on top of it.

pub mod coverage;
pub mod synchronizer;

pub use coverage::{
    build_feed, candidates_from_snapshot, group_by_day, select, Candidate, DayGroup, LeagueFilter,
    TargetUniverse,
};
pub use synchronizer::{ScheduleSnapshot, ScheduleSynchronizer, SyncWindow};
