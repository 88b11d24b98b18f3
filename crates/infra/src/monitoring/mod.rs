//! Read-side monitoring and periodic maintenance.

pub mod retention;
pub mod stats;
pub mod stuck;

pub use retention::RetentionSweeper;
pub use stats::{StatisticsAggregator, StatsOverview, TypeStats, success_rate};
pub use stuck::StuckJobDetector;
