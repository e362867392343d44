/// Logic Layer - Update Decisions
///
/// This layer is responsible for:
/// - Feed, beacon and update parameter types
/// - Median aggregation, deviation and heartbeat math
/// - Per-feed updatability, including individual beacon overrides
/// - Pending update bookkeeping across cycles
///
/// Nothing in here performs I/O; callers pass `now` explicitly.

pub mod deviation;
pub mod pending;
pub mod types;
pub mod updatability;

// Re-export key components from the logic layer
pub use deviation::{UpdateCheck, deviation_percentage, is_updatable, median, median_timestamp, update_reason};
pub use pending::{PendingKey, PendingTransactionRecord, PendingTransactionTracker};
pub use types::{
    ActiveDataFeed, Beacon, ChainId, OnChainBeacon, UpdatableBeacon, UpdatableDataFeed, UpdateParameters, UpdateReason,
};
pub use updatability::{EvaluationSettings, evaluate_feed, get_updatable_feeds};
