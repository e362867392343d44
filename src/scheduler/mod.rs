/// Scheduling Layer
///
/// One update loop per (chain, provider) pair. Each cycle pages through the feed registry,
/// hands every page to the logic layer and submits what is updatable.
pub mod update_scheduler;

pub use update_scheduler::{BatchStats, CycleStats, UpdateScheduler, calculate_stagger, provider_offset};
