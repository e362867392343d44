use super::deviation::{UpdateCheck, median, median_timestamp, scale_threshold, update_reason};
use super::types::{ActiveDataFeed, UpdatableBeacon, UpdatableDataFeed, UpdateReason};
use crate::config::{ChainConfig, IndividualBeaconUpdateSettings, KeeperConfig};
use crate::data_sync::signed_data::{SignedReport, is_timestamp_fresh};
use alloy_primitives::{B256, I256};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Threshold adjustments applied on top of the on-chain update parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationSettings {
    pub deviation_threshold_coefficient: f64,
    pub individual_beacon_update_settings: Option<IndividualBeaconUpdateSettings>,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self { deviation_threshold_coefficient: 1.0, individual_beacon_update_settings: None }
    }
}

impl EvaluationSettings {
    pub fn for_chain(config: &KeeperConfig, chain: &ChainConfig) -> Self {
        Self {
            deviation_threshold_coefficient: config.deviation_threshold_coefficient,
            individual_beacon_update_settings: chain.individual_beacon_update_settings,
        }
    }
}

/// Heartbeat interval with the per-beacon modifier applied, floored at zero.
pub fn adjusted_heartbeat_interval(heartbeat_interval: u64, modifier: i64) -> u64 {
    let adjusted = i128::from(heartbeat_interval) + i128::from(modifier);
    if adjusted < 0 {
        warn!(heartbeat_interval, modifier, "Heartbeat interval modifier makes the interval negative, using zero");
        return 0;
    }
    u64::try_from(adjusted).unwrap_or(u64::MAX)
}

struct BeaconCandidate {
    value: I256,
    timestamp: u64,
    /// Set when the off-chain report is newer than the on-chain beacon
    newer: Option<(I256, u64, SignedReport)>,
}

fn usable_report(beacon_id: &B256, report: &SignedReport, now: u64) -> Option<(I256, u64)> {
    let timestamp = match report.timestamp_secs() {
        Ok(timestamp) => timestamp,
        Err(e) => {
            warn!(%beacon_id, "Ignoring signed data: {}", e);
            return None;
        }
    };
    if !is_timestamp_fresh(timestamp, now) {
        warn!(%beacon_id, timestamp, "Ignoring signed data older than the retention window");
        return None;
    }
    match report.value() {
        Ok(value) => Some((value, timestamp)),
        Err(e) => {
            warn!(%beacon_id, "Ignoring signed data: {}", e);
            None
        }
    }
}

/// Decides whether a feed should be updated and which beacons carry data to submit.
///
/// Returns `None` when nothing should be sent, including when no beacon has signed data newer
/// than what is stored on-chain.
pub fn evaluate_feed(
    feed: &ActiveDataFeed,
    signed_reports: &HashMap<B256, SignedReport>,
    settings: &EvaluationSettings,
    now: u64,
) -> Option<UpdatableDataFeed> {
    if feed.beacons.is_empty() {
        return None;
    }

    let candidates: Vec<BeaconCandidate> = feed
        .beacons
        .iter()
        .map(|on_chain| {
            let beacon_id = on_chain.beacon.beacon_id;
            let newer = signed_reports
                .get(&beacon_id)
                .and_then(|report| usable_report(&beacon_id, report, now).map(|(value, ts)| (value, ts, report)))
                .filter(|(_, timestamp, _)| *timestamp > on_chain.timestamp)
                .map(|(value, timestamp, report)| (value, timestamp, report.clone()));
            match newer {
                Some((value, timestamp, _)) => BeaconCandidate { value, timestamp, newer },
                None => BeaconCandidate { value: on_chain.value, timestamp: on_chain.timestamp, newer: None },
            }
        })
        .collect();

    let updatable_beacons: Vec<UpdatableBeacon> = feed
        .beacons
        .iter()
        .zip(&candidates)
        .filter_map(|(on_chain, candidate)| {
            candidate
                .newer
                .as_ref()
                .map(|(_, _, report)| UpdatableBeacon { beacon: on_chain.beacon, signed_report: report.clone() })
        })
        .collect();
    if updatable_beacons.is_empty() {
        debug!(feed = %feed.label(), "No beacon has signed data newer than on-chain");
        return None;
    }

    let values: Vec<I256> = candidates.iter().map(|candidate| candidate.value).collect();
    let timestamps: Vec<u64> = candidates.iter().map(|candidate| candidate.timestamp).collect();
    let (aggregate_value, aggregate_timestamp) = (median(&values)?, median_timestamp(&timestamps)?);

    let parameters = &feed.update_parameters;
    let deviation_threshold =
        scale_threshold(parameters.deviation_threshold_percentage, settings.deviation_threshold_coefficient);
    let check = UpdateCheck {
        on_chain_value: feed.on_chain_value,
        on_chain_timestamp: feed.on_chain_timestamp,
        off_chain_value: aggregate_value,
        off_chain_timestamp: aggregate_timestamp,
        heartbeat_interval: parameters.heartbeat_interval_secs(),
        deviation_threshold,
        deviation_reference: parameters.deviation_reference,
    };

    if let Some(reason) = update_reason(&check, now) {
        debug!(feed = %feed.label(), %reason, beacons = updatable_beacons.len(), "Feed is updatable");
        return Some(UpdatableDataFeed { feed: feed.clone(), updatable_beacons, reason });
    }

    let overrides = settings.individual_beacon_update_settings?;
    if !feed.is_aggregate() {
        return None;
    }
    evaluate_individual_beacons(feed, &candidates, &overrides, deviation_threshold, now)
}

/// Per-beacon check for aggregates whose aggregate value did not qualify.
fn evaluate_individual_beacons(
    feed: &ActiveDataFeed,
    candidates: &[BeaconCandidate],
    overrides: &IndividualBeaconUpdateSettings,
    deviation_threshold: alloy_primitives::U256,
    now: u64,
) -> Option<UpdatableDataFeed> {
    let parameters = &feed.update_parameters;
    let heartbeat_interval =
        adjusted_heartbeat_interval(parameters.heartbeat_interval_secs(), overrides.heartbeat_interval_modifier);
    let deviation_threshold = scale_threshold(deviation_threshold, overrides.deviation_threshold_coefficient);

    let updatable_beacons: Vec<UpdatableBeacon> = feed
        .beacons
        .iter()
        .zip(candidates)
        .filter_map(|(on_chain, candidate)| {
            let (value, timestamp, report) = candidate.newer.as_ref()?;
            let check = UpdateCheck {
                on_chain_value: on_chain.value,
                on_chain_timestamp: on_chain.timestamp,
                off_chain_value: *value,
                off_chain_timestamp: *timestamp,
                heartbeat_interval,
                deviation_threshold,
                deviation_reference: parameters.deviation_reference,
            };
            update_reason(&check, now)
                .map(|_| UpdatableBeacon { beacon: on_chain.beacon, signed_report: report.clone() })
        })
        .collect();

    if updatable_beacons.is_empty() {
        return None;
    }
    debug!(feed = %feed.label(), beacons = updatable_beacons.len(), "Individual beacons are updatable");
    Some(UpdatableDataFeed { feed: feed.clone(), updatable_beacons, reason: UpdateReason::IndividualBeacon })
}

/// Evaluates a batch of feeds against the stored signed reports.
pub fn get_updatable_feeds(
    feeds: &[ActiveDataFeed],
    signed_reports: &HashMap<B256, SignedReport>,
    settings: &EvaluationSettings,
    now: u64,
) -> Vec<UpdatableDataFeed> {
    feeds
        .iter()
        .filter_map(|feed| evaluate_feed(feed, signed_reports, settings, now))
        .collect()
}
