//! Pure update-decision math. Everything here works on 256-bit integers and takes `now` explicitly.

use super::types::UpdateReason;
use crate::utils::constants::{HUNDRED_PERCENT, MULTIPLIER_SCALE};
use alloy_primitives::{I256, U256};

/// Median of the values. Even lengths average the two middle values, truncating toward zero.
/// Undefined (`None`) for an empty input.
pub fn median(values: &[I256]) -> Option<I256> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    let middle = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[middle])
    } else {
        let sum = sorted[middle - 1].saturating_add(sorted[middle]);
        Some(sum / I256::from_raw(U256::from(2)))
    }
}

/// Median of unix timestamps, same rules as [`median`].
pub fn median_timestamp(timestamps: &[u64]) -> Option<u64> {
    if timestamps.is_empty() {
        return None;
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    let middle = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[middle])
    } else {
        Some(((u128::from(sorted[middle - 1]) + u128::from(sorted[middle])) / 2) as u64)
    }
}

/// `|off_chain - on_chain| * 1e8 / |reference - on_chain|`.
///
/// Saturates to `U256::MAX` when the reference equals the on-chain value and the value moved.
pub fn deviation_percentage(on_chain_value: I256, off_chain_value: I256, deviation_reference: I256) -> U256 {
    let absolute_delta = off_chain_value.saturating_sub(on_chain_value).unsigned_abs();
    if absolute_delta.is_zero() {
        return U256::ZERO;
    }
    let absolute_reference_distance = deviation_reference.saturating_sub(on_chain_value).unsigned_abs();
    if absolute_reference_distance.is_zero() {
        return U256::MAX;
    }
    absolute_delta.saturating_mul(U256::from(HUNDRED_PERCENT)) / absolute_reference_distance
}

/// Scales a fixed-point threshold by a configured coefficient.
pub fn scale_threshold(threshold: U256, coefficient: f64) -> U256 {
    if !coefficient.is_finite() || coefficient <= 0.0 {
        return threshold;
    }
    let scaled_coefficient = (coefficient * MULTIPLIER_SCALE as f64).round() as u64;
    threshold.saturating_mul(U256::from(scaled_coefficient)) / U256::from(MULTIPLIER_SCALE)
}

/// Inputs of a single update decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCheck {
    pub on_chain_value: I256,
    pub on_chain_timestamp: u64,
    pub off_chain_value: I256,
    pub off_chain_timestamp: u64,
    pub heartbeat_interval: u64,
    pub deviation_threshold: U256,
    pub deviation_reference: I256,
}

/// Why (if at all) the on-chain value should be replaced by the off-chain one.
pub fn update_reason(check: &UpdateCheck, now: u64) -> Option<UpdateReason> {
    if check.on_chain_timestamp == 0 && check.off_chain_timestamp > 0 {
        return Some(UpdateReason::Initialization);
    }

    let deviation = deviation_percentage(check.on_chain_value, check.off_chain_value, check.deviation_reference);
    if deviation >= check.deviation_threshold {
        return Some(UpdateReason::Deviation);
    }

    if check.on_chain_timestamp.saturating_add(check.heartbeat_interval) <= now {
        return Some(UpdateReason::Heartbeat);
    }

    None
}

#[allow(clippy::too_many_arguments)]
pub fn is_updatable(
    on_chain_value: I256,
    on_chain_timestamp: u64,
    off_chain_value: I256,
    off_chain_timestamp: u64,
    heartbeat_interval: u64,
    deviation_threshold: U256,
    deviation_reference: I256,
    now: u64,
) -> bool {
    let check = UpdateCheck {
        on_chain_value,
        on_chain_timestamp,
        off_chain_value,
        off_chain_timestamp,
        heartbeat_interval,
        deviation_threshold,
        deviation_reference,
    };
    update_reason(&check, now).is_some()
}
