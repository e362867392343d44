use super::rpc::ChainRpc;
use crate::config::GasSettings;
use crate::logic::types::ChainId;
use crate::state::ProcessState;
use crate::utils::constants::MULTIPLIER_SCALE;
use alloy_primitives::{Address, U256};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GasPriceKey {
    pub chain_id: ChainId,
    pub provider_name: String,
}

impl GasPriceKey {
    pub fn new(chain_id: ChainId, provider_name: impl Into<String>) -> Self {
        Self { chain_id, provider_name: provider_name.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPriceSample {
    pub price: U256,
    pub timestamp: u64,
}

/// Gas price history of one (chain, provider) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GasPriceState {
    /// Oldest first
    pub samples: VecDeque<GasPriceSample>,
    /// When each sponsor wallet first submitted for its current pending update
    pub sponsor_last_update: HashMap<Address, u64>,
}

/// Nearest-rank percentile. `None` for an empty input.
pub fn percentile(p: u8, prices: &[U256]) -> Option<U256> {
    if prices.is_empty() {
        return None;
    }
    let mut sorted = prices.to_vec();
    sorted.sort_unstable();
    let rank = (sorted.len() * usize::from(p)).div_ceil(100);
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    Some(sorted[index])
}

/// Linear interpolation from `base` to `max` over the scaling window, clamped to `max`.
pub fn scaling_multiplier(base: f64, max: f64, elapsed_secs: u64, scaling_window_secs: u64) -> f64 {
    if scaling_window_secs == 0 || elapsed_secs >= scaling_window_secs {
        return max.max(base);
    }
    let progress = elapsed_secs as f64 / scaling_window_secs as f64;
    (base + (max - base) * progress).min(max).max(base)
}

/// Applies a configured multiplier in fixed point so the price never passes through a float.
pub fn multiply_gas_price(price: U256, multiplier: f64) -> U256 {
    if !multiplier.is_finite() || multiplier <= 0.0 {
        return price;
    }
    let scaled_multiplier = (multiplier * MULTIPLIER_SCALE as f64).round() as u64;
    price.saturating_mul(U256::from(scaled_multiplier)) / U256::from(MULTIPLIER_SCALE)
}

/// Gas pricing per (chain, provider): sanitization of outliers and scaling of stuck retries.
#[derive(Clone)]
pub struct GasPriceEngine {
    state: ProcessState,
}

impl GasPriceEngine {
    pub fn new(state: ProcessState) -> Self {
        Self { state }
    }

    pub fn record_sample(&self, key: &GasPriceKey, price: U256, now: u64) {
        self.state.update(|draft| {
            draft
                .gas_prices_mut()
                .entry(key.clone())
                .or_default()
                .samples
                .push_back(GasPriceSample { price, timestamp: now });
        });
    }

    /// Drops samples older than the sampling window.
    pub fn purge_expired(&self, key: &GasPriceKey, window_secs: u64, now: u64) {
        let cutoff = now.saturating_sub(window_secs);
        self.state.update(|draft| {
            if let Some(gas_state) = draft.gas_prices_mut().get_mut(key) {
                while gas_state.samples.front().is_some_and(|sample| sample.timestamp < cutoff) {
                    gas_state.samples.pop_front();
                }
            }
        });
    }

    pub fn samples(&self, key: &GasPriceKey) -> Vec<GasPriceSample> {
        self.state
            .get()
            .gas_prices
            .get(key)
            .map(|gas_state| gas_state.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Stamps the first submission of a sponsor wallet for its current pending update.
    pub fn set_sponsor_last_update(&self, key: &GasPriceKey, sponsor_wallet: Address, now: u64) {
        self.state.update(|draft| {
            draft.gas_prices_mut().entry(key.clone()).or_default().sponsor_last_update.insert(sponsor_wallet, now);
        });
    }

    pub fn clear_sponsor_last_update(&self, key: &GasPriceKey, sponsor_wallet: Address) {
        let tracked = self
            .state
            .get()
            .gas_prices
            .get(key)
            .is_some_and(|gas_state| gas_state.sponsor_last_update.contains_key(&sponsor_wallet));
        if tracked {
            self.state.update(|draft| {
                if let Some(gas_state) = draft.gas_prices_mut().get_mut(key) {
                    gas_state.sponsor_last_update.remove(&sponsor_wallet);
                }
            });
        }
    }

    pub fn sponsor_last_update(&self, key: &GasPriceKey, sponsor_wallet: Address) -> Option<u64> {
        self.state.get().gas_prices.get(key)?.sponsor_last_update.get(&sponsor_wallet).copied()
    }

    /// The gas price to submit with, or `None` when no price is known yet.
    ///
    /// A first attempt uses the provider price capped at the sanitization percentile. A retry uses
    /// the provider price scaled up by how long the sponsor has been waiting, without sanitization.
    pub async fn recommended_price(
        &self,
        rpc: &dyn ChainRpc,
        key: &GasPriceKey,
        sponsor_wallet: Address,
        settings: &GasSettings,
        is_retry: bool,
        now: u64,
    ) -> Option<U256> {
        let window = settings.sanitization_sampling_window_secs;
        let fetched = match rpc.gas_price().await {
            Ok(price) => {
                self.record_sample(key, price, now);
                Some(price)
            }
            Err(e) => {
                warn!(chain_id = key.chain_id, provider = %key.provider_name, "Failed to fetch gas price: {}", e);
                None
            }
        };
        self.purge_expired(key, window, now);
        let samples = self.samples(key);

        let Some(price) = fetched.or_else(|| samples.last().map(|sample| sample.price)) else {
            warn!(chain_id = key.chain_id, provider = %key.provider_name, "No gas price available");
            return None;
        };

        if is_retry {
            let since = self.sponsor_last_update(key, sponsor_wallet).unwrap_or(now);
            let multiplier = scaling_multiplier(
                settings.recommended_gas_price_multiplier,
                settings.max_scaling_multiplier,
                now.saturating_sub(since),
                settings.scaling_window_secs,
            );
            info!(
                chain_id = key.chain_id,
                provider = %key.provider_name,
                %sponsor_wallet,
                multiplier,
                "Scaling gas price of pending update"
            );
            return Some(multiply_gas_price(price, multiplier));
        }

        let mut base_price = price;
        if samples.len() >= settings.sanitization_min_samples {
            let history: Vec<U256> = samples.iter().map(|sample| sample.price).collect();
            if let Some(cap) = percentile(settings.sanitization_percentile, &history).filter(|cap| price > *cap) {
                debug!(
                    chain_id = key.chain_id,
                    provider = %key.provider_name,
                    %price,
                    %cap,
                    "Sanitizing gas price to the historical percentile"
                );
                base_price = cap;
            }
        }
        Some(multiply_gas_price(base_price, settings.recommended_gas_price_multiplier))
    }
}
