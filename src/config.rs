use crate::utils::config_loader::{
    KeeperConfigLoader, KeeperConfigLoaderSync, LoadConfigError, load_from_file, load_from_file_sync,
};
use alloy_primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::Display;

/// Process-wide configuration. Loaded once, then carried inside the process state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeeperConfig {
    /// Interval of the signed-data ingestion loop
    pub signed_data_fetch_interval_secs: u64,
    /// Signed API URLs polled in addition to the ones published by the registry
    #[serde(default)]
    pub signed_api_urls: Vec<String>,
    /// Whether URLs published by the on-chain registry are polled as well
    #[serde(default = "default_true")]
    pub use_signed_api_urls_from_contract: bool,
    /// Multiplies every on-chain deviation threshold
    #[serde(default = "default_coefficient")]
    pub deviation_threshold_coefficient: f64,
    /// Mnemonic that all sponsor wallets are derived from
    pub sponsor_wallet_mnemonic: String,
    pub wallet_derivation_scheme: WalletDerivationScheme,
    /// Timeout for signed API requests
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Signature verification workers, defaults to the available parallelism minus one (at least one)
    #[serde(default)]
    pub verifier_workers: Option<usize>,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    pub chain_id: u64,
    #[serde(default)]
    pub alias: Option<String>,
    pub providers: Vec<ProviderConfig>,
    pub contracts: ContractsConfig,
    pub data_feed_update_interval_secs: u64,
    pub data_feed_batch_size: usize,
    /// Used when gas estimation fails
    #[serde(default)]
    pub fallback_gas_limit: Option<u64>,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default)]
    pub gas_settings: GasSettings,
    #[serde(default)]
    pub individual_beacon_update_settings: Option<IndividualBeaconUpdateSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContractsConfig {
    /// Feed server receiving signed-data updates
    pub server: Address,
    /// Registry listing the active feeds
    pub registry: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GasSettings {
    pub recommended_gas_price_multiplier: f64,
    pub sanitization_sampling_window_secs: u64,
    pub sanitization_percentile: u8,
    /// Sanitization only kicks in once the window holds this many samples
    pub sanitization_min_samples: usize,
    pub scaling_window_secs: u64,
    pub max_scaling_multiplier: f64,
}

impl Default for GasSettings {
    fn default() -> Self {
        Self {
            recommended_gas_price_multiplier: 1.5,
            sanitization_sampling_window_secs: 900,
            sanitization_percentile: 80,
            sanitization_min_samples: 10,
            scaling_window_secs: 300,
            max_scaling_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndividualBeaconUpdateSettings {
    pub deviation_threshold_coefficient: f64,
    pub heartbeat_interval_modifier: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum WalletDerivationScheme {
    /// One wallet per dAPI name (or feed ID when unnamed)
    Managed,
    /// One wallet per (dAPI name or feed ID, update parameters)
    SelfFunded,
    /// A single wallet for every feed
    Fixed { sponsor_address: Address },
}

fn default_true() -> bool {
    true
}

fn default_coefficient() -> f64 {
    1.0
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_rpc_timeout_secs() -> u64 {
    10
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            signed_data_fetch_interval_secs: 10,
            signed_api_urls: Vec::new(),
            use_signed_api_urls_from_contract: true,
            deviation_threshold_coefficient: 1.0,
            sponsor_wallet_mnemonic: String::new(),
            wallet_derivation_scheme: WalletDerivationScheme::Managed,
            http_timeout_secs: default_http_timeout_secs(),
            verifier_workers: None,
            chains: Vec::new(),
        }
    }
}

impl KeeperConfig {
    pub fn signed_data_fetch_interval(&self) -> Duration {
        Duration::from_secs(self.signed_data_fetch_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|chain| chain.chain_id == chain_id)
    }

    /// Rejects configurations the loops cannot run with.
    pub fn validate(&self) -> Result<(), LoadConfigError> {
        let invalid = |reason: String| Err(LoadConfigError::ConfigError(reason));

        if self.signed_data_fetch_interval_secs == 0 {
            return invalid("signed_data_fetch_interval_secs must be positive".to_string());
        }
        if self.deviation_threshold_coefficient <= 0.0 {
            return invalid("deviation_threshold_coefficient must be positive".to_string());
        }
        if self.verifier_workers == Some(0) {
            return invalid("verifier_workers must be at least 1".to_string());
        }

        for chain in &self.chains {
            let chain_id = chain.chain_id;
            if chain.providers.is_empty() {
                return invalid(format!("chain {chain_id} has no providers"));
            }
            if chain.data_feed_update_interval_secs == 0 {
                return invalid(format!("chain {chain_id} data_feed_update_interval_secs must be positive"));
            }
            if chain.data_feed_batch_size == 0 {
                return invalid(format!("chain {chain_id} data_feed_batch_size must be positive"));
            }
            let gas = &chain.gas_settings;
            if gas.sanitization_percentile == 0 || gas.sanitization_percentile > 100 {
                return invalid(format!("chain {chain_id} sanitization_percentile must be within 1..=100"));
            }
            if gas.recommended_gas_price_multiplier <= 0.0 {
                return invalid(format!("chain {chain_id} recommended_gas_price_multiplier must be positive"));
            }
            if gas.max_scaling_multiplier < gas.recommended_gas_price_multiplier {
                return invalid(format!(
                    "chain {chain_id} max_scaling_multiplier must not be below recommended_gas_price_multiplier"
                ));
            }
            if let Some(settings) = chain.individual_beacon_update_settings {
                if settings.deviation_threshold_coefficient <= 0.0 {
                    return invalid(format!("chain {chain_id} individual deviation coefficient must be positive"));
                }
            }
        }

        Ok(())
    }
}

impl ChainConfig {
    pub fn data_feed_update_interval(&self) -> Duration {
        Duration::from_secs(self.data_feed_update_interval_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

#[async_trait]
impl KeeperConfigLoader for KeeperConfig {
    type SectionType = KeeperConfig;

    async fn load_from_file(file_name: String) -> Result<Self::SectionType, LoadConfigError> {
        let config: KeeperConfig = load_from_file(file_name).await?;
        config.validate()?;
        Ok(config)
    }
}

impl KeeperConfigLoaderSync for KeeperConfig {
    type SectionType = KeeperConfig;

    fn load_from_file_sync(file_name: String) -> Result<Self::SectionType, LoadConfigError> {
        let config: KeeperConfig = load_from_file_sync(file_name)?;
        config.validate()?;
        Ok(config)
    }
}
