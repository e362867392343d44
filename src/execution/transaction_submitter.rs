use super::gas_price::{GasPriceEngine, GasPriceKey};
use super::rpc::{ChainRpc, SubmissionRequest};
use super::sponsor_wallet::{DerivedSponsorWallet, SponsorWalletCache};
use crate::config::{ChainConfig, GasSettings};
use crate::data_sync::contracts::IFeedServer;
use crate::keeper_error::KeeperError;
use crate::logic::pending::{PendingKey, PendingTransactionTracker};
use crate::logic::types::{ChainId, UpdatableDataFeed};
use crate::state::ProcessState;
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::SolCall;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One signed-data update per changed beacon, plus a beacon set recompute over every beacon of
/// an aggregate feed.
pub fn build_calldata(updatable: &UpdatableDataFeed) -> Result<Vec<Bytes>, KeeperError> {
    let mut calldata = updatable
        .updatable_beacons
        .iter()
        .map(|updatable_beacon| -> Result<Bytes, KeeperError> {
            let report = &updatable_beacon.signed_report;
            let call = IFeedServer::updateBeaconWithSignedDataCall {
                airnode: report.reporter_address,
                templateId: report.template_id,
                timestamp: U256::from(report.timestamp_secs()?),
                data: report.encoded_value.clone(),
                signature: report.signature.clone(),
            };
            Ok(Bytes::from(call.abi_encode()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if updatable.feed.is_aggregate() {
        let beacon_ids = updatable.feed.beacons.iter().map(|beacon| beacon.beacon.beacon_id).collect();
        calldata.push(Bytes::from(IFeedServer::updateBeaconSetWithBeaconsCall { beaconIds: beacon_ids }.abi_encode()));
    }
    Ok(calldata)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionStats {
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Sends update transactions for one (chain, provider) pair.
#[derive(Clone)]
pub struct TransactionSubmitter {
    chain_id: ChainId,
    provider_name: String,
    server: Address,
    fallback_gas_limit: Option<u64>,
    gas_settings: GasSettings,
    rpc: Arc<dyn ChainRpc>,
    gas_prices: GasPriceEngine,
    wallets: SponsorWalletCache,
    pending: PendingTransactionTracker,
}

impl TransactionSubmitter {
    pub fn new(state: ProcessState, chain: &ChainConfig, provider_name: impl Into<String>, rpc: Arc<dyn ChainRpc>) -> Self {
        Self {
            chain_id: chain.chain_id,
            provider_name: provider_name.into(),
            server: chain.contracts.server,
            fallback_gas_limit: chain.fallback_gas_limit,
            gas_settings: chain.gas_settings.clone(),
            rpc,
            gas_prices: GasPriceEngine::new(state.clone()),
            wallets: SponsorWalletCache::new(state.clone()),
            pending: PendingTransactionTracker::new(state),
        }
    }

    pub fn gas_price_key(&self) -> GasPriceKey {
        GasPriceKey::new(self.chain_id, self.provider_name.clone())
    }

    pub fn pending_key(&self, wallet: &DerivedSponsorWallet, feed_id: B256) -> PendingKey {
        PendingKey::new(self.chain_id, self.provider_name.clone(), wallet.wallet_address, feed_id)
    }

    pub fn sponsor_wallet(&self, updatable: &UpdatableDataFeed) -> Result<DerivedSponsorWallet, KeeperError> {
        self.wallets.get_or_derive(&updatable.feed)
    }

    /// Gas limit for the batch. `None` means the submission has to be skipped.
    pub async fn estimate_gas(&self, from: Address, calldata: &[Bytes]) -> Option<u64> {
        let data = Bytes::from(IFeedServer::multicallCall { data: calldata.to_vec() }.abi_encode());
        match self.rpc.estimate_gas(from, self.server, data).await {
            Ok(gas_limit) => Some(gas_limit),
            Err(e) if e.is_benign_race() => {
                info!(
                    chain_id = self.chain_id,
                    provider = %self.provider_name,
                    fallback_gas_limit = ?self.fallback_gas_limit,
                    "Gas estimation reverted because the feed was already updated"
                );
                self.fallback_gas_limit
            }
            Err(e) => {
                warn!(
                    chain_id = self.chain_id,
                    provider = %self.provider_name,
                    fallback_gas_limit = ?self.fallback_gas_limit,
                    "Gas estimation failed: {}",
                    e
                );
                self.fallback_gas_limit
            }
        }
    }

    /// Sends one `tryMulticall` update for the feed.
    ///
    /// Returns `Ok(None)` when the attempt was skipped for lack of a gas limit or gas price.
    /// Failures are not retried here; the next cycle re-evaluates the feed.
    pub async fn submit(&self, updatable: &UpdatableDataFeed, now: u64) -> Result<Option<B256>, KeeperError> {
        let feed = &updatable.feed;
        let wallet = self.sponsor_wallet(updatable)?;
        let calldata = build_calldata(updatable)?;

        let Some(gas_limit) = self.estimate_gas(wallet.wallet_address, &calldata).await else {
            warn!(feed = %feed.label(), "No gas limit available, skipping update");
            return Ok(None);
        };
        let nonce = self.rpc.transaction_count(wallet.wallet_address).await?;

        let pending_key = self.pending_key(&wallet, feed.data_feed_id);
        let is_retry = self.pending.has_pending(&pending_key);
        let gas_key = self.gas_price_key();
        let Some(gas_price) = self
            .gas_prices
            .recommended_price(self.rpc.as_ref(), &gas_key, wallet.wallet_address, &self.gas_settings, is_retry, now)
            .await
        else {
            warn!(feed = %feed.label(), "No gas price available, skipping update");
            return Ok(None);
        };
        // The stamp belongs to the wallet. Another feed on the same wallet must not restart it.
        if !is_retry && self.gas_prices.sponsor_last_update(&gas_key, wallet.wallet_address).is_none() {
            self.gas_prices.set_sponsor_last_update(&gas_key, wallet.wallet_address, now);
        }

        let request = SubmissionRequest {
            chain_id: self.chain_id,
            to: self.server,
            data: Bytes::from(IFeedServer::tryMulticallCall { data: calldata }.abi_encode()),
            nonce,
            gas_limit,
            gas_price,
        };
        debug!(
            chain_id = self.chain_id,
            provider = %self.provider_name,
            feed = %feed.label(),
            sponsor_wallet = %wallet.wallet_address,
            nonce,
            gas_limit,
            %gas_price,
            reason = %updatable.reason,
            "Submitting update"
        );

        let signer = wallet.signer()?;
        match self.rpc.send_transaction(&signer, request).await {
            Ok(tx_hash) => {
                info!(
                    chain_id = self.chain_id,
                    provider = %self.provider_name,
                    feed = %feed.label(),
                    sponsor_wallet = %wallet.wallet_address,
                    %tx_hash,
                    beacons = updatable.updatable_beacons.len(),
                    "Sent update transaction"
                );
                Ok(Some(tx_hash))
            }
            Err(e) if e.is_replacement_underpriced() => {
                info!(
                    chain_id = self.chain_id,
                    provider = %self.provider_name,
                    feed = %feed.label(),
                    sponsor_wallet = %wallet.wallet_address,
                    nonce,
                    "A pending update with the same nonce is already priced higher"
                );
                Err(e)
            }
            Err(e) => {
                error!(
                    chain_id = self.chain_id,
                    provider = %self.provider_name,
                    feed = %feed.label(),
                    sponsor_wallet = %wallet.wallet_address,
                    "Failed to send update transaction: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Submits every feed in order. Feeds sharing a sponsor wallet must not race for nonces.
    pub async fn submit_all(&self, feeds: &[UpdatableDataFeed], now: u64) -> SubmissionStats {
        let mut stats = SubmissionStats::default();
        for updatable in feeds {
            match self.submit(updatable, now).await {
                Ok(Some(_)) => stats.successful += 1,
                Ok(None) => stats.skipped += 1,
                Err(e) => {
                    if !e.is_replacement_underpriced() {
                        debug!(feed = %updatable.feed.label(), "Update not sent: {}", e);
                    }
                    stats.failed += 1;
                }
            }
        }
        stats
    }
}
