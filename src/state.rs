use crate::config::KeeperConfig;
use crate::data_sync::signed_data::SignedReport;
use crate::execution::gas_price::{GasPriceKey, GasPriceState};
use crate::execution::sponsor_wallet::DerivedSponsorWallet;
use crate::logic::pending::{PendingKey, PendingTransactionRecord};
use crate::logic::types::ChainId;
use alloy_primitives::{Address, B256};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Everything the keeper knows at one point in time.
///
/// Snapshots are immutable once published: readers hold an `Arc<KeeperState>` and never observe
/// a partial update. All changes go through [`ProcessState::update`].
///
/// Every map sits behind its own `Arc`. Cloning a snapshot shares them, and a draft only copies
/// the maps it writes to through the `*_mut` accessors.
#[derive(Debug, Clone, Default)]
pub struct KeeperState {
    pub config: Arc<KeeperConfig>,
    /// Freshest verified report per beacon ID
    pub signed_reports: Arc<HashMap<B256, SignedReport>>,
    /// Signed API URLs published by the registry, per (chain, provider) and feed ID
    pub signed_api_urls: Arc<HashMap<(ChainId, String), BTreeMap<B256, Vec<String>>>>,
    pub gas_prices: Arc<HashMap<GasPriceKey, GasPriceState>>,
    pub pending_transactions: Arc<HashMap<PendingKey, PendingTransactionRecord>>,
    /// Derived wallets keyed by sponsor address
    pub sponsor_wallets: Arc<HashMap<Address, DerivedSponsorWallet>>,
}

impl KeeperState {
    pub fn new(config: KeeperConfig) -> Self {
        Self { config: Arc::new(config), ..Self::default() }
    }

    pub fn signed_reports_mut(&mut self) -> &mut HashMap<B256, SignedReport> {
        Arc::make_mut(&mut self.signed_reports)
    }

    pub fn signed_api_urls_mut(&mut self) -> &mut HashMap<(ChainId, String), BTreeMap<B256, Vec<String>>> {
        Arc::make_mut(&mut self.signed_api_urls)
    }

    pub fn gas_prices_mut(&mut self) -> &mut HashMap<GasPriceKey, GasPriceState> {
        Arc::make_mut(&mut self.gas_prices)
    }

    pub fn pending_transactions_mut(&mut self) -> &mut HashMap<PendingKey, PendingTransactionRecord> {
        Arc::make_mut(&mut self.pending_transactions)
    }

    pub fn sponsor_wallets_mut(&mut self) -> &mut HashMap<Address, DerivedSponsorWallet> {
        Arc::make_mut(&mut self.sponsor_wallets)
    }

    /// Every signed API URL published by any registry, deduplicated and sorted.
    pub fn published_signed_api_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .signed_api_urls
            .values()
            .flat_map(|per_feed| per_feed.values().flatten().cloned())
            .collect();
        urls.sort();
        urls.dedup();
        urls
    }
}

/// Process-wide state container with copy-on-write snapshots.
#[derive(Clone, Default)]
pub struct ProcessState {
    inner: Arc<RwLock<Arc<KeeperState>>>,
}

impl ProcessState {
    pub fn new(config: KeeperConfig) -> Self {
        Self { inner: Arc::new(RwLock::new(Arc::new(KeeperState::new(config)))) }
    }

    /// Current snapshot. Later updates never change what the returned value contains.
    pub fn get(&self) -> Arc<KeeperState> {
        self.inner.read().clone()
    }

    pub fn config(&self) -> Arc<KeeperConfig> {
        self.get().config.clone()
    }

    /// Produces the next snapshot from a draft copy of the current one and publishes it atomically.
    /// Updates are serialized; if `transform` panics the current snapshot stays in place.
    pub fn update<R>(&self, transform: impl FnOnce(&mut KeeperState) -> R) -> R {
        let mut guard = self.inner.write();
        let mut draft = KeeperState::clone(&guard);
        let result = transform(&mut draft);
        *guard = Arc::new(draft);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_snapshots_are_isolated_from_updates() {
        let state = ProcessState::new(KeeperConfig::default());
        let before = state.get();

        state.update(|draft| {
            draft.signed_api_urls_mut().entry((1, "main".to_string())).or_default().insert(B256::ZERO, vec!["https://a".to_string()]);
        });

        assert!(before.signed_api_urls.is_empty());
        assert_eq!(state.get().published_signed_api_urls(), vec!["https://a".to_string()]);
    }

    #[test]
    fn test_update_only_copies_written_maps() {
        let state = ProcessState::new(KeeperConfig::default());
        state.update(|draft| {
            draft.signed_api_urls_mut().entry((1, "main".to_string())).or_default().insert(B256::ZERO, vec!["https://a".to_string()]);
        });
        let before = state.get();

        state.update(|draft| {
            let key = PendingKey { chain_id: 1, provider_name: "main".to_string(), sponsor_wallet: Address::ZERO, feed_id: B256::ZERO };
            draft.pending_transactions_mut().insert(key, PendingTransactionRecord { consecutively_updatable_count: 1, first_updatable_timestamp: 10, on_chain_timestamp: 5 });
        });
        let after = state.get();

        assert!(Arc::ptr_eq(&before.signed_api_urls, &after.signed_api_urls));
        assert!(Arc::ptr_eq(&before.signed_reports, &after.signed_reports));
        assert!(Arc::ptr_eq(&before.gas_prices, &after.gas_prices));
        assert!(!Arc::ptr_eq(&before.pending_transactions, &after.pending_transactions));
        assert!(before.pending_transactions.is_empty());
        assert_eq!(after.pending_transactions.len(), 1);
    }

    #[test]
    fn test_update_returns_transform_result() {
        let state = ProcessState::new(KeeperConfig::default());
        let len = state.update(|draft| {
            draft.sponsor_wallets_mut().clear();
            draft.sponsor_wallets.len()
        });
        assert_eq!(len, 0);
    }

    #[test]
    fn test_panicking_update_keeps_previous_snapshot() {
        let state = ProcessState::new(KeeperConfig::default());
        state.update(|draft| {
            draft.signed_api_urls_mut().entry((1, "main".to_string())).or_default().insert(B256::ZERO, vec!["https://a".to_string()]);
        });

        let cloned = state.clone();
        let result = thread::spawn(move || {
            cloned.update(|draft| {
                draft.signed_api_urls_mut().clear();
                if draft.signed_api_urls.is_empty() {
                    panic!("transform failed");
                }
            })
        })
        .join();

        assert!(result.is_err());
        assert_eq!(state.get().published_signed_api_urls().len(), 1);
    }

    #[test]
    fn test_concurrent_updates_are_serialized() {
        let state = ProcessState::new(KeeperConfig::default());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let state = state.clone();
                thread::spawn(move || {
                    for j in 0..50u8 {
                        state.update(|draft| {
                            draft
                                .signed_api_urls_mut()
                                .entry((u64::from(i), "p".to_string()))
                                .or_default()
                                .insert(B256::repeat_byte(j), vec![format!("https://{i}/{j}")]);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = state.get();
        assert_eq!(snapshot.signed_api_urls.len(), 8);
        assert!(snapshot.signed_api_urls.values().all(|per_feed| per_feed.len() == 50));
    }

    #[test]
    fn test_published_urls_are_deduplicated() {
        let state = ProcessState::new(KeeperConfig::default());
        state.update(|draft| {
            let urls = vec!["https://b".to_string(), "https://a".to_string()];
            draft.signed_api_urls_mut().entry((1, "one".to_string())).or_default().insert(B256::ZERO, urls.clone());
            draft.signed_api_urls_mut().entry((2, "two".to_string())).or_default().insert(B256::ZERO, urls);
        });
        assert_eq!(state.get().published_signed_api_urls(), vec!["https://a".to_string(), "https://b".to_string()]);
    }
}
