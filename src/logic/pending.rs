use super::types::ChainId;
use crate::state::ProcessState;
use alloy_primitives::{Address, B256};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub chain_id: ChainId,
    pub provider_name: String,
    pub sponsor_wallet: Address,
    pub feed_id: B256,
}

impl PendingKey {
    pub fn new(chain_id: ChainId, provider_name: impl Into<String>, sponsor_wallet: Address, feed_id: B256) -> Self {
        Self { chain_id, provider_name: provider_name.into(), sponsor_wallet, feed_id }
    }
}

/// How long a feed has been waiting for an on-chain update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTransactionRecord {
    pub consecutively_updatable_count: u64,
    pub first_updatable_timestamp: u64,
    /// On-chain timestamp observed when the record was created
    pub on_chain_timestamp: u64,
}

/// Tracks feeds that stay updatable across cycles, inside the process state.
#[derive(Clone)]
pub struct PendingTransactionTracker {
    state: ProcessState,
}

impl PendingTransactionTracker {
    pub fn new(state: ProcessState) -> Self {
        Self { state }
    }

    /// Records that the feed is updatable this cycle.
    ///
    /// A changed on-chain timestamp means the previous update landed, so a new record is started.
    pub fn mark_updatable(&self, key: &PendingKey, on_chain_timestamp: u64, now: u64) -> PendingTransactionRecord {
        self.state.update(|draft| {
            let record = draft
                .pending_transactions_mut()
                .entry(key.clone())
                .and_modify(|record| {
                    if record.on_chain_timestamp == on_chain_timestamp {
                        record.consecutively_updatable_count += 1;
                    } else {
                        *record = PendingTransactionRecord {
                            consecutively_updatable_count: 1,
                            first_updatable_timestamp: now,
                            on_chain_timestamp,
                        };
                    }
                })
                .or_insert(PendingTransactionRecord {
                    consecutively_updatable_count: 1,
                    first_updatable_timestamp: now,
                    on_chain_timestamp,
                });
            *record
        })
    }

    /// Drops the record of a feed that no longer needs an update. Returns the removed record.
    pub fn clear(&self, key: &PendingKey, now: u64) -> Option<PendingTransactionRecord> {
        if !self.state.get().pending_transactions.contains_key(key) {
            return None;
        }
        let removed = self.state.update(|draft| draft.pending_transactions_mut().remove(key))?;
        if removed.consecutively_updatable_count > 1 {
            info!(
                chain_id = key.chain_id,
                provider = %key.provider_name,
                sponsor_wallet = %key.sponsor_wallet,
                feed_id = %key.feed_id,
                "Feed was updatable for {}s over {} cycles",
                now.saturating_sub(removed.first_updatable_timestamp),
                removed.consecutively_updatable_count
            );
        } else {
            debug!(chain_id = key.chain_id, provider = %key.provider_name, feed_id = %key.feed_id, "Cleared pending record");
        }
        Some(removed)
    }

    /// Clears every record of a feed on one (chain, provider) pair, whichever wallet it was
    /// recorded under. Returns the cleared keys.
    pub fn clear_feed(&self, chain_id: ChainId, provider_name: &str, feed_id: B256, now: u64) -> Vec<PendingKey> {
        let keys: Vec<PendingKey> = self
            .state
            .get()
            .pending_transactions
            .keys()
            .filter(|key| key.chain_id == chain_id && key.provider_name == provider_name && key.feed_id == feed_id)
            .cloned()
            .collect();
        for key in &keys {
            self.clear(key, now);
        }
        keys
    }

    /// Whether any feed still waits on this sponsor wallet.
    pub fn wallet_has_records(&self, chain_id: ChainId, provider_name: &str, sponsor_wallet: Address) -> bool {
        self.state.get().pending_transactions.keys().any(|key| {
            key.chain_id == chain_id && key.provider_name == provider_name && key.sponsor_wallet == sponsor_wallet
        })
    }

    pub fn get(&self, key: &PendingKey) -> Option<PendingTransactionRecord> {
        self.state.get().pending_transactions.get(key).copied()
    }

    /// Whether the current submission retries an earlier one. Records are created before the
    /// first submission, so a retry is a record seen in more than one cycle.
    pub fn has_pending(&self, key: &PendingKey) -> bool {
        self.get(key).is_some_and(|record| record.consecutively_updatable_count > 1)
    }

    /// Drops the records of feeds on one (chain, provider) pair that are not in `active_feeds`.
    /// Returns the dropped keys.
    pub fn retain_feeds(&self, chain_id: ChainId, provider_name: &str, active_feeds: &HashSet<B256>) -> Vec<PendingKey> {
        let is_stale = |key: &PendingKey| {
            key.chain_id == chain_id && key.provider_name == provider_name && !active_feeds.contains(&key.feed_id)
        };
        if !self.state.get().pending_transactions.keys().any(is_stale) {
            return Vec::new();
        }
        let dropped = self.state.update(|draft| {
            let stale: Vec<PendingKey> = draft.pending_transactions.keys().filter(|key| is_stale(key)).cloned().collect();
            let records = draft.pending_transactions_mut();
            for key in &stale {
                records.remove(key);
            }
            stale
        });
        debug!(chain_id, provider = provider_name, dropped = dropped.len(), "Dropped pending records of removed feeds");
        dropped
    }
}
