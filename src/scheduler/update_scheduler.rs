use crate::config::ChainConfig;
use crate::data_sync::registry::FeedRegistryClient;
use crate::execution::gas_price::GasPriceEngine;
use crate::execution::rpc::ChainRpc;
use crate::execution::transaction_submitter::{SubmissionStats, TransactionSubmitter};
use crate::logic::pending::{PendingKey, PendingTransactionTracker};
use crate::logic::types::{ActiveDataFeed, UpdatableDataFeed};
use crate::logic::updatability::{EvaluationSettings, get_updatable_feeds};
use crate::state::ProcessState;
use crate::utils::unix_now;
use alloy_primitives::B256;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Delay between the remaining registry pages of a cycle.
///
/// Pages are spread evenly over the update interval. When the first page already ate more than
/// its share, the rest of the interval is split among the remaining pages instead.
pub fn calculate_stagger(interval: Duration, first_page_elapsed: Duration, page_count: usize) -> Duration {
    if page_count <= 2 || first_page_elapsed >= interval {
        return Duration::ZERO;
    }
    let Ok(pages) = u32::try_from(page_count) else {
        return Duration::ZERO;
    };
    let share = interval / pages;
    if first_page_elapsed <= share {
        share
    } else {
        (interval - first_page_elapsed) / (pages - 1)
    }
}

/// Start offset of the `index`-th provider of a chain, so providers don't hit the chain in lockstep.
pub fn provider_offset(interval: Duration, provider_count: usize, index: usize) -> Duration {
    match (u32::try_from(provider_count), u32::try_from(index)) {
        (Ok(count), Ok(index)) if count > 0 => interval / count * index,
        _ => Duration::ZERO,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub feeds: usize,
    pub updatable: usize,
    pub submissions: SubmissionStats,
}

/// Summary of one update cycle, logged when the cycle ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub active_data_feed_count: usize,
    pub pages: usize,
    pub failed_pages: usize,
    pub feeds: usize,
    pub updatable: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub elapsed: Duration,
}

impl CycleStats {
    fn add_batch(&mut self, batch: BatchStats) {
        self.feeds += batch.feeds;
        self.updatable += batch.updatable;
        self.successful += batch.submissions.successful;
        self.failed += batch.submissions.failed;
        self.skipped += batch.submissions.skipped;
    }
}

/// Drives update cycles for one (chain, provider) pair.
#[derive(Clone)]
pub struct UpdateScheduler {
    chain: ChainConfig,
    provider_name: String,
    state: ProcessState,
    registry: FeedRegistryClient,
    submitter: TransactionSubmitter,
    pending: PendingTransactionTracker,
    gas_prices: GasPriceEngine,
}

impl UpdateScheduler {
    pub fn new(state: ProcessState, chain: ChainConfig, provider_name: impl Into<String>, rpc: Arc<dyn ChainRpc>) -> Self {
        let provider_name = provider_name.into();
        Self {
            registry: FeedRegistryClient::new(rpc.clone(), chain.contracts.registry),
            submitter: TransactionSubmitter::new(state.clone(), &chain, provider_name.clone(), rpc),
            pending: PendingTransactionTracker::new(state.clone()),
            gas_prices: GasPriceEngine::new(state.clone()),
            chain,
            provider_name,
            state,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain.chain_id
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// One full pass over the registry.
    ///
    /// The first page also returns the active feed count. Later pages are fetched on the
    /// stagger while earlier pages are already being processed; a failed page is logged and
    /// does not affect its siblings.
    pub async fn run_cycle(&self) -> CycleStats {
        let started = Instant::now();
        let batch_size = self.chain.data_feed_batch_size.max(1);
        let mut stats = CycleStats::default();

        let first = match self.registry.fetch_first_batch(batch_size).await {
            Ok(first) => first,
            Err(e) => {
                warn!(chain_id = self.chain.chain_id, provider = %self.provider_name, "Failed to fetch first registry page: {}", e);
                stats.pages = 1;
                stats.failed_pages = 1;
                stats.elapsed = started.elapsed();
                return stats;
            }
        };
        let count = first.active_data_feed_count;
        let page_count = count.div_ceil(batch_size).max(1);
        let stagger = calculate_stagger(self.chain.data_feed_update_interval(), started.elapsed(), page_count);
        debug!(
            chain_id = self.chain.chain_id,
            provider = %self.provider_name,
            active_data_feed_count = count,
            page_count,
            stagger_ms = stagger.as_millis() as u64,
            "Fetched first registry page"
        );

        let mut active_feeds: HashSet<B256> = first.feeds.iter().map(|feed| feed.data_feed_id).collect();
        let first_page = self.process_batch(first.feeds, unix_now());
        let other_pages = join_all((1..page_count).map(|page| async move {
            tokio::time::sleep(stagger * (page as u32 - 1)).await;
            match self.registry.fetch_batch(page * batch_size, batch_size, count).await {
                Ok(feeds) => {
                    let feed_ids: Vec<B256> = feeds.iter().map(|feed| feed.data_feed_id).collect();
                    Some((feed_ids, self.process_batch(feeds, unix_now()).await))
                }
                Err(e) => {
                    warn!(chain_id = self.chain.chain_id, provider = %self.provider_name, page, "Failed to fetch registry page: {}", e);
                    None
                }
            }
        }));
        let (first_stats, other_stats) = futures::join!(first_page, other_pages);

        stats.active_data_feed_count = count;
        stats.pages = page_count;
        stats.add_batch(first_stats);
        for batch in other_stats {
            match batch {
                Some((feed_ids, batch)) => {
                    active_feeds.extend(feed_ids);
                    stats.add_batch(batch);
                }
                None => stats.failed_pages += 1,
            }
        }
        // A failed page hides its feeds, so records are only pruned after a complete pass
        if stats.failed_pages == 0 {
            self.prune_removed_feeds(&active_feeds);
        }
        stats.elapsed = started.elapsed();
        stats
    }

    /// Evaluates one page of feeds and submits the updatable ones.
    pub async fn process_batch(&self, feeds: Vec<ActiveDataFeed>, now: u64) -> BatchStats {
        self.publish_signed_api_urls(&feeds);

        let snapshot = self.state.get();
        let settings = EvaluationSettings::for_chain(&snapshot.config, &self.chain);
        let updatable = get_updatable_feeds(&feeds, &snapshot.signed_reports, &settings, now);
        drop(snapshot);

        let updatable = self.track_pending(&feeds, updatable, now);
        let submissions = self.submitter.submit_all(&updatable, now).await;
        BatchStats { feeds: feeds.len(), updatable: updatable.len(), submissions }
    }

    fn publish_signed_api_urls(&self, feeds: &[ActiveDataFeed]) {
        let published: Vec<_> = feeds
            .iter()
            .filter(|feed| !feed.signed_api_urls.is_empty())
            .map(|feed| (feed.data_feed_id, feed.signed_api_urls.clone()))
            .collect();
        if published.is_empty() {
            return;
        }
        let key = (self.chain.chain_id, self.provider_name.clone());
        let unchanged = self.state.get().signed_api_urls.get(&key).is_some_and(|known| {
            published.iter().all(|(feed_id, urls)| known.get(feed_id) == Some(urls))
        });
        if unchanged {
            return;
        }
        self.state.update(|draft| draft.signed_api_urls_mut().entry(key).or_default().extend(published));
    }

    /// Marks updatable feeds as pending and clears feeds that no longer need an update.
    /// Feeds whose sponsor wallet cannot be derived are dropped from submission.
    fn track_pending(&self, feeds: &[ActiveDataFeed], updatable: Vec<UpdatableDataFeed>, now: u64) -> Vec<UpdatableDataFeed> {
        let chain_id = self.chain.chain_id;
        let updatable_ids: HashSet<_> = updatable.iter().map(|u| u.feed.data_feed_id).collect();

        for feed in feeds.iter().filter(|feed| !updatable_ids.contains(&feed.data_feed_id)) {
            let cleared = self.pending.clear_feed(chain_id, &self.provider_name, feed.data_feed_id, now);
            self.release_sponsor_wallets(&cleared);
        }

        updatable
            .into_iter()
            .filter(|u| match self.submitter.sponsor_wallet(u) {
                Ok(wallet) => {
                    let key = self.submitter.pending_key(&wallet, u.feed.data_feed_id);
                    self.pending.mark_updatable(&key, u.feed.on_chain_timestamp, now);
                    true
                }
                Err(e) => {
                    error!(feed = %u.feed.label(), "Failed to derive sponsor wallet: {}", e);
                    false
                }
            })
            .collect()
    }

    /// Drops pending records of feeds that left the registry.
    fn prune_removed_feeds(&self, active_feeds: &HashSet<B256>) {
        let dropped = self.pending.retain_feeds(self.chain.chain_id, &self.provider_name, active_feeds);
        if !dropped.is_empty() {
            info!(chain_id = self.chain.chain_id, provider = %self.provider_name, dropped = dropped.len(), "Pruned pending records of removed feeds");
            self.release_sponsor_wallets(&dropped);
        }
    }

    /// Clears the gas price scaling stamp of every wallet in `keys` that no feed waits on anymore.
    fn release_sponsor_wallets(&self, keys: &[PendingKey]) {
        let gas_key = self.submitter.gas_price_key();
        for key in keys {
            if !self.pending.wallet_has_records(self.chain.chain_id, &self.provider_name, key.sponsor_wallet) {
                self.gas_prices.clear_sponsor_last_update(&gas_key, key.sponsor_wallet);
            }
        }
    }

    /// Runs cycles on the update interval after `start_delay`, until `shutdown` flips to true.
    pub async fn run(self, start_delay: Duration, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(start_delay) => {}
            _ = shutdown.changed() => return,
        }
        let mut interval = tokio::time::interval(self.chain.data_feed_update_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(chain_id = self.chain.chain_id, provider = %self.provider_name, "Update loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let scheduler = self.clone();
            match tokio::spawn(async move { scheduler.run_cycle().await }).await {
                Ok(stats) => info!(
                    chain_id = self.chain.chain_id,
                    provider = %self.provider_name,
                    active_data_feed_count = stats.active_data_feed_count,
                    pages = stats.pages,
                    failed_pages = stats.failed_pages,
                    feeds = stats.feeds,
                    updatable = stats.updatable,
                    successful = stats.successful,
                    failed = stats.failed,
                    skipped = stats.skipped,
                    elapsed_ms = stats.elapsed.as_millis() as u64,
                    "Finished update cycle"
                ),
                Err(e) => error!(chain_id = self.chain.chain_id, provider = %self.provider_name, "Update cycle failed: {}", e),
            }
        }

        info!(chain_id = self.chain.chain_id, provider = %self.provider_name, "Update loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{test_chain_config, test_keeper_config};
    use crate::data_sync::registry::tests::registry_handler;
    use crate::data_sync::signed_data::SignedReportStore;
    use crate::data_sync::signed_data::tests::{sign_report, test_signer};
    use crate::execution::rpc::mock::MockChainRpc;
    use crate::logic::updatability::tests::{int, ten_percent_parameters, test_feed};

    #[test]
    fn test_calculate_stagger() {
        let interval = Duration::from_secs(30);
        assert_eq!(calculate_stagger(interval, Duration::from_secs(1), 1), Duration::ZERO);
        assert_eq!(calculate_stagger(interval, Duration::from_secs(1), 2), Duration::ZERO);
        assert_eq!(calculate_stagger(interval, Duration::from_secs(30), 5), Duration::ZERO);
        assert_eq!(calculate_stagger(interval, Duration::from_secs(1), 3), Duration::from_secs(10));
        assert_eq!(calculate_stagger(interval, Duration::from_secs(14), 3), Duration::from_secs(8));
    }

    #[test]
    fn test_provider_offset() {
        let interval = Duration::from_secs(30);
        assert_eq!(provider_offset(interval, 3, 0), Duration::ZERO);
        assert_eq!(provider_offset(interval, 3, 2), Duration::from_secs(20));
        assert_eq!(provider_offset(interval, 0, 0), Duration::ZERO);
    }

    /// Five single-beacon feeds signed by the test signer, all stale on chain.
    fn setup(failing: Vec<usize>) -> (UpdateScheduler, MockChainRpc, ProcessState, Vec<ActiveDataFeed>) {
        let now = unix_now();
        let signer = test_signer();
        let feeds: Vec<ActiveDataFeed> = (1..=5u8)
            .map(|i| {
                let mut feed = test_feed(&signer, &[(B256::repeat_byte(i), 500, now - 100)], 500, now - 100, ten_percent_parameters(86_400));
                feed.signed_api_urls = vec![format!("https://signed-api-{i}.example")];
                feed
            })
            .collect();

        let state = ProcessState::new(test_keeper_config());
        let store = SignedReportStore::new(state.clone());
        let reports = (1..=5u8).map(|i| sign_report(&signer, B256::repeat_byte(i), now - 5, 600)).collect();
        assert_eq!(store.save_verified(reports, now), 5);

        let rpc = MockChainRpc::with_call_handler(registry_handler(feeds.clone(), failing));
        let chain = ChainConfig { data_feed_update_interval_secs: 1, ..test_chain_config() };
        let scheduler = UpdateScheduler::new(state.clone(), chain, "local", Arc::new(rpc.clone()));
        (scheduler, rpc, state, feeds)
    }

    #[tokio::test]
    async fn test_cycle_updates_every_page() {
        let (scheduler, rpc, state, feeds) = setup(vec![]);

        let stats = scheduler.run_cycle().await;
        assert_eq!(stats.active_data_feed_count, 5);
        assert_eq!(stats.pages, 3);
        assert_eq!(stats.failed_pages, 0);
        assert_eq!(stats.feeds, 5);
        assert_eq!(stats.updatable, 5);
        assert_eq!(stats.successful, 5);
        assert_eq!(rpc.sent().len(), 5);

        let snapshot = state.get();
        assert_eq!(snapshot.pending_transactions.len(), 5);
        assert_eq!(snapshot.signed_api_urls[&(31337, "local".to_string())].len(), 5);
        assert_eq!(snapshot.published_signed_api_urls().len(), feeds.len());
    }

    #[tokio::test]
    async fn test_failed_page_does_not_abort_siblings() {
        let (scheduler, rpc, _, _) = setup(vec![3]);

        let stats = scheduler.run_cycle().await;
        assert_eq!(stats.pages, 3);
        assert_eq!(stats.failed_pages, 1);
        assert_eq!(stats.feeds, 3);
        assert_eq!(rpc.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_first_page_ends_cycle() {
        let (_, _, state, _) = setup(vec![]);
        let rpc = MockChainRpc::default();
        let scheduler = UpdateScheduler::new(state, test_chain_config(), "local", Arc::new(rpc.clone()));

        let stats = scheduler.run_cycle().await;
        assert_eq!(stats.failed_pages, 1);
        assert_eq!(stats.feeds, 0);
        assert!(rpc.sent().is_empty());
    }

    #[tokio::test]
    async fn test_pending_records_follow_updatability() {
        let (scheduler, _, state, feeds) = setup(vec![]);
        let now = unix_now();

        scheduler.process_batch(feeds[..2].to_vec(), now).await;
        scheduler.process_batch(feeds[..2].to_vec(), now + 10).await;
        let records: Vec<_> = state.get().pending_transactions.values().copied().collect();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| record.consecutively_updatable_count == 2));
        assert!(!state.get().gas_prices.values().all(|gas| gas.sponsor_last_update.is_empty()));

        // The update landed: the on-chain data now matches the signed data
        let landed: Vec<ActiveDataFeed> = feeds[..2]
            .iter()
            .map(|feed| {
                let mut feed = feed.clone();
                feed.on_chain_value = int(600);
                feed.on_chain_timestamp = now - 5;
                for beacon in &mut feed.beacons {
                    beacon.value = feed.on_chain_value;
                    beacon.timestamp = now - 5;
                }
                feed
            })
            .collect();
        let stats = scheduler.process_batch(landed, now + 20).await;
        assert_eq!(stats.updatable, 0);
        assert!(state.get().pending_transactions.is_empty());
        assert!(state.get().gas_prices.values().all(|gas| gas.sponsor_last_update.is_empty()));
    }

    fn sponsor_stamp_count(state: &ProcessState) -> usize {
        state.get().gas_prices.values().map(|gas| gas.sponsor_last_update.len()).sum()
    }

    #[tokio::test]
    async fn test_removed_feeds_are_pruned() {
        let (scheduler, _, state, feeds) = setup(vec![]);
        scheduler.run_cycle().await;
        assert_eq!(state.get().pending_transactions.len(), 5);
        assert_eq!(sponsor_stamp_count(&state), 5);

        // Two feeds are deregistered
        let rpc = MockChainRpc::with_call_handler(registry_handler(feeds[..3].to_vec(), vec![]));
        let chain = ChainConfig { data_feed_update_interval_secs: 1, ..test_chain_config() };
        let scheduler = UpdateScheduler::new(state.clone(), chain, "local", Arc::new(rpc));
        let stats = scheduler.run_cycle().await;
        assert_eq!(stats.failed_pages, 0);

        let snapshot = state.get();
        let pending_feeds: HashSet<B256> = snapshot.pending_transactions.keys().map(|key| key.feed_id).collect();
        let expected: HashSet<B256> = feeds[..3].iter().map(|feed| feed.data_feed_id).collect();
        assert_eq!(pending_feeds, expected);
        assert_eq!(sponsor_stamp_count(&state), 3);
    }

    #[tokio::test]
    async fn test_failed_page_keeps_records() {
        let (scheduler, _, state, feeds) = setup(vec![]);
        scheduler.run_cycle().await;
        assert_eq!(state.get().pending_transactions.len(), 5);

        let rpc = MockChainRpc::with_call_handler(registry_handler(feeds, vec![3]));
        let chain = ChainConfig { data_feed_update_interval_secs: 1, ..test_chain_config() };
        let scheduler = UpdateScheduler::new(state.clone(), chain, "local", Arc::new(rpc));
        let stats = scheduler.run_cycle().await;
        assert_eq!(stats.failed_pages, 1);
        assert_eq!(state.get().pending_transactions.len(), 5);
        assert_eq!(sponsor_stamp_count(&state), 5);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (scheduler, _, _, _) = setup(vec![]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(Duration::ZERO, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
