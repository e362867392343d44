use super::signed_data::{SignedReport, SignedReportStore};
use super::verifier_pool::{VerificationOutcome, VerifierPool};
use crate::keeper_error::KeeperError;
use crate::state::ProcessState;
use crate::utils::unix_now;
use futures::future::join_all;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Body of `GET <signed api url>`.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedApiResponse {
    pub count: usize,
    pub data: BTreeMap<String, SignedReport>,
}

/// Parses and schema-checks a response. Any violation discards the whole response.
pub fn parse_signed_api_response(body: &[u8]) -> Result<Vec<SignedReport>, KeeperError> {
    let response: SignedApiResponse = serde_json::from_slice(body)
        .map_err(|e| KeeperError::Malformed { what: "signed API response", reason: e.to_string() })?;
    if response.count != response.data.len() {
        return Err(KeeperError::Malformed {
            what: "signed API response",
            reason: format!("count {} does not match {} entries", response.count, response.data.len()),
        });
    }
    Ok(response.data.into_values().collect())
}

/// Delay between consecutive URL fetches so a cycle spreads its requests over the interval.
pub fn url_stagger(interval: Duration, url_count: usize) -> Duration {
    match u32::try_from(url_count) {
        Ok(count) if count > 0 => interval / count,
        _ => Duration::ZERO,
    }
}

/// Periodically pulls signed data from every known signed API and stores the verified reports.
#[derive(Clone)]
pub struct SignedApiFetcher {
    http: reqwest::Client,
    state: ProcessState,
    store: SignedReportStore,
    verifier: VerifierPool,
}

impl SignedApiFetcher {
    pub fn new(state: ProcessState, verifier: VerifierPool) -> Result<Self, KeeperError> {
        let config = state.config();
        let http = reqwest::Client::builder()
            .user_agent(concat!("feed-keeper/", env!("CARGO_PKG_VERSION")))
            .timeout(config.http_timeout())
            .build()?;
        Ok(Self { http, store: SignedReportStore::new(state.clone()), state, verifier })
    }

    /// Configured URLs plus, when enabled, the ones published by the registries. Deduplicated.
    pub fn urls(&self) -> Vec<String> {
        let snapshot = self.state.get();
        let mut urls = snapshot.config.signed_api_urls.clone();
        if snapshot.config.use_signed_api_urls_from_contract {
            urls.extend(snapshot.published_signed_api_urls());
        }
        urls.sort();
        urls.dedup();
        urls
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<SignedReport>, KeeperError> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        parse_signed_api_response(&body)
    }

    /// Fetches, verifies and stores one URL. Returns the number of stored entries that changed.
    pub async fn fetch_and_store(&self, url: &str) -> Result<usize, KeeperError> {
        let reports = self.fetch(url).await?;
        let received = reports.len();
        match self.verifier.verify_batch(reports).await? {
            VerificationOutcome::Verified(reports) => {
                let changed = self.store.save_verified(reports, unix_now());
                debug!(url, received, changed, "Stored signed data");
                Ok(changed)
            }
            VerificationOutcome::Rejected(report) => Err(KeeperError::InvalidSignedData(format!(
                "response contains an invalid signature for beacon {}",
                report.beacon_id()
            ))),
        }
    }

    /// One pass over every URL, staggered across the fetch interval, then a purge of stale data.
    pub async fn run_cycle(&self) {
        let started = Instant::now();
        let urls = self.urls();
        let stagger = url_stagger(self.state.config().signed_data_fetch_interval(), urls.len());

        let fetches = urls.iter().enumerate().map(|(i, url)| async move {
            tokio::time::sleep(stagger * i as u32).await;
            match self.fetch_and_store(url).await {
                Ok(changed) => Some(changed),
                Err(e) => {
                    warn!(%url, "Failed to fetch signed data: {}", e);
                    None
                }
            }
        });
        let results = join_all(fetches).await;

        let purged = self.store.purge_stale(unix_now());
        let failed = results.iter().filter(|result| result.is_none()).count();
        let changed: usize = results.into_iter().flatten().sum();
        info!(
            urls = urls.len(),
            failed,
            changed,
            purged,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished signed data fetch cycle"
        );
    }

    /// Runs cycles on the fetch interval until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.state.config().signed_data_fetch_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Signed data fetch loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let fetcher = self.clone();
            // A panicking cycle must not end the loop
            if let Err(e) = tokio::spawn(async move { fetcher.run_cycle().await }).await {
                error!("Signed data fetch cycle failed: {}", e);
            }
        }

        info!("Signed data fetch loop stopped");
    }
}
