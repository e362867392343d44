use crate::config::KeeperConfig;
use crate::data_sync::signed_api::SignedApiFetcher;
use crate::data_sync::verifier_pool::VerifierPool;
use crate::execution::rpc::{AlloyChainRpc, ChainRpc};
use crate::scheduler::update_scheduler::{UpdateScheduler, provider_offset};
use crate::state::ProcessState;
use crate::utils::config_loader::KeeperConfigLoader;
use eyre::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The keeper process: one signed data fetch loop plus one update loop per (chain, provider).
pub struct KeeperService {
    state: ProcessState,
    fetcher: SignedApiFetcher,
    schedulers: Vec<(UpdateScheduler, std::time::Duration)>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl KeeperService {
    pub fn new(config: KeeperConfig) -> Result<Self> {
        config.validate()?;
        let state = ProcessState::new(config.clone());
        let verifier = VerifierPool::new(config.verifier_workers)?;
        let fetcher = SignedApiFetcher::new(state.clone(), verifier)?;

        let mut schedulers = Vec::new();
        for chain in &config.chains {
            for (index, provider) in chain.providers.iter().enumerate() {
                let rpc: Arc<dyn ChainRpc> = Arc::new(AlloyChainRpc::new(&provider.url, chain.rpc_timeout())?);
                let offset = provider_offset(chain.data_feed_update_interval(), chain.providers.len(), index);
                schedulers.push((UpdateScheduler::new(state.clone(), chain.clone(), provider.name.clone(), rpc), offset));
            }
        }

        let (shutdown_tx, _) = watch::channel(false);
        info!(chains = config.chains.len(), update_loops = schedulers.len(), "Initialized keeper");
        Ok(Self { state, fetcher, schedulers, tasks: Vec::new(), shutdown_tx })
    }

    /// Spawns every loop. Calling it twice is an error.
    pub fn start(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            return Err(eyre::eyre!("KeeperService already started"));
        }
        self.tasks.push(tokio::spawn(self.fetcher.clone().run(self.shutdown_tx.subscribe())));
        for (scheduler, offset) in &self.schedulers {
            self.tasks.push(tokio::spawn(scheduler.clone().run(*offset, self.shutdown_tx.subscribe())));
        }
        info!(tasks = self.tasks.len(), "Keeper started");
        Ok(())
    }

    /// Signals every loop to stop and waits for them. In-flight cycles finish first.
    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping keeper");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Keeper task error during shutdown: {}", e);
            }
        }
        info!("Keeper stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().any(|task| !task.is_finished())
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    pub fn update_loop_count(&self) -> usize {
        self.schedulers.len()
    }
}

impl Drop for KeeperService {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("KeeperService dropped while running, signalling shutdown");
            let _ = self.shutdown_tx.send(true);
        }
    }
}

#[derive(Default)]
pub struct KeeperServiceBuilder {
    config: Option<KeeperConfig>,
    config_file: Option<String>,
}

impl KeeperServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: KeeperConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_config_file(mut self, path: impl Into<String>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// An explicit config wins over a config file.
    pub async fn build(self) -> Result<KeeperService> {
        let config = match (self.config, self.config_file) {
            (Some(config), _) => config,
            (None, Some(path)) => KeeperConfig::load_from_file(path).await?,
            (None, None) => return Err(eyre::eyre!("no keeper configuration given")),
        };
        KeeperService::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::config::tests::{test_chain_config, test_keeper_config};
    use std::time::Duration;

    #[tokio::test]
    async fn test_builder_requires_config() {
        assert!(KeeperServiceBuilder::new().build().await.is_err());
        assert!(KeeperServiceBuilder::new().with_config_file("/nonexistent/keeper.toml").build().await.is_err());
    }

    #[tokio::test]
    async fn test_one_update_loop_per_provider() {
        let mut chain = test_chain_config();
        chain.providers.push(ProviderConfig { name: "backup".to_string(), url: "http://127.0.0.1:8546".to_string() });
        let config = KeeperConfig { chains: vec![chain], ..test_keeper_config() };

        let service = KeeperServiceBuilder::new().with_config(config).build().await.unwrap();
        assert_eq!(service.update_loop_count(), 2);
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let config = KeeperConfig { chains: vec![], ..test_keeper_config() };
        let mut service = KeeperService::new(config).unwrap();

        service.start().unwrap();
        assert!(service.is_running());
        assert!(service.start().is_err());

        tokio::time::timeout(Duration::from_secs(5), service.stop()).await.unwrap().unwrap();
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut chain = test_chain_config();
        chain.data_feed_batch_size = 0;
        let config = KeeperConfig { chains: vec![chain], ..test_keeper_config() };
        assert!(KeeperService::new(config).is_err());
    }
}
