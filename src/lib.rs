// Three-Layer Architecture
pub mod data_sync; // Data Layer: signed data ingestion, verification, registry reads
pub mod logic; // Logic Layer: deviation math, updatability, pending bookkeeping
pub mod execution; // Execution Layer: gas pricing, sponsor wallets, transaction submission

// Orchestration
pub mod scheduler;
pub mod service;

// Process-wide configuration, state and errors
pub mod config;
pub mod keeper_error;
pub mod state;
pub mod utils;

pub use config::{ChainConfig, GasSettings, IndividualBeaconUpdateSettings, KeeperConfig, WalletDerivationScheme};
pub use data_sync::{FeedRegistryClient, SignedApiFetcher, SignedReport, SignedReportStore, VerifierPool};
pub use execution::{ChainRpc, GasPriceEngine, SponsorWalletCache, TransactionSubmitter};
pub use keeper_error::KeeperError;
pub use logic::{ActiveDataFeed, PendingTransactionTracker, UpdatableDataFeed, UpdateReason, get_updatable_feeds};
pub use scheduler::{CycleStats, UpdateScheduler};
pub use service::{KeeperService, KeeperServiceBuilder};
pub use state::{KeeperState, ProcessState};
