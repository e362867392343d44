/// Execution Layer
///
/// This layer is responsible for:
/// - The JSON-RPC seam towards chain providers
/// - Gas price sanitization and retry scaling
/// - Sponsor wallet derivation
/// - Building, pricing and sending update transactions

pub mod gas_price;
pub mod rpc;
pub mod sponsor_wallet;
pub mod transaction_submitter;

// Re-export key components from the execution layer
pub use gas_price::{GasPriceEngine, GasPriceKey, GasPriceSample, GasPriceState};
pub use rpc::{AlloyChainRpc, ChainRpc, SubmissionRequest};
pub use sponsor_wallet::{DerivedSponsorWallet, SponsorWalletCache};
pub use transaction_submitter::{SubmissionStats, TransactionSubmitter, build_calldata};
