/// Data Layer
///
/// Everything the keeper reads from the outside world:
///
/// - Signed data pulled from signed APIs and verified off the async runtime
/// - The freshest verified report per beacon
/// - Paginated reads of the on-chain feed registry
pub mod contracts;
pub mod registry;
pub mod signed_api;
pub mod signed_data;
pub mod verifier_pool;

#[cfg(test)]
mod tests;

pub use registry::{FeedRegistryClient, FirstBatch};
pub use signed_api::{SignedApiFetcher, parse_signed_api_response};
pub use signed_data::{SignedReport, SignedReportStore};
pub use verifier_pool::{VerificationOutcome, VerifierPool};
