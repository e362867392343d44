use super::signed_data::SignedReport;
use crate::keeper_error::KeeperError;
use alloy_primitives::B256;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Outcome of verifying one signed API response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified(Vec<SignedReport>),
    /// The first report whose signature does not match its reporter
    Rejected(SignedReport),
}

impl VerificationOutcome {
    pub fn beacon_ids(&self) -> Vec<B256> {
        match self {
            Self::Verified(reports) => reports.iter().map(SignedReport::beacon_id).collect(),
            Self::Rejected(_) => Vec::new(),
        }
    }
}

/// Signature verification on a dedicated rayon pool, off the tokio workers.
///
/// The pool always has at least one thread. Queued batches are bounded by a semaphore and run
/// in FIFO order.
#[derive(Clone)]
pub struct VerifierPool {
    pool: Arc<ThreadPool>,
    semaphore: Arc<Semaphore>,
    workers: usize,
}

/// One core is left to the async runtime.
pub fn default_worker_count() -> usize {
    let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    cores.saturating_sub(1).max(1)
}

impl VerifierPool {
    pub fn new(workers: Option<usize>) -> Result<Self, KeeperError> {
        let workers = workers.unwrap_or_else(default_worker_count).max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("signature-verifier-{index}"))
            .build()
            .map_err(|e| KeeperError::InternalEyre(eyre::eyre!("failed to build verifier pool: {e}")))?;
        debug!(workers, "Started signature verifier pool");
        Ok(Self { pool: Arc::new(pool), semaphore: Arc::new(Semaphore::new(workers * 2)), workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// All-or-nothing check of a batch: any invalid signature rejects the whole batch.
    pub async fn verify_batch(&self, reports: Vec<SignedReport>) -> Result<VerificationOutcome, KeeperError> {
        if reports.is_empty() {
            return Ok(VerificationOutcome::Verified(reports));
        }
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| KeeperError::InternalEyre(eyre::eyre!("verifier pool closed: {e}")))?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        // Runs on a pool thread, so the parallel search below stays inside the verifier pool
        self.pool.spawn_fifo(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                let offending = reports.par_iter().position_first(|report| !report.has_valid_signature());
                match offending {
                    Some(index) => VerificationOutcome::Rejected(reports[index].clone()),
                    None => VerificationOutcome::Verified(reports),
                }
            }));
            let _ = tx.send(result);
        });

        let outcome = rx
            .await
            .map_err(|_| KeeperError::InternalEyre(eyre::eyre!("verifier worker dropped the batch")))?
            .map_err(|_| KeeperError::InternalEyre(eyre::eyre!("verifier worker panicked")))?;
        if let VerificationOutcome::Rejected(report) = &outcome {
            warn!(beacon_id = %report.beacon_id(), reporter = %report.reporter_address, "Rejecting batch with an invalid signature");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sync::signed_data::tests::{encode_int224, sign_report, test_signer};

    fn batch(size: u8) -> Vec<SignedReport> {
        let signer = test_signer();
        (0..size).map(|i| sign_report(&signer, B256::repeat_byte(i), 1_700_000_000, i64::from(i))).collect()
    }

    #[test]
    fn test_pool_has_at_least_one_worker() {
        assert!(default_worker_count() >= 1);
        assert_eq!(VerifierPool::new(Some(0)).unwrap().workers(), 1);
        assert_eq!(VerifierPool::new(Some(3)).unwrap().workers(), 3);
    }

    #[tokio::test]
    async fn test_verifies_valid_batch() {
        let pool = VerifierPool::new(Some(2)).unwrap();
        let reports = batch(8);
        let expected_ids: Vec<B256> = reports.iter().map(SignedReport::beacon_id).collect();

        let outcome = pool.verify_batch(reports.clone()).await.unwrap();
        assert_eq!(outcome, VerificationOutcome::Verified(reports));
        assert_eq!(outcome.beacon_ids(), expected_ids);
    }

    #[tokio::test]
    async fn test_rejects_whole_batch_on_first_invalid_report() {
        let pool = VerifierPool::new(Some(1)).unwrap();
        let mut reports = batch(6);
        reports[2].encoded_value = encode_int224(999);
        reports[4].encoded_value = encode_int224(999);

        let outcome = pool.verify_batch(reports.clone()).await.unwrap();
        assert_eq!(outcome, VerificationOutcome::Rejected(reports[2].clone()));
        assert!(outcome.beacon_ids().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_batches() {
        let pool = VerifierPool::new(Some(1)).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.verify_batch(batch(4)).await })
            })
            .collect();
        for handle in handles {
            assert!(matches!(handle.await.unwrap().unwrap(), VerificationOutcome::Verified(_)));
        }
        assert_eq!(pool.verify_batch(Vec::new()).await.unwrap(), VerificationOutcome::Verified(vec![]));
    }
}
