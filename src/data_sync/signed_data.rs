use crate::keeper_error::KeeperError;
use crate::logic::types::derive_beacon_id;
use crate::state::{KeeperState, ProcessState};
use crate::utils::constants::{SIGNED_DATA_MAX_FUTURE_SECS, SIGNED_DATA_RETENTION_SECS};
use crate::utils::unix_now;
use alloy_primitives::{Address, B256, Bytes, I256, Signature, U256, keccak256};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A signed off-chain report as served by a signed API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedReport {
    #[serde(alias = "airnode")]
    pub reporter_address: Address,
    pub template_id: B256,
    /// Unix seconds, string encoded
    pub timestamp: String,
    /// ABI encoded int224
    pub encoded_value: Bytes,
    pub signature: Bytes,
}

impl SignedReport {
    pub fn beacon_id(&self) -> B256 {
        derive_beacon_id(self.reporter_address, self.template_id)
    }

    pub fn timestamp_secs(&self) -> Result<u64, KeeperError> {
        self.timestamp
            .parse::<u64>()
            .map_err(|e| KeeperError::InvalidSignedData(format!("timestamp {:?}: {}", self.timestamp, e)))
    }

    /// Decodes the ABI encoded int224 value.
    pub fn value(&self) -> Result<I256, KeeperError> {
        decode_int224(&self.encoded_value)
    }

    /// keccak256(abi.encodePacked(templateId, timestamp, encodedValue)), the message the reporter signs.
    pub fn digest(&self) -> Result<B256, KeeperError> {
        let timestamp = U256::from(self.timestamp_secs()?);
        let mut packed = Vec::with_capacity(64 + self.encoded_value.len());
        packed.extend_from_slice(self.template_id.as_slice());
        packed.extend_from_slice(&timestamp.to_be_bytes::<32>());
        packed.extend_from_slice(&self.encoded_value);
        Ok(keccak256(packed))
    }

    /// Recovers the EIP-191 signer of the digest.
    pub fn recover_signer(&self) -> Result<Address, KeeperError> {
        let digest = self.digest()?;
        let signature = Signature::try_from(self.signature.as_ref())
            .map_err(|e| KeeperError::InvalidSignedData(format!("signature: {e}")))?;
        signature
            .recover_address_from_msg(digest.as_slice())
            .map_err(|e| KeeperError::InvalidSignedData(format!("signer recovery: {e}")))
    }

    /// Signature-only check.
    pub fn has_valid_signature(&self) -> bool {
        matches!(self.recover_signer(), Ok(signer) if signer == self.reporter_address)
    }

    pub fn is_fresh(&self, now: u64) -> bool {
        self.timestamp_secs()
            .map(|timestamp| is_timestamp_fresh(timestamp, now))
            .unwrap_or(false)
    }
}

pub fn is_timestamp_fresh(timestamp: u64, now: u64) -> bool {
    timestamp > now.saturating_sub(SIGNED_DATA_RETENTION_SECS)
}

/// Decodes a 32 byte two's complement word that must fit into int224.
pub fn decode_int224(encoded: &[u8]) -> Result<I256, KeeperError> {
    if encoded.len() != 32 {
        return Err(KeeperError::Malformed { what: "int224 value", reason: format!("expected 32 bytes, got {}", encoded.len()) });
    }
    let value = I256::from_raw(U256::from_be_slice(encoded));
    let bound = I256::from_raw(U256::from(1u8) << 223usize);
    if value >= bound || value < -bound {
        return Err(KeeperError::Malformed { what: "int224 value", reason: format!("{value} out of range") });
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampCheck {
    Valid,
    /// Accepted, but ahead of the local clock
    SlightlyInFuture,
    TooFarInFuture,
    Stale,
}

pub fn check_timestamp(timestamp: u64, now: u64) -> TimestampCheck {
    if timestamp > now + SIGNED_DATA_MAX_FUTURE_SECS {
        TimestampCheck::TooFarInFuture
    } else if timestamp > now {
        TimestampCheck::SlightlyInFuture
    } else if !is_timestamp_fresh(timestamp, now) {
        TimestampCheck::Stale
    } else {
        TimestampCheck::Valid
    }
}

/// Keeps the freshest verified signed report per beacon inside the process state.
#[derive(Clone)]
pub struct SignedReportStore {
    state: ProcessState,
}

impl SignedReportStore {
    pub fn new(state: ProcessState) -> Self {
        Self { state }
    }

    /// Full check: signature plus the future-timestamp bound.
    pub fn verify(report: &SignedReport, now: u64) -> bool {
        if !report.has_valid_signature() {
            warn!(beacon_id = %report.beacon_id(), reporter = %report.reporter_address, "Signed data has an invalid signature");
            return false;
        }
        Self::accepts_timestamp(report, now)
    }

    fn accepts_timestamp(report: &SignedReport, now: u64) -> bool {
        let timestamp = match report.timestamp_secs() {
            Ok(timestamp) => timestamp,
            Err(e) => {
                warn!(beacon_id = %report.beacon_id(), "Dropping signed data: {}", e);
                return false;
            }
        };
        match check_timestamp(timestamp, now) {
            TimestampCheck::Valid => true,
            TimestampCheck::SlightlyInFuture => {
                warn!(beacon_id = %report.beacon_id(), timestamp, now, "Signed data timestamp is in the future");
                true
            }
            TimestampCheck::TooFarInFuture => {
                warn!(beacon_id = %report.beacon_id(), timestamp, now, "Dropping signed data too far in the future");
                false
            }
            TimestampCheck::Stale => {
                debug!(beacon_id = %report.beacon_id(), timestamp, now, "Dropping stale signed data");
                false
            }
        }
    }

    /// Verifies and stores a single report. Returns whether the stored entry changed.
    pub fn save(&self, report: SignedReport) -> bool {
        let now = unix_now();
        if !Self::verify(&report, now) {
            return false;
        }
        self.save_verified(vec![report], now) == 1
    }

    /// Stores reports whose signatures were already checked (e.g. by the verifier pool).
    /// Timestamp bounds are still applied per report. Returns how many entries changed.
    pub fn save_verified(&self, reports: Vec<SignedReport>, now: u64) -> usize {
        let accepted: Vec<(B256, u64, SignedReport)> = reports
            .into_iter()
            .filter(|report| Self::accepts_timestamp(report, now))
            .filter_map(|report| report.timestamp_secs().ok().map(|timestamp| (report.beacon_id(), timestamp, report)))
            .collect();
        if accepted.is_empty() {
            return 0;
        }

        let mut changed = 0;
        self.state.update(|draft| {
            for (beacon_id, timestamp, report) in accepted {
                if insert_if_newer(draft, beacon_id, timestamp, report) {
                    changed += 1;
                }
            }
        });
        changed
    }

    pub fn get(&self, beacon_id: &B256) -> Option<SignedReport> {
        self.state.get().signed_reports.get(beacon_id).cloned()
    }

    /// Drops every report older than the retention window. Returns the number removed.
    pub fn purge_stale(&self, now: u64) -> usize {
        let snapshot = self.state.get();
        let stale = snapshot.signed_reports.values().filter(|report| !report.is_fresh(now)).count();
        if stale == 0 {
            return 0;
        }

        let mut removed = 0;
        self.state.update(|draft| {
            let before = draft.signed_reports.len();
            draft.signed_reports_mut().retain(|_, report| report.is_fresh(now));
            removed = before - draft.signed_reports.len();
        });
        debug!("Purged {} stale signed reports", removed);
        removed
    }
}

fn insert_if_newer(draft: &mut KeeperState, beacon_id: B256, timestamp: u64, report: SignedReport) -> bool {
    let is_newer = match draft.signed_reports.get(&beacon_id) {
        Some(existing) => existing.timestamp_secs().map(|stored| stored < timestamp).unwrap_or(true),
        None => true,
    };
    if is_newer {
        draft.signed_reports_mut().insert(beacon_id, report);
    }
    is_newer
}
