use alloy_transport::{RpcError, TransportErrorKind};
use eyre::Report;
use std::time::Duration;

/// Revert reason emitted by the feed server when the submitted data is not newer than what is on-chain.
pub const BENIGN_TIMESTAMP_RACE: &str = "Does not update timestamp";

#[derive(Debug, thiserror::Error)]
pub enum KeeperError {
    // RPC
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: &'static str, timeout: Duration },
    #[error("replacement transaction underpriced: {0}")]
    ReplacementUnderpriced(String),
    #[error(transparent)]
    Transport(#[from] RpcError<TransportErrorKind>),

    // Signed API
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    // Data quality
    #[error("invalid signed data: {0}")]
    InvalidSignedData(String),
    #[error("abi decode error: {0}")]
    Decode(#[from] alloy_sol_types::Error),
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error(transparent)]
    InternalEyre(Report),
}

impl KeeperError {
    /// Classifies a raw transaction submission error message.
    pub fn from_submission_message(message: String) -> Self {
        let lowercase = message.to_lowercase();
        if lowercase.contains("replacement transaction underpriced") || message.contains("REPLACEMENT_UNDERPRICED") {
            Self::ReplacementUnderpriced(message)
        } else {
            Self::Rpc(message)
        }
    }

    /// True when the error indicates another submitter already advanced the on-chain timestamp.
    pub fn is_benign_race(&self) -> bool {
        self.to_string().contains(BENIGN_TIMESTAMP_RACE)
    }

    pub fn is_replacement_underpriced(&self) -> bool {
        matches!(self, Self::ReplacementUnderpriced(_))
    }
}

impl From<Report> for KeeperError {
    fn from(error: Report) -> Self {
        Self::InternalEyre(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_message_classification() {
        let err = KeeperError::from_submission_message("error code -32000: replacement transaction underpriced".to_string());
        assert!(err.is_replacement_underpriced());

        let err = KeeperError::from_submission_message("REPLACEMENT_UNDERPRICED".to_string());
        assert!(err.is_replacement_underpriced());

        let err = KeeperError::from_submission_message("nonce too low".to_string());
        assert!(!err.is_replacement_underpriced());
    }

    #[test]
    fn test_benign_race_detection() {
        let err = KeeperError::Rpc("execution reverted: Does not update timestamp".to_string());
        assert!(err.is_benign_race());
        assert!(!KeeperError::Rpc("execution reverted: Signature mismatch".to_string()).is_benign_race());
    }
}
