/// Fixed-point unit for deviation percentages: 1e8 represents 100%.
pub const HUNDRED_PERCENT: u64 = 100_000_000;

/// Signed reports older than this are purged and never used for decisions.
pub const SIGNED_DATA_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Signed reports further than this in the future are rejected outright.
pub const SIGNED_DATA_MAX_FUTURE_SECS: u64 = 60 * 60;

/// Fixed-point scale used when applying configured multipliers to on-chain integers.
pub const MULTIPLIER_SCALE: u64 = 1_000_000;

/// BIP-44 prefix for sponsor wallets, followed by the protocol id and the sponsor address chunks.
pub const SPONSOR_WALLET_PATH_PREFIX: &str = "m/44'/60'/0'";
pub const SPONSOR_WALLET_PROTOCOL_ID: u32 = 5;

