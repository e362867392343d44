use crate::config::WalletDerivationScheme;
use crate::keeper_error::KeeperError;
use crate::logic::types::ActiveDataFeed;
use crate::state::ProcessState;
use crate::utils::constants::{SPONSOR_WALLET_PATH_PREFIX, SPONSOR_WALLET_PROTOCOL_ID};
use alloy_primitives::{Address, B256, U256, keccak256};
use alloy_signer_local::{MnemonicBuilder, PrivateKeySigner, coins_bip39::English};
use std::fmt;
use tracing::debug;

/// A sponsor wallet derived from the keeper mnemonic.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedSponsorWallet {
    pub sponsor_address: Address,
    pub wallet_address: Address,
    private_key: B256,
}

impl fmt::Debug for DerivedSponsorWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedSponsorWallet")
            .field("sponsor_address", &self.sponsor_address)
            .field("wallet_address", &self.wallet_address)
            .finish_non_exhaustive()
    }
}

impl DerivedSponsorWallet {
    pub fn signer(&self) -> Result<PrivateKeySigner, KeeperError> {
        PrivateKeySigner::from_bytes(&self.private_key)
            .map_err(|e| KeeperError::Malformed { what: "sponsor wallet key", reason: e.to_string() })
    }
}

fn address_from_hash(hash: B256) -> Address {
    Address::from_slice(&hash[..20])
}

/// The address whose wallet pays for updates of `feed` under the given scheme.
pub fn derive_sponsor_address(scheme: &WalletDerivationScheme, feed: &ActiveDataFeed) -> Address {
    let dapi_name_or_data_feed_id = feed.dapi_name_or_data_feed_id();
    match scheme {
        WalletDerivationScheme::Managed => address_from_hash(keccak256(dapi_name_or_data_feed_id)),
        WalletDerivationScheme::SelfFunded => {
            let mut preimage = dapi_name_or_data_feed_id.to_vec();
            preimage.extend_from_slice(&feed.encoded_update_parameters);
            address_from_hash(keccak256(preimage))
        }
        WalletDerivationScheme::Fixed { sponsor_address } => *sponsor_address,
    }
}

/// `m/44'/60'/0'/<protocol>/<six 31 bit chunks of the sponsor address, least significant first>`
pub fn derive_wallet_path(sponsor_address: Address) -> String {
    let mask = U256::from(u32::MAX >> 1);
    let value = U256::from_be_slice(sponsor_address.as_slice());
    let chunks: Vec<String> = (0..6usize)
        .map(|i| ((value >> (31 * i)) & mask).to_string())
        .collect();
    format!("{SPONSOR_WALLET_PATH_PREFIX}/{SPONSOR_WALLET_PROTOCOL_ID}/{}", chunks.join("/"))
}

pub fn derive_sponsor_wallet(mnemonic: &str, sponsor_address: Address) -> Result<DerivedSponsorWallet, KeeperError> {
    let path = derive_wallet_path(sponsor_address);
    let signer = MnemonicBuilder::<English>::default()
        .phrase(mnemonic)
        .derivation_path(&path)
        .and_then(|builder| builder.build())
        .map_err(|e| KeeperError::Malformed { what: "sponsor wallet", reason: format!("{path}: {e}") })?;
    Ok(DerivedSponsorWallet {
        sponsor_address,
        wallet_address: signer.address(),
        private_key: B256::from_slice(&signer.to_bytes()[..]),
    })
}

/// Derives sponsor wallets and caches them in the process state by sponsor address.
#[derive(Clone)]
pub struct SponsorWalletCache {
    state: ProcessState,
}

impl SponsorWalletCache {
    pub fn new(state: ProcessState) -> Self {
        Self { state }
    }

    pub fn sponsor_address(&self, feed: &ActiveDataFeed) -> Address {
        derive_sponsor_address(&self.state.config().wallet_derivation_scheme, feed)
    }

    pub fn get_or_derive(&self, feed: &ActiveDataFeed) -> Result<DerivedSponsorWallet, KeeperError> {
        let snapshot = self.state.get();
        let sponsor_address = derive_sponsor_address(&snapshot.config.wallet_derivation_scheme, feed);
        if let Some(wallet) = snapshot.sponsor_wallets.get(&sponsor_address) {
            return Ok(wallet.clone());
        }

        let wallet = derive_sponsor_wallet(&snapshot.config.sponsor_wallet_mnemonic, sponsor_address)?;
        debug!(feed = %feed.label(), %sponsor_address, wallet = %wallet.wallet_address, "Derived sponsor wallet");
        self.state.update(|draft| {
            draft.sponsor_wallets_mut().insert(sponsor_address, wallet.clone());
        });
        Ok(wallet)
    }
}
