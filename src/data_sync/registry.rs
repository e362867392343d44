use super::contracts::IFeedRegistry;
use super::signed_data::decode_int224;
use crate::execution::rpc::ChainRpc;
use crate::keeper_error::KeeperError;
use crate::logic::types::{ActiveDataFeed, Beacon, OnChainBeacon, UpdateParameters, derive_data_feed_id};
use alloy_primitives::{Address, B256, Bytes, I256, U256};
use alloy_sol_types::{SolCall, SolValue};
use std::sync::Arc;
use tracing::{debug, warn};

/// Encoded length of `(uint256, int224, uint256)`.
pub const UPDATE_PARAMETERS_LENGTH: usize = 96;

/// Encoded length of the `(address, bytes32)` details of a single beacon feed.
const SINGLE_BEACON_DETAILS_LENGTH: usize = 64;

pub fn encode_update_parameters(parameters: &UpdateParameters) -> Bytes {
    let mut encoded = Vec::with_capacity(UPDATE_PARAMETERS_LENGTH);
    encoded.extend_from_slice(&parameters.deviation_threshold_percentage.to_be_bytes::<32>());
    encoded.extend_from_slice(&parameters.deviation_reference.into_raw().to_be_bytes::<32>());
    encoded.extend_from_slice(&parameters.heartbeat_interval.to_be_bytes::<32>());
    Bytes::from(encoded)
}

/// Decodes exactly three words. Any other length, or a reference outside int224, is an error.
pub fn decode_update_parameters(encoded: &[u8]) -> Result<UpdateParameters, KeeperError> {
    if encoded.len() != UPDATE_PARAMETERS_LENGTH {
        return Err(KeeperError::Malformed {
            what: "update parameters",
            reason: format!("expected {UPDATE_PARAMETERS_LENGTH} bytes, got {}", encoded.len()),
        });
    }
    Ok(UpdateParameters {
        deviation_threshold_percentage: U256::from_be_slice(&encoded[..32]),
        deviation_reference: decode_int224(&encoded[32..64])?,
        heartbeat_interval: U256::from_be_slice(&encoded[64..]),
    })
}

/// Beacons of a feed in registry order. `None` when the feed is not registered.
pub fn decode_data_feed_details(details: &[u8]) -> Result<Option<Vec<Beacon>>, KeeperError> {
    if details.is_empty() {
        return Ok(None);
    }
    if details.len() == SINGLE_BEACON_DETAILS_LENGTH {
        let (reporter, template_id) = <(Address, B256)>::abi_decode_params(details)?;
        return Ok(Some(vec![Beacon::new(reporter, template_id)]));
    }

    let (reporters, template_ids) = <(Vec<Address>, Vec<B256>)>::abi_decode_params(details)?;
    if reporters.len() != template_ids.len() || reporters.is_empty() {
        return Err(KeeperError::Malformed {
            what: "data feed details",
            reason: format!("{} reporters for {} templates", reporters.len(), template_ids.len()),
        });
    }
    Ok(Some(reporters.into_iter().zip(template_ids).map(|(reporter, template_id)| Beacon::new(reporter, template_id)).collect()))
}

/// Result of the first registry call of a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstBatch {
    pub active_data_feed_count: usize,
    pub feeds: Vec<ActiveDataFeed>,
}

/// Batched, paginated reads of the registry through its `tryMulticall`.
#[derive(Clone)]
pub struct FeedRegistryClient {
    rpc: Arc<dyn ChainRpc>,
    registry: Address,
}

impl FeedRegistryClient {
    pub fn new(rpc: Arc<dyn ChainRpc>, registry: Address) -> Self {
        Self { rpc, registry }
    }

    async fn try_multicall(&self, calls: Vec<Bytes>) -> Result<Vec<(bool, Bytes)>, KeeperError> {
        let expected = calls.len();
        let data = IFeedRegistry::tryMulticallCall { data: calls }.abi_encode();
        let raw = self.rpc.call(self.registry, Bytes::from(data)).await?;
        let (successes, returndata) = <(Vec<bool>, Vec<Bytes>)>::abi_decode_params(&raw)?;
        if successes.len() != expected || returndata.len() != expected {
            return Err(KeeperError::Malformed {
                what: "tryMulticall result",
                reason: format!("expected {expected} results, got {}/{}", successes.len(), returndata.len()),
            });
        }
        Ok(successes.into_iter().zip(returndata).collect())
    }

    fn active_data_feed_calls(offset: usize, count: usize) -> impl Iterator<Item = Bytes> {
        (offset..offset + count)
            .map(|index| Bytes::from(IFeedRegistry::activeDataFeedCall { index: U256::from(index) }.abi_encode()))
    }

    /// Active feed count plus the first page of feeds, in a single call.
    pub async fn fetch_first_batch(&self, batch_size: usize) -> Result<FirstBatch, KeeperError> {
        let mut calls = vec![Bytes::from(IFeedRegistry::activeDataFeedCountCall {}.abi_encode())];
        calls.extend(Self::active_data_feed_calls(0, batch_size));

        let mut results = self.try_multicall(calls).await?.into_iter();
        let (count_success, count_data) = results
            .next()
            .ok_or_else(|| KeeperError::Rpc("empty tryMulticall result".to_string()))?;
        if !count_success {
            return Err(KeeperError::Rpc("activeDataFeedCount() reverted".to_string()));
        }
        let active_data_feed_count: usize = U256::abi_decode(&count_data)?.saturating_to();

        let feeds = decode_page(results.collect(), 0, active_data_feed_count)?;
        Ok(FirstBatch { active_data_feed_count, feeds })
    }

    /// One further page, `[offset, offset + batch_size)` clipped to the active feed count.
    pub async fn fetch_batch(
        &self,
        offset: usize,
        batch_size: usize,
        active_data_feed_count: usize,
    ) -> Result<Vec<ActiveDataFeed>, KeeperError> {
        let count = batch_size.min(active_data_feed_count.saturating_sub(offset));
        if count == 0 {
            return Ok(Vec::new());
        }
        let results = self.try_multicall(Self::active_data_feed_calls(offset, count).collect()).await?;
        decode_page(results, offset, active_data_feed_count)
    }
}

/// Indexes past the active count revert and are ignored; a revert inside the range fails the page.
fn decode_page(
    results: Vec<(bool, Bytes)>,
    offset: usize,
    active_data_feed_count: usize,
) -> Result<Vec<ActiveDataFeed>, KeeperError> {
    let mut feeds = Vec::with_capacity(results.len());
    for (i, (success, data)) in results.into_iter().enumerate() {
        let index = offset + i;
        if index >= active_data_feed_count {
            break;
        }
        if !success {
            return Err(KeeperError::Rpc(format!("activeDataFeed({index}) reverted")));
        }
        match decode_active_data_feed(&data) {
            Ok(Some(feed)) => feeds.push(feed),
            Ok(None) => debug!(index, "Skipping unregistered data feed"),
            Err(e) => warn!(index, "Skipping data feed: {}", e),
        }
    }
    Ok(feeds)
}

fn decode_active_data_feed(data: &[u8]) -> Result<Option<ActiveDataFeed>, KeeperError> {
    let decoded = IFeedRegistry::activeDataFeedCall::abi_decode_returns(data)?;

    let Some(beacons) = decode_data_feed_details(&decoded.dataFeedDetails)? else {
        return Ok(None);
    };
    let derived_id = derive_data_feed_id(&beacons);
    if derived_id != Some(decoded.dataFeedId) {
        warn!(data_feed_id = %decoded.dataFeedId, "Data feed ID does not match its beacons");
        return Ok(None);
    }

    let on_chain_value = decoded.dataFeedValue;
    let on_chain_timestamp: u64 = decoded.dataFeedTimestamp.saturating_to();
    let beacons: Vec<OnChainBeacon> = if decoded.beaconValues.is_empty() && beacons.len() == 1 {
        // Single beacon feeds only report the feed value
        beacons
            .into_iter()
            .map(|beacon| OnChainBeacon { beacon, value: on_chain_value, timestamp: on_chain_timestamp })
            .collect()
    } else {
        if decoded.beaconValues.len() != beacons.len() || decoded.beaconTimestamps.len() != beacons.len() {
            return Err(KeeperError::Malformed {
                what: "active data feed",
                reason: format!(
                    "{} beacons, {} values, {} timestamps",
                    beacons.len(),
                    decoded.beaconValues.len(),
                    decoded.beaconTimestamps.len()
                ),
            });
        }
        beacons
            .into_iter()
            .zip(decoded.beaconValues.iter().zip(&decoded.beaconTimestamps))
            .map(|(beacon, (value, timestamp))| OnChainBeacon {
                beacon,
                value: *value,
                timestamp: timestamp.saturating_to(),
            })
            .collect()
    };

    Ok(Some(ActiveDataFeed {
        data_feed_id: decoded.dataFeedId,
        dapi_name: (!decoded.dapiName.is_zero()).then_some(decoded.dapiName),
        beacons,
        update_parameters: decode_update_parameters(&decoded.updateParameters)?,
        encoded_update_parameters: decoded.updateParameters,
        on_chain_value,
        on_chain_timestamp,
        signed_api_urls: decoded.signedApiUrls,
    }))
}
