use crate::data_sync::signed_data::SignedReport;
use alloy_primitives::{Address, B256, Bytes, I256, U256, keccak256};
use alloy_sol_types::SolValue;
use strum_macros::Display;

pub type ChainId = u64;

/// A single signed data point, identified by its reporter and template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Beacon {
    pub reporter_address: Address,
    pub template_id: B256,
    pub beacon_id: B256,
}

impl Beacon {
    pub fn new(reporter_address: Address, template_id: B256) -> Self {
        Self { reporter_address, template_id, beacon_id: derive_beacon_id(reporter_address, template_id) }
    }
}

/// keccak256(abi.encodePacked(reporterAddress, templateId))
pub fn derive_beacon_id(reporter_address: Address, template_id: B256) -> B256 {
    let mut packed = [0u8; 52];
    packed[..20].copy_from_slice(reporter_address.as_slice());
    packed[20..].copy_from_slice(template_id.as_slice());
    keccak256(packed)
}

/// keccak256(abi.encode(beaconIds))
pub fn derive_beacon_set_id(beacon_ids: &[B256]) -> B256 {
    keccak256(beacon_ids.to_vec().abi_encode())
}

/// The ID a feed made of these beacons is registered under.
pub fn derive_data_feed_id(beacons: &[Beacon]) -> Option<B256> {
    match beacons {
        [] => None,
        [single] => Some(single.beacon_id),
        many => Some(derive_beacon_set_id(&many.iter().map(|beacon| beacon.beacon_id).collect::<Vec<_>>())),
    }
}

/// Decoded `(uint256 deviationThresholdPercentage, int224 deviationReference, uint256 heartbeatInterval)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateParameters {
    pub deviation_threshold_percentage: U256,
    pub deviation_reference: I256,
    pub heartbeat_interval: U256,
}

impl UpdateParameters {
    pub fn heartbeat_interval_secs(&self) -> u64 {
        self.heartbeat_interval.saturating_to::<u64>()
    }
}

/// A beacon together with what the feed server currently stores for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainBeacon {
    pub beacon: Beacon,
    pub value: I256,
    pub timestamp: u64,
}

/// An active feed as listed by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDataFeed {
    pub data_feed_id: B256,
    pub dapi_name: Option<B256>,
    /// Ordered constituents; exactly one for a simple feed
    pub beacons: Vec<OnChainBeacon>,
    pub update_parameters: UpdateParameters,
    pub encoded_update_parameters: Bytes,
    pub on_chain_value: I256,
    pub on_chain_timestamp: u64,
    pub signed_api_urls: Vec<String>,
}

impl ActiveDataFeed {
    pub fn is_aggregate(&self) -> bool {
        self.beacons.len() > 1
    }

    pub fn dapi_name_or_data_feed_id(&self) -> B256 {
        self.dapi_name.unwrap_or(self.data_feed_id)
    }

    /// Human readable name for logs: the dAPI name when it is printable, the feed ID otherwise.
    pub fn label(&self) -> String {
        self.dapi_name
            .and_then(|name| {
                let trimmed: Vec<u8> = name.iter().copied().take_while(|byte| *byte != 0).collect();
                String::from_utf8(trimmed).ok().filter(|s| !s.is_empty())
            })
            .unwrap_or_else(|| self.data_feed_id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum UpdateReason {
    /// Nothing has been written on-chain yet
    Initialization,
    Deviation,
    Heartbeat,
    /// Only individual beacons qualified, under the per-beacon override settings
    IndividualBeacon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatableBeacon {
    pub beacon: Beacon,
    pub signed_report: SignedReport,
}

/// A feed that should be updated this cycle, with the beacons that carry newer signed data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatableDataFeed {
    pub feed: ActiveDataFeed,
    pub updatable_beacons: Vec<UpdatableBeacon>,
    pub reason: UpdateReason,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};

    #[test]
    fn test_beacon_id_is_packed_hash() {
        let reporter = address!("0xc52EeA00154B4fF1EbbF8Ba39FDe37F1AC3B9Fd4");
        let template_id = b256!("0x457a3b3da67e394a895ea49e534a4d91b2d009477bef15eab8cbed313925b010");
        let beacon = Beacon::new(reporter, template_id);

        let mut packed = reporter.to_vec();
        packed.extend_from_slice(template_id.as_slice());
        assert_eq!(beacon.beacon_id, keccak256(&packed));
    }

    #[test]
    fn test_data_feed_id_for_single_and_aggregate() {
        let beacons: Vec<Beacon> =
            (1u8..=3).map(|i| Beacon::new(Address::repeat_byte(i), B256::repeat_byte(i))).collect();

        assert_eq!(derive_data_feed_id(&[]), None);
        assert_eq!(derive_data_feed_id(&beacons[..1]), Some(beacons[0].beacon_id));

        let ids: Vec<B256> = beacons.iter().map(|beacon| beacon.beacon_id).collect();
        let aggregate_id = derive_data_feed_id(&beacons).unwrap();
        assert_eq!(aggregate_id, derive_beacon_set_id(&ids));
        // Order matters for aggregate IDs
        let reversed: Vec<B256> = ids.iter().rev().copied().collect();
        assert_ne!(aggregate_id, derive_beacon_set_id(&reversed));
    }

    #[test]
    fn test_feed_label_prefers_dapi_name() {
        let mut name = [0u8; 32];
        name[..7].copy_from_slice(b"ETH/USD");
        let feed = ActiveDataFeed {
            data_feed_id: B256::repeat_byte(0xaa),
            dapi_name: Some(B256::from(name)),
            beacons: vec![],
            update_parameters: UpdateParameters {
                deviation_threshold_percentage: U256::ZERO,
                deviation_reference: I256::ZERO,
                heartbeat_interval: U256::ZERO,
            },
            encoded_update_parameters: Bytes::new(),
            on_chain_value: I256::ZERO,
            on_chain_timestamp: 0,
            signed_api_urls: vec![],
        };
        assert_eq!(feed.label(), "ETH/USD");
        assert_eq!(feed.dapi_name_or_data_feed_id(), B256::from(name));

        let unnamed = ActiveDataFeed { dapi_name: None, ..feed };
        assert_eq!(unnamed.label(), B256::repeat_byte(0xaa).to_string());
        assert_eq!(unnamed.dapi_name_or_data_feed_id(), B256::repeat_byte(0xaa));
    }
}
