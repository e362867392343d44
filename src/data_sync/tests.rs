//! End-to-end flow of the data layer: a signed API response is parsed, verified on the pool,
//! stored, and then drives the updatability decision.

use super::signed_api::parse_signed_api_response;
use super::signed_data::tests::{encode_int224, sign_report, test_signer};
use super::signed_data::{SignedReport, SignedReportStore};
use super::verifier_pool::{VerificationOutcome, VerifierPool};
use crate::config::tests::test_keeper_config;
use crate::logic::types::UpdateReason;
use crate::logic::updatability::tests::{ten_percent_parameters, test_feed};
use crate::logic::updatability::{EvaluationSettings, get_updatable_feeds};
use crate::state::ProcessState;
use crate::utils::unix_now;
use alloy_primitives::B256;

fn response_body(reports: &[SignedReport]) -> Vec<u8> {
    let data: serde_json::Map<String, serde_json::Value> = reports
        .iter()
        .map(|report| (report.beacon_id().to_string(), serde_json::to_value(report).unwrap()))
        .collect();
    serde_json::to_vec(&serde_json::json!({ "count": reports.len(), "data": data })).unwrap()
}

#[tokio::test]
async fn test_signed_response_drives_update_decision() {
    let now = unix_now();
    let signer = test_signer();
    let (a, b, c) = (B256::repeat_byte(1), B256::repeat_byte(2), B256::repeat_byte(3));
    let reports = vec![
        sign_report(&signer, a, now - 5, 600),
        sign_report(&signer, b, now - 5, 610),
        sign_report(&signer, c, now - 5, 590),
    ];

    let state = ProcessState::new(test_keeper_config());
    let store = SignedReportStore::new(state.clone());
    let pool = VerifierPool::new(Some(2)).unwrap();

    let parsed = parse_signed_api_response(&response_body(&reports)).unwrap();
    let VerificationOutcome::Verified(verified) = pool.verify_batch(parsed).await.unwrap() else {
        panic!("valid response was rejected");
    };
    assert_eq!(store.save_verified(verified, now), 3);
    assert!(store.get(&reports[0].beacon_id()).is_some());

    let feed = test_feed(
        &signer,
        &[(a, 500, now - 100), (b, 500, now - 100), (c, 500, now - 100)],
        500,
        now - 100,
        ten_percent_parameters(86_400),
    );
    let snapshot = state.get();
    let updatable = get_updatable_feeds(&[feed], &snapshot.signed_reports, &EvaluationSettings::default(), now);
    assert_eq!(updatable.len(), 1);
    assert_eq!(updatable[0].reason, UpdateReason::Deviation);
    assert_eq!(updatable[0].updatable_beacons.len(), 3);
}

#[tokio::test]
async fn test_tampered_response_stores_nothing() {
    let now = unix_now();
    let signer = test_signer();
    let mut reports = vec![
        sign_report(&signer, B256::repeat_byte(1), now - 5, 600),
        sign_report(&signer, B256::repeat_byte(2), now - 5, 610),
    ];
    reports[1].encoded_value = encode_int224(1);

    let state = ProcessState::new(test_keeper_config());
    let pool = VerifierPool::new(Some(1)).unwrap();
    let parsed = parse_signed_api_response(&response_body(&reports)).unwrap();

    assert!(matches!(pool.verify_batch(parsed).await.unwrap(), VerificationOutcome::Rejected(_)));
    assert!(state.get().signed_reports.is_empty());
}

#[test]
fn test_store_keeps_newest_report() {
    let now = unix_now();
    let signer = test_signer();
    let template = B256::repeat_byte(7);
    let store = SignedReportStore::new(ProcessState::new(test_keeper_config()));

    let newer = sign_report(&signer, template, now - 5, 2);
    assert_eq!(store.save_verified(vec![newer.clone()], now), 1);
    assert_eq!(store.save_verified(vec![sign_report(&signer, template, now - 30, 1)], now), 0);
    assert_eq!(store.get(&newer.beacon_id()), Some(newer));
}
