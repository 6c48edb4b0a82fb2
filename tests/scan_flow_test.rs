//! Library-level flow: scan, persist, then simulate a revoke with local REVM

use alloy_primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use wallet_guardian::core::{
    AccountState, ChainState, EvidenceResolver, IdempotencyManager, LabelRegistry, PreSimulator, ProbeSet,
    RemediationService, RevmSimulationBackend, ScanOrchestrator, ScanTimeouts,
};
use wallet_guardian::models::{
    ActionType, AppResult, ApprovalRecord, FlowDirection, Provenance, RemediationCandidate,
    ScanEvent,
};
use wallet_guardian::providers::{
    ChainDataSource, KvScanStore, MemoryKvStore, ScanStore, Sourced, TransferRecord,
};
use wallet_guardian::utils::{EvidenceCache, ScanTelemetry};

const TOKEN: Address = Address::repeat_byte(0x70);
const SPENDER: Address = Address::repeat_byte(0x71);
const TORNADO_100_ETH: &str = "0xA160cdAB225685dA1d56aa342Ad8841c3b53f291";

struct WalletFixture;

fn provenance(method: &str) -> Provenance {
    Provenance {
        provider: "fixture".to_string(),
        method: method.to_string(),
        request_id: "fixture".to_string(),
    }
}

#[async_trait]
impl ChainDataSource for WalletFixture {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn approvals(
        &self,
        _owner: Address,
        _chain_id: u64,
    ) -> AppResult<Sourced<Vec<ApprovalRecord>>> {
        Ok(Sourced {
            data: vec![ApprovalRecord {
                token: TOKEN,
                spender: SPENDER,
                allowance: "max".to_string(),
                unlimited: true,
            }],
            provenance: provenance("approvals"),
        })
    }

    async fn transfers(
        &self,
        _address: Address,
        _chain_id: u64,
    ) -> AppResult<Sourced<Vec<TransferRecord>>> {
        Ok(Sourced {
            data: vec![TransferRecord {
                counterparty: TORNADO_100_ETH.parse().unwrap(),
                direction: FlowDirection::Inbound,
                tx_hash: "0xfeed".to_string(),
            }],
            provenance: provenance("transfers"),
        })
    }
}

/// Token contract code at TOKEN; every other account and slot is empty
struct TokenChain(Bytes);

#[async_trait]
impl ChainState for TokenChain {
    async fn account(&self, _chain_id: u64, address: Address) -> AppResult<AccountState> {
        let code = if address == TOKEN { self.0.clone() } else { Bytes::new() };
        Ok(AccountState {
            code,
            ..Default::default()
        })
    }

    async fn storage(&self, _chain_id: u64, _address: Address, _slot: U256) -> AppResult<U256> {
        Ok(U256::ZERO)
    }
}

/// PUSH1 1 PUSH1 0 MSTORE PUSH1 32 PUSH1 0 RETURN
fn returns_true() -> Bytes {
    Bytes::from(vec![
        0x60, 0x01, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3,
    ])
}

/// PUSH1 0 PUSH1 0 REVERT
fn always_reverts() -> Bytes {
    Bytes::from(vec![0x60, 0x00, 0x60, 0x00, 0xfd])
}

struct Harness {
    orchestrator: ScanOrchestrator,
    remediation: RemediationService,
    store: Arc<dyn ScanStore>,
}

fn harness(code: Bytes) -> Harness {
    let kv = Arc::new(MemoryKvStore::new());
    let telemetry = Arc::new(ScanTelemetry::new());
    let cache = EvidenceCache::new(1_000, Duration::from_secs(3_600));
    let probes = ProbeSet::standard(
        Arc::new(WalletFixture),
        EvidenceResolver::new(cache.clone(), 300),
        Arc::new(LabelRegistry::default()),
    );
    let store: Arc<dyn ScanStore> = Arc::new(KvScanStore::new(kv.clone()));

    let orchestrator = ScanOrchestrator::new(
        probes.clone(),
        store.clone(),
        telemetry.clone(),
        ScanTimeouts::default(),
    );
    let simulator = Arc::new(PreSimulator::new(
        Arc::new(RevmSimulationBackend::new(Arc::new(TokenChain(code)))),
        probes,
        cache,
        telemetry.clone(),
    ));
    let remediation = RemediationService::new(
        IdempotencyManager::new(kv, Duration::from_secs(300), Duration::from_secs(15)),
        simulator,
        telemetry,
    );

    Harness {
        orchestrator,
        remediation,
        store,
    }
}

fn revoke(subject: Address, key: &str) -> RemediationCandidate {
    RemediationCandidate {
        idempotency_key: key.to_string(),
        subject_address: subject,
        action_type: ActionType::RevokeApproval,
        target_contract: TOKEN,
        chain_id: 1,
        spender: None,
    }
}

#[tokio::test]
async fn test_scan_then_revoke_lowers_score() {
    let h = harness(returns_true());
    let subject = Address::repeat_byte(0x01);

    let events = h
        .orchestrator
        .start_scan(subject, 1, "req-flow-1")
        .collect()
        .await;
    assert_eq!(events.len(), 4);
    let Some(ScanEvent::Complete {
        aggregate_score, ..
    }) = events.last()
    else {
        panic!("expected complete, got {:?}", events.last());
    };
    assert!(*aggregate_score > 0.0);

    let record = h.store.by_request_id("req-flow-1").await.unwrap().unwrap();
    assert_eq!(record.subject_address, subject);
    assert_eq!(record.aggregate_score, *aggregate_score);

    let outcome = h.remediation.submit(revoke(subject, "flow-1")).await.unwrap();
    assert!(outcome.result.will_succeed);
    assert_eq!(outcome.result.calls, 1);
    assert!(outcome.result.estimated_gas >= 21_000);
    assert!(outcome.result.score_delta > 0.0);
    assert!(outcome.result.score_delta <= *aggregate_score);
}

#[tokio::test]
async fn test_reverting_token_predicts_failure_without_score_change() {
    let h = harness(always_reverts());
    let subject = Address::repeat_byte(0x02);

    h.orchestrator.start_scan(subject, 1, "req-flow-2").collect().await;
    let outcome = h.remediation.submit(revoke(subject, "flow-2")).await.unwrap();
    assert!(!outcome.result.will_succeed);
    assert_eq!(outcome.result.revert_reason.as_deref(), Some("reverted: 0x"));
    assert_eq!(outcome.result.score_delta, 0.0);

    // predicted failures are stored like any other result
    let again = h.remediation.submit(revoke(subject, "flow-2")).await.unwrap();
    assert!(again.from_cache);
    assert_eq!(again.result, outcome.result);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let h = harness(returns_true());
    let a = h.orchestrator.start_scan(Address::repeat_byte(0x0a), 1, "req-a");
    let b = h.orchestrator.start_scan(Address::repeat_byte(0x0b), 1, "req-b");
    assert_ne!(a.session_id, b.session_id);

    let (events_a, events_b) = tokio::join!(a.collect(), b.collect());
    for (events, request_id) in [(events_a, "req-a"), (events_b, "req-b")] {
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        match events.last() {
            Some(ScanEvent::Complete { request_id: id, .. }) => assert_eq!(id, request_id),
            other => panic!("expected complete, got {:?}", other),
        }
    }
    assert!(h.store.by_request_id("req-a").await.unwrap().is_some());
    assert!(h.store.by_request_id("req-b").await.unwrap().is_some());
}
