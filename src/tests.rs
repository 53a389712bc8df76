//! Ledger scenario tests
//!
//! End-to-end behavior of the ledger over the in-memory settlement adapter,
//! plus HTTP routes driven through the router.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::config::{Config, Environment};
use crate::sealed::{Amount, Binding, Duration, EnclaveScheme, Rate, RevealGrant};
use crate::services::{
    Constraint, CreatePoolRequest, CreatePositionRequest, EventFilter, EventKind,
    InMemorySettlement, LedgerConfig, LedgerError, LedgerEvent, LockKey, PositionLedger,
    PositionState, PositionView, SettlementError, WsHub,
};
use crate::types::{OwnerId, PoolId, PositionId, DEFAULT_MAX_DURATION_SECS};
use crate::{create_router, AppState};

// ============================================================================
// Fixtures
// ============================================================================

fn addr(n: u8) -> OwnerId {
    OwnerId::new(&format!("0x{}", hex::encode([n; 20]))).unwrap()
}

struct Harness {
    ledger: PositionLedger,
    settlement: Arc<InMemorySettlement>,
    scheme: Arc<EnclaveScheme>,
}

fn harness_with(config: LedgerConfig) -> Harness {
    let scheme = Arc::new(EnclaveScheme::from_seed(&[7u8; 32]));
    let settlement = Arc::new(InMemorySettlement::new());
    let ledger = PositionLedger::new(scheme.clone(), settlement.clone(), config).unwrap();
    Harness {
        ledger,
        settlement,
        scheme,
    }
}

fn harness() -> Harness {
    harness_with(LedgerConfig::default())
}

fn position(owner: &OwnerId, amount: u64) -> CreatePositionRequest {
    CreatePositionRequest {
        owner: owner.clone(),
        amount,
        rate_bps: 500,
        duration_secs: 2_592_000,
        strategy: "Alpha".to_string(),
        pool_id: None,
    }
}

fn in_pool(owner: &OwnerId, amount: u64, pool_id: PoolId) -> CreatePositionRequest {
    CreatePositionRequest {
        pool_id: Some(pool_id),
        ..position(owner, amount)
    }
}

fn pool(manager: &OwnerId, max_capacity: u64) -> CreatePoolRequest {
    CreatePoolRequest {
        manager: manager.clone(),
        max_capacity,
        initial_yield_bps: 800,
        name: "Stable LP".to_string(),
    }
}

// ============================================================================
// Position lifecycle
// ============================================================================

#[tokio::test]
async fn test_create_then_get_is_sealed() {
    let h = harness();
    let owner = addr(0xa1);

    let id = h.ledger.create_position(position(&owner, 1_000_000)).await.unwrap();
    assert_eq!(id, PositionId(1));

    let view = h.ledger.get_position(id).unwrap();
    assert_eq!(view.state(), PositionState::Active);
    match &view {
        PositionView::Active {
            amount, rate, duration, ..
        } => {
            assert!(amount.satisfied && rate.satisfied && duration.satisfied);
            assert_eq!(amount.constraint, Constraint::PositiveAmount);
            assert_eq!(duration.constraint, Constraint::DurationInRange);
        }
        other => panic!("expected active view, got {:?}", other),
    }

    // 평문은 어디에도 노출되지 않음
    let json = serde_json::to_string(&view).unwrap();
    assert!(!json.contains("1000000"));
    assert!(!json.contains("2592000"));
}

#[tokio::test]
async fn test_withdraw_reveals_and_computes_rewards() {
    let h = harness();
    let owner = addr(0xa1);
    let id = h.ledger.create_position(position(&owner, 1_000_000)).await.unwrap();

    let revealed = h.ledger.withdraw_position(id, &owner).await.unwrap();
    assert_eq!(revealed.amount, Amount(1_000_000));
    assert_eq!(revealed.rate, Rate(500));
    assert_eq!(revealed.duration, Duration(2_592_000));
    assert_eq!(revealed.earned, Amount(4_109));
    assert_eq!(revealed.strategy, "Alpha");
    // 즉시 출금: 만기 전
    assert!(!revealed.matured);
    assert_eq!(
        revealed.matures_at,
        revealed.created_at + chrono::Duration::seconds(2_592_000)
    );
    assert_eq!(revealed.proofs.len(), 3);

    let view = h.ledger.get_position(id).unwrap();
    assert_eq!(view.state(), PositionState::Withdrawn);
    assert_eq!(h.settlement.reveal_record(id), Some(revealed));
}

#[tokio::test]
async fn test_withdraw_exactly_once() {
    let h = harness();
    let owner = addr(0xa1);
    let id = h.ledger.create_position(position(&owner, 1_000_000)).await.unwrap();

    tokio_test::assert_ok!(h.ledger.withdraw_position(id, &owner).await);
    assert_eq!(
        h.ledger.withdraw_position(id, &owner).await,
        Err(LedgerError::AlreadyWithdrawn(id))
    );
}

#[tokio::test]
async fn test_withdraw_authorization_and_missing() {
    let h = harness();
    let owner = addr(0xa1);
    let stranger = addr(0xb2);
    let id = h.ledger.create_position(position(&owner, 10)).await.unwrap();

    assert!(matches!(
        h.ledger.withdraw_position(id, &stranger).await,
        Err(LedgerError::Unauthorized(_))
    ));
    assert!(matches!(
        h.ledger.withdraw_position(PositionId(99), &owner).await,
        Err(LedgerError::NotFound(_))
    ));
    assert!(matches!(h.ledger.get_position(PositionId(99)), Err(LedgerError::NotFound(_))));

    // 실패한 시도 이후에도 소유자는 출금 가능
    tokio_test::assert_ok!(h.ledger.withdraw_position(id, &owner).await);
}

#[tokio::test]
async fn test_invalid_input_consumes_no_id() {
    let h = harness();
    let owner = addr(0xa1);

    assert!(matches!(
        h.ledger.create_position(position(&owner, 0)).await,
        Err(LedgerError::InvalidInput(_))
    ));
    let bad_rate = CreatePositionRequest {
        rate_bps: 10_001,
        ..position(&owner, 5)
    };
    assert!(matches!(
        h.ledger.create_position(bad_rate).await,
        Err(LedgerError::InvalidInput(_))
    ));
    assert_eq!(h.settlement.committed(), 0);

    let id = h.ledger.create_position(position(&owner, 5)).await.unwrap();
    assert_eq!(id, PositionId(1));
}

#[tokio::test]
async fn test_duration_above_limit_is_proof_rejected() {
    let h = harness();
    let owner = addr(0xa1);
    let request = CreatePositionRequest {
        duration_secs: DEFAULT_MAX_DURATION_SECS + 1,
        ..position(&owner, 5)
    };

    assert_eq!(
        h.ledger.create_position(request).await,
        Err(LedgerError::ProofRejected {
            field: "duration",
            constraint: Constraint::DurationInRange,
        })
    );
    assert_eq!(h.ledger.global_stats().total_positions, 0);
    assert_eq!(h.ledger.create_position(position(&owner, 5)).await, Ok(PositionId(1)));
}

#[tokio::test]
async fn test_positions_of_lists_only_owner() {
    let h = harness();
    let a = addr(0xa1);
    let b = addr(0xb2);

    h.ledger.create_position(position(&a, 1)).await.unwrap();
    h.ledger.create_position(position(&b, 2)).await.unwrap();
    h.ledger.create_position(position(&a, 3)).await.unwrap();

    let ids: Vec<PositionId> = h.ledger.positions_of(&a).iter().map(PositionView::id).collect();
    assert_eq!(ids, vec![PositionId(1), PositionId(3)]);
    assert!(h.ledger.positions_of(&addr(0xcc)).is_empty());
}

// ============================================================================
// Pools
// ============================================================================

#[tokio::test]
async fn test_pool_capacity_exceeded_leaves_pool_unchanged() {
    let h = harness();
    let manager = addr(0x01);
    let farmer = addr(0xa1);

    let pool_id = h.ledger.create_pool(pool(&manager, 1_000_000)).await.unwrap();
    assert_eq!(pool_id, PoolId(1));

    // 정확히 용량만큼은 허용
    let first = h.ledger.create_position(in_pool(&farmer, 1_000_000, pool_id)).await.unwrap();
    let before = h.ledger.get_pool(pool_id).unwrap();
    assert!(before.within_capacity);
    assert_eq!(before.active_positions, 1);

    assert_eq!(
        h.ledger.create_position(in_pool(&farmer, 1, pool_id)).await,
        Err(LedgerError::PoolCapacityExceeded(pool_id))
    );

    let after = h.ledger.get_pool(pool_id).unwrap();
    assert_eq!(after.utilization, before.utilization);
    assert_eq!(after.active_positions, 1);
    assert_eq!(h.ledger.global_stats().total_positions, 1);

    // 출금으로 용량이 반환됨
    h.ledger.withdraw_position(first, &farmer).await.unwrap();
    let next = h.ledger.create_position(in_pool(&farmer, 400_000, pool_id)).await.unwrap();
    assert_eq!(next, PositionId(2));
}

#[tokio::test]
async fn test_pool_validation_and_lookup() {
    let h = harness();
    let manager = addr(0x01);

    assert!(matches!(
        h.ledger.create_pool(pool(&manager, 0)).await,
        Err(LedgerError::InvalidInput(_))
    ));
    let unnamed = CreatePoolRequest {
        name: String::new(),
        ..pool(&manager, 10)
    };
    assert!(matches!(h.ledger.create_pool(unnamed).await, Err(LedgerError::InvalidInput(_))));

    let id = h.ledger.create_pool(pool(&manager, 10)).await.unwrap();
    assert_eq!(id, PoolId(1));
    let view = h.ledger.get_pool(id).unwrap();
    assert_eq!(view.name, "Stable LP");
    assert!(view.capacity.satisfied && view.initial_yield.satisfied);

    assert!(matches!(h.ledger.get_pool(PoolId(2)), Err(LedgerError::NotFound(_))));
    assert!(matches!(
        h.ledger.create_position(in_pool(&addr(0xa1), 1, PoolId(2))).await,
        Err(LedgerError::NotFound(_))
    ));
    assert_eq!(h.ledger.global_stats().total_pools, 1);
}

// ============================================================================
// Proofs
// ============================================================================

#[tokio::test]
async fn test_proofs_do_not_replay_across_positions() {
    let h = harness();
    let owner = addr(0xa1);
    let first = h.ledger.create_position(position(&owner, 1_000_000)).await.unwrap();
    let second = h.ledger.create_position(position(&owner, 1_000_000)).await.unwrap();

    let revealed = h.ledger.withdraw_position(first, &owner).await.unwrap();
    let amount_proof = &revealed.proofs[0];
    assert_eq!(amount_proof.constraint, Constraint::PositiveAmount);

    // 같은 평문이라도 content id가 다름
    let PositionView::Active { amount, .. } = h.ledger.get_position(second).unwrap() else {
        panic!("second position should still be active");
    };
    assert_ne!(amount_proof.bound_to, amount.content_id);

    let engine = h.ledger.engine();
    let other = engine.seal(Amount(1_000_000), Binding::owner(&owner)).unwrap();
    assert!(!engine.verify(amount_proof, &other));
}

#[test]
fn test_seal_reveal_round_trip() {
    let scheme = Arc::new(EnclaveScheme::from_seed(&[3u8; 32]));
    let engine = crate::services::ProofEngine::new(scheme, DEFAULT_MAX_DURATION_SECS);
    let owner = addr(0xa1);
    let grant = RevealGrant::for_owner(&owner);

    for x in [1u64, 4_109, u64::MAX] {
        let mut sealed = engine.seal(Amount(x), Binding::owner(&owner)).unwrap();
        assert_eq!(engine.reveal(&mut sealed, &grant), Ok(Amount(x)));
    }
    let mut rate = engine.seal(Rate(10_000), Binding::owner(&owner)).unwrap();
    assert_eq!(engine.reveal(&mut rate, &grant), Ok(Rate(10_000)));
    let mut duration = engine.seal(Duration(1), Binding::owner(&owner)).unwrap();
    assert_eq!(engine.reveal(&mut duration, &grant), Ok(Duration(1)));
}

// ============================================================================
// Stats
// ============================================================================

#[tokio::test]
async fn test_incremental_stats_match_full_fold() {
    let h = harness();
    let manager = addr(0x01);
    let a = addr(0xa1);
    let b = addr(0xb2);

    let pool_id = h.ledger.create_pool(pool(&manager, 10_000_000)).await.unwrap();
    let p1 = h.ledger.create_position(position(&a, 1_000_000)).await.unwrap();
    h.ledger.create_position(in_pool(&a, 250_000, pool_id)).await.unwrap();
    h.ledger.create_position(position(&a, 50_000)).await.unwrap();
    h.ledger.create_position(position(&b, 7_000)).await.unwrap();
    let revealed = h.ledger.withdraw_position(p1, &a).await.unwrap();

    let incremental = h.ledger.farmer_stats(&a).unwrap();
    let folded = h.ledger.recompute_farmer_stats(&a).unwrap();
    assert_eq!(incremental.public_summary(), folded.public_summary());
    assert_eq!(incremental.reputation, 3 * 5 + 10);
    assert_eq!(incremental.active_positions, 2);
    assert_eq!(incremental.withdrawn_stake, Amount(1_000_000));
    assert_eq!(incremental.total_earned, revealed.earned);

    // 봉인된 합계는 reveal 로 비교
    let stake = h.ledger.reveal_farmer_stake(&a, &a).unwrap();
    assert_eq!(stake.active_stake, Amount(300_000));
    assert_eq!(stake.total_staked, Amount(1_300_000));
    let mut folded_stake = folded.active_stake.clone();
    assert_eq!(
        h.ledger.engine().reveal(&mut folded_stake, &RevealGrant::for_owner(&a)),
        Ok(Amount(300_000))
    );

    let global = h.ledger.global_stats();
    let global_folded = h.ledger.recompute_global_stats().unwrap();
    assert_eq!(global.public_summary(), global_folded.public_summary());
    assert_eq!(global.total_positions, 4);
    assert_eq!(global.active_positions, 3);
    assert_eq!(global.total_pools, 1);
    assert_eq!(global.total_rewards, revealed.earned);

    let mut liquidity = global.total_liquidity.clone();
    assert_eq!(
        h.ledger
            .engine()
            .reveal(&mut liquidity, &RevealGrant::for_binding(Binding::ledger())),
        Ok(Amount(307_000))
    );
}

#[tokio::test]
async fn test_stake_reveal_requires_owner() {
    let h = harness();
    let a = addr(0xa1);
    h.ledger.create_position(position(&a, 10)).await.unwrap();

    assert!(matches!(
        h.ledger.reveal_farmer_stake(&a, &addr(0xb2)),
        Err(LedgerError::Unauthorized(_))
    ));

    // 포지션 없는 파머: 0
    let empty = h.ledger.reveal_farmer_stake(&addr(0xcc), &addr(0xcc)).unwrap();
    assert_eq!(empty.total_staked, Amount(0));
}

// ============================================================================
// Settlement failures and cancellation
// ============================================================================

#[tokio::test]
async fn test_rejected_settlement_rolls_back_create() {
    let h = harness();
    let owner = addr(0xa1);
    let mut events = h.ledger.subscribe(EventFilter::all());

    h.settlement.fail_next(SettlementError::Rejected("constraint".to_string()));
    let err = h.ledger.create_position(position(&owner, 5)).await.unwrap_err();
    assert!(matches!(err, LedgerError::SettlementFailure(SettlementError::Rejected(_))));
    assert!(!err.is_retryable());

    assert_eq!(h.settlement.committed(), 0);
    assert!(h.ledger.get_position(PositionId(1)).is_err());
    assert_eq!(h.ledger.global_stats().total_positions, 0);
    assert_eq!(h.ledger.farmer_stats(&owner).unwrap().total_positions, 0);

    // 거부된 id 는 재사용하지 않음
    let id = h.ledger.create_position(position(&owner, 5)).await.unwrap();
    assert_eq!(id, PositionId(2));

    // 실패한 작업의 이벤트는 없음: 첫 이벤트가 성공한 생성
    let event = tokio::time::timeout(StdDuration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, LedgerEvent::PositionCreated { position_id, .. } if position_id == id));
}

#[tokio::test]
async fn test_settlement_timeout_is_retryable() {
    let h = harness_with(LedgerConfig {
        settlement_timeout: StdDuration::from_millis(20),
        ..LedgerConfig::default()
    });
    let owner = addr(0xa1);
    h.settlement.set_latency(Some(StdDuration::from_millis(200)));

    let err = h.ledger.create_position(position(&owner, 5)).await.unwrap_err();
    assert_eq!(err, LedgerError::SettlementFailure(SettlementError::Timeout(20)));
    assert!(err.is_retryable());

    // 타임아웃 뒤 늦게 도착한 커밋은 없음
    tokio::time::sleep(StdDuration::from_millis(250)).await;
    assert_eq!(h.settlement.committed(), 0);

    h.settlement.set_latency(None);
    assert_eq!(h.ledger.create_position(position(&owner, 5)).await, Ok(PositionId(1)));
}

#[tokio::test]
async fn test_dropped_create_leaves_no_trace() {
    let h = harness();
    let owner = addr(0xa1);
    h.settlement.set_latency(Some(StdDuration::from_millis(200)));

    let cancelled = tokio::time::timeout(
        StdDuration::from_millis(20),
        h.ledger.create_position(position(&owner, 5)),
    )
    .await;
    assert!(cancelled.is_err());

    tokio::time::sleep(StdDuration::from_millis(250)).await;
    assert_eq!(h.settlement.committed(), 0);
    assert!(h.ledger.positions_of(&owner).is_empty());

    h.settlement.set_latency(None);
    assert_eq!(h.ledger.create_position(position(&owner, 5)).await, Ok(PositionId(1)));
}

#[tokio::test]
async fn test_lost_reply_resolved_by_lookup() {
    let h = harness_with(LedgerConfig {
        settlement_timeout: StdDuration::from_millis(20),
        ..LedgerConfig::default()
    });
    let manager = addr(0x01);
    let owner = addr(0xa1);
    let pool_id = h.ledger.create_pool(pool(&manager, 1_000)).await.unwrap();
    h.settlement.set_reply_delay(Some(StdDuration::from_millis(200)));

    let id = h.ledger.create_position(in_pool(&owner, 10, pool_id)).await.unwrap();
    assert_eq!(id, PositionId(1));
    assert_eq!(h.ledger.get_position(id).unwrap().state(), PositionState::Active);
    assert_eq!(h.ledger.get_pool(pool_id).unwrap().active_positions, 1);

    let revealed = h.ledger.withdraw_position(id, &owner).await.unwrap();
    assert_eq!(revealed.amount, Amount(10));
    assert_eq!(h.ledger.get_position(id).unwrap().state(), PositionState::Withdrawn);

    assert_eq!(h.settlement.committed(), 3);
    assert!(h.ledger.halted_keys().is_empty());
}

#[tokio::test]
async fn test_in_doubt_create_halts_and_burns_id() {
    let h = harness_with(LedgerConfig {
        settlement_timeout: StdDuration::from_millis(20),
        ..LedgerConfig::default()
    });
    let manager = addr(0x01);
    let owner = addr(0xa1);
    let pool_id = h.ledger.create_pool(pool(&manager, 1_000)).await.unwrap();
    h.settlement.set_reply_delay(Some(StdDuration::from_millis(200)));
    h.settlement.set_lookup_unavailable(true);

    let err = h.ledger.create_position(in_pool(&owner, 10, pool_id)).await.unwrap_err();
    assert_eq!(err, LedgerError::SettlementFailure(SettlementError::InDoubt(20)));
    assert!(!err.is_retryable());

    let halted = h.ledger.halted_keys();
    assert!(halted.contains(&LockKey::Position(PositionId(1))));
    assert!(halted.contains(&LockKey::Pool(pool_id)));
    assert!(h.ledger.positions_of(&owner).is_empty());

    h.settlement.set_reply_delay(None);
    h.settlement.set_lookup_unavailable(false);
    assert_eq!(h.ledger.create_position(position(&owner, 5)).await, Ok(PositionId(2)));

    // settlement 에는 1 이 남아 있음: 복구가 이를 반영
    let recovered = PositionLedger::recover(
        h.scheme.clone(),
        h.settlement.clone(),
        LedgerConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(recovered.get_position(PositionId(1)).unwrap().state(), PositionState::Active);
    assert_eq!(recovered.get_pool(pool_id).unwrap().active_positions, 1);
    assert_eq!(recovered.create_position(position(&owner, 5)).await, Ok(PositionId(3)));
}

#[tokio::test]
async fn test_in_doubt_withdraw_halts_position() {
    let h = harness_with(LedgerConfig {
        settlement_timeout: StdDuration::from_millis(20),
        ..LedgerConfig::default()
    });
    let owner = addr(0xa1);
    let id = h.ledger.create_position(position(&owner, 5)).await.unwrap();
    h.settlement.set_reply_delay(Some(StdDuration::from_millis(200)));
    h.settlement.set_lookup_unavailable(true);

    let err = h.ledger.withdraw_position(id, &owner).await.unwrap_err();
    assert!(matches!(err, LedgerError::SettlementFailure(SettlementError::InDoubt(_))));

    // 메모리 상태는 그대로, 키는 감사 전까지 차단
    assert_eq!(h.ledger.get_position(id).unwrap().state(), PositionState::Active);
    assert_eq!(h.ledger.halted_keys(), vec![LockKey::Position(id)]);

    h.settlement.set_reply_delay(None);
    h.settlement.set_lookup_unavailable(false);
    assert!(matches!(
        h.ledger.withdraw_position(id, &owner).await,
        Err(LedgerError::InvariantViolation(_))
    ));

    // 감사: settlement 기준으로 재구성
    assert!(h.settlement.reveal_record(id).is_some());
    let recovered = PositionLedger::recover(
        h.scheme.clone(),
        h.settlement.clone(),
        LedgerConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(recovered.get_position(id).unwrap().state(), PositionState::Withdrawn);
}

#[tokio::test]
async fn test_failed_withdraw_keeps_position_active() {
    let h = harness();
    let manager = addr(0x01);
    let owner = addr(0xa1);
    let pool_id = h.ledger.create_pool(pool(&manager, 100)).await.unwrap();
    let id = h.ledger.create_position(in_pool(&owner, 100, pool_id)).await.unwrap();
    let utilization = h.ledger.get_pool(pool_id).unwrap().utilization;

    h.settlement.fail_next(SettlementError::Unavailable("offline".to_string()));
    let err = h.ledger.withdraw_position(id, &owner).await.unwrap_err();
    assert!(err.is_retryable());

    assert_eq!(h.ledger.get_position(id).unwrap().state(), PositionState::Active);
    assert_eq!(h.ledger.get_pool(pool_id).unwrap().utilization, utilization);
    assert_eq!(h.ledger.farmer_stats(&owner).unwrap().withdrawn_positions, 0);

    // 재시도는 안전
    tokio_test::assert_ok!(h.ledger.withdraw_position(id, &owner).await);
    assert_eq!(h.ledger.get_pool(pool_id).unwrap().active_positions, 0);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_concurrent_withdrawals_one_wins() {
    let h = harness();
    let owner = addr(0xa1);
    let id = h.ledger.create_position(position(&owner, 5)).await.unwrap();
    h.settlement.set_latency(Some(StdDuration::from_millis(30)));

    let (first, second) = tokio::join!(
        h.ledger.withdraw_position(id, &owner),
        h.ledger.withdraw_position(id, &owner)
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| r.as_ref().err() == Some(&LedgerError::AlreadyWithdrawn(id))));
    assert_eq!(h.ledger.farmer_stats(&owner).unwrap().withdrawn_positions, 1);
}

#[tokio::test]
async fn test_concurrent_creates_get_distinct_ids() {
    let h = harness();
    let owner = addr(0xa1);
    h.settlement.set_latency(Some(StdDuration::from_millis(5)));

    let creates = (1..=5).map(|n| h.ledger.create_position(position(&owner, n)));
    let mut ids: Vec<u64> = futures_util::future::join_all(creates)
        .await
        .into_iter()
        .map(|r| r.unwrap().0)
        .collect();
    ids.sort_unstable();

    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(h.ledger.global_stats().total_positions, 5);
}

#[tokio::test]
async fn test_unrelated_creates_settle_concurrently() {
    let h = harness();
    let latency = StdDuration::from_millis(100);
    h.settlement.set_latency(Some(latency));

    let owners: Vec<OwnerId> = (1..=4).map(addr).collect();
    let started = std::time::Instant::now();
    let results =
        futures_util::future::join_all(owners.iter().map(|o| h.ledger.create_position(position(o, 5)))).await;
    let elapsed = started.elapsed();

    assert!(results.iter().all(Result::is_ok));
    // 직렬이면 4 * latency
    assert!(elapsed < latency * 2, "creates serialized: {:?}", elapsed);
}

#[tokio::test]
async fn test_withdraw_not_blocked_by_unrelated_create() {
    let h = harness();
    let manager = addr(0x01);
    let a = addr(0xa1);
    let b = addr(0xb2);
    let first = h.ledger.create_pool(pool(&manager, 1_000)).await.unwrap();
    let second = h.ledger.create_pool(pool(&manager, 1_000)).await.unwrap();
    let id = h.ledger.create_position(in_pool(&a, 10, first)).await.unwrap();

    let latency = StdDuration::from_millis(100);
    h.settlement.set_latency(Some(latency));
    let started = std::time::Instant::now();
    let (created, withdrawn) = tokio::join!(
        h.ledger.create_position(in_pool(&b, 10, second)),
        h.ledger.withdraw_position(id, &a)
    );

    tokio_test::assert_ok!(created);
    tokio_test::assert_ok!(withdrawn);
    assert!(started.elapsed() < latency * 2);
}

#[tokio::test]
async fn test_halted_key_blocks_mutation_until_cleared() {
    let h = harness();
    let manager = addr(0x01);
    let owner = addr(0xa1);
    let pool_id = h.ledger.create_pool(pool(&manager, 1_000)).await.unwrap();
    let id = h.ledger.create_position(position(&owner, 5)).await.unwrap();

    h.ledger.halt(LockKey::Position(id));
    assert!(matches!(
        h.ledger.withdraw_position(id, &owner).await,
        Err(LedgerError::InvariantViolation(_))
    ));
    // 조회는 계속 가능
    assert_eq!(h.ledger.get_position(id).unwrap().state(), PositionState::Active);

    h.ledger.halt(LockKey::Pool(pool_id));
    assert!(matches!(
        h.ledger.create_position(in_pool(&owner, 5, pool_id)).await,
        Err(LedgerError::InvariantViolation(_))
    ));
    assert_eq!(h.ledger.halted_keys().len(), 2);

    assert!(h.ledger.clear_halt(LockKey::Position(id)));
    assert!(h.ledger.clear_halt(LockKey::Pool(pool_id)));
    assert!(!h.ledger.clear_halt(LockKey::Pool(pool_id)));

    tokio_test::assert_ok!(h.ledger.withdraw_position(id, &owner).await);
    assert_eq!(
        h.ledger.create_position(in_pool(&owner, 5, pool_id)).await,
        Ok(PositionId(2))
    );
}

// ============================================================================
// Events and recovery
// ============================================================================

#[tokio::test]
async fn test_event_stream_in_commit_order() {
    let h = harness();
    let manager = addr(0x01);
    let owner = addr(0xa1);
    let mut all = h.ledger.subscribe(EventFilter::all());
    let mut mine = h.ledger.subscribe(EventFilter::participant(owner.clone()));

    let pool_id = h.ledger.create_pool(pool(&manager, 1_000)).await.unwrap();
    let id = h.ledger.create_position(in_pool(&owner, 10, pool_id)).await.unwrap();
    h.ledger.withdraw_position(id, &owner).await.unwrap();

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(StdDuration::from_secs(1), all.next())
            .await
            .unwrap()
            .unwrap();
        kinds.push(event.kind());
    }
    assert_eq!(
        kinds,
        vec![EventKind::PoolCreated, EventKind::PositionCreated, EventKind::PositionWithdrawn]
    );

    // participant 필터: 풀 생성 이벤트는 제외
    let first = tokio::time::timeout(StdDuration::from_secs(1), mine.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.kind(), EventKind::PositionCreated);
    assert_eq!(first.participant(), &owner);
}

#[tokio::test]
async fn test_recover_rebuilds_state() {
    let h = harness();
    let manager = addr(0x01);
    let a = addr(0xa1);
    let b = addr(0xb2);

    let pool_id = h.ledger.create_pool(pool(&manager, 1_000_000)).await.unwrap();
    let p1 = h.ledger.create_position(in_pool(&a, 600_000, pool_id)).await.unwrap();
    let p2 = h.ledger.create_position(position(&a, 40_000)).await.unwrap();
    h.ledger.create_position(position(&b, 9)).await.unwrap();
    let revealed = h.ledger.withdraw_position(p2, &a).await.unwrap();

    let recovered = PositionLedger::recover(
        h.scheme.clone(),
        h.settlement.clone(),
        LedgerConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(recovered.get_position(p1).unwrap().state(), PositionState::Active);
    match recovered.get_position(p2).unwrap() {
        PositionView::Withdrawn { revealed: restored, .. } => {
            assert_eq!(restored.amount, revealed.amount);
            assert_eq!(restored.earned, revealed.earned);
            assert_eq!(restored.withdrawn_at, revealed.withdrawn_at);
        }
        other => panic!("expected withdrawn view, got {:?}", other),
    }

    assert_eq!(
        recovered.farmer_stats(&a).unwrap().public_summary(),
        h.ledger.farmer_stats(&a).unwrap().public_summary()
    );
    assert_eq!(
        recovered.global_stats().public_summary(),
        h.ledger.global_stats().public_summary()
    );
    assert_eq!(recovered.get_pool(pool_id).unwrap().active_positions, 1);

    // 복구된 풀 용량: 남은 400_000 초과 불가
    assert_eq!(
        recovered.create_position(in_pool(&b, 400_001, pool_id)).await,
        Err(LedgerError::PoolCapacityExceeded(pool_id))
    );
    assert_eq!(
        recovered.create_position(in_pool(&b, 400_000, pool_id)).await,
        Ok(PositionId(4))
    );
    assert_eq!(recovered.create_pool(pool(&manager, 1)).await, Ok(PoolId(2)));
}

#[tokio::test]
async fn test_recover_halts_positions_outside_current_limits() {
    let h = harness();
    let owner = addr(0xa1);
    let long = h.ledger.create_position(position(&owner, 5)).await.unwrap();
    let short = h
        .ledger
        .create_position(CreatePositionRequest {
            duration_secs: 600,
            ..position(&owner, 5)
        })
        .await
        .unwrap();

    // MAX_DURATION_SECS 를 30일 미만으로 낮춘 재시작
    let recovered = PositionLedger::recover(
        h.scheme.clone(),
        h.settlement.clone(),
        LedgerConfig {
            max_duration_secs: 86_400,
            ..LedgerConfig::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(recovered.halted_keys(), vec![LockKey::Position(long)]);
    match recovered.get_position(long).unwrap() {
        PositionView::Active { amount, duration, .. } => {
            assert!(amount.satisfied);
            assert!(!duration.satisfied);
        }
        other => panic!("expected active view, got {:?}", other),
    }

    assert!(matches!(
        recovered.withdraw_position(long, &owner).await,
        Err(LedgerError::InvariantViolation(_))
    ));
    tokio_test::assert_ok!(recovered.withdraw_position(short, &owner).await);
}

#[tokio::test]
async fn test_health_follows_settlement() {
    let h = harness();
    tokio_test::assert_ok!(h.ledger.health_check().await);

    h.settlement.set_unavailable(true);
    tokio_test::assert_err!(h.ledger.health_check().await);
}

// ============================================================================
// HTTP routes
// ============================================================================

fn test_app() -> (Router, Arc<InMemorySettlement>) {
    let h = harness();
    let config = Config {
        port: 0,
        database_url: None,
        environment: Environment::Development,
        allowed_origins: vec![],
        settlement_timeout_ms: 5_000,
        max_duration_secs: DEFAULT_MAX_DURATION_SECS,
        sealing_key: None,
    };
    let state = AppState {
        ledger: Arc::new(h.ledger),
        hub: Arc::new(WsHub::new()),
        config: Arc::new(config),
    };
    (create_router(state), h.settlement)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_route_position_lifecycle() {
    let (app, _) = test_app();
    let owner = addr(0xa1).to_string();

    let (status, body) = send(
        &app,
        "POST",
        "/positions",
        Some(json!({
            "owner": owner,
            "amount": 1_000_000,
            "rate_bps": 500,
            "duration_secs": 2_592_000,
            "strategy": "Alpha"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["position_id"], 1);
    assert_eq!(body["data"]["position"]["state"], "active");

    let (status, body) = send(&app, "GET", "/positions/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["amount"]["satisfied"], true);

    let (status, body) = send(
        &app,
        "POST",
        "/positions/1/withdraw",
        Some(json!({ "caller": addr(0xb2).to_string() })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, body) = send(&app, "POST", "/positions/1/withdraw", Some(json!({ "caller": owner }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["amount"], 1_000_000);
    assert_eq!(body["data"]["earned"], 4_109);

    let (status, body) = send(&app, "POST", "/positions/1/withdraw", Some(json!({ "caller": owner }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ALREADY_WITHDRAWN");
    assert_eq!(body["retryable"], false);

    let (status, body) = send(&app, "GET", &format!("/owners/{}/positions", owner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["positions"][0]["state"], "withdrawn");
}

#[tokio::test]
async fn test_route_errors() {
    let (app, settlement) = test_app();
    let owner = addr(0xa1).to_string();

    let (status, body) = send(
        &app,
        "POST",
        "/positions",
        Some(json!({
            "owner": owner,
            "amount": 0,
            "rate_bps": 500,
            "duration_secs": 60,
            "strategy": "Alpha"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INPUT");

    let (status, _) = send(&app, "GET", "/positions/42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, "GET", "/owners/not-an-address/positions", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    settlement.fail_next(SettlementError::Timeout(10));
    let (status, body) = send(
        &app,
        "POST",
        "/pools",
        Some(json!({
            "manager": owner,
            "max_capacity": 100,
            "initial_yield_bps": 300,
            "name": "Main"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["retryable"], true);
}

#[tokio::test]
async fn test_route_malformed_bodies_are_bad_requests() {
    let (app, _) = test_app();
    let owner = addr(0xa1).to_string();

    let cases = [
        json!({"owner": "0x12", "amount": 5, "rate_bps": 500, "duration_secs": 60, "strategy": "Alpha"}),
        json!({"owner": owner, "amount": -5, "rate_bps": 500, "duration_secs": 60, "strategy": "Alpha"}),
        json!({"owner": owner, "amount": 5}),
    ];
    for case in cases {
        let (status, body) = send(&app, "POST", "/positions", Some(case)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
        assert_eq!(body["retryable"], false);
    }

    let (status, body) = send(&app, "POST", "/positions/1/withdraw", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    // 문법 오류 본문
    let request = Request::builder()
        .method("POST")
        .uri("/pools")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_route_pool_and_stats() {
    let (app, _) = test_app();
    let owner = addr(0xa1).to_string();

    let (status, body) = send(
        &app,
        "POST",
        "/pools",
        Some(json!({
            "manager": owner,
            "max_capacity": 100,
            "initial_yield_bps": 300,
            "name": "Main"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["pool_id"], 1);

    let (status, body) = send(&app, "GET", "/pools/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["within_capacity"], true);

    send(
        &app,
        "POST",
        "/positions",
        Some(json!({
            "owner": owner,
            "amount": 60,
            "rate_bps": 500,
            "duration_secs": 60,
            "strategy": "Alpha",
            "pool_id": 1
        })),
    )
    .await;

    let (status, body) = send(&app, "GET", &format!("/stats/farmers/{}", owner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["reputation"], 5);
    assert_eq!(body["data"]["active_positions"], 1);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/stats/farmers/{}/reveal", owner),
        Some(json!({ "caller": owner })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["active_stake"], 60);

    let (status, body) = send(&app, "GET", "/stats/global", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_pools"], 1);
    assert_eq!(body["data"]["total_positions"], 1);

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}
