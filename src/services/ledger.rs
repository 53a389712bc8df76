//! Position Ledger
//!
//! Owns the position and pool lifecycle:
//!
//! ```text
//!   create ──▶ Active (sealed) ──▶ withdraw ──▶ Withdrawn (revealed)
//! ```
//!
//! # Mutation protocol
//!
//! 1. validate and seal in memory, nothing is shared yet
//! 2. take the per-key locks (position, then pool) and reserve an id
//! 3. commit the operation to the settlement adapter, bounded by a timeout
//! 4. only after confirmation, apply the change to the in-memory maps and
//!    the stats snapshots without any `.await` in between
//!
//! A failure or cancellation anywhere before step 4 leaves no partial
//! position and no event. The reserved id goes back unless a later id was
//! handed out meanwhile, the adapter rejected the operation, or the outcome
//! is unknown.
//!
//! # In-doubt commits
//!
//! When the commit times out the ledger asks the adapter whether the
//! operation landed, by content hash. Found: the operation counts as
//! confirmed. Not found: rolled back. No answer: the touched keys are halted
//! and the caller gets `InDoubt`, until an operator reconciles.
//!
//! # Lock order
//!
//! `position → pool`. Ids come from an atomic counter that is never held
//! across `.await`, so unrelated creates run concurrently.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::{PoolRecord, PositionRecord};
use crate::sealed::{
    Amount, Binding, ContentId, Duration, Plaintext, Rate, RevealGrant, SealedBlob, SealedError,
    SealedValue, SealingScheme, TypeTag,
};
use crate::services::locks::{KeyedLocks, LockError, LockKey};
use crate::services::proof_engine::{Constraint, ConstraintProof, ProofEngine, ProofError};
use crate::services::settlement::{
    Confirmation, ContentHash, EventFilter, EventKind, LedgerEvent, Operation, OperationKind,
    PoolUtilization, SettlementAdapter, SettlementError,
};
use crate::services::stats::{fold_farmer, fold_global, FarmerStats, GlobalStats, StatsAggregator};
use crate::types::{
    OwnerId, PoolId, PositionId, DEFAULT_MAX_DURATION_SECS, MAX_LABEL_LEN, MAX_RATE_BPS,
    SECONDS_PER_YEAR,
};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("constraint proof rejected for {field} ({constraint})")]
    ProofRejected {
        field: &'static str,
        constraint: Constraint,
    },

    #[error("caller is not authorized for {0}")]
    Unauthorized(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("position {0} already withdrawn")]
    AlreadyWithdrawn(PositionId),

    #[error("pool {0} capacity exceeded")]
    PoolCapacityExceeded(PoolId),

    #[error("settlement failure: {0}")]
    SettlementFailure(#[from] SettlementError),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("sealing failure: {0}")]
    SealingFailure(String),
}

impl LedgerError {
    /// Whether the same request may succeed if retried unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::SettlementFailure(SettlementError::Timeout(_))
                | LedgerError::SettlementFailure(SettlementError::Unavailable(_))
        )
    }

    /// 거부 또는 결과 불명: 예약한 id 는 반납하지 않음
    fn burns_id(&self) -> bool {
        matches!(
            self,
            LedgerError::SettlementFailure(SettlementError::Rejected(_))
                | LedgerError::SettlementFailure(SettlementError::InDoubt(_))
        )
    }
}

impl From<LockError> for LedgerError {
    fn from(e: LockError) -> Self {
        LedgerError::InvariantViolation(e.to_string())
    }
}

impl From<ProofError> for LedgerError {
    fn from(e: ProofError) -> Self {
        LedgerError::SealingFailure(e.to_string())
    }
}

fn corrupt(what: impl std::fmt::Display, e: impl std::fmt::Display) -> LedgerError {
    LedgerError::InvariantViolation(format!("corrupt {}: {}", what, e))
}

fn db_id(id: u64) -> Result<i64, LedgerError> {
    i64::try_from(id).map_err(|_| LedgerError::InvariantViolation(format!("id {} exceeds storage range", id)))
}

fn from_db_id(id: i64) -> Result<u64, LedgerError> {
    u64::try_from(id).map_err(|_| LedgerError::InvariantViolation(format!("negative id {} in storage", id)))
}

// ============================================================================
// Configuration / requests
// ============================================================================

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Settlement 커밋 대기 상한
    pub settlement_timeout: StdDuration,
    pub max_duration_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            settlement_timeout: StdDuration::from_millis(5_000),
            max_duration_secs: DEFAULT_MAX_DURATION_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePositionRequest {
    pub owner: OwnerId,
    pub amount: u64,
    pub rate_bps: u32,
    pub duration_secs: u64,
    pub strategy: String,
    #[serde(default)]
    pub pool_id: Option<PoolId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePoolRequest {
    pub manager: OwnerId,
    pub max_capacity: u64,
    pub initial_yield_bps: u32,
    pub name: String,
}

fn validate_label(field: &str, value: &str) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        return Err(LedgerError::InvalidInput(format!("{} must not be empty", field)));
    }
    if value.chars().count() > MAX_LABEL_LEN {
        return Err(LedgerError::InvalidInput(format!(
            "{} longer than {} characters",
            field, MAX_LABEL_LEN
        )));
    }
    Ok(())
}

fn validate_rate(field: &str, rate_bps: u32) -> Result<(), LedgerError> {
    if !(1..=MAX_RATE_BPS).contains(&rate_bps) {
        return Err(LedgerError::InvalidInput(format!(
            "{} must be within [1, {}] bps",
            field, MAX_RATE_BPS
        )));
    }
    Ok(())
}

/// Local fast-fail checks; the proof engine is not invoked for these
fn validate_position(request: &CreatePositionRequest, created_at: DateTime<Utc>) -> Result<(), LedgerError> {
    if request.amount == 0 {
        return Err(LedgerError::InvalidInput("amount must be positive".to_string()));
    }
    validate_rate("rate", request.rate_bps)?;
    if request.duration_secs == 0 {
        return Err(LedgerError::InvalidInput("duration must be positive".to_string()));
    }
    if maturity(created_at, request.duration_secs).is_none() {
        return Err(LedgerError::InvalidInput(
            "duration overflows the maturity timestamp".to_string(),
        ));
    }
    validate_label("strategy", &request.strategy)
}

fn validate_pool(request: &CreatePoolRequest) -> Result<(), LedgerError> {
    if request.max_capacity == 0 {
        return Err(LedgerError::InvalidInput("capacity must be positive".to_string()));
    }
    validate_rate("initial yield", request.initial_yield_bps)?;
    validate_label("name", &request.name)
}

/// `created_at + duration`, `None` on overflow
pub fn maturity(created_at: DateTime<Utc>, duration_secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(duration_secs).ok()?;
    created_at.checked_add_signed(chrono::Duration::try_seconds(secs)?)
}

/// Simple interest over the committed term, floored
pub fn compute_earned(amount: Amount, rate: Rate, duration: Duration) -> Amount {
    let numerator = u128::from(amount.0) * u128::from(rate.0) * u128::from(duration.0);
    let denominator = u128::from(MAX_RATE_BPS) * u128::from(SECONDS_PER_YEAR);
    Amount(u64::try_from(numerator / denominator).unwrap_or(u64::MAX))
}

// ============================================================================
// Domain types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Active,
    Withdrawn,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Active => "active",
            PositionState::Withdrawn => "withdrawn",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PositionState::Active),
            "withdrawn" => Some(PositionState::Withdrawn),
            _ => None,
        }
    }
}

/// Sealed value plus the constraint proof that was verified for it
#[derive(Debug, Clone)]
pub struct SealedField<T: Plaintext> {
    pub value: SealedValue<T>,
    pub proof: ConstraintProof,
    /// 생성 시점 검증 결과 (조회 시 engine 호출 없이 사용)
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SealedFieldView {
    pub content_id: ContentId,
    pub tag: TypeTag,
    pub constraint: Constraint,
    pub satisfied: bool,
}

impl<T: Plaintext> SealedField<T> {
    fn restore(engine: &ProofEngine, bytes: &[u8], constraint: Constraint, what: &str) -> Result<Self, LedgerError> {
        let blob = SealedBlob::from_bytes(bytes).map_err(|e| corrupt(what, e))?;
        let value = SealedValue::from_blob(blob).map_err(|e| corrupt(what, e))?;
        let proof = engine.prove(&value, constraint)?;
        let verified = engine.verify(&proof, &value);
        Ok(Self {
            value,
            proof,
            verified,
        })
    }

    pub fn view(&self) -> SealedFieldView {
        SealedFieldView {
            content_id: self.value.content_id(),
            tag: T::TAG,
            constraint: self.proof.constraint,
            satisfied: self.verified,
        }
    }
}

/// Plaintext lifecycle fields, published on withdrawal as the audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevealedFields {
    pub position_id: PositionId,
    pub owner: OwnerId,
    pub amount: Amount,
    pub rate: Rate,
    pub duration: Duration,
    pub strategy: String,
    pub earned: Amount,
    pub created_at: DateTime<Utc>,
    pub matures_at: DateTime<Utc>,
    pub withdrawn_at: DateTime<Utc>,
    pub matured: bool,
    pub proofs: Vec<ConstraintProof>,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub id: PositionId,
    pub owner: OwnerId,
    pub amount: SealedField<Amount>,
    pub rate: SealedField<Rate>,
    pub duration: SealedField<Duration>,
    pub strategy: String,
    pub created_at: DateTime<Utc>,
    pub state: PositionState,
    pub pool_id: Option<PoolId>,
    /// Withdrawn 이후에만 Some
    pub revealed: Option<RevealedFields>,
}

impl Position {
    /// Every sealed field still satisfies its constraint
    pub fn all_verified(&self) -> bool {
        self.amount.verified && self.rate.verified && self.duration.verified
    }

    pub fn content_ids(&self) -> [ContentId; 3] {
        [
            self.amount.value.content_id(),
            self.rate.value.content_id(),
            self.duration.value.content_id(),
        ]
    }

    fn to_record(&self) -> Result<PositionRecord, LedgerError> {
        Ok(PositionRecord {
            id: db_id(self.id.0)?,
            owner: self.owner.to_string(),
            sealed_amount: self.amount.value.blob().to_bytes(),
            sealed_rate: self.rate.value.blob().to_bytes(),
            sealed_duration: self.duration.value.blob().to_bytes(),
            strategy: self.strategy.clone(),
            state: self.state.as_str().to_string(),
            created_at: self.created_at,
            withdrawn_at: self.revealed.as_ref().map(|r| r.withdrawn_at),
            pool_id: self.pool_id.map(|p| db_id(p.0)).transpose()?,
        })
    }

    fn restore(engine: &ProofEngine, record: &PositionRecord) -> Result<Self, LedgerError> {
        let what = format!("position {}", record.id);
        let state = PositionState::parse(&record.state)
            .ok_or_else(|| corrupt(&what, format!("unknown state {:?}", record.state)))?;

        let mut position = Self {
            id: PositionId(from_db_id(record.id)?),
            owner: OwnerId::new(&record.owner).map_err(|e| corrupt(&what, e))?,
            amount: SealedField::restore(engine, &record.sealed_amount, Constraint::PositiveAmount, &what)?,
            rate: SealedField::restore(engine, &record.sealed_rate, Constraint::RateInRange, &what)?,
            duration: SealedField::restore(engine, &record.sealed_duration, Constraint::DurationInRange, &what)?,
            strategy: record.strategy.clone(),
            created_at: record.created_at,
            state,
            pool_id: record.pool_id.map(from_db_id).transpose()?.map(PoolId),
            revealed: None,
        };

        if state == PositionState::Withdrawn {
            let withdrawn_at = record
                .withdrawn_at
                .ok_or_else(|| corrupt(&what, "withdrawn without timestamp"))?;
            position.revealed = Some(reveal_fields(engine, &mut position, withdrawn_at)?);
        }
        Ok(position)
    }

    pub fn view(&self) -> PositionView {
        match &self.revealed {
            Some(revealed) if self.state == PositionState::Withdrawn => PositionView::Withdrawn {
                id: self.id,
                owner: self.owner.clone(),
                strategy: self.strategy.clone(),
                created_at: self.created_at,
                pool_id: self.pool_id,
                revealed: revealed.clone(),
            },
            _ => PositionView::Active {
                id: self.id,
                owner: self.owner.clone(),
                strategy: self.strategy.clone(),
                created_at: self.created_at,
                pool_id: self.pool_id,
                amount: self.amount.view(),
                rate: self.rate.view(),
                duration: self.duration.view(),
            },
        }
    }
}

/// Open a position's sealed fields for its owner.
///
/// Caches the plaintexts on `position` and derives maturity and rewards.
fn reveal_fields(
    engine: &ProofEngine,
    position: &mut Position,
    withdrawn_at: DateTime<Utc>,
) -> Result<RevealedFields, LedgerError> {
    let id = position.id;
    let grant = RevealGrant::for_owner(&position.owner);
    let violation = |e: SealedError| LedgerError::InvariantViolation(format!("position {} reveal failed: {}", id, e));

    let amount = engine.reveal(&mut position.amount.value, &grant).map_err(violation)?;
    let rate = engine.reveal(&mut position.rate.value, &grant).map_err(violation)?;
    let duration = engine.reveal(&mut position.duration.value, &grant).map_err(violation)?;

    let matures_at = maturity(position.created_at, duration.0).ok_or_else(|| {
        LedgerError::InvariantViolation(format!("position {} maturity overflows", id))
    })?;

    Ok(RevealedFields {
        position_id: id,
        owner: position.owner.clone(),
        amount,
        rate,
        duration,
        strategy: position.strategy.clone(),
        earned: compute_earned(amount, rate, duration),
        created_at: position.created_at,
        matures_at,
        withdrawn_at,
        matured: withdrawn_at >= matures_at,
        proofs: vec![
            position.amount.proof.clone(),
            position.rate.proof.clone(),
            position.duration.proof.clone(),
        ],
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PositionView {
    Active {
        id: PositionId,
        owner: OwnerId,
        strategy: String,
        created_at: DateTime<Utc>,
        pool_id: Option<PoolId>,
        amount: SealedFieldView,
        rate: SealedFieldView,
        duration: SealedFieldView,
    },
    Withdrawn {
        id: PositionId,
        owner: OwnerId,
        strategy: String,
        created_at: DateTime<Utc>,
        pool_id: Option<PoolId>,
        revealed: RevealedFields,
    },
}

impl PositionView {
    pub fn id(&self) -> PositionId {
        match self {
            PositionView::Active { id, .. } | PositionView::Withdrawn { id, .. } => *id,
        }
    }

    pub fn state(&self) -> PositionState {
        match self {
            PositionView::Active { .. } => PositionState::Active,
            PositionView::Withdrawn { .. } => PositionState::Withdrawn,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pool {
    pub id: PoolId,
    pub manager: OwnerId,
    pub name: String,
    pub capacity: SealedField<Amount>,
    pub initial_yield: SealedField<Rate>,
    /// 활성 포지션 금액 합 (봉인, manager binding)
    pub utilization: SealedValue<Amount>,
    pub utilization_proof: ConstraintProof,
    pub created_at: DateTime<Utc>,
    pub active_positions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolView {
    pub id: PoolId,
    pub manager: OwnerId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub active_positions: u64,
    pub capacity: SealedFieldView,
    pub initial_yield: SealedFieldView,
    pub utilization: ContentId,
    pub within_capacity: bool,
}

impl Pool {
    fn to_record(&self) -> Result<PoolRecord, LedgerError> {
        Ok(PoolRecord {
            id: db_id(self.id.0)?,
            manager: self.manager.to_string(),
            name: self.name.clone(),
            sealed_capacity: self.capacity.value.blob().to_bytes(),
            sealed_initial_yield: self.initial_yield.value.blob().to_bytes(),
            sealed_utilization: self.utilization.blob().to_bytes(),
            created_at: self.created_at,
        })
    }

    fn restore(engine: &ProofEngine, record: &PoolRecord) -> Result<Self, LedgerError> {
        let what = format!("pool {}", record.id);
        let capacity = SealedField::restore(engine, &record.sealed_capacity, Constraint::PositiveCapacity, &what)?;
        let utilization: SealedValue<Amount> = SealedBlob::from_bytes(&record.sealed_utilization)
            .and_then(SealedValue::from_blob)
            .map_err(|e| corrupt(&what, e))?;
        let utilization_proof = engine.prove_within_capacity(&utilization, &capacity.value)?;

        Ok(Self {
            id: PoolId(from_db_id(record.id)?),
            manager: OwnerId::new(&record.manager).map_err(|e| corrupt(&what, e))?,
            name: record.name.clone(),
            initial_yield: SealedField::restore(engine, &record.sealed_initial_yield, Constraint::RateInRange, &what)?,
            capacity,
            utilization,
            utilization_proof,
            created_at: record.created_at,
            active_positions: 0,
        })
    }

    pub fn view(&self, engine: &ProofEngine) -> PoolView {
        PoolView {
            id: self.id,
            manager: self.manager.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            active_positions: self.active_positions,
            capacity: self.capacity.view(),
            initial_yield: self.initial_yield.view(),
            utilization: self.utilization.content_id(),
            within_capacity: engine.verify_within_capacity(
                &self.utilization_proof,
                &self.utilization,
                &self.capacity.value,
            ),
        }
    }
}

/// Opened farmer stake
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StakeReveal {
    pub owner: OwnerId,
    pub active_stake: Amount,
    pub withdrawn_stake: Amount,
    pub total_staked: Amount,
}

/// Staged pool change, applied after settlement confirms
struct PoolChange {
    pool_id: PoolId,
    utilization: SealedValue<Amount>,
    proof: ConstraintProof,
}

impl PoolChange {
    fn to_update(&self) -> PoolUtilization {
        PoolUtilization {
            pool_id: self.pool_id,
            sealed_utilization: self.utilization.blob().to_bytes(),
        }
    }
}

// ============================================================================
// Id reservation
// ============================================================================

/// 확정 전까지 예약된 id. 반납은 그 뒤로 다른 id 가 나가지 않았을 때만 가능
struct IdReservation<'a> {
    seq: &'a AtomicU64,
    id: u64,
    retained: bool,
}

impl<'a> IdReservation<'a> {
    fn next(seq: &'a AtomicU64) -> Result<Self, LedgerError> {
        let last = seq
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
            .map_err(|_| LedgerError::InvariantViolation("id space exhausted".to_string()))?;
        Ok(Self {
            seq,
            id: last + 1,
            retained: false,
        })
    }

    /// Keep the id on success, and on failures that may have consumed it
    fn settled<T>(&mut self, result: Result<T, LedgerError>) -> Result<T, LedgerError> {
        match &result {
            Ok(_) => self.retained = true,
            Err(e) if e.burns_id() => self.retained = true,
            Err(_) => {}
        }
        result
    }
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        if !self.retained {
            let _ = self
                .seq
                .compare_exchange(self.id, self.id - 1, Ordering::AcqRel, Ordering::Acquire);
        }
    }
}

// ============================================================================
// PositionLedger
// ============================================================================

pub struct PositionLedger {
    engine: Arc<ProofEngine>,
    settlement: Arc<dyn SettlementAdapter>,
    config: LedgerConfig,
    positions: RwLock<BTreeMap<PositionId, Position>>,
    pools: RwLock<BTreeMap<PoolId, Pool>>,
    stats: StatsAggregator,
    locks: KeyedLocks,
    /// 마지막으로 예약된 id
    position_seq: AtomicU64,
    pool_seq: AtomicU64,
}

impl PositionLedger {
    pub fn new(
        scheme: Arc<dyn SealingScheme>,
        settlement: Arc<dyn SettlementAdapter>,
        config: LedgerConfig,
    ) -> Result<Self, LedgerError> {
        let engine = Arc::new(ProofEngine::new(scheme, config.max_duration_secs));
        let stats = StatsAggregator::new(engine.clone())?;

        Ok(Self {
            engine,
            settlement,
            config,
            positions: RwLock::new(BTreeMap::new()),
            pools: RwLock::new(BTreeMap::new()),
            stats,
            locks: KeyedLocks::new(),
            position_seq: AtomicU64::new(0),
            pool_seq: AtomicU64::new(0),
        })
    }

    /// Rebuild the ledger from the adapter's durable records.
    ///
    /// Proofs are re-derived, withdrawn positions re-revealed, stats
    /// recomputed by full fold.
    pub async fn recover(
        scheme: Arc<dyn SealingScheme>,
        settlement: Arc<dyn SettlementAdapter>,
        config: LedgerConfig,
    ) -> Result<Self, LedgerError> {
        let mut ledger = Self::new(scheme, settlement, config)?;
        let snapshot = ledger.settlement.load_state().await?;

        let mut pools = BTreeMap::new();
        for record in &snapshot.pools {
            let pool = Pool::restore(&ledger.engine, record)?;
            if !(pool.capacity.verified && pool.initial_yield.verified) {
                error!(pool_id = %pool.id, "restored pool fails its constraints under the current limits");
                ledger.locks.halt(LockKey::Pool(pool.id));
            }
            pools.insert(pool.id, pool);
        }

        let mut positions = BTreeMap::new();
        for record in &snapshot.positions {
            let position = Position::restore(&ledger.engine, record)?;
            // 설정 변경 (예: MAX_DURATION_SECS 하향) 으로 기존 증명이 깨진 경우
            if position.state == PositionState::Active && !position.all_verified() {
                error!(
                    position_id = %position.id,
                    "restored position fails its constraints under the current limits"
                );
                ledger.locks.halt(LockKey::Position(position.id));
            }
            if let (PositionState::Active, Some(pool_id)) = (position.state, position.pool_id) {
                let pool = pools
                    .get_mut(&pool_id)
                    .ok_or_else(|| corrupt(format!("position {}", position.id), "references unknown pool"))?;
                pool.active_positions += 1;
            }
            positions.insert(position.id, position);
        }

        let all: Vec<&Position> = positions.values().collect();
        ledger.stats.rebuild(&all, pools.len() as u64)?;

        *ledger.position_seq.get_mut() = positions.keys().next_back().map_or(0, |id| id.0);
        *ledger.pool_seq.get_mut() = pools.keys().next_back().map_or(0, |id| id.0);

        info!(
            positions = positions.len(),
            pools = pools.len(),
            halted = ledger.locks.halted_keys().len(),
            "ledger recovered"
        );

        *ledger.positions.get_mut() = positions;
        *ledger.pools.get_mut() = pools;
        Ok(ledger)
    }

    pub fn engine(&self) -> &ProofEngine {
        &self.engine
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    /// Seal, prove and commit a new position
    pub async fn create_position(&self, request: CreatePositionRequest) -> Result<PositionId, LedgerError> {
        let created_at = Utc::now();
        validate_position(&request, created_at)?;

        let binding = Binding::owner(&request.owner);
        let amount = self.seal_field(Amount(request.amount), binding, Constraint::PositiveAmount, "amount")?;
        let rate = self.seal_field(Rate(request.rate_bps), binding, Constraint::RateInRange, "rate")?;
        let duration = self.seal_field(
            Duration(request.duration_secs),
            binding,
            Constraint::DurationInRange,
            "duration",
        )?;

        let mut pool_change = None;
        let _pool_guard = match request.pool_id {
            Some(pool_id) => {
                self.ensure_pool_exists(pool_id)?;
                let guard = self.locks.acquire(LockKey::Pool(pool_id)).await?;
                pool_change = Some(self.reserve_capacity(pool_id, &amount.value)?);
                Some(guard)
            }
            None => None,
        };

        let mut reservation = IdReservation::next(&self.position_seq)?;
        let id = PositionId(reservation.id);

        let position = Position {
            id,
            owner: request.owner,
            amount,
            rate,
            duration,
            strategy: request.strategy,
            created_at,
            state: PositionState::Active,
            pool_id: request.pool_id,
            revealed: None,
        };

        let operation = Operation {
            kind: OperationKind::CreatePosition {
                record: position.to_record()?,
                utilization: pool_change.as_ref().map(PoolChange::to_update),
            },
            event: LedgerEvent::PositionCreated {
                position_id: id,
                owner: position.owner.clone(),
                pool_id: position.pool_id,
                content_hash: ContentHash::compute(
                    EventKind::PositionCreated,
                    id.0,
                    &position.owner,
                    &position.content_ids(),
                ),
            },
        };
        let mut touched = vec![LockKey::Position(id)];
        touched.extend(request.pool_id.map(LockKey::Pool));
        let confirmation = reservation.settled(self.settle(operation, &touched).await)?;

        // 확정 이후: await 없이 적용
        if let Some(change) = pool_change {
            self.apply_pool_change(change, 1);
        }
        if let Err(e) = self.stats.record_created(&position) {
            error!(position_id = %id, error = %e, "stats update failed after commit");
            self.locks.halt(LockKey::Position(id));
        }
        let owner = position.owner.clone();
        self.positions.write().insert(id, position);

        info!(
            position_id = %id,
            owner = %owner,
            pool_id = ?request.pool_id,
            sequence = confirmation.sequence,
            "position created"
        );
        Ok(id)
    }

    /// Reveal and close a position. Only the owner may withdraw.
    pub async fn withdraw_position(&self, id: PositionId, caller: &OwnerId) -> Result<RevealedFields, LedgerError> {
        // 존재하지 않는 id로 락 테이블이 커지지 않도록 먼저 확인
        self.check_owner(id, caller)?;

        let _guard = self.locks.acquire(LockKey::Position(id)).await?;

        let mut staged = self
            .positions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("position {}", id)))?;
        if &staged.owner != caller {
            return Err(LedgerError::Unauthorized(format!("position {}", id)));
        }
        if staged.state == PositionState::Withdrawn {
            return Err(LedgerError::AlreadyWithdrawn(id));
        }

        let withdrawn_at = Utc::now();
        let revealed = reveal_fields(&self.engine, &mut staged, withdrawn_at).map_err(|e| {
            error!(position_id = %id, error = %e, "reveal failed on withdrawal");
            self.locks.halt(LockKey::Position(id));
            e
        })?;

        let mut pool_change = None;
        let _pool_guard = match staged.pool_id {
            Some(pool_id) => {
                let guard = self.locks.acquire(LockKey::Pool(pool_id)).await?;
                pool_change = Some(self.release_capacity(pool_id, &staged.amount.value)?);
                Some(guard)
            }
            None => None,
        };

        staged.state = PositionState::Withdrawn;
        staged.revealed = Some(revealed.clone());

        let operation = Operation {
            kind: OperationKind::WithdrawPosition {
                position_id: id,
                revealed: revealed.clone(),
                utilization: pool_change.as_ref().map(PoolChange::to_update),
            },
            event: LedgerEvent::PositionWithdrawn {
                position_id: id,
                owner: staged.owner.clone(),
                pool_id: staged.pool_id,
                content_hash: ContentHash::compute(
                    EventKind::PositionWithdrawn,
                    id.0,
                    &staged.owner,
                    &staged.content_ids(),
                ),
            },
        };
        let mut touched = vec![LockKey::Position(id)];
        touched.extend(staged.pool_id.map(LockKey::Pool));
        let confirmation = self.settle(operation, &touched).await?;

        if let Some(change) = pool_change {
            self.apply_pool_change(change, -1);
        }
        if let Err(e) = self.stats.record_withdrawn(&staged, &revealed) {
            error!(position_id = %id, error = %e, "stats update failed after commit");
            self.locks.halt(LockKey::Position(id));
        }
        self.positions.write().insert(id, staged);

        info!(
            position_id = %id,
            owner = %caller,
            matured = revealed.matured,
            sequence = confirmation.sequence,
            "position withdrawn"
        );
        Ok(revealed)
    }

    /// Current view. Never waits on a mutation in progress.
    pub fn get_position(&self, id: PositionId) -> Result<PositionView, LedgerError> {
        self.positions
            .read()
            .get(&id)
            .map(Position::view)
            .ok_or_else(|| LedgerError::NotFound(format!("position {}", id)))
    }

    pub fn positions_of(&self, owner: &OwnerId) -> Vec<PositionView> {
        self.positions
            .read()
            .values()
            .filter(|p| &p.owner == owner)
            .map(Position::view)
            .collect()
    }

    // ------------------------------------------------------------------
    // Pools
    // ------------------------------------------------------------------

    pub async fn create_pool(&self, request: CreatePoolRequest) -> Result<PoolId, LedgerError> {
        validate_pool(&request)?;

        let binding = Binding::owner(&request.manager);
        let capacity = self.seal_field(
            Amount(request.max_capacity),
            binding,
            Constraint::PositiveCapacity,
            "capacity",
        )?;
        let initial_yield = self.seal_field(
            Rate(request.initial_yield_bps),
            binding,
            Constraint::RateInRange,
            "initial_yield",
        )?;
        let utilization = self.engine.seal(Amount(0), binding)?;
        let utilization_proof = self.engine.prove_within_capacity(&utilization, &capacity.value)?;

        let mut reservation = IdReservation::next(&self.pool_seq)?;
        let id = PoolId(reservation.id);

        let pool = Pool {
            id,
            manager: request.manager,
            name: request.name,
            capacity,
            initial_yield,
            utilization,
            utilization_proof,
            created_at: Utc::now(),
            active_positions: 0,
        };

        let operation = Operation {
            kind: OperationKind::CreatePool {
                record: pool.to_record()?,
            },
            event: LedgerEvent::PoolCreated {
                pool_id: id,
                manager: pool.manager.clone(),
                content_hash: ContentHash::compute(
                    EventKind::PoolCreated,
                    id.0,
                    &pool.manager,
                    &[
                        pool.capacity.value.content_id(),
                        pool.initial_yield.value.content_id(),
                        pool.utilization.content_id(),
                    ],
                ),
            },
        };
        let confirmation = reservation.settled(self.settle(operation, &[LockKey::Pool(id)]).await)?;

        self.stats.record_pool_created();
        info!(pool_id = %id, manager = %pool.manager, sequence = confirmation.sequence, "pool created");
        self.pools.write().insert(id, pool);
        Ok(id)
    }

    pub fn get_pool(&self, id: PoolId) -> Result<PoolView, LedgerError> {
        self.pools
            .read()
            .get(&id)
            .map(|pool| pool.view(&self.engine))
            .ok_or_else(|| LedgerError::NotFound(format!("pool {}", id)))
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub fn farmer_stats(&self, owner: &OwnerId) -> Result<FarmerStats, LedgerError> {
        Ok(self.stats.farmer_stats(owner)?)
    }

    pub fn global_stats(&self) -> GlobalStats {
        self.stats.global_stats()
    }

    /// Full fold over the owner's positions (bypasses the snapshot)
    pub fn recompute_farmer_stats(&self, owner: &OwnerId) -> Result<FarmerStats, LedgerError> {
        // 봉인 연산은 락 밖에서
        let owned: Vec<Position> = self
            .positions
            .read()
            .values()
            .filter(|p| &p.owner == owner)
            .cloned()
            .collect();
        Ok(fold_farmer(&self.engine, owner, owned.iter())?)
    }

    pub fn recompute_global_stats(&self) -> Result<GlobalStats, LedgerError> {
        let all: Vec<Position> = self.positions.read().values().cloned().collect();
        let total_pools = self.pools.read().len() as u64;
        Ok(fold_global(&self.engine, all.iter(), total_pools)?)
    }

    /// Open the owner's sealed active stake
    pub fn reveal_farmer_stake(&self, owner: &OwnerId, caller: &OwnerId) -> Result<StakeReveal, LedgerError> {
        if owner != caller {
            return Err(LedgerError::Unauthorized(format!("stake of {}", owner)));
        }

        let mut stats = self.stats.farmer_stats(owner)?;
        let grant = RevealGrant::for_owner(owner);
        let active_stake = self
            .engine
            .reveal(&mut stats.active_stake, &grant)
            .map_err(|e| LedgerError::InvariantViolation(format!("stake of {}: {}", owner, e)))?;
        let total_staked = active_stake
            .0
            .checked_add(stats.withdrawn_stake.0)
            .ok_or_else(|| LedgerError::InvariantViolation(format!("stake of {} overflows", owner)))?;

        Ok(StakeReveal {
            owner: owner.clone(),
            active_stake,
            withdrawn_stake: stats.withdrawn_stake,
            total_staked: Amount(total_staked),
        })
    }

    // ------------------------------------------------------------------
    // Events / operations
    // ------------------------------------------------------------------

    pub fn subscribe(&self, filter: EventFilter) -> BoxStream<'static, LedgerEvent> {
        self.settlement.subscribe(filter)
    }

    pub async fn health_check(&self) -> Result<(), LedgerError> {
        Ok(self.settlement.health_check().await?)
    }

    /// Operator halt of a key, e.g. during an audit
    pub fn halt(&self, key: LockKey) {
        self.locks.halt(key);
    }

    /// Lift a halt after audit
    pub fn clear_halt(&self, key: LockKey) -> bool {
        self.locks.clear_halt(key)
    }

    pub fn halted_keys(&self) -> Vec<LockKey> {
        self.locks.halted_keys()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn seal_field<T: Plaintext>(
        &self,
        plaintext: T,
        binding: Binding,
        constraint: Constraint,
        field: &'static str,
    ) -> Result<SealedField<T>, LedgerError> {
        let (value, proof) = self.engine.seal_and_prove(plaintext, binding, constraint)?;
        if !self.engine.verify(&proof, &value) {
            warn!(field, %constraint, "constraint proof rejected");
            return Err(LedgerError::ProofRejected { field, constraint });
        }
        Ok(SealedField {
            value,
            proof,
            verified: true,
        })
    }

    fn check_owner(&self, id: PositionId, caller: &OwnerId) -> Result<(), LedgerError> {
        let positions = self.positions.read();
        let position = positions
            .get(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("position {}", id)))?;
        if &position.owner != caller {
            warn!(position_id = %id, caller = %caller, "withdrawal by non-owner");
            return Err(LedgerError::Unauthorized(format!("position {}", id)));
        }
        Ok(())
    }

    fn ensure_pool_exists(&self, pool_id: PoolId) -> Result<(), LedgerError> {
        if self.pools.read().contains_key(&pool_id) {
            Ok(())
        } else {
            Err(LedgerError::NotFound(format!("pool {}", pool_id)))
        }
    }

    /// Sealed `utilization + amount`, proven against the sealed capacity
    fn reserve_capacity(&self, pool_id: PoolId, amount: &SealedValue<Amount>) -> Result<PoolChange, LedgerError> {
        let (current, capacity, manager) = {
            let pools = self.pools.read();
            let pool = pools
                .get(&pool_id)
                .ok_or_else(|| LedgerError::NotFound(format!("pool {}", pool_id)))?;
            (pool.utilization.clone(), pool.capacity.value.clone(), pool.manager.clone())
        };

        let utilization = match self.engine.add(&current, amount, Binding::owner(&manager)) {
            Ok(value) => value,
            Err(ProofError::Sealed(SealedError::Overflow)) => {
                return Err(LedgerError::PoolCapacityExceeded(pool_id))
            }
            Err(e) => return Err(e.into()),
        };
        let proof = self.engine.prove_within_capacity(&utilization, &capacity)?;
        if !self.engine.verify_within_capacity(&proof, &utilization, &capacity) {
            warn!(pool_id = %pool_id, "pool capacity exceeded");
            return Err(LedgerError::PoolCapacityExceeded(pool_id));
        }

        Ok(PoolChange {
            pool_id,
            utilization,
            proof,
        })
    }

    /// Sealed `utilization - amount`
    fn release_capacity(&self, pool_id: PoolId, amount: &SealedValue<Amount>) -> Result<PoolChange, LedgerError> {
        let (current, capacity, manager) = {
            let pools = self.pools.read();
            let pool = pools
                .get(&pool_id)
                .ok_or_else(|| LedgerError::InvariantViolation(format!("pool {} vanished", pool_id)))?;
            (pool.utilization.clone(), pool.capacity.value.clone(), pool.manager.clone())
        };

        let utilization = self
            .engine
            .sub(&current, amount, Binding::owner(&manager))
            .map_err(|e| {
                error!(pool_id = %pool_id, error = %e, "pool utilization underflow");
                self.locks.halt(LockKey::Pool(pool_id));
                LedgerError::InvariantViolation(format!("pool {} utilization: {}", pool_id, e))
            })?;
        let proof = self.engine.prove_within_capacity(&utilization, &capacity)?;

        Ok(PoolChange {
            pool_id,
            utilization,
            proof,
        })
    }

    fn apply_pool_change(&self, change: PoolChange, delta: i64) {
        let mut pools = self.pools.write();
        match pools.get_mut(&change.pool_id) {
            Some(pool) => {
                pool.utilization = change.utilization;
                pool.utilization_proof = change.proof;
                pool.active_positions = pool.active_positions.saturating_add_signed(delta);
            }
            None => {
                error!(pool_id = %change.pool_id, "committed change for unknown pool");
                self.locks.halt(LockKey::Pool(change.pool_id));
            }
        }
    }

    /// Commit with the configured timeout.
    ///
    /// On timeout the commit future is dropped and the adapter is asked,
    /// within the same timeout, whether the operation landed anyway. If that
    /// question goes unanswered every key in `touched` is halted.
    async fn settle(&self, operation: Operation, touched: &[LockKey]) -> Result<Confirmation, LedgerError> {
        let kind = operation.event.kind();
        let content_hash = operation.event.content_hash();
        let timeout = self.config.settlement_timeout;
        let timeout_ms = timeout.as_millis() as u64;

        let result = match tokio::time::timeout(timeout, self.settlement.commit(operation)).await {
            Ok(result) => result,
            Err(_) => match tokio::time::timeout(timeout, self.settlement.lookup(&content_hash)).await {
                Ok(Ok(Some(confirmation))) => {
                    warn!(
                        event = kind.as_str(),
                        sequence = confirmation.sequence,
                        "settlement reply lost, operation found committed"
                    );
                    Ok(confirmation)
                }
                Ok(Ok(None)) => Err(SettlementError::Timeout(timeout_ms)),
                Ok(Err(e)) => {
                    error!(event = kind.as_str(), error = %e, "settlement outcome lookup failed");
                    Err(SettlementError::InDoubt(timeout_ms))
                }
                Err(_) => {
                    error!(event = kind.as_str(), "settlement outcome lookup timed out");
                    Err(SettlementError::InDoubt(timeout_ms))
                }
            },
        };

        result.map_err(|e| {
            if let SettlementError::InDoubt(_) = e {
                for key in touched {
                    self.locks.halt(*key);
                }
            } else {
                warn!(event = kind.as_str(), error = %e, "settlement failed, operation rolled back");
            }
            LedgerError::SettlementFailure(e)
        })
    }
}

impl std::fmt::Debug for PositionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionLedger")
            .field("positions", &self.positions.read().len())
            .field("pools", &self.pools.read().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
