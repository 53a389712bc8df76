//! Settlement Adapter
//!
//! The durable, ordered, append-only record behind the ledger. The ledger
//! hands it one [`Operation`] at a time and only applies the change to its
//! own state after a [`Confirmation`] comes back.
//!
//! # Guarantees required from an adapter
//!
//! - `commit` is atomic: either every record in the operation persists and
//!   the event is emitted, or nothing happens
//! - events are emitted only after the records are durable
//! - a dropped `commit` future either wrote nothing or committed in full;
//!   [`SettlementAdapter::lookup`] tells the two apart by content hash
//!
//! # Adapters
//!
//! - [`InMemorySettlement`]: process-local, used by tests and by the server
//!   when no `DATABASE_URL` is set
//! - [`Database`](crate::db::Database): PostgreSQL via sqlx transactions

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::db::{PoolRecord, PositionRecord};
use crate::sealed::{keccak, ContentId};
use crate::services::ledger::{PositionState, RevealedFields};
use crate::types::{OwnerId, PoolId, PositionId};

/// 이벤트 채널 버퍼 크기
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettlementError {
    #[error("settlement rejected the operation: {0}")]
    Rejected(String),

    #[error("settlement did not confirm within {0}ms")]
    Timeout(u64),

    #[error("settlement unavailable: {0}")]
    Unavailable(String),

    /// 타임아웃 후 커밋 여부를 확인하지 못함. 관련 키는 halt 됨
    #[error("settlement outcome unknown after {0}ms")]
    InDoubt(u64),
}

// ============================================================================
// Events
// ============================================================================

/// Hash over an event's public fields and the content ids of its sealed values
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn compute(kind: EventKind, id: u64, participant: &OwnerId, sealed: &[ContentId]) -> Self {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(4 + sealed.len());
        let id_bytes = id.to_be_bytes();
        parts.push(b"stealth-yield/event");
        parts.push(kind.as_str().as_bytes());
        parts.push(&id_bytes);
        parts.push(participant.as_str().as_bytes());
        for content_id in sealed {
            parts.push(content_id.as_bytes());
        }
        Self(keccak(&parts))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PositionCreated,
    PositionWithdrawn,
    PoolCreated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PositionCreated => "position_created",
            EventKind::PositionWithdrawn => "position_withdrawn",
            EventKind::PoolCreated => "pool_created",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "position_created" => Some(EventKind::PositionCreated),
            "position_withdrawn" => Some(EventKind::PositionWithdrawn),
            "pool_created" => Some(EventKind::PoolCreated),
            _ => None,
        }
    }
}

/// Lifecycle event. Carries ids, public metadata and content hashes only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LedgerEvent {
    PositionCreated {
        position_id: PositionId,
        owner: OwnerId,
        pool_id: Option<PoolId>,
        content_hash: ContentHash,
    },
    PositionWithdrawn {
        position_id: PositionId,
        owner: OwnerId,
        pool_id: Option<PoolId>,
        content_hash: ContentHash,
    },
    PoolCreated {
        pool_id: PoolId,
        manager: OwnerId,
        content_hash: ContentHash,
    },
}

impl LedgerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LedgerEvent::PositionCreated { .. } => EventKind::PositionCreated,
            LedgerEvent::PositionWithdrawn { .. } => EventKind::PositionWithdrawn,
            LedgerEvent::PoolCreated { .. } => EventKind::PoolCreated,
        }
    }

    /// Owner or manager the event concerns
    pub fn participant(&self) -> &OwnerId {
        match self {
            LedgerEvent::PositionCreated { owner, .. } | LedgerEvent::PositionWithdrawn { owner, .. } => {
                owner
            }
            LedgerEvent::PoolCreated { manager, .. } => manager,
        }
    }

    pub fn content_hash(&self) -> ContentHash {
        match self {
            LedgerEvent::PositionCreated { content_hash, .. }
            | LedgerEvent::PositionWithdrawn { content_hash, .. }
            | LedgerEvent::PoolCreated { content_hash, .. } => *content_hash,
        }
    }
}

/// Subscription filter. Empty `kinds` means every kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub kinds: Vec<EventKind>,
    pub participant: Option<OwnerId>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn participant(owner: OwnerId) -> Self {
        Self {
            kinds: Vec::new(),
            participant: Some(owner),
        }
    }

    pub fn matches(&self, event: &LedgerEvent) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&event.kind()))
            && self
                .participant
                .as_ref()
                .map_or(true, |p| p == event.participant())
    }
}

// ============================================================================
// Operations
// ============================================================================

/// New sealed utilization of a pool touched by the operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolUtilization {
    pub pool_id: PoolId,
    pub sealed_utilization: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum OperationKind {
    CreatePosition {
        record: PositionRecord,
        utilization: Option<PoolUtilization>,
    },
    WithdrawPosition {
        position_id: PositionId,
        revealed: RevealedFields,
        utilization: Option<PoolUtilization>,
    },
    CreatePool {
        record: PoolRecord,
    },
}

/// One atomic unit of settlement
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OperationKind,
    pub event: LedgerEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    /// 어댑터 내 커밋 순번 (1부터)
    pub sequence: u64,
    pub committed_at: DateTime<Utc>,
}

/// Everything needed to rebuild the ledger after a restart
#[derive(Debug, Clone, Default)]
pub struct SettlementSnapshot {
    pub positions: Vec<PositionRecord>,
    pub pools: Vec<PoolRecord>,
}

#[async_trait]
pub trait SettlementAdapter: Send + Sync {
    /// Persist the operation atomically and emit its event
    async fn commit(&self, operation: Operation) -> Result<Confirmation, SettlementError>;

    /// Events committed after the call, in commit order
    fn subscribe(&self, filter: EventFilter) -> BoxStream<'static, LedgerEvent>;

    /// Current durable state, ordered by id
    async fn load_state(&self) -> Result<SettlementSnapshot, SettlementError>;

    /// Confirmation of an already committed operation, found by the content
    /// hash of its event. `None` means the operation never landed.
    async fn lookup(&self, content_hash: &ContentHash) -> Result<Option<Confirmation>, SettlementError>;

    async fn health_check(&self) -> Result<(), SettlementError>;
}

/// Broadcast fan-out shared by adapters
pub struct EventBus {
    tx: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn publish(&self, event: LedgerEvent) {
        // 구독자가 없으면 send 실패, 무시
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, filter: EventFilter) -> BoxStream<'static, LedgerEvent> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(move |item| {
                let event = match item {
                    Ok(event) if filter.matches(&event) => Some(event),
                    Ok(_) => None,
                    Err(lagged) => {
                        tracing::warn!(error = %lagged, "event subscriber lagged");
                        None
                    }
                };
                std::future::ready(event)
            })
            .boxed()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// InMemorySettlement
// ============================================================================

#[derive(Default)]
struct MemoryState {
    positions: BTreeMap<i64, PositionRecord>,
    pools: BTreeMap<i64, PoolRecord>,
    reveals: BTreeMap<i64, RevealedFields>,
    confirmations: HashMap<ContentHash, Confirmation>,
    sequence: u64,
}

/// Process-local settlement with failure and latency injection
#[derive(Default)]
pub struct InMemorySettlement {
    state: Mutex<MemoryState>,
    bus: EventBus,
    injected: Mutex<VecDeque<SettlementError>>,
    latency: Mutex<Option<StdDuration>>,
    reply_delay: Mutex<Option<StdDuration>>,
    unavailable: Mutex<bool>,
    lookup_unavailable: Mutex<bool>,
}

impl InMemorySettlement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next commit with `error`
    pub fn fail_next(&self, error: SettlementError) {
        self.injected.lock().push_back(error);
    }

    /// Delay every commit before it is applied
    pub fn set_latency(&self, latency: Option<StdDuration>) {
        *self.latency.lock() = latency;
    }

    /// Delay the reply of every commit after it has been applied
    pub fn set_reply_delay(&self, delay: Option<StdDuration>) {
        *self.reply_delay.lock() = delay;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    pub fn set_lookup_unavailable(&self, unavailable: bool) {
        *self.lookup_unavailable.lock() = unavailable;
    }

    /// Number of committed operations
    pub fn committed(&self) -> u64 {
        self.state.lock().sequence
    }

    pub fn reveal_record(&self, position_id: PositionId) -> Option<RevealedFields> {
        let key = i64::try_from(position_id.0).ok()?;
        self.state.lock().reveals.get(&key).cloned()
    }

    /// Every precondition of `kind`, checked without touching `state`
    fn check(state: &MemoryState, kind: &OperationKind) -> Result<(), SettlementError> {
        match kind {
            OperationKind::CreatePosition { record, utilization } => {
                if state.positions.contains_key(&record.id) {
                    return Err(SettlementError::Rejected(format!(
                        "position {} already exists",
                        record.id
                    )));
                }
                if let Some(pool_id) = record.pool_id {
                    if !state.pools.contains_key(&pool_id) {
                        return Err(SettlementError::Rejected(format!("pool {} does not exist", pool_id)));
                    }
                }
                if let Some(update) = utilization {
                    Self::check_pool(state, update)?;
                }
            }
            OperationKind::WithdrawPosition {
                position_id,
                utilization,
                ..
            } => {
                match state.positions.get(&to_key(position_id.0)?) {
                    Some(record) if record.state == PositionState::Active.as_str() => {}
                    Some(_) => {
                        return Err(SettlementError::Rejected(format!(
                            "position {} is not active",
                            position_id
                        )))
                    }
                    None => {
                        return Err(SettlementError::Rejected(format!(
                            "position {} does not exist",
                            position_id
                        )))
                    }
                }
                if let Some(update) = utilization {
                    Self::check_pool(state, update)?;
                }
            }
            OperationKind::CreatePool { record } => {
                if state.pools.contains_key(&record.id) {
                    return Err(SettlementError::Rejected(format!(
                        "pool {} already exists",
                        record.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_pool(state: &MemoryState, update: &PoolUtilization) -> Result<(), SettlementError> {
        if state.pools.contains_key(&to_key(update.pool_id.0)?) {
            Ok(())
        } else {
            Err(SettlementError::Rejected(format!("pool {} does not exist", update.pool_id)))
        }
    }

    /// Apply a checked operation in place. Keys were converted in `check`.
    fn apply(state: &mut MemoryState, kind: OperationKind) {
        match kind {
            OperationKind::CreatePosition { record, utilization } => {
                if let Some(update) = utilization {
                    Self::apply_utilization(state, update);
                }
                state.positions.insert(record.id, record);
            }
            OperationKind::WithdrawPosition {
                position_id,
                revealed,
                utilization,
            } => {
                if let Some(update) = utilization {
                    Self::apply_utilization(state, update);
                }
                let key = position_id.0 as i64;
                if let Some(record) = state.positions.get_mut(&key) {
                    record.state = PositionState::Withdrawn.as_str().to_string();
                    record.withdrawn_at = Some(revealed.withdrawn_at);
                }
                state.reveals.insert(key, revealed);
            }
            OperationKind::CreatePool { record } => {
                state.pools.insert(record.id, record);
            }
        }
    }

    fn apply_utilization(state: &mut MemoryState, update: PoolUtilization) {
        if let Some(pool) = state.pools.get_mut(&(update.pool_id.0 as i64)) {
            pool.sealed_utilization = update.sealed_utilization;
        }
    }
}

pub(crate) fn to_key(id: u64) -> Result<i64, SettlementError> {
    i64::try_from(id).map_err(|_| SettlementError::Rejected(format!("id {} out of range", id)))
}

#[async_trait]
impl SettlementAdapter for InMemorySettlement {
    async fn commit(&self, operation: Operation) -> Result<Confirmation, SettlementError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.injected.lock().pop_front() {
            tracing::warn!(%error, "injected settlement failure");
            return Err(error);
        }
        if *self.unavailable.lock() {
            return Err(SettlementError::Unavailable("in-memory settlement offline".to_string()));
        }

        // 검사 통과 후에는 실패 지점 없이 제자리 적용
        let confirmation = {
            let mut state = self.state.lock();
            Self::check(&state, &operation.kind)?;
            Self::apply(&mut state, operation.kind);
            state.sequence += 1;
            let confirmation = Confirmation {
                sequence: state.sequence,
                committed_at: Utc::now(),
            };
            state
                .confirmations
                .insert(operation.event.content_hash(), confirmation.clone());
            confirmation
        };

        tracing::debug!(
            sequence = confirmation.sequence,
            event = operation.event.kind().as_str(),
            "operation committed"
        );
        self.bus.publish(operation.event);

        let reply_delay = *self.reply_delay.lock();
        if let Some(delay) = reply_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(confirmation)
    }

    fn subscribe(&self, filter: EventFilter) -> BoxStream<'static, LedgerEvent> {
        self.bus.subscribe(filter)
    }

    async fn load_state(&self) -> Result<SettlementSnapshot, SettlementError> {
        if *self.unavailable.lock() {
            return Err(SettlementError::Unavailable("in-memory settlement offline".to_string()));
        }
        let state = self.state.lock();
        Ok(SettlementSnapshot {
            positions: state.positions.values().cloned().collect(),
            pools: state.pools.values().cloned().collect(),
        })
    }

    async fn lookup(&self, content_hash: &ContentHash) -> Result<Option<Confirmation>, SettlementError> {
        if *self.lookup_unavailable.lock() {
            return Err(SettlementError::Unavailable("in-memory settlement offline".to_string()));
        }
        Ok(self.state.lock().confirmations.get(content_hash).cloned())
    }

    async fn health_check(&self) -> Result<(), SettlementError> {
        if *self.unavailable.lock() {
            return Err(SettlementError::Unavailable("in-memory settlement offline".to_string()));
        }
        Ok(())
    }
}
