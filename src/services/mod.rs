//! Services Module
//!
//! 비즈니스 로직을 담당하는 서비스 레이어
//!
//! # Services
//! - `ProofEngine`: 봉인, 제약 증명, 봉인 상태 연산
//! - `PositionLedger`: 포지션/풀 생명주기
//! - `StatsAggregator`: 파머/전역 통계
//! - `SettlementAdapter`: 영속화 및 이벤트 발행
//! - `WsHub`: WebSocket 실시간 이벤트

pub mod ledger;
pub mod locks;
pub mod proof_engine;
pub mod settlement;
pub mod stats;
pub mod websocket;

pub use ledger::{
    CreatePoolRequest, CreatePositionRequest, LedgerConfig, LedgerError, PoolView, PositionLedger,
    PositionState, PositionView, RevealedFields, StakeReveal,
};
pub use locks::LockKey;
pub use proof_engine::{Constraint, ConstraintProof, ProofEngine, ProofError, ProofStatus};
pub use settlement::{
    EventFilter, EventKind, InMemorySettlement, LedgerEvent, SettlementAdapter, SettlementError,
};
pub use stats::{FarmerStats, GlobalStats};
pub use websocket::{WsHub, WsMessage};
