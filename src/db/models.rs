//! Database Models
//!
//! Persisted layout of positions and pools. Sensitive fields are stored as
//! sealed blobs (`SealedBlob::to_bytes`); everything else is public metadata.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// 포지션 레코드
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PositionRecord {
    pub id: i64,

    /// Ethereum 주소 (lowercase)
    pub owner: String,

    /// 봉인된 금액 / 수익률 / 기간
    pub sealed_amount: Vec<u8>,
    pub sealed_rate: Vec<u8>,
    pub sealed_duration: Vec<u8>,

    /// 전략 라벨 (공개)
    pub strategy: String,

    /// "active" | "withdrawn"
    pub state: String,

    pub created_at: DateTime<Utc>,

    pub withdrawn_at: Option<DateTime<Utc>>,

    pub pool_id: Option<i64>,
}

/// Pool 레코드
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PoolRecord {
    pub id: i64,

    pub manager: String,

    pub name: String,

    pub sealed_capacity: Vec<u8>,

    pub sealed_initial_yield: Vec<u8>,

    /// 현재 사용량 (봉인, 포지션 생성/출금 시 갱신)
    pub sealed_utilization: Vec<u8>,

    pub created_at: DateTime<Utc>,
}
