//! Database Module
//!
//! PostgreSQL-backed [`SettlementAdapter`]. Every operation runs in one
//! transaction: records, pool utilization and the event row commit together
//! or not at all. A dropped `commit` future drops the open transaction, which
//! sqlx rolls back. A commit whose reply was lost is found again through the
//! unique `content_hash` of its event row.
//!
//! # Interview Q&A
//!
//! Q: 왜 PostgreSQL을 선택했는가?
//! A: 원장 데이터에 필요한 성질
//!
//!    1. ACID 트랜잭션: 레코드 + 이벤트를 한 번에 커밋
//!    2. BYTEA: 봉인된 blob을 그대로 저장
//!    3. JSONB: 이벤트 payload, 공개된 증명 보관
//!    4. BIGSERIAL: 이벤트 순번 = 커밋 순서
//!
//! Q: 동시성은 어디서 보장하는가?
//! A: 두 단계
//!    - 원장: 키별 락으로 같은 포지션/풀 변경을 직렬화
//!    - DB: `WHERE state = 'active'` 조건부 UPDATE, PRIMARY KEY 충돌 → Rejected
//!
//! Q: 커넥션 풀은 어떻게 관리하는가?
//! A: SQLx의 PgPool 사용
//!    - 최소/최대 커넥션 수 설정
//!    - 커넥션 재사용 (오버헤드 감소)
//!    - 타임아웃 처리

mod models;

pub use models::*;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};

use crate::services::ledger::PositionState;
use crate::services::settlement::{
    to_key, Confirmation, ContentHash, EventBus, EventFilter, LedgerEvent, Operation, OperationKind,
    PoolUtilization, SettlementAdapter, SettlementError, SettlementSnapshot,
};

/// 데이터베이스 연결 및 settlement 커밋 담당
pub struct Database {
    pool: PgPool,
    bus: EventBus,
}

/// 제약 위반 등 DB가 거부한 경우 Rejected, 연결 문제는 Unavailable
fn map_sqlx(err: sqlx::Error) -> SettlementError {
    match err {
        sqlx::Error::Database(db) => SettlementError::Rejected(db.to_string()),
        sqlx::Error::RowNotFound => SettlementError::Rejected("row not found".to_string()),
        other => SettlementError::Unavailable(other.to_string()),
    }
}

fn out_of_range(what: &str) -> SettlementError {
    SettlementError::Rejected(format!("{} out of storage range", what))
}

impl Database {
    /// 데이터베이스 연결
    ///
    /// # Connection Pool Settings
    ///
    /// - max_connections: 10 (트래픽에 따라 조정)
    /// - min_connections: 1 (idle 시 최소 유지)
    /// - acquire_timeout: 3초 (커넥션 획득 대기)
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(3))
            .connect(database_url)
            .await?;

        Ok(Self {
            pool,
            bus: EventBus::new(),
        })
    }

    /// 마이그레이션 실행
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn update_utilization(
        tx: &mut Transaction<'_, Postgres>,
        update: &PoolUtilization,
    ) -> Result<(), SettlementError> {
        let result = sqlx::query("UPDATE pools SET sealed_utilization = $2 WHERE id = $1")
            .bind(to_key(update.pool_id.0)?)
            .bind(&update.sealed_utilization)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;

        if result.rows_affected() != 1 {
            return Err(SettlementError::Rejected(format!(
                "pool {} does not exist",
                update.pool_id
            )));
        }
        Ok(())
    }

    async fn apply(tx: &mut Transaction<'_, Postgres>, kind: &OperationKind) -> Result<(), SettlementError> {
        match kind {
            OperationKind::CreatePosition { record, utilization } => {
                sqlx::query(
                    r#"
                    INSERT INTO positions (
                        id, owner, sealed_amount, sealed_rate, sealed_duration,
                        strategy, state, created_at, withdrawn_at, pool_id
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    "#,
                )
                .bind(record.id)
                .bind(&record.owner)
                .bind(&record.sealed_amount)
                .bind(&record.sealed_rate)
                .bind(&record.sealed_duration)
                .bind(&record.strategy)
                .bind(&record.state)
                .bind(record.created_at)
                .bind(record.withdrawn_at)
                .bind(record.pool_id)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;

                if let Some(update) = utilization {
                    Self::update_utilization(tx, update).await?;
                }
            }
            OperationKind::WithdrawPosition {
                position_id,
                revealed,
                utilization,
            } => {
                let id = to_key(position_id.0)?;

                // 조건부 UPDATE: 이미 출금된 포지션은 0 rows
                let result = sqlx::query(
                    "UPDATE positions SET state = $2, withdrawn_at = $3 WHERE id = $1 AND state = $4",
                )
                .bind(id)
                .bind(PositionState::Withdrawn.as_str())
                .bind(revealed.withdrawn_at)
                .bind(PositionState::Active.as_str())
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;

                if result.rows_affected() != 1 {
                    return Err(SettlementError::Rejected(format!(
                        "position {} is not active",
                        position_id
                    )));
                }

                let proofs = serde_json::to_value(&revealed.proofs)
                    .map_err(|e| SettlementError::Rejected(e.to_string()))?;
                sqlx::query(
                    r#"
                    INSERT INTO position_reveals (
                        position_id, amount, rate_bps, duration_secs, earned,
                        matured, matures_at, withdrawn_at, proofs
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(id)
                .bind(revealed.amount.0.to_string())
                .bind(i32::try_from(revealed.rate.0).map_err(|_| out_of_range("rate"))?)
                .bind(i64::try_from(revealed.duration.0).map_err(|_| out_of_range("duration"))?)
                .bind(revealed.earned.0.to_string())
                .bind(revealed.matured)
                .bind(revealed.matures_at)
                .bind(revealed.withdrawn_at)
                .bind(proofs)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;

                if let Some(update) = utilization {
                    Self::update_utilization(tx, update).await?;
                }
            }
            OperationKind::CreatePool { record } => {
                sqlx::query(
                    r#"
                    INSERT INTO pools (
                        id, manager, name, sealed_capacity, sealed_initial_yield,
                        sealed_utilization, created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(record.id)
                .bind(&record.manager)
                .bind(&record.name)
                .bind(&record.sealed_capacity)
                .bind(&record.sealed_initial_yield)
                .bind(&record.sealed_utilization)
                .bind(record.created_at)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SettlementAdapter for Database {
    async fn commit(&self, operation: Operation) -> Result<Confirmation, SettlementError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        Self::apply(&mut tx, &operation.kind).await?;

        let payload = serde_json::to_value(&operation.event)
            .map_err(|e| SettlementError::Rejected(e.to_string()))?;
        let (sequence,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO ledger_events (event_type, participant, content_hash, payload, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING sequence
            "#,
        )
        .bind(operation.event.kind().as_str())
        .bind(operation.event.participant().as_str())
        .bind(operation.event.content_hash().to_hex())
        .bind(payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;

        tracing::debug!(sequence, event = operation.event.kind().as_str(), "operation committed");
        // 커밋 이후에만 발행
        self.bus.publish(operation.event);

        Ok(Confirmation {
            sequence: u64::try_from(sequence).unwrap_or_default(),
            committed_at: Utc::now(),
        })
    }

    fn subscribe(&self, filter: EventFilter) -> BoxStream<'static, LedgerEvent> {
        self.bus.subscribe(filter)
    }

    async fn load_state(&self) -> Result<SettlementSnapshot, SettlementError> {
        let pools = sqlx::query_as::<_, PoolRecord>(
            r#"
            SELECT id, manager, name, sealed_capacity, sealed_initial_yield,
                   sealed_utilization, created_at
            FROM pools
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let positions = sqlx::query_as::<_, PositionRecord>(
            r#"
            SELECT id, owner, sealed_amount, sealed_rate, sealed_duration,
                   strategy, state, created_at, withdrawn_at, pool_id
            FROM positions
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(SettlementSnapshot { positions, pools })
    }

    async fn lookup(&self, content_hash: &ContentHash) -> Result<Option<Confirmation>, SettlementError> {
        let row: Option<(i64, DateTime<Utc>)> =
            sqlx::query_as("SELECT sequence, created_at FROM ledger_events WHERE content_hash = $1")
                .bind(content_hash.to_hex())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;

        Ok(row.map(|(sequence, committed_at)| Confirmation {
            sequence: u64::try_from(sequence).unwrap_or_default(),
            committed_at,
        }))
    }

    /// Health check
    async fn health_check(&self) -> Result<(), SettlementError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}
