//! Health Check Endpoint
//!
//! # Interview Q&A
//!
//! Q: Health check 엔드포인트는 왜 필요한가?
//! A: 로드밸런서/K8s probe, 모니터링 연동
//!
//! Q: Settlement 상태도 체크하는 이유는?
//! A: "깊은 헬스체크"(deep health check) 패턴
//!    - 단순 200 OK: 프로세스 살아있음
//!    - Settlement 체크: 실제로 커밋 가능한 상태
//!    - halt 된 키가 있으면 운영자 감사가 필요한 상태

use axum::{extract::State, Json};
use serde::Serialize;

use crate::AppState;

/// Health check 응답
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub settlement: SettlementStatus,
    /// 감사 대기 중인 키 (position:N, pool:N)
    pub halted_keys: Vec<String>,
    pub ws_connections: usize,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct SettlementStatus {
    pub connected: bool,
    pub latency_ms: Option<u64>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let start = std::time::Instant::now();
    let settlement = match state.ledger.health_check().await {
        Ok(()) => SettlementStatus {
            connected: true,
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!("Settlement health check failed: {}", e);
            SettlementStatus {
                connected: false,
                latency_ms: None,
            }
        }
    };

    let halted_keys: Vec<String> = state
        .ledger
        .halted_keys()
        .iter()
        .map(ToString::to_string)
        .collect();

    let status = if !settlement.connected || !halted_keys.is_empty() {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        settlement,
        halted_keys,
        ws_connections: state.hub.active_connections().await,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
