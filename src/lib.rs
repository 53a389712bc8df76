//! Stealth Yield Ledger Library
//!
//! # Overview
//!
//! 이 라이브러리는 Stealth Yield Farm 의 포지션 원장을 제공합니다.
//! 예치 금액, 이율, 기간은 봉인된 상태로 저장되고, 각 값은 제약 증명
//! (양수, 범위, 용량 이내)과 함께 공개됩니다. 평문은 소유자가 출금할 때만
//! 감사 레코드로 공개됩니다.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     HTTP / WebSocket                      │
//! │                  routes (axum) + WsHub                    │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │
//! ┌────────────────────────────▼─────────────────────────────┐
//! │                     PositionLedger                        │
//! │  ┌────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │ KeyedLocks │  │ ProofEngine  │  │ StatsAggregator  │  │
//! │  └────────────┘  └──────┬───────┘  └──────────────────┘  │
//! │                         │ SealingScheme (EnclaveScheme)   │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ SettlementAdapter
//!                 ┌────────────┴────────────┐
//!                 ▼                         ▼
//!        InMemorySettlement          Database (PostgreSQL)
//! ```
//!
//! ## Modules
//!
//! - `config`: 환경 설정 관리
//! - `error`: HTTP 에러 매핑
//! - `routes`: HTTP 엔드포인트 핸들러
//! - `sealed`: 봉인 값과 sealing scheme
//! - `services`: 증명 엔진, 원장, 통계, settlement, WebSocket
//! - `db`: PostgreSQL settlement adapter
//! - `types`: 공통 타입 정의
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stealth_yield_ledger::{sealed::EnclaveScheme, services::*};
//!
//! let ledger = PositionLedger::recover(
//!     Arc::new(EnclaveScheme::generate()),
//!     Arc::new(InMemorySettlement::new()),
//!     LedgerConfig::default(),
//! )
//! .await?;
//! ```

use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod sealed;
pub mod services;
pub mod types;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use config::Config;
pub use db::Database;
pub use error::ApiError;
pub use services::{PositionLedger, WsHub};

/// 애플리케이션 전역 상태
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<PositionLedger>,
    pub hub: Arc<WsHub>,
    pub config: Arc<Config>,
}

/// 라우터 생성
///
/// # Route Structure
///
/// ```text
/// GET  /health                        - 서버/settlement 상태
///
/// POST /positions                     - 포지션 생성
/// GET  /positions/:id                 - 포지션 조회 (봉인 필드)
/// POST /positions/:id/withdraw        - 출금 + 감사 레코드 공개
/// GET  /owners/:owner/positions       - 소유자 포지션 목록
///
/// POST /pools                         - 풀 생성
/// GET  /pools/:id                     - 풀 조회
///
/// GET  /stats/farmers/:owner          - 파머 통계
/// POST /stats/farmers/:owner/reveal   - 파머 stake 공개 (소유자만)
/// GET  /stats/global                  - 전역 통계
///
/// GET  /ws                            - WebSocket 이벤트 스트림
/// ```
pub fn create_router(state: AppState) -> Router {
    // CORS 설정
    // 프로덕션: ALLOWED_ORIGINS 만 허용, 개발: localhost 허용
    let cors = if state.config.is_production() {
        let origins: Vec<HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    } else {
        CorsLayer::new()
            .allow_origin([
                HeaderValue::from_static("http://localhost:5173"), // Vite dev server
                HeaderValue::from_static("http://localhost:3000"),
                HeaderValue::from_static("http://127.0.0.1:5173"),
            ])
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        // Health check
        .route("/health", get(routes::health::health_check))

        // Positions
        .route("/positions", post(routes::position::create_position))
        .route("/positions/:id", get(routes::position::get_position))
        .route("/positions/:id/withdraw", post(routes::position::withdraw_position))
        .route("/owners/:owner/positions", get(routes::position::list_owner_positions))

        // Pools
        .route("/pools", post(routes::pool::create_pool))
        .route("/pools/:id", get(routes::pool::get_pool))

        // Stats
        .route("/stats/farmers/:owner", get(routes::stats::get_farmer_stats))
        .route("/stats/farmers/:owner/reveal", post(routes::stats::reveal_farmer_stake))
        .route("/stats/global", get(routes::stats::get_global_stats))

        // WebSocket
        .route("/ws", get(routes::ws::ws_handler))

        // 미들웨어
        .layer(TraceLayer::new_for_http())
        .layer(cors)

        // 상태 주입
        .with_state(state)
}
