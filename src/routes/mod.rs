//! API Routes Module
//!
//! 모든 HTTP 엔드포인트 정의
//!
//! # Routes
//! - `/health` - 헬스 체크
//! - `/positions/*`, `/owners/:owner/positions` - 포지션 생성/조회/출금
//! - `/pools/*` - 풀 생성/조회
//! - `/stats/*` - 파머/전역 통계
//! - `/ws` - WebSocket 실시간 이벤트

pub mod health;
pub mod pool;
pub mod position;
pub mod stats;
pub mod ws;

use axum::extract::FromRequest;

use crate::error::ApiError;
use crate::types::OwnerId;

/// `Json` 추출기, 거부 시 ApiError 형식의 400 응답
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct AppJson<T>(pub T);

/// Path 주소 파싱
pub(crate) fn parse_owner(raw: &str) -> Result<OwnerId, ApiError> {
    OwnerId::new(raw).map_err(ApiError::BadRequest)
}
