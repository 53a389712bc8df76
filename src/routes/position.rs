//! Position Endpoints
//!
//! Amount, rate and duration travel in plaintext only on the way in; every
//! response carries content ids and constraint results until the owner
//! withdraws and the audit record is published.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{parse_owner, AppJson};
use crate::error::ApiError;
use crate::services::{CreatePositionRequest, PositionView, RevealedFields};
use crate::types::{ApiResponse, OwnerId, PositionId};
use crate::AppState;

// ============ Request/Response Types ============

/// 포지션 생성 응답
#[derive(Debug, Serialize)]
pub struct CreatedPosition {
    pub position_id: PositionId,
    pub position: PositionView,
}

/// 출금 요청. caller 는 지갑 레이어가 인증한 주소
#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub caller: OwnerId,
}

#[derive(Debug, Serialize)]
pub struct OwnerPositions {
    pub owner: OwnerId,
    pub positions: Vec<PositionView>,
}

// ============ Handlers ============

/// POST /positions
///
/// # Request
///
/// ```json
/// {
///   "owner": "0x...",
///   "amount": 1000000,
///   "rate_bps": 500,
///   "duration_secs": 2592000,
///   "strategy": "stable-lp",
///   "pool_id": 1
/// }
/// ```
pub async fn create_position(
    State(state): State<AppState>,
    AppJson(request): AppJson<CreatePositionRequest>,
) -> Result<Json<ApiResponse<CreatedPosition>>, ApiError> {
    let position_id = state.ledger.create_position(request).await?;
    let position = state.ledger.get_position(position_id)?;

    Ok(Json(ApiResponse::success(CreatedPosition {
        position_id,
        position,
    })))
}

/// GET /positions/:id
pub async fn get_position(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<ApiResponse<PositionView>>, ApiError> {
    let position = state.ledger.get_position(PositionId(id))?;
    Ok(Json(ApiResponse::success(position)))
}

/// POST /positions/:id/withdraw
///
/// 출금 성공 시 공개된 감사 레코드(원금, 이율, 기간, 보상) 반환
pub async fn withdraw_position(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    AppJson(request): AppJson<WithdrawRequest>,
) -> Result<Json<ApiResponse<RevealedFields>>, ApiError> {
    let revealed = state
        .ledger
        .withdraw_position(PositionId(id), &request.caller)
        .await?;
    Ok(Json(ApiResponse::success(revealed)))
}

/// GET /owners/:owner/positions
pub async fn list_owner_positions(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Result<Json<ApiResponse<OwnerPositions>>, ApiError> {
    let owner = parse_owner(&owner)?;
    let positions = state.ledger.positions_of(&owner);

    Ok(Json(ApiResponse::success(OwnerPositions { owner, positions })))
}
