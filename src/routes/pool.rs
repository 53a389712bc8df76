//! Pool Endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use super::AppJson;
use crate::error::ApiError;
use crate::services::{CreatePoolRequest, PoolView};
use crate::types::{ApiResponse, PoolId};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct CreatedPool {
    pub pool_id: PoolId,
    pub pool: PoolView,
}

/// POST /pools
///
/// 용량과 초기 수익률은 봉인되어 저장됨
pub async fn create_pool(
    State(state): State<AppState>,
    AppJson(request): AppJson<CreatePoolRequest>,
) -> Result<Json<ApiResponse<CreatedPool>>, ApiError> {
    let pool_id = state.ledger.create_pool(request).await?;
    let pool = state.ledger.get_pool(pool_id)?;

    Ok(Json(ApiResponse::success(CreatedPool { pool_id, pool })))
}

/// GET /pools/:id
pub async fn get_pool(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<ApiResponse<PoolView>>, ApiError> {
    let pool = state.ledger.get_pool(PoolId(id))?;
    Ok(Json(ApiResponse::success(pool)))
}
