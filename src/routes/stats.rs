//! Stats Endpoints
//!
//! 집계값 중 봉인된 부분(active stake, total liquidity)은 content id 로만 노출.
//! 소유자는 reveal 엔드포인트로 자신의 stake를 열 수 있다.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use super::{parse_owner, AppJson};
use crate::error::ApiError;
use crate::services::stats::{FarmerStatsView, GlobalStatsView};
use crate::services::StakeReveal;
use crate::types::{ApiResponse, OwnerId};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RevealStakeRequest {
    pub caller: OwnerId,
}

/// GET /stats/farmers/:owner
pub async fn get_farmer_stats(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Result<Json<ApiResponse<FarmerStatsView>>, ApiError> {
    let owner = parse_owner(&owner)?;
    let stats = state.ledger.farmer_stats(&owner)?;
    Ok(Json(ApiResponse::success(stats.view())))
}

/// POST /stats/farmers/:owner/reveal
pub async fn reveal_farmer_stake(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    AppJson(request): AppJson<RevealStakeRequest>,
) -> Result<Json<ApiResponse<StakeReveal>>, ApiError> {
    let owner = parse_owner(&owner)?;
    let reveal = state.ledger.reveal_farmer_stake(&owner, &request.caller)?;
    Ok(Json(ApiResponse::success(reveal)))
}

/// GET /stats/global
pub async fn get_global_stats(
    State(state): State<AppState>,
) -> Json<ApiResponse<GlobalStatsView>> {
    Json(ApiResponse::success(state.ledger.global_stats().view()))
}
