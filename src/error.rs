//! Error Handling Module
//!
//! Maps ledger errors onto HTTP status codes with a stable `code` string.
//! Every response also says whether the same request may be retried.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::services::{LedgerError, SettlementError};

/// API 에러 타입
///
/// # Design Decision
///
/// 각 에러 variant는 적절한 HTTP 상태 코드에 매핑됨
/// - 클라이언트 에러: 4xx (잘못된 입력, 권한 없음, 상태 충돌)
/// - 서버 에러: 5xx (settlement 장애, 불변식 위반)
///
/// 불변식 위반/봉인 실패의 상세 내용은 로그에만 남김
#[derive(Debug, Error)]
pub enum ApiError {
    // ============ 400 Bad Request ============
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // ============ 4xx / 5xx from the ledger ============
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    // ============ 500 Internal Server Error ============
    #[error("Internal server error")]
    InternalError,
}

/// API 에러 응답 구조
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Ledger(e) => match e {
                LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                LedgerError::Unauthorized(_) => StatusCode::FORBIDDEN,
                LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
                LedgerError::AlreadyWithdrawn(_) | LedgerError::PoolCapacityExceeded(_) => {
                    StatusCode::CONFLICT
                }
                LedgerError::ProofRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                LedgerError::SettlementFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
                LedgerError::InvariantViolation(_) | LedgerError::SealingFailure(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::InternalError => "INTERNAL_ERROR",
            ApiError::Ledger(e) => match e {
                LedgerError::InvalidInput(_) => "INVALID_INPUT",
                LedgerError::ProofRejected { .. } => "PROOF_REJECTED",
                LedgerError::Unauthorized(_) => "UNAUTHORIZED",
                LedgerError::NotFound(_) => "NOT_FOUND",
                LedgerError::AlreadyWithdrawn(_) => "ALREADY_WITHDRAWN",
                LedgerError::PoolCapacityExceeded(_) => "POOL_CAPACITY_EXCEEDED",
                LedgerError::SettlementFailure(SettlementError::InDoubt(_)) => "SETTLEMENT_IN_DOUBT",
                LedgerError::SettlementFailure(_) => "SETTLEMENT_FAILURE",
                LedgerError::InvariantViolation(_) => "INVARIANT_VIOLATION",
                LedgerError::SealingFailure(_) => "SEALING_FAILURE",
            },
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            ApiError::Ledger(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let (message, details) = match &self {
            ApiError::Ledger(LedgerError::InvariantViolation(_))
            | ApiError::Ledger(LedgerError::SealingFailure(_))
            | ApiError::InternalError => {
                // 내부 에러는 클라이언트에 상세 정보 노출 안 함
                tracing::error!("Internal error: {:?}", self);
                ("An internal error occurred".to_string(), None)
            }
            ApiError::Ledger(LedgerError::SettlementFailure(e)) => {
                tracing::warn!("Settlement failure: {}", e);
                ("Settlement did not confirm".to_string(), Some(e.to_string()))
            }
            other => (other.to_string(), None),
        };

        let body = ErrorResponse {
            error: message,
            code: self.code().to_string(),
            retryable: self.retryable(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// 요청 본문 추출 실패 (문법 오류, 타입 불일치, Content-Type 누락)
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// anyhow 에러를 ApiError로 변환
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Anyhow error: {:?}", err);
        ApiError::InternalError
    }
}
