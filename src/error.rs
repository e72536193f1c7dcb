use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::matchdata::FeedError;

#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub(crate) detail: String,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    pub(crate) status: StatusCode,
    pub(crate) detail: String,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, value.to_string())
    }
}

/// Failures of the place/cancel/query stake operations. Validation and
/// state-conflict variants map to 4xx responses; `Store` is the
/// infrastructure category and must never be mistaken for a business
/// outcome.
#[derive(Debug, Error)]
pub(crate) enum StakeError {
    #[error("amount must be a positive multiple of the betting increment")]
    InvalidAmount,
    #[error("no match is currently open")]
    NoOpenMatch,
    #[error("the current match is locked")]
    MatchLocked,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("no active stake to cancel")]
    NoActiveStake,
    #[error("cancel amount exceeds active stake")]
    StakeExceedsActive,
    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),
}

impl From<LedgerError> for StakeError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::NoStake => StakeError::NoActiveStake,
            LedgerError::InsufficientStake => StakeError::StakeExceedsActive,
            LedgerError::InsufficientFunds => StakeError::InsufficientFunds,
        }
    }
}

impl From<StakeError> for ApiError {
    fn from(value: StakeError) -> Self {
        let status = match value {
            StakeError::InvalidAmount => StatusCode::BAD_REQUEST,
            StakeError::NoOpenMatch => StatusCode::NOT_FOUND,
            StakeError::MatchLocked => StatusCode::CONFLICT,
            StakeError::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            StakeError::NoActiveStake => StatusCode::NOT_FOUND,
            StakeError::StakeExceedsActive => StatusCode::CONFLICT,
            StakeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, value.to_string())
    }
}

/// Failures of match creation, conclusion and settlement.
#[derive(Debug, Error)]
pub(crate) enum LifecycleError {
    #[error("a match for this bout already exists")]
    DuplicateMatch,
    #[error("match not found")]
    NotFound,
    #[error("match already concluded")]
    AlreadyConcluded,
    #[error("winner could not be resolved automatically")]
    UnresolvedWinner,
    #[error("reported winner {winner} is neither fighter of match {match_id}")]
    CorruptWinnerMapping { match_id: String, winner: String },
    #[error("match data feed error: {0}")]
    Feed(#[from] FeedError),
    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),
}

impl From<LifecycleError> for ApiError {
    fn from(value: LifecycleError) -> Self {
        let status = match value {
            LifecycleError::DuplicateMatch => StatusCode::CONFLICT,
            LifecycleError::NotFound => StatusCode::NOT_FOUND,
            LifecycleError::AlreadyConcluded => StatusCode::CONFLICT,
            LifecycleError::UnresolvedWinner => StatusCode::CONFLICT,
            LifecycleError::CorruptWinnerMapping { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            LifecycleError::Feed(_) => StatusCode::BAD_GATEWAY,
            LifecycleError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, value.to_string())
    }
}
