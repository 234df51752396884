use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::stock::Violation;

pub type StockResult<T> = Result<T, StockError>;

/// Failure taxonomy of the stock engine.
///
/// Every variant is produced after the enclosing transaction (if any) has
/// been rolled back, so callers never observe a partial commit.
#[derive(Debug, Error)]
pub enum StockError {
    /// Malformed input. Rejected before a transaction is opened.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// One or more lines exceed what the ledgers say is available.
    #[error("insufficient stock for {} item(s)", .0.len())]
    InsufficientStock(Vec<Violation>),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    /// Connection loss, pool exhaustion, deadlock or serialization failure.
    /// The whole commit may be retried from scratch.
    #[error("transient store failure: {0}")]
    TransientStoreFailure(#[source] sqlx::Error),

    #[error("store failure: {0}")]
    Store(#[source] sqlx::Error),
}

impl StockError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// True when the same request can be replayed without changing it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStoreFailure(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::InsufficientStock(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::TransientStoreFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn response_message(&self) -> String {
        match self {
            Self::InsufficientStock(violations) => format!(
                "Insufficient stock for {} item(s). Please refresh and try again.",
                violations.len()
            ),
            Self::TransientStoreFailure(_) => "Service temporarily unavailable, please retry".to_string(),
            Self::Store(_) => "Internal server error".to_string(),
            Self::Unauthorized => "Please log in to access this page".to_string(),
            Self::Forbidden => "You do not have permission to access this page".to_string(),
            _ => self.to_string(),
        }
    }
}

fn is_transient_code(code: &str) -> bool {
    // serialization_failure, deadlock_detected, lock_not_available, admin/crash shutdown
    matches!(code, "40001" | "40P01" | "55P03" | "57P01" | "57P02" | "57P03")
}

impl From<sqlx::Error> for StockError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("record"),
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed => Self::TransientStoreFailure(err),
            sqlx::Error::Database(ref db_err)
                if db_err.code().map_or(false, |code| is_transient_code(&code)) =>
            {
                Self::TransientStoreFailure(err)
            }
            other => Self::Store(other),
        }
    }
}

// Extractor rejections become the same JSON error body as every other
// bad request instead of axum's plain-text default.
impl From<JsonRejection> for StockError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for StockError {
    fn from(rejection: QueryRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl From<PathRejection> for StockError {
    fn from(rejection: PathRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for StockError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Self::TransientStoreFailure(e) | Self::Store(e) => log::error!("Store error: {}", e),
            Self::InsufficientStock(v) => log::warn!("Rejected batch: {} violation(s)", v.len()),
            _ => log::debug!("Request rejected: {}", self),
        }

        let mut body = json!({
            "success": false,
            "message": self.response_message(),
        });
        if let Self::InsufficientStock(violations) = &self {
            body["violations"] = json!(violations);
        }
        if self.is_retryable() {
            body["retryable"] = json!(true);
        }

        (status, Json(body)).into_response()
    }
}
