use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::EntryKind;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Hold error: {0}")]
    Hold(#[from] HoldError),

    #[error("Recharge error: {0}")]
    Recharge(#[from] RechargeError),

    #[error("Store call timed out after {0}ms")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Errors raised by the ledger store while validating or applying an append
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Unknown client: {0}")]
    UnknownClient(Uuid),

    #[error("Insufficient balance for client {client_id}: required {required}, available {available}")]
    InsufficientBalance {
        client_id: Uuid,
        required: Decimal,
        available: Decimal,
    },

    #[error("Entry {kind:?} already recorded for reference {reference}")]
    DuplicateReference { reference: String, kind: EntryKind },

    #[error("Append batch is invalid: {0}")]
    InvalidBatch(String),

    #[error("Applying {kind:?} of {amount} would take a balance total out of range")]
    BalanceLimit { kind: EntryKind, amount: Decimal },
}

/// Hold lifecycle errors
#[derive(Error, Debug)]
pub enum HoldError {
    #[error("No hold found for reference {0}")]
    NotFound(String),

    #[error("Reference {reference} already holds {existing_amount} for client {existing_client}")]
    ReferenceConflict {
        reference: String,
        existing_client: Uuid,
        existing_amount: Decimal,
    },

    #[error("Hold {reference} resolution does not match the hold: {detail}")]
    ResolutionMismatch { reference: String, detail: String },
}

/// Recharge reconciliation errors
#[derive(Error, Debug)]
pub enum RechargeError {
    #[error("Recharge not found: {0}")]
    NotFound(String),

    #[error("Recharge {recharge_id} already processed at {paid_at}")]
    AlreadyProcessed {
        recharge_id: String,
        paid_at: DateTime<Utc>,
    },

    #[error("Recharge {0} already registered with different terms")]
    Conflict(String),

    #[error("Recharge {recharge_id} paid {paid} but {expected} was expected")]
    AmountMismatch {
        recharge_id: String,
        expected: Decimal,
        paid: Decimal,
    },
}

/// How callers should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad amount, unknown client/recharge/hold. Never retried.
    Validation,
    /// Already resolved or already processed. Benign for idempotent retries.
    Conflict,
    /// Expected business outcome such as insufficient balance.
    Business,
    /// Timeouts and connection failures. Retry through the idempotent entry points.
    Transient,
    Fatal,
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Database(e) => classify_sqlx(e),
            AppError::Ledger(LedgerError::InsufficientBalance { .. })
            | AppError::Ledger(LedgerError::BalanceLimit { .. }) => ErrorClass::Business,
            AppError::Ledger(LedgerError::DuplicateReference { .. }) => ErrorClass::Conflict,
            AppError::Ledger(_) => ErrorClass::Validation,
            AppError::Hold(HoldError::ReferenceConflict { .. }) => ErrorClass::Conflict,
            AppError::Hold(_) => ErrorClass::Validation,
            AppError::Recharge(RechargeError::AlreadyProcessed { .. })
            | AppError::Recharge(RechargeError::Conflict(_)) => ErrorClass::Conflict,
            AppError::Recharge(_) => ErrorClass::Validation,
            AppError::Timeout(_) => ErrorClass::Transient,
            AppError::InvalidInput(_) => ErrorClass::Validation,
            AppError::Config(_) | AppError::Internal(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Postgres SQLSTATE codes that mean "try the whole transaction again".
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

fn classify_sqlx(error: &sqlx::Error) -> ErrorClass {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            ErrorClass::Transient
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        },
        sqlx::Error::RowNotFound => ErrorClass::Validation,
        _ => ErrorClass::Fatal,
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    pub class: ErrorClass,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let class = self.class();
        let retryable = self.is_retryable();

        let (status, error_code, details) = match &self {
            AppError::Ledger(LedgerError::InvalidAmount(amount)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_AMOUNT",
                Some(serde_json::json!({ "amount": amount.to_string() })),
            ),
            AppError::Ledger(LedgerError::UnknownClient(client_id)) => (
                StatusCode::NOT_FOUND,
                "UNKNOWN_CLIENT",
                Some(serde_json::json!({ "client_id": client_id })),
            ),
            AppError::Ledger(LedgerError::InsufficientBalance {
                client_id,
                required,
                available,
            }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "INSUFFICIENT_BALANCE",
                Some(serde_json::json!({
                    "client_id": client_id,
                    "required": required.to_string(),
                    "available": available.to_string(),
                })),
            ),
            AppError::Ledger(LedgerError::DuplicateReference { reference, kind }) => (
                StatusCode::CONFLICT,
                "DUPLICATE_REFERENCE",
                Some(serde_json::json!({ "reference": reference, "kind": kind })),
            ),
            AppError::Ledger(LedgerError::InvalidBatch(_)) => {
                (StatusCode::BAD_REQUEST, "INVALID_BATCH", None)
            }
            AppError::Ledger(LedgerError::BalanceLimit { kind, amount }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "BALANCE_LIMIT",
                Some(serde_json::json!({ "kind": kind, "amount": amount.to_string() })),
            ),
            AppError::Hold(HoldError::NotFound(reference)) => (
                StatusCode::NOT_FOUND,
                "HOLD_NOT_FOUND",
                Some(serde_json::json!({ "reference": reference })),
            ),
            AppError::Hold(HoldError::ReferenceConflict { reference, .. }) => (
                StatusCode::CONFLICT,
                "HOLD_REFERENCE_CONFLICT",
                Some(serde_json::json!({ "reference": reference })),
            ),
            AppError::Hold(HoldError::ResolutionMismatch { reference, .. }) => (
                StatusCode::BAD_REQUEST,
                "HOLD_RESOLUTION_MISMATCH",
                Some(serde_json::json!({ "reference": reference })),
            ),
            AppError::Recharge(RechargeError::NotFound(recharge_id)) => (
                StatusCode::NOT_FOUND,
                "RECHARGE_NOT_FOUND",
                Some(serde_json::json!({ "recharge_id": recharge_id })),
            ),
            AppError::Recharge(RechargeError::AlreadyProcessed {
                recharge_id,
                paid_at,
            }) => (
                StatusCode::CONFLICT,
                "ALREADY_PROCESSED",
                Some(serde_json::json!({ "recharge_id": recharge_id, "paid_at": paid_at })),
            ),
            AppError::Recharge(RechargeError::Conflict(recharge_id)) => (
                StatusCode::CONFLICT,
                "RECHARGE_CONFLICT",
                Some(serde_json::json!({ "recharge_id": recharge_id })),
            ),
            AppError::Recharge(RechargeError::AmountMismatch {
                recharge_id,
                expected,
                paid,
            }) => (
                StatusCode::BAD_REQUEST,
                "AMOUNT_MISMATCH",
                Some(serde_json::json!({
                    "recharge_id": recharge_id,
                    "expected": expected.to_string(),
                    "paid": paid.to_string(),
                })),
            ),
            AppError::Timeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORE_TIMEOUT", None),
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", None),
            AppError::Database(_) if retryable => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", None)
            }
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", None),
            AppError::Config(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None)
            }
        };

        // Store internals stay out of the response body.
        let message = match class {
            ErrorClass::Fatal => "An internal error occurred".to_string(),
            _ if matches!(self, AppError::Database(_)) => "The ledger store is unavailable".to_string(),
            _ => self.to_string(),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            class,
            retryable,
            details,
        });

        (status, body).into_response()
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
