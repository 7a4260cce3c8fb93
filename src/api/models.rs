use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::recharge::PixItemResult;
use crate::sweeper::{SweepResult, SweepSummary};
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

pub const DEFAULT_HISTORY_LIMIT: i64 = 100;
pub const MAX_HISTORY_LIMIT: i64 = 1000;

// ========== REQUEST MODELS ==========

/// Register a client account (zero balance)
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterClientRequest {
    /// Generated when omitted
    pub client_id: Option<Uuid>,
    #[validate(length(min = 1, max = 200))]
    pub display_name: Option<String>,
}

/// Reserve funds for a label
#[derive(Debug, Deserialize, Validate)]
pub struct OpenHoldRequest {
    pub client_id: Uuid,
    #[validate(length(min = 1, max = 128))]
    pub reference: String,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReleaseHoldRequest {
    pub reason: ReleaseReason,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRechargeRequest {
    /// PIX txid or manual id
    #[validate(length(min = 1, max = 128))]
    pub recharge_id: String,
    pub client_id: Uuid,
    pub amount: Decimal,
    #[serde(default = "default_source")]
    pub source: RechargeSource,
}

fn default_source() -> RechargeSource {
    RechargeSource::Manual
}

/// Manual confirmation by an operator
#[derive(Debug, Default, Deserialize, Validate)]
pub struct MarkPaidRequest {
    /// Defaults to the time of the call
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Opaque cursor from a previous page's `next_cursor`
    pub after: Option<String>,
    pub limit: Option<i64>,
}

impl HistoryQuery {
    pub fn range(&self) -> AppResult<HistoryRange> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(AppError::InvalidInput("`from` must not be after `to`".to_string()));
            }
        }
        Ok(HistoryRange {
            from: self.from,
            to: self.to,
        })
    }

    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }

    pub fn cursor(&self) -> AppResult<Option<EntryCursor>> {
        self.after.as_deref().map(decode_cursor).transpose()
    }
}

/// `<created_at rfc3339>_<entry id>`
pub fn encode_cursor(cursor: &EntryCursor) -> String {
    format!(
        "{}_{}",
        cursor.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        cursor.id
    )
}

pub fn decode_cursor(raw: &str) -> AppResult<EntryCursor> {
    let invalid = || AppError::InvalidInput(format!("invalid history cursor: {}", raw));
    let (at, id) = raw.rsplit_once('_').ok_or_else(invalid)?;

    Ok(EntryCursor {
        created_at: DateTime::parse_from_rfc3339(at)
            .map_err(|_| invalid())?
            .with_timezone(&Utc),
        id: Uuid::parse_str(id).map_err(|_| invalid())?,
    })
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub client_id: Uuid,
    pub entries: Vec<LedgerEntry>,
    /// Present when more entries may follow
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MarkPaidResponse {
    pub recharge: Recharge,
    /// True when this confirmation was a duplicate and credited nothing
    pub already_processed: bool,
}

#[derive(Debug, Serialize)]
pub struct PixWebhookResponse {
    pub received: usize,
    pub results: Vec<PixItemResult>,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub swept_at: DateTime<Utc>,
    pub summary: SweepSummary,
    pub results: Vec<SweepResult>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub store: String,
    pub store_reachable: bool,
}
