use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::*;
use crate::error::{AppResult, LedgerError};

/// Durable contract behind the ledger.
///
/// `append` is the only way money moves. Each call is one atomic unit: the
/// store serializes appends per client, validates the whole batch against the
/// current state, writes every entry and the updated balance view, or writes
/// nothing. Implementations must enforce:
///
/// - amount in `0.01..=MAX_AMOUNT` with at most cent precision,
/// - the client exists and every entry in the batch belongs to it,
/// - at most one HOLD, one terminal (CONSUME or RELEASE) and one CREDIT per reference,
/// - a terminal entry matches an existing HOLD's client and amount,
/// - the resulting available balance is never negative, and no running
///   total exceeds `MAX_AMOUNT`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Creates the account with a zero balance, or returns the existing one.
    async fn register_client(
        &self,
        client_id: Uuid,
        display_name: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<ClientAccount>;

    async fn client(&self, client_id: Uuid) -> AppResult<Option<ClientAccount>>;

    async fn append(&self, entries: Vec<NewEntry>, now: DateTime<Utc>) -> AppResult<Vec<LedgerEntry>>;

    /// Materialized balance view, read in one consistent snapshot.
    async fn balance(&self, client_id: Uuid) -> AppResult<BalanceSnapshot>;

    /// Materialized view plus a fresh fold over every entry of the client,
    /// both read while appends for that client are held off.
    async fn audit_balance(&self, client_id: Uuid) -> AppResult<BalanceAudit>;

    /// One page of entries ordered by `(created_at, id)`, strictly after `after`.
    async fn entries_page(
        &self,
        client_id: Uuid,
        range: HistoryRange,
        after: Option<EntryCursor>,
        limit: i64,
    ) -> AppResult<Vec<LedgerEntry>>;

    /// Every entry sharing the reference, in append order.
    async fn entries_for_reference(&self, reference: &str) -> AppResult<Vec<LedgerEntry>>;

    /// ACTIVE holds with `expires_at <= now` in `(expires_at, reference)`
    /// order, strictly after `after` when given.
    async fn expired_holds(
        &self,
        now: DateTime<Utc>,
        after: Option<HoldCursor>,
        limit: i64,
    ) -> AppResult<Vec<Hold>>;

    /// Stores a payment intent. Returns the stored record, which is the
    /// pre-existing one when the id was already registered.
    async fn insert_recharge(&self, record: RechargeRecord) -> AppResult<RechargeRecord>;

    async fn recharge(&self, recharge_id: &str) -> AppResult<Option<RechargeRecord>>;

    /// Cheap liveness probe for health checks.
    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Validation shared by every store before it touches state.
pub(crate) fn check_batch(entries: &[NewEntry]) -> AppResult<Uuid> {
    let first = entries
        .first()
        .ok_or_else(|| LedgerError::InvalidBatch("empty batch".to_string()))?;

    for entry in entries {
        validate_amount(entry.amount)?;
        validate_reference(&entry.reference)?;
        if entry.client_id != first.client_id {
            return Err(LedgerError::InvalidBatch(
                "a batch must target a single client".to_string(),
            )
            .into());
        }
        if entry.kind == EntryKind::Hold && entry.expires_at.is_none() {
            return Err(
                LedgerError::InvalidBatch("hold entries need an expiry".to_string()).into(),
            );
        }
    }

    Ok(first.client_id)
}
