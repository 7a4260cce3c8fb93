use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::LedgerError;

/// Money is BRL with cent precision.
pub const MONEY_SCALE: u32 = 2;

/// Largest amount and largest running total a client account can carry.
/// Matches the `NUMERIC(14, 2)` money columns.
pub const MAX_AMOUNT: Decimal = dec!(999999999999.99);

/// Longest reference or recharge id accepted from callers.
pub const MAX_REFERENCE_LEN: usize = 128;

/// Kind of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "entry_kind", rename_all = "lowercase")]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryKind {
    Credit,
    Hold,
    Consume,
    Release,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Credit => "credit",
            EntryKind::Hold => "hold",
            EntryKind::Consume => "consume",
            EntryKind::Release => "release",
        }
    }

    /// CONSUME and RELEASE close a hold; at most one of them exists per reference.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryKind::Consume | EntryKind::Release)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable ledger fact. Never updated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub client_id: Uuid,
    pub kind: EntryKind,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    /// Label id for HOLD/CONSUME/RELEASE, recharge id for CREDIT
    pub reference: String,
    pub memo: Option<String>,
    /// Business time of the fact (paid_at for credits)
    pub occurred_at: DateTime<Utc>,
    /// Only set on HOLD entries
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn cursor(&self) -> EntryCursor {
        EntryCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Entry as handed to the store; id and created_at are assigned on append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub client_id: Uuid,
    pub kind: EntryKind,
    pub amount: Decimal,
    pub reference: String,
    pub memo: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewEntry {
    pub fn credit(
        client_id: Uuid,
        reference: impl Into<String>,
        amount: Decimal,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id,
            kind: EntryKind::Credit,
            amount,
            reference: reference.into(),
            memo: None,
            occurred_at,
            expires_at: None,
        }
    }

    pub fn hold(
        client_id: Uuid,
        reference: impl Into<String>,
        amount: Decimal,
        occurred_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id,
            kind: EntryKind::Hold,
            amount,
            reference: reference.into(),
            memo: None,
            occurred_at,
            expires_at: Some(expires_at),
        }
    }

    pub fn consume(hold: &Hold, occurred_at: DateTime<Utc>) -> Self {
        Self {
            client_id: hold.client_id,
            kind: EntryKind::Consume,
            amount: hold.amount,
            reference: hold.reference.clone(),
            memo: None,
            occurred_at,
            expires_at: None,
        }
    }

    pub fn release(hold: &Hold, reason: ReleaseReason, occurred_at: DateTime<Utc>) -> Self {
        Self {
            client_id: hold.client_id,
            kind: EntryKind::Release,
            amount: hold.amount,
            reference: hold.reference.clone(),
            memo: Some(reason.as_str().to_string()),
            occurred_at,
            expires_at: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }
}

/// Rejects non-positive amounts, sub-cent precision and anything above [`MAX_AMOUNT`].
pub fn validate_amount(amount: Decimal) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO || amount > MAX_AMOUNT || amount.normalize().scale() > MONEY_SCALE {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

pub fn validate_reference(reference: &str) -> Result<(), LedgerError> {
    if reference.trim().is_empty() || reference.len() > MAX_REFERENCE_LEN {
        return Err(LedgerError::InvalidBatch(format!(
            "reference must be 1..={} characters",
            MAX_REFERENCE_LEN
        )));
    }
    Ok(())
}

/// Running totals folded over a client's entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceTotals {
    pub credited: Decimal,
    pub consumed: Decimal,
    /// Sum of holds that are still ACTIVE
    pub held: Decimal,
}

impl BalanceTotals {
    pub fn fold<'a>(
        entries: impl IntoIterator<Item = &'a LedgerEntry>,
    ) -> Result<Self, LedgerError> {
        entries.into_iter().try_fold(Self::default(), |mut totals, entry| {
            totals.apply(entry.kind, entry.amount)?;
            Ok(totals)
        })
    }

    /// Applies one entry. Fails without touching the totals when a running
    /// total would leave `0..=MAX_AMOUNT`.
    pub fn apply(&mut self, kind: EntryKind, amount: Decimal) -> Result<(), LedgerError> {
        let limit = || LedgerError::BalanceLimit { kind, amount };
        let add = |total: Decimal| {
            total
                .checked_add(amount)
                .filter(|sum| *sum <= MAX_AMOUNT)
                .ok_or_else(limit)
        };
        let sub = |total: Decimal| {
            total
                .checked_sub(amount)
                .filter(|rest| *rest >= Decimal::ZERO)
                .ok_or_else(limit)
        };

        match kind {
            EntryKind::Credit => self.credited = add(self.credited)?,
            EntryKind::Hold => self.held = add(self.held)?,
            EntryKind::Consume => {
                let held = sub(self.held)?;
                self.consumed = add(self.consumed)?;
                self.held = held;
            }
            EntryKind::Release => self.held = sub(self.held)?,
        }
        Ok(())
    }

    /// credits - consumptions - active holds
    pub fn available(&self) -> Decimal {
        self.credited - self.consumed - self.held
    }

    pub fn snapshot(&self, client_id: Uuid, as_of: DateTime<Utc>) -> BalanceSnapshot {
        BalanceSnapshot {
            client_id,
            credited: self.credited,
            consumed: self.consumed,
            held: self.held,
            available: self.available(),
            as_of,
        }
    }
}

/// Client account with its materialized balance view
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClientAccount {
    pub id: Uuid,
    pub display_name: Option<String>,
    #[serde(with = "rust_decimal::serde::str")]
    pub credited: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub consumed: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub held: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub available: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClientAccount {
    pub fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            client_id: self.id,
            credited: self.credited,
            consumed: self.consumed,
            held: self.held,
            available: self.available,
            as_of: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub client_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub credited: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub consumed: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub held: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub available: Decimal,
    pub as_of: DateTime<Utc>,
}

impl BalanceSnapshot {
    /// Compares the money fields only.
    pub fn same_totals(&self, other: &BalanceSnapshot) -> bool {
        self.credited == other.credited
            && self.consumed == other.consumed
            && self.held == other.held
            && self.available == other.available
    }
}

/// Materialized view and a fresh fold of every entry, read at one point in time
#[derive(Debug, Clone, Copy)]
pub struct BalanceAudit {
    pub materialized: BalanceSnapshot,
    pub recomputed: BalanceTotals,
}

/// Materialized view checked against a fresh fold of the entries
#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub client_id: Uuid,
    pub materialized: BalanceSnapshot,
    pub recomputed: BalanceSnapshot,
    pub consistent: bool,
}

// ========== HOLDS ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HoldState {
    Active,
    Consumed,
    Released,
}

impl HoldState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HoldState::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReleaseReason {
    Expired,
    Cancelled,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::Expired => "expired",
            ReleaseReason::Cancelled => "cancelled",
        }
    }
}

impl FromStr for ReleaseReason {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "expired" => Ok(ReleaseReason::Expired),
            "cancelled" | "canceled" => Ok(ReleaseReason::Cancelled),
            other => Err(LedgerError::InvalidBatch(format!(
                "unknown release reason: {}",
                other
            ))),
        }
    }
}

/// Hold view derived from the HOLD entry and its optional terminal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub reference: String,
    pub client_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub state: HoldState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub release_reason: Option<ReleaseReason>,
}

impl Hold {
    /// Builds the view from the entries sharing a reference.
    /// Returns `None` when no HOLD entry is present.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Option<Self> {
        let mut hold_entry: Option<&LedgerEntry> = None;
        let mut terminal: Option<&LedgerEntry> = None;

        for entry in entries {
            match entry.kind {
                EntryKind::Hold => hold_entry = Some(entry),
                EntryKind::Consume | EntryKind::Release => terminal = Some(entry),
                EntryKind::Credit => {}
            }
        }

        let hold_entry = hold_entry?;
        let (state, resolved_at, release_reason) = match terminal {
            None => (HoldState::Active, None, None),
            Some(t) if t.kind == EntryKind::Consume => {
                (HoldState::Consumed, Some(t.created_at), None)
            }
            Some(t) => (
                HoldState::Released,
                Some(t.created_at),
                t.memo.as_deref().and_then(|m| m.parse().ok()),
            ),
        };

        Some(Hold {
            reference: hold_entry.reference.clone(),
            client_id: hold_entry.client_id,
            amount: hold_entry.amount,
            state,
            created_at: hold_entry.created_at,
            expires_at: hold_entry.expires_at.unwrap_or(hold_entry.created_at),
            resolved_at,
            release_reason,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state == HoldState::Active && self.expires_at <= now
    }

    pub fn deadline_cursor(&self) -> HoldCursor {
        HoldCursor {
            expires_at: self.expires_at,
            reference: self.reference.clone(),
        }
    }
}

/// Position in the `(expires_at, reference)` order the sweeper walks
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HoldCursor {
    pub expires_at: DateTime<Utc>,
    pub reference: String,
}

/// Outcome of consume/release. Both variants are success for callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "hold", rename_all = "snake_case")]
pub enum HoldTransition {
    Applied(Hold),
    AlreadyResolved(Hold),
}

impl HoldTransition {
    pub fn hold(&self) -> &Hold {
        match self {
            HoldTransition::Applied(hold) | HoldTransition::AlreadyResolved(hold) => hold,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, HoldTransition::Applied(_))
    }
}

// ========== RECHARGES ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "recharge_source", rename_all = "lowercase")]
#[serde(rename_all = "UPPERCASE")]
pub enum RechargeSource {
    Pix,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RechargeStatus {
    Pending,
    Paid,
}

/// Immutable payment intent as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RechargeRecord {
    pub id: String,
    pub client_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub source: RechargeSource,
    pub created_at: DateTime<Utc>,
}

/// Recharge view; PAID iff a CREDIT entry with `reference = id` exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recharge {
    pub id: String,
    pub client_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub source: RechargeSource,
    pub status: RechargeStatus,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub credit_entry_id: Option<Uuid>,
}

impl Recharge {
    pub fn from_parts(record: RechargeRecord, credit: Option<&LedgerEntry>) -> Self {
        let (status, paid_at, credit_entry_id) = match credit {
            Some(entry) => (RechargeStatus::Paid, Some(entry.occurred_at), Some(entry.id)),
            None => (RechargeStatus::Pending, None, None),
        };

        Self {
            id: record.id,
            client_id: record.client_id,
            amount: record.amount,
            source: record.source,
            status,
            created_at: record.created_at,
            paid_at,
            credit_entry_id,
        }
    }
}

// ========== HISTORY ==========

/// Half-open time window `[from, to)` over `created_at`; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl HistoryRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at < to)
    }
}

/// Position in the `(created_at, id)` order of a client's entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}
