// Hold lifecycle: ACTIVE -> CONSUMED | RELEASED, keyed by label reference.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, HoldError, LedgerError};
use crate::ledger::{
    models::{
        EntryKind, Hold, HoldCursor, HoldState, HoldTransition, LedgerEntry, NewEntry,
        ReleaseReason,
    },
    Ledger,
};

/// Hold deadline configuration
#[derive(Debug, Clone)]
pub struct HoldConfig {
    /// Time a label has to be dispatched before its hold is released
    pub ttl: Duration,
    /// Upper bound on references returned by one `list_expired` call
    pub expiry_batch: i64,
}

impl Default for HoldConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(72),
            expiry_batch: 500,
        }
    }
}

/// Single authority over hold state. Label creation, carrier status callbacks,
/// cancellations and the expiry sweeper all go through here.
pub struct HoldManager {
    ledger: Arc<Ledger>,
    config: HoldConfig,
}

impl HoldManager {
    pub fn new(ledger: Arc<Ledger>, config: HoldConfig) -> Self {
        Self { ledger, config }
    }

    pub fn config(&self) -> &HoldConfig {
        &self.config
    }

    /// Reserves `amount` of the client's available balance for a label.
    ///
    /// The balance check and the HOLD entry land in one store transaction.
    /// Re-opening an existing reference with the same client and amount
    /// returns the existing hold without appending anything.
    pub async fn open_hold(
        &self,
        client_id: Uuid,
        reference: &str,
        amount: Decimal,
    ) -> AppResult<Hold> {
        let now = self.ledger.now();
        let entry = NewEntry::hold(client_id, reference, amount, now, now + self.config.ttl);

        match self.ledger.append_one(entry).await {
            Ok(stored) => {
                let hold = Hold::from_entries([&stored])
                    .ok_or_else(|| AppError::Internal("hold entry not recorded".to_string()))?;
                info!(
                    "🔒 Hold opened: ref={} client={} amount={} expires_at={}",
                    hold.reference, client_id, amount, hold.expires_at
                );
                Ok(hold)
            }
            Err(AppError::Ledger(LedgerError::DuplicateReference {
                kind: EntryKind::Hold,
                ..
            })) => {
                let existing = self.require_hold(reference).await?;
                if existing.client_id == client_id && existing.amount == amount {
                    debug!("Hold {} already open, returning existing", reference);
                    Ok(existing)
                } else {
                    warn!(
                        "Hold reference {} reused with different terms by client {}",
                        reference, client_id
                    );
                    Err(HoldError::ReferenceConflict {
                        reference: reference.to_string(),
                        existing_client: existing.client_id,
                        existing_amount: existing.amount,
                    }
                    .into())
                }
            }
            Err(e @ AppError::Ledger(LedgerError::InsufficientBalance { .. })) => {
                info!("Hold {} declined: {}", reference, e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Label dispatched: the held amount becomes a permanent consumption.
    pub async fn consume(&self, reference: &str) -> AppResult<HoldTransition> {
        let hold = self.require_hold(reference).await?;
        if hold.state.is_terminal() {
            debug!("Consume on {} ignored, hold is {:?}", reference, hold.state);
            return Ok(HoldTransition::AlreadyResolved(hold));
        }

        let entry = NewEntry::consume(&hold, self.ledger.now());
        match self.ledger.append_one(entry).await {
            Ok(stored) => {
                info!(
                    "📦 Hold consumed: ref={} client={} amount={}",
                    reference, hold.client_id, hold.amount
                );
                Ok(HoldTransition::Applied(resolve(hold, &stored, None)))
            }
            Err(e) => self.lost_race(reference, e).await,
        }
    }

    /// Returns the held amount to the client's available balance.
    pub async fn release(&self, reference: &str, reason: ReleaseReason) -> AppResult<HoldTransition> {
        let hold = self.require_hold(reference).await?;
        if hold.state.is_terminal() {
            debug!("Release on {} ignored, hold is {:?}", reference, hold.state);
            return Ok(HoldTransition::AlreadyResolved(hold));
        }

        let entry = NewEntry::release(&hold, reason, self.ledger.now());
        match self.ledger.append_one(entry).await {
            Ok(stored) => {
                info!(
                    "🔓 Hold released ({}): ref={} client={} amount={}",
                    reason.as_str(),
                    reference,
                    hold.client_id,
                    hold.amount
                );
                Ok(HoldTransition::Applied(resolve(hold, &stored, Some(reason))))
            }
            Err(e) => self.lost_race(reference, e).await,
        }
    }

    pub async fn hold(&self, reference: &str) -> AppResult<Option<Hold>> {
        let entries = self.ledger.entries_for_reference(reference).await?;
        Ok(Hold::from_entries(&entries))
    }

    /// References of ACTIVE holds whose deadline is at or before `now`.
    pub async fn list_expired(&self, now: DateTime<Utc>) -> AppResult<Vec<String>> {
        Ok(self
            .list_expired_holds(now, None)
            .await?
            .into_iter()
            .map(|hold| hold.reference)
            .collect())
    }

    /// One batch of expired holds in deadline order, resuming after `after`.
    pub async fn list_expired_holds(
        &self,
        now: DateTime<Utc>,
        after: Option<HoldCursor>,
    ) -> AppResult<Vec<Hold>> {
        let holds = self
            .ledger
            .expired_holds(now, after, self.config.expiry_batch)
            .await?;
        Ok(holds.into_iter().filter(|h| h.is_expired_at(now)).collect())
    }

    async fn require_hold(&self, reference: &str) -> AppResult<Hold> {
        self.hold(reference)
            .await?
            .ok_or_else(|| HoldError::NotFound(reference.to_string()).into())
    }

    /// The store refused a terminal entry because another one landed first.
    async fn lost_race(&self, reference: &str, error: AppError) -> AppResult<HoldTransition> {
        match error {
            AppError::Ledger(LedgerError::DuplicateReference { kind, .. }) if kind.is_terminal() => {
                let hold = self.require_hold(reference).await?;
                debug!("Hold {} resolved concurrently as {:?}", reference, hold.state);
                Ok(HoldTransition::AlreadyResolved(hold))
            }
            other => Err(other),
        }
    }
}

fn resolve(mut hold: Hold, terminal: &LedgerEntry, reason: Option<ReleaseReason>) -> Hold {
    hold.state = match terminal.kind {
        EntryKind::Consume => HoldState::Consumed,
        _ => HoldState::Released,
    };
    hold.resolved_at = Some(terminal.created_at);
    hold.release_reason = reason;
    hold
}
