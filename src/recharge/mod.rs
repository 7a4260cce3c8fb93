pub mod pix;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, LedgerError, RechargeError};
use crate::ledger::{
    models::{
        validate_amount, validate_reference, EntryKind, LedgerEntry, NewEntry, Recharge,
        RechargeRecord, RechargeSource,
    },
    Ledger,
};

pub use pix::{PixItemResult, PixNotification, PixOutcome, PixPayment};

/// Turns payment confirmations into ledger credits.
///
/// Webhook and manual admin confirmations share `mark_paid`, and the
/// one-CREDIT-per-reference rule in the store makes a second confirmation
/// a no-op regardless of which path delivers it.
pub struct RechargeReconciler {
    ledger: Arc<Ledger>,
}

impl RechargeReconciler {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Registers a PENDING payment intent.
    pub async fn create_recharge(
        &self,
        recharge_id: &str,
        client_id: Uuid,
        amount: Decimal,
        source: RechargeSource,
    ) -> AppResult<Recharge> {
        validate_reference(recharge_id)?;
        validate_amount(amount)?;

        let requested = RechargeRecord {
            id: recharge_id.to_string(),
            client_id,
            amount,
            source,
            created_at: self.ledger.now(),
        };
        let stored = self.ledger.insert_recharge(requested.clone()).await?;

        if stored.client_id != requested.client_id
            || stored.amount != requested.amount
            || stored.source != requested.source
        {
            warn!(
                "Recharge {} re-registered with different terms (client {}, amount {})",
                recharge_id, client_id, amount
            );
            return Err(RechargeError::Conflict(recharge_id.to_string()).into());
        }

        if stored.created_at == requested.created_at {
            info!(
                "💳 Recharge {} registered: client={} amount={} source={:?}",
                recharge_id, client_id, amount, source
            );
        }

        let credit = self.credit_entry(recharge_id).await?;
        Ok(Recharge::from_parts(stored, credit.as_ref()))
    }

    pub async fn recharge(&self, recharge_id: &str) -> AppResult<Recharge> {
        let record = self.record(recharge_id).await?;
        let credit = self.credit_entry(recharge_id).await?;
        Ok(Recharge::from_parts(record, credit.as_ref()))
    }

    /// PENDING -> PAID. Appends exactly one CREDIT with `reference = recharge_id`.
    ///
    /// A second confirmation fails with `AlreadyProcessed` carrying the
    /// original `paid_at`; nothing is appended.
    pub async fn mark_paid(&self, recharge_id: &str, paid_at: DateTime<Utc>) -> AppResult<Recharge> {
        let record = self.record(recharge_id).await?;

        if let Some(credit) = self.credit_entry(recharge_id).await? {
            return Err(already_processed(recharge_id, &credit));
        }

        let entry = NewEntry::credit(record.client_id, &record.id, record.amount, paid_at)
            .with_memo(format!("recharge:{:?}", record.source).to_lowercase());

        match self.ledger.append_one(entry).await {
            Ok(credit) => {
                info!(
                    "💰 Recharge {} credited: client={} amount={} paid_at={}",
                    recharge_id, record.client_id, record.amount, paid_at
                );
                Ok(Recharge::from_parts(record, Some(&credit)))
            }
            Err(AppError::Ledger(LedgerError::DuplicateReference {
                kind: EntryKind::Credit,
                ..
            })) => {
                // Another confirmation committed between the check and the append.
                let credit = self.credit_entry(recharge_id).await?.ok_or_else(|| {
                    AppError::Internal(format!("credit for {} vanished", recharge_id))
                })?;
                Err(already_processed(recharge_id, &credit))
            }
            Err(e) => Err(e),
        }
    }

    async fn record(&self, recharge_id: &str) -> AppResult<RechargeRecord> {
        self.ledger
            .recharge_record(recharge_id)
            .await?
            .ok_or_else(|| RechargeError::NotFound(recharge_id.to_string()).into())
    }

    async fn credit_entry(&self, recharge_id: &str) -> AppResult<Option<LedgerEntry>> {
        Ok(self
            .ledger
            .entries_for_reference(recharge_id)
            .await?
            .into_iter()
            .find(|e| e.kind == EntryKind::Credit))
    }
}

fn already_processed(recharge_id: &str, credit: &LedgerEntry) -> AppError {
    warn!(
        "⚠️ Recharge {} already processed at {}, ignoring confirmation",
        recharge_id, credit.occurred_at
    );
    RechargeError::AlreadyProcessed {
        recharge_id: recharge_id.to_string(),
        paid_at: credit.occurred_at,
    }
    .into()
}
