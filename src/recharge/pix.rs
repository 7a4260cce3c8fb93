use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::RechargeReconciler;
use crate::error::{AppError, AppResult, ErrorClass, RechargeError};
use crate::ledger::models::Recharge;

/// PIX payment notification as delivered by the PSP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixNotification {
    #[serde(default)]
    pub pix: Vec<PixPayment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixPayment {
    /// Charge id; equals the recharge id registered for it
    pub txid: String,
    /// Paid value, decimal string ("10.00")
    #[serde(with = "rust_decimal::serde::str")]
    pub valor: Decimal,
    /// Settlement time; missing means "now"
    #[serde(default)]
    pub horario: Option<DateTime<Utc>>,
    #[serde(rename = "endToEndId", default, skip_serializing_if = "Option::is_none")]
    pub end_to_end_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PixOutcome {
    Credited { recharge: Recharge },
    AlreadyProcessed { paid_at: DateTime<Utc> },
    Rejected {
        class: ErrorClass,
        retryable: bool,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PixItemResult {
    pub txid: String,
    #[serde(flatten)]
    pub outcome: PixOutcome,
}

impl PixItemResult {
    pub fn is_retryable(&self) -> bool {
        matches!(self.outcome, PixOutcome::Rejected { retryable: true, .. })
    }
}

impl RechargeReconciler {
    /// Runs every payment of the notification through `mark_paid`.
    ///
    /// One bad item never blocks the others; each txid gets its own result.
    pub async fn process_pix(&self, notification: PixNotification) -> Vec<PixItemResult> {
        let mut results = Vec::with_capacity(notification.pix.len());

        for payment in notification.pix {
            let txid = payment.txid.clone();
            let outcome = match self.confirm_pix(payment).await {
                Ok(recharge) => PixOutcome::Credited { recharge },
                Err(AppError::Recharge(RechargeError::AlreadyProcessed { paid_at, .. })) => {
                    PixOutcome::AlreadyProcessed { paid_at }
                }
                Err(e) => PixOutcome::Rejected {
                    class: e.class(),
                    retryable: e.is_retryable(),
                    error: e.to_string(),
                },
            };
            results.push(PixItemResult { txid, outcome });
        }

        results
    }

    /// Checks the paid value against the registered intent, then credits it.
    pub async fn confirm_pix(&self, payment: PixPayment) -> AppResult<Recharge> {
        let record = self.record(&payment.txid).await?;
        if record.amount != payment.valor {
            tracing::warn!(
                "PIX {} paid {} but recharge expects {}",
                payment.txid,
                payment.valor,
                record.amount
            );
            return Err(RechargeError::AmountMismatch {
                recharge_id: record.id,
                expected: record.amount,
                paid: payment.valor,
            }
            .into());
        }

        let paid_at = payment.horario.unwrap_or_else(|| self.ledger.now());
        self.mark_paid(&payment.txid, paid_at).await
    }
}
