pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::AppResult;
use crate::holds::HoldManager;
use crate::ledger::models::{HoldCursor, HoldState, HoldTransition, ReleaseReason};

pub use scheduler::SweepScheduler;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SweepOutcome {
    Released,
    /// Consumed or released by someone else between listing and release
    AlreadyResolved(HoldState),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepResult {
    pub reference: String,
    #[serde(flatten)]
    pub outcome: SweepOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub released: usize,
    pub already_resolved: usize,
    pub failed: usize,
}

impl SweepSummary {
    pub fn of(results: &[SweepResult]) -> Self {
        results.iter().fold(Self::default(), |mut summary, r| {
            match r.outcome {
                SweepOutcome::Released => summary.released += 1,
                SweepOutcome::AlreadyResolved(_) => summary.already_resolved += 1,
                SweepOutcome::Error(_) => summary.failed += 1,
            }
            summary
        })
    }
}

/// One batch of a sweep and where the next batch starts.
#[derive(Debug, Clone)]
pub struct SweepPage {
    pub results: Vec<SweepResult>,
    /// Last listed hold when the batch was full; `None` once the expired set is exhausted
    pub resume: Option<HoldCursor>,
}

/// Releases ACTIVE holds whose deadline has passed.
///
/// Holds no state of its own; running it twice, or right after a crash
/// mid-sweep, is safe because `release` is idempotent.
pub struct ExpirySweeper {
    holds: Arc<HoldManager>,
}

impl ExpirySweeper {
    pub fn new(holds: Arc<HoldManager>) -> Self {
        Self { holds }
    }

    /// One pass over at most one batch of expired holds.
    ///
    /// Only a failure to list the holds is returned as `Err`; a failed
    /// release is reported in that reference's result and the pass goes on.
    pub async fn sweep(&self, now: DateTime<Utc>) -> AppResult<Vec<SweepResult>> {
        Ok(self.sweep_after(now, None).await?.results)
    }

    /// Like [`ExpirySweeper::sweep`], listing only holds strictly after
    /// `after` in `(expires_at, reference)` order. Holds that failed in an
    /// earlier batch stay behind the cursor, so they never hide later ones.
    pub async fn sweep_after(
        &self,
        now: DateTime<Utc>,
        after: Option<HoldCursor>,
    ) -> AppResult<SweepPage> {
        let expired = self.holds.list_expired_holds(now, after).await?;
        let resume = if expired.len() >= self.batch_size() {
            expired.last().map(|hold| hold.deadline_cursor())
        } else {
            None
        };
        let mut results = Vec::with_capacity(expired.len());

        for hold in expired {
            let reference = hold.reference;
            let outcome = match self.holds.release(&reference, ReleaseReason::Expired).await {
                Ok(HoldTransition::Applied(_)) => SweepOutcome::Released,
                Ok(HoldTransition::AlreadyResolved(hold)) => SweepOutcome::AlreadyResolved(hold.state),
                Err(e) => {
                    error!("❌ Failed to release expired hold {}: {}", reference, e);
                    SweepOutcome::Error(e.to_string())
                }
            };
            results.push(SweepResult { reference, outcome });
        }

        if !results.is_empty() {
            let summary = SweepSummary::of(&results);
            info!(
                "🧹 Sweep at {}: released={} already_resolved={} failed={}",
                now, summary.released, summary.already_resolved, summary.failed
            );
        }

        Ok(SweepPage { results, resume })
    }

    /// Batch size the underlying listing is capped at.
    pub fn batch_size(&self) -> usize {
        usize::try_from(self.holds.config().expiry_batch).unwrap_or(usize::MAX)
    }
}
