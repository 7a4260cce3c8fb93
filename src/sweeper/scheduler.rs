// Expiry sweep scheduler
//
// Polls on a fixed interval. A hold becomes eligible at its deadline and is
// released on the first cycle after it, so release latency is bounded by
// the interval, not by the deadline itself.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use super::{ExpirySweeper, SweepSummary};
use crate::clock::Clock;

/// Upper bound on back-to-back batches within one cycle.
const MAX_BATCHES_PER_CYCLE: usize = 20;

pub struct SweepScheduler {
    sweeper: Arc<ExpirySweeper>,
    clock: Arc<dyn Clock>,
    every: Duration,
}

impl SweepScheduler {
    pub fn new(sweeper: Arc<ExpirySweeper>, clock: Arc<dyn Clock>, every: Duration) -> Self {
        Self {
            sweeper,
            clock,
            every,
        }
    }

    /// Start the sweep loop (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let sweeper = self.sweeper.clone();
        let clock = self.clock.clone();
        let every = self.every;

        tokio::spawn(async move {
            info!("⏰ Expiry sweeper running every {:?}", every);
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                Self::run_cycle(&sweeper, clock.as_ref()).await;
            }
        })
    }

    /// Walks the expired holds batch by batch, each batch starting after the
    /// last hold of the previous one, until a batch comes back short.
    pub async fn run_cycle(sweeper: &ExpirySweeper, clock: &dyn Clock) -> SweepSummary {
        let now = clock.now();
        let mut total = SweepSummary::default();
        let mut after = None;

        for _ in 0..MAX_BATCHES_PER_CYCLE {
            let page = match sweeper.sweep_after(now, after).await {
                Ok(page) => page,
                Err(e) => {
                    error!("❌ Expiry sweep could not list holds: {}", e);
                    break;
                }
            };

            let batch = SweepSummary::of(&page.results);
            total.released += batch.released;
            total.already_resolved += batch.already_resolved;
            total.failed += batch.failed;

            match page.resume {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }

        if total.failed > 0 {
            warn!("Expiry sweep left {} holds for the next cycle", total.failed);
        }
        total
    }
}
