use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    clock::{Clock, SystemClock},
    config::Config,
    error::AppResult,
    holds::{HoldConfig, HoldManager},
    ledger::{store::LedgerStore, Ledger, LedgerRepository, MemoryLedgerStore},
    recharge::RechargeReconciler,
    sweeper::{ExpirySweeper, SweepScheduler},
};

/// Running application: HTTP state plus the background sweep task.
pub struct App {
    pub state: AppState,
    pub sweep_task: JoinHandle<()>,
}

pub async fn initialize_app(config: &Config) -> AppResult<App> {
    info!("Initializing application components ...");

    let (store, store_kind): (Arc<dyn LedgerStore>, &'static str) = match config.database_url() {
        Some(url) => {
            let pool = initialize_database(url, config.db_max_connections).await?;
            (Arc::new(LedgerRepository::new(pool)), "postgres")
        }
        None => {
            warn!("⚠️  DATABASE_URL not set - using the in-memory ledger store, balances will not survive a restart");
            (Arc::new(MemoryLedgerStore::new()), "memory")
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = build_state(store, clock.clone(), store_kind, config);
    info!("✅ Ledger ready ({} store, hold ttl {}h)", store_kind, config.hold_ttl_hours);

    let scheduler = SweepScheduler::new(state.sweeper.clone(), clock, config.sweep_interval());
    let sweep_task = scheduler.start();

    Ok(App { state, sweep_task })
}

/// Wires the components over an already-open store.
pub fn build_state(
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    store_kind: &'static str,
    config: &Config,
) -> AppState {
    let ledger = Arc::new(Ledger::new(store, clock, config.store_timeout()));
    let holds = Arc::new(HoldManager::new(
        ledger.clone(),
        HoldConfig {
            ttl: config.hold_ttl(),
            expiry_batch: config.sweep_batch_size,
        },
    ));
    let reconciler = Arc::new(RechargeReconciler::new(ledger.clone()));
    let sweeper = Arc::new(ExpirySweeper::new(holds.clone()));

    AppState {
        ledger,
        holds,
        reconciler,
        sweeper,
        store_kind,
    }
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
