pub mod history;
pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use history::History;
use models::*;
use store::LedgerStore;

pub use memory::MemoryLedgerStore;
pub use repository::LedgerRepository;

/// Runs a store call with an upper bound. A timeout means "unknown outcome":
/// callers re-query state or retry through an idempotent entry point.
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            error!("Ledger store call exceeded {:?}", limit);
            Err(AppError::Timeout(limit.as_millis() as u64))
        }
    }
}

/// Ledger Store facade: the one place that talks to the durable store.
///
/// Every balance-affecting operation funnels through [`Ledger::append`].
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn register_client(
        &self,
        client_id: Uuid,
        display_name: Option<String>,
    ) -> AppResult<ClientAccount> {
        let account = bounded(
            self.timeout,
            self.store.register_client(client_id, display_name, self.now()),
        )
        .await?;
        info!("👤 Client {} registered", client_id);
        Ok(account)
    }

    pub async fn client(&self, client_id: Uuid) -> AppResult<Option<ClientAccount>> {
        bounded(self.timeout, self.store.client(client_id)).await
    }

    /// Appends the entries as one atomic unit.
    pub async fn append(&self, entries: Vec<NewEntry>) -> AppResult<Vec<LedgerEntry>> {
        bounded(self.timeout, self.store.append(entries, self.now())).await
    }

    pub async fn append_one(&self, entry: NewEntry) -> AppResult<LedgerEntry> {
        self.append(vec![entry])
            .await?
            .pop()
            .ok_or_else(|| AppError::Internal("store returned no entry".to_string()))
    }

    /// Available balance: credits - consumptions - active holds.
    pub async fn balance(&self, client_id: Uuid) -> AppResult<Decimal> {
        Ok(self.snapshot(client_id).await?.available)
    }

    pub async fn snapshot(&self, client_id: Uuid) -> AppResult<BalanceSnapshot> {
        bounded(self.timeout, self.store.balance(client_id)).await
    }

    /// Folds every entry again and compares with the materialized view.
    /// Both sides come from one store read, so a concurrent append cannot
    /// show up on only one of them.
    pub async fn verify_balance(&self, client_id: Uuid) -> AppResult<Reconciliation> {
        let audit = bounded(self.timeout, self.store.audit_balance(client_id)).await?;
        let materialized = audit.materialized;
        let recomputed = audit.recomputed.snapshot(client_id, self.now());
        let consistent = materialized.same_totals(&recomputed);

        if !consistent {
            error!(
                "Balance view for client {} diverges from entries: view={:?} fold={:?}",
                client_id, materialized, recomputed
            );
        }

        Ok(Reconciliation {
            client_id,
            materialized,
            recomputed,
            consistent,
        })
    }

    pub fn history(&self, client_id: Uuid, range: HistoryRange) -> History {
        History::new(self.store.clone(), client_id, range, self.timeout)
    }

    pub async fn entries_for_reference(&self, reference: &str) -> AppResult<Vec<LedgerEntry>> {
        bounded(self.timeout, self.store.entries_for_reference(reference)).await
    }

    pub async fn expired_holds(
        &self,
        now: DateTime<Utc>,
        after: Option<HoldCursor>,
        limit: i64,
    ) -> AppResult<Vec<Hold>> {
        bounded(self.timeout, self.store.expired_holds(now, after, limit)).await
    }

    pub async fn insert_recharge(&self, record: RechargeRecord) -> AppResult<RechargeRecord> {
        bounded(self.timeout, self.store.insert_recharge(record)).await
    }

    pub async fn recharge_record(&self, recharge_id: &str) -> AppResult<Option<RechargeRecord>> {
        bounded(self.timeout, self.store.recharge(recharge_id)).await
    }

    pub async fn ping(&self) -> AppResult<()> {
        bounded(self.timeout, self.store.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::LedgerError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ledger() -> (Ledger, Arc<MemoryLedgerStore>) {
        let store = Arc::new(MemoryLedgerStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 7, 1, 8, 0, 0).unwrap(),
        ));
        (
            Ledger::new(store.clone(), clock, Duration::from_secs(1)),
            store,
        )
    }

    #[tokio::test]
    async fn test_append_requires_positive_amount() {
        let (ledger, _) = ledger();
        let client = Uuid::new_v4();
        ledger.register_client(client, Some("Loja A".into())).await.unwrap();

        let err = ledger
            .append_one(NewEntry::credit(client, "R1", dec!(0), ledger.now()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Ledger(LedgerError::InvalidAmount(_))));
        assert_eq!(ledger.balance(client).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_verify_balance_is_consistent_after_appends() {
        let (ledger, _) = ledger();
        let client = Uuid::new_v4();
        ledger.register_client(client, None).await.unwrap();
        ledger
            .append_one(NewEntry::credit(client, "R1", dec!(100.00), ledger.now()))
            .await
            .unwrap();
        ledger
            .append_one(NewEntry::hold(
                client,
                "LBL1",
                dec!(25.50),
                ledger.now(),
                ledger.now() + chrono::Duration::hours(72),
            ))
            .await
            .unwrap();

        let report = ledger.verify_balance(client).await.unwrap();
        assert!(report.consistent);
        assert_eq!(report.recomputed.available, dec!(74.50));
        assert_eq!(report.materialized.held, dec!(25.50));
    }

    /// Lands an append right after every materialized balance read.
    struct BusyStore {
        inner: MemoryLedgerStore,
        appended: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl LedgerStore for BusyStore {
        async fn register_client(
            &self,
            client_id: Uuid,
            display_name: Option<String>,
            now: DateTime<Utc>,
        ) -> AppResult<ClientAccount> {
            self.inner.register_client(client_id, display_name, now).await
        }
        async fn client(&self, client_id: Uuid) -> AppResult<Option<ClientAccount>> {
            self.inner.client(client_id).await
        }
        async fn append(&self, entries: Vec<NewEntry>, now: DateTime<Utc>) -> AppResult<Vec<LedgerEntry>> {
            self.inner.append(entries, now).await
        }
        async fn balance(&self, client_id: Uuid) -> AppResult<BalanceSnapshot> {
            let snapshot = self.inner.balance(client_id).await?;
            let n = self
                .appended
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let now = snapshot.as_of;
            self.inner
                .append(vec![NewEntry::credit(client_id, format!("busy-{n}"), dec!(1.00), now)], now)
                .await?;
            Ok(snapshot)
        }
        async fn audit_balance(&self, client_id: Uuid) -> AppResult<BalanceAudit> {
            self.balance(client_id).await?;
            self.inner.audit_balance(client_id).await
        }
        async fn entries_page(
            &self,
            client_id: Uuid,
            range: HistoryRange,
            after: Option<EntryCursor>,
            limit: i64,
        ) -> AppResult<Vec<LedgerEntry>> {
            self.inner.entries_page(client_id, range, after, limit).await
        }
        async fn entries_for_reference(&self, reference: &str) -> AppResult<Vec<LedgerEntry>> {
            self.inner.entries_for_reference(reference).await
        }
        async fn expired_holds(
            &self,
            now: DateTime<Utc>,
            after: Option<HoldCursor>,
            limit: i64,
        ) -> AppResult<Vec<Hold>> {
            self.inner.expired_holds(now, after, limit).await
        }
        async fn insert_recharge(&self, record: RechargeRecord) -> AppResult<RechargeRecord> {
            self.inner.insert_recharge(record).await
        }
        async fn recharge(&self, recharge_id: &str) -> AppResult<Option<RechargeRecord>> {
            self.inner.recharge(recharge_id).await
        }
    }

    #[tokio::test]
    async fn test_verify_balance_reads_both_sides_together() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 7, 1, 8, 0, 0).unwrap(),
        ));
        let ledger = Ledger::new(
            Arc::new(BusyStore {
                inner: MemoryLedgerStore::new(),
                appended: Default::default(),
            }),
            clock,
            Duration::from_secs(1),
        );
        let client = Uuid::new_v4();
        ledger.register_client(client, None).await.unwrap();
        ledger
            .append_one(NewEntry::credit(client, "R1", dec!(10.00), ledger.now()))
            .await
            .unwrap();

        // Appends keep landing between reads; each report is still coherent.
        for _ in 0..3 {
            let report = ledger.verify_balance(client).await.unwrap();
            assert!(report.consistent);
            assert_eq!(report.materialized.available, report.recomputed.available);
        }
        // Read before this call's own append lands.
        assert_eq!(ledger.balance(client).await.unwrap(), dec!(13.00));
    }

    struct StalledStore;

    #[async_trait]
    impl LedgerStore for StalledStore {
        async fn register_client(
            &self,
            _: Uuid,
            _: Option<String>,
            _: DateTime<Utc>,
        ) -> AppResult<ClientAccount> {
            futures::future::pending().await
        }
        async fn client(&self, _: Uuid) -> AppResult<Option<ClientAccount>> {
            futures::future::pending().await
        }
        async fn append(&self, _: Vec<NewEntry>, _: DateTime<Utc>) -> AppResult<Vec<LedgerEntry>> {
            futures::future::pending().await
        }
        async fn balance(&self, _: Uuid) -> AppResult<BalanceSnapshot> {
            futures::future::pending().await
        }
        async fn audit_balance(&self, _: Uuid) -> AppResult<BalanceAudit> {
            futures::future::pending().await
        }
        async fn entries_page(
            &self,
            _: Uuid,
            _: HistoryRange,
            _: Option<EntryCursor>,
            _: i64,
        ) -> AppResult<Vec<LedgerEntry>> {
            futures::future::pending().await
        }
        async fn entries_for_reference(&self, _: &str) -> AppResult<Vec<LedgerEntry>> {
            futures::future::pending().await
        }
        async fn expired_holds(
            &self,
            _: DateTime<Utc>,
            _: Option<HoldCursor>,
            _: i64,
        ) -> AppResult<Vec<Hold>> {
            futures::future::pending().await
        }
        async fn insert_recharge(&self, _: RechargeRecord) -> AppResult<RechargeRecord> {
            futures::future::pending().await
        }
        async fn recharge(&self, _: &str) -> AppResult<Option<RechargeRecord>> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_store_calls_are_bounded() {
        let ledger = Ledger::new(
            Arc::new(StalledStore),
            Arc::new(crate::clock::SystemClock),
            Duration::from_millis(20),
        );

        let err = ledger.balance(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(20)));
        assert!(err.is_retryable());
    }
}
