use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use credit_ledger::{
    clock::{Clock, ManualClock},
    error::{AppError, AppResult, LedgerError, RechargeError},
    holds::{HoldConfig, HoldManager},
    ledger::{
        models::*,
        store::LedgerStore,
        Ledger, MemoryLedgerStore,
    },
    recharge::RechargeReconciler,
    sweeper::{ExpirySweeper, SweepOutcome},
};
use futures::future::join_all;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 11, 4, 9, 0, 0).unwrap()
}

struct Harness {
    store: Arc<MemoryLedgerStore>,
    clock: Arc<ManualClock>,
    ledger: Arc<Ledger>,
    holds: Arc<HoldManager>,
    reconciler: RechargeReconciler,
    sweeper: ExpirySweeper,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        Self::with_store(store.clone(), store, Arc::new(ManualClock::new(t0())))
    }

    fn with_store(
        store: Arc<MemoryLedgerStore>,
        backend: Arc<dyn LedgerStore>,
        clock: Arc<ManualClock>,
    ) -> Self {
        let ledger = Arc::new(Ledger::new(
            backend,
            clock.clone(),
            std::time::Duration::from_secs(2),
        ));
        let holds = Arc::new(HoldManager::new(ledger.clone(), HoldConfig::default()));
        Self {
            store,
            clock,
            reconciler: RechargeReconciler::new(ledger.clone()),
            sweeper: ExpirySweeper::new(holds.clone()),
            ledger,
            holds,
        }
    }

    async fn client_with(&self, amount: Decimal) -> Uuid {
        let client = Uuid::new_v4();
        self.ledger.register_client(client, None).await.unwrap();
        if amount > Decimal::ZERO {
            self.ledger
                .append_one(NewEntry::credit(client, format!("seed-{client}"), amount, self.clock.now()))
                .await
                .unwrap();
        }
        client
    }

    async fn terminal_entries(&self, reference: &str) -> usize {
        self.ledger
            .entries_for_reference(reference)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.kind.is_terminal())
            .count()
    }
}

#[tokio::test]
async fn scenario_hold_then_consume_keeps_balance() {
    let h = Harness::new();
    let client = h.client_with(dec!(100.00)).await;

    h.holds.open_hold(client, "LBL1", dec!(30.00)).await.unwrap();
    assert_eq!(h.ledger.balance(client).await.unwrap(), dec!(70.00));

    h.holds.consume("LBL1").await.unwrap();
    assert_eq!(h.ledger.balance(client).await.unwrap(), dec!(70.00));

    let kinds: Vec<EntryKind> = h
        .ledger
        .entries_for_reference("LBL1")
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![EntryKind::Hold, EntryKind::Consume]);

    // credits - consumptions - active holds, folded from the full history
    let entries = h.ledger.history(client, HistoryRange::all()).collect().await.unwrap();
    assert_eq!(BalanceTotals::fold(&entries).unwrap().available(), dec!(70.00));
    assert!(h.ledger.verify_balance(client).await.unwrap().consistent);
}

#[tokio::test]
async fn scenario_unconsumed_hold_is_swept_after_deadline() {
    let h = Harness::new();
    let client = h.client_with(dec!(100.00)).await;

    h.holds.open_hold(client, "LBL2", dec!(40.00)).await.unwrap();
    h.clock.advance(Duration::hours(30));
    h.reconciler
        .create_recharge("tx-mid", client, dec!(15.00), RechargeSource::Pix)
        .await
        .unwrap();
    h.reconciler.mark_paid("tx-mid", h.clock.now()).await.unwrap();
    assert_eq!(h.ledger.balance(client).await.unwrap(), dec!(75.00));

    let results = h
        .sweeper
        .sweep(t0() + Duration::hours(72) + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].reference, "LBL2");
    assert_eq!(results[0].outcome, SweepOutcome::Released);

    // pre-hold value plus the intervening credit
    assert_eq!(h.ledger.balance(client).await.unwrap(), dec!(115.00));
}

#[tokio::test]
async fn scenario_oversized_hold_is_declined() {
    let h = Harness::new();
    let client = h.client_with(dec!(70.00)).await;

    let err = h.holds.open_hold(client, "LBL3", dec!(200.00)).await.unwrap_err();
    match err {
        AppError::Ledger(LedgerError::InsufficientBalance { required, available, .. }) => {
            assert_eq!(required, dec!(200.00));
            assert_eq!(available, dec!(70.00));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.ledger.balance(client).await.unwrap(), dec!(70.00));
}

#[tokio::test]
async fn repeated_resolution_appends_nothing() {
    let h = Harness::new();
    let client = h.client_with(dec!(100.00)).await;

    h.holds.open_hold(client, "LBL-c", dec!(10.00)).await.unwrap();
    h.holds.consume("LBL-c").await.unwrap();
    let count = h.store.entry_count();
    let second = h.holds.consume("LBL-c").await.unwrap();
    assert!(!second.was_applied());
    assert_eq!(h.store.entry_count(), count);

    h.holds.open_hold(client, "LBL-r", dec!(20.00)).await.unwrap();
    h.holds.release("LBL-r", ReleaseReason::Cancelled).await.unwrap();
    let balance = h.ledger.balance(client).await.unwrap();
    let count = h.store.entry_count();
    let second = h.holds.release("LBL-r", ReleaseReason::Cancelled).await.unwrap();
    assert!(!second.was_applied());
    assert_eq!(h.store.entry_count(), count);
    assert_eq!(h.ledger.balance(client).await.unwrap(), balance);
    assert_eq!(balance, dec!(90.00));
}

#[tokio::test]
async fn mark_paid_twice_credits_once() {
    let h = Harness::new();
    let client = h.client_with(Decimal::ZERO).await;
    h.reconciler
        .create_recharge("txid-42", client, dec!(25.00), RechargeSource::Pix)
        .await
        .unwrap();

    h.reconciler.mark_paid("txid-42", t0()).await.unwrap();
    let err = h.reconciler.mark_paid("txid-42", t0()).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::Recharge(RechargeError::AlreadyProcessed { .. })
    ));

    let credits = h
        .ledger
        .entries_for_reference("txid-42")
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EntryKind::Credit)
        .count();
    assert_eq!(credits, 1);
    assert_eq!(h.ledger.balance(client).await.unwrap(), dec!(25.00));
}

#[tokio::test]
async fn oversized_recharges_are_rejected_not_panicking() {
    let h = Harness::new();
    let client = h.client_with(Decimal::ZERO).await;

    let err = h
        .reconciler
        .create_recharge("huge", client, Decimal::MAX, RechargeSource::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Ledger(LedgerError::InvalidAmount(_))));

    h.reconciler
        .create_recharge("big", client, MAX_AMOUNT, RechargeSource::Manual)
        .await
        .unwrap();
    h.reconciler.mark_paid("big", t0()).await.unwrap();

    h.reconciler
        .create_recharge("one", client, dec!(1.00), RechargeSource::Manual)
        .await
        .unwrap();
    let err = h.reconciler.mark_paid("one", t0()).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::Ledger(LedgerError::BalanceLimit { .. })
    ));

    assert_eq!(h.ledger.balance(client).await.unwrap(), MAX_AMOUNT);
    assert_eq!(
        h.reconciler.recharge("one").await.unwrap().status,
        RechargeStatus::Pending
    );
    assert!(h.ledger.verify_balance(client).await.unwrap().consistent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resolutions_leave_one_terminal_entry() {
    let h = Arc::new(Harness::new());
    let client = h.client_with(dec!(500.00)).await;

    for round in 0..10 {
        let reference = format!("LBL-race-{round}");
        h.holds.open_hold(client, &reference, dec!(12.34)).await.unwrap();

        let tasks = (0..16).map(|i| {
            let h = h.clone();
            let reference = reference.clone();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    h.holds.consume(&reference).await
                } else {
                    h.holds.release(&reference, ReleaseReason::Cancelled).await
                }
            })
        });

        let outcomes: Vec<HoldTransition> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(outcomes.iter().filter(|o| o.was_applied()).count(), 1);
        assert_eq!(h.terminal_entries(&reference).await, 1);

        let final_state = h.holds.hold(&reference).await.unwrap().unwrap().state;
        assert!(outcomes.iter().all(|o| o.hold().state == final_state));
    }

    assert!(h.ledger.verify_balance(client).await.unwrap().consistent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_holds_cannot_overdraw() {
    let h = Arc::new(Harness::new());
    let client = h.client_with(dec!(100.00)).await;

    let tasks = (0..20).map(|i| {
        let h = h.clone();
        tokio::spawn(async move { h.holds.open_hold(client, &format!("LBL-{i}"), dec!(15.00)).await })
    });
    let opened = join_all(tasks)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();

    // 6 * 15.00 fits in 100.00, a seventh does not.
    assert_eq!(opened, 6);
    assert_eq!(h.ledger.balance(client).await.unwrap(), dec!(10.00));
}

#[tokio::test]
async fn random_sequences_never_go_negative() {
    let mut rng = StdRng::seed_from_u64(0x5eed_1ed6);
    let h = Harness::new();
    let client = h.client_with(Decimal::ZERO).await;
    let mut references: Vec<String> = Vec::new();

    for step in 0..400 {
        let amount = Decimal::new(rng.random_range(1..=5_000), 2);
        let _ = match rng.random_range(0..4) {
            0 => h
                .ledger
                .append_one(NewEntry::credit(client, format!("R{step}"), amount, h.clock.now()))
                .await
                .map(|_| ()),
            1 => {
                let reference = format!("L{step}");
                let result = h.holds.open_hold(client, &reference, amount).await.map(|_| ());
                references.push(reference);
                result
            }
            2 if !references.is_empty() => {
                let pick = rng.random_range(0..references.len());
                h.holds.consume(&references[pick]).await.map(|_| ())
            }
            _ if !references.is_empty() => {
                let pick = rng.random_range(0..references.len());
                h.holds
                    .release(&references[pick], ReleaseReason::Cancelled)
                    .await
                    .map(|_| ())
            }
            _ => Ok(()),
        };

        h.clock.advance(Duration::minutes(rng.random_range(1..90)));

        let snapshot = h.ledger.snapshot(client).await.unwrap();
        assert!(snapshot.available >= Decimal::ZERO, "negative after step {step}");
        assert!(snapshot.held >= Decimal::ZERO);
    }

    // Sweeping everything still keeps the books consistent.
    h.sweeper.sweep(h.clock.now() + Duration::days(30)).await.unwrap();
    let report = h.ledger.verify_balance(client).await.unwrap();
    assert!(report.consistent);
    assert!(report.recomputed.available >= Decimal::ZERO);
}

/// Store that refuses to append entries for one reference.
struct FailingStore {
    inner: Arc<MemoryLedgerStore>,
    poisoned: String,
}

#[async_trait]
impl LedgerStore for FailingStore {
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
        if entries.iter().any(|e| e.reference == self.poisoned) {
            return Err(AppError::Timeout(1));
        }
        self.inner.append(entries, now).await
    }

    async fn balance(&self, client_id: Uuid) -> AppResult<BalanceSnapshot> {
        self.inner.balance(client_id).await
    }

    async fn audit_balance(&self, client_id: Uuid) -> AppResult<BalanceAudit> {
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
async fn sweep_reports_failures_per_reference() {
    let inner = Arc::new(MemoryLedgerStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let client = Uuid::new_v4();

    // Seed through the plain store, then sweep through the failing one.
    let seed = Harness::with_store(inner.clone(), inner.clone(), clock.clone());
    seed.ledger.register_client(client, None).await.unwrap();
    seed.ledger
        .append_one(NewEntry::credit(client, "R0", dec!(90.00), clock.now()))
        .await
        .unwrap();
    for reference in ["LBL-a", "LBL-b", "LBL-c"] {
        seed.holds.open_hold(client, reference, dec!(10.00)).await.unwrap();
    }

    let failing = Arc::new(FailingStore {
        inner: inner.clone(),
        poisoned: "LBL-b".to_string(),
    });
    let h = Harness::with_store(inner, failing, clock.clone());

    let results = h.sweeper.sweep(t0() + Duration::hours(73)).await.unwrap();
    let outcomes: Vec<(&str, &SweepOutcome)> = results
        .iter()
        .map(|r| (r.reference.as_str(), &r.outcome))
        .collect();

    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], ("LBL-a", SweepOutcome::Released)));
    assert!(matches!(outcomes[1], ("LBL-b", SweepOutcome::Error(_))));
    assert!(matches!(outcomes[2], ("LBL-c", SweepOutcome::Released)));
    assert_eq!(h.ledger.balance(client).await.unwrap(), dec!(80.00));

    // The failed hold is picked up by the next sweep once the store recovers.
    let results = seed.sweeper.sweep(t0() + Duration::hours(74)).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].reference, "LBL-b");
    assert_eq!(seed.ledger.balance(client).await.unwrap(), dec!(90.00));
}
