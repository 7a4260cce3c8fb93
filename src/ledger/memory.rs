use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use uuid::Uuid;

use super::models::*;
use super::store::{check_batch, LedgerStore};
use crate::error::{AppResult, HoldError, LedgerError};

/// In-process ledger store.
///
/// Enforces the same append rules as the Postgres repository. A single mutex
/// plays the role of the per-client row lock, so it is only suitable for
/// tests and single-process deployments without a database.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    clients: HashMap<Uuid, ClientAccount>,
    entries: Vec<LedgerEntry>,
    by_client: HashMap<Uuid, Vec<usize>>,
    by_reference: HashMap<String, Vec<usize>>,
    active_holds: BTreeSet<(DateTime<Utc>, String)>,
    recharges: HashMap<String, RechargeRecord>,
    last_created_at: Option<DateTime<Utc>>,
}

impl State {
    fn find(&self, reference: &str, pred: impl Fn(&LedgerEntry) -> bool) -> Option<&LedgerEntry> {
        self.by_reference
            .get(reference)?
            .iter()
            .map(|&i| &self.entries[i])
            .find(|e| pred(e))
    }

    /// Append timestamps are strictly increasing so `(created_at, id)` follows append order.
    fn next_created_at(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let at = match self.last_created_at {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_created_at = Some(at);
        at
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries across all clients.
    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn register_client(
        &self,
        client_id: Uuid,
        display_name: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<ClientAccount> {
        let mut state = self.state.lock();
        let account = state
            .clients
            .entry(client_id)
            .or_insert_with(|| ClientAccount {
                id: client_id,
                display_name,
                credited: Decimal::ZERO,
                consumed: Decimal::ZERO,
                held: Decimal::ZERO,
                available: Decimal::ZERO,
                created_at: now,
                updated_at: now,
            });
        Ok(account.clone())
    }

    async fn client(&self, client_id: Uuid) -> AppResult<Option<ClientAccount>> {
        Ok(self.state.lock().clients.get(&client_id).cloned())
    }

    async fn append(&self, entries: Vec<NewEntry>, now: DateTime<Utc>) -> AppResult<Vec<LedgerEntry>> {
        let client_id = check_batch(&entries)?;
        let mut state = self.state.lock();

        let account = state
            .clients
            .get(&client_id)
            .ok_or(LedgerError::UnknownClient(client_id))?;
        let mut totals = BalanceTotals {
            credited: account.credited,
            consumed: account.consumed,
            held: account.held,
        };

        // Validate the whole batch before writing anything.
        for (pos, entry) in entries.iter().enumerate() {
            let staged = &entries[..pos];
            let same_ref = |kind_matches: fn(EntryKind) -> bool| {
                staged
                    .iter()
                    .find(|s| s.reference == entry.reference && kind_matches(s.kind))
                    .map(|s| s.kind)
                    .or_else(|| {
                        state
                            .find(&entry.reference, |e| kind_matches(e.kind))
                            .map(|e| e.kind)
                    })
            };

            match entry.kind {
                EntryKind::Credit => {
                    if let Some(kind) = same_ref(|k| k == EntryKind::Credit) {
                        return Err(LedgerError::DuplicateReference {
                            reference: entry.reference.clone(),
                            kind,
                        }
                        .into());
                    }
                }
                EntryKind::Hold => {
                    if let Some(kind) = same_ref(|k| k == EntryKind::Hold) {
                        return Err(LedgerError::DuplicateReference {
                            reference: entry.reference.clone(),
                            kind,
                        }
                        .into());
                    }
                }
                EntryKind::Consume | EntryKind::Release => {
                    let hold = staged
                        .iter()
                        .find(|s| s.reference == entry.reference && s.kind == EntryKind::Hold)
                        .map(|s| (s.client_id, s.amount))
                        .or_else(|| {
                            state
                                .find(&entry.reference, |e| e.kind == EntryKind::Hold)
                                .map(|e| (e.client_id, e.amount))
                        })
                        .ok_or_else(|| HoldError::NotFound(entry.reference.clone()))?;

                    if hold != (entry.client_id, entry.amount) {
                        return Err(HoldError::ResolutionMismatch {
                            reference: entry.reference.clone(),
                            detail: format!(
                                "hold is {} for {}, resolution is {} for {}",
                                hold.1, hold.0, entry.amount, entry.client_id
                            ),
                        }
                        .into());
                    }

                    if let Some(kind) = same_ref(|k| k.is_terminal()) {
                        return Err(LedgerError::DuplicateReference {
                            reference: entry.reference.clone(),
                            kind,
                        }
                        .into());
                    }
                }
            }

            let available_before = totals.available();
            totals.apply(entry.kind, entry.amount)?;
            if totals.available() < Decimal::ZERO {
                return Err(LedgerError::InsufficientBalance {
                    client_id,
                    required: entry.amount,
                    available: available_before,
                }
                .into());
            }
        }

        let mut written = Vec::with_capacity(entries.len());
        for entry in entries {
            let created_at = state.next_created_at(now);
            let stored = LedgerEntry {
                id: Uuid::new_v4(),
                client_id,
                kind: entry.kind,
                amount: entry.amount,
                reference: entry.reference,
                memo: entry.memo,
                occurred_at: entry.occurred_at,
                expires_at: entry.expires_at,
                created_at,
            };

            match stored.kind {
                EntryKind::Hold => {
                    if let Some(expires_at) = stored.expires_at {
                        state.active_holds.insert((expires_at, stored.reference.clone()));
                    }
                }
                EntryKind::Consume | EntryKind::Release => {
                    let deadline = state
                        .find(&stored.reference, |e| e.kind == EntryKind::Hold)
                        .and_then(|h| h.expires_at);
                    if let Some(expires_at) = deadline {
                        state.active_holds.remove(&(expires_at, stored.reference.clone()));
                    }
                }
                EntryKind::Credit => {}
            }

            let index = state.entries.len();
            state.by_client.entry(client_id).or_default().push(index);
            state
                .by_reference
                .entry(stored.reference.clone())
                .or_default()
                .push(index);
            state.entries.push(stored.clone());
            written.push(stored);
        }

        if let Some(account) = state.clients.get_mut(&client_id) {
            account.credited = totals.credited;
            account.consumed = totals.consumed;
            account.held = totals.held;
            account.available = totals.available();
            account.updated_at = now;
        }

        Ok(written)
    }

    async fn balance(&self, client_id: Uuid) -> AppResult<BalanceSnapshot> {
        self.state
            .lock()
            .clients
            .get(&client_id)
            .map(ClientAccount::snapshot)
            .ok_or_else(|| LedgerError::UnknownClient(client_id).into())
    }

    async fn audit_balance(&self, client_id: Uuid) -> AppResult<BalanceAudit> {
        let state = self.state.lock();
        let account = state
            .clients
            .get(&client_id)
            .ok_or(LedgerError::UnknownClient(client_id))?;
        let entries = state
            .by_client
            .get(&client_id)
            .into_iter()
            .flatten()
            .map(|&i| &state.entries[i]);

        Ok(BalanceAudit {
            materialized: account.snapshot(),
            recomputed: BalanceTotals::fold(entries)?,
        })
    }

    async fn entries_page(
        &self,
        client_id: Uuid,
        range: HistoryRange,
        after: Option<EntryCursor>,
        limit: i64,
    ) -> AppResult<Vec<LedgerEntry>> {
        let state = self.state.lock();
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);

        let page = state
            .by_client
            .get(&client_id)
            .into_iter()
            .flatten()
            .map(|&i| &state.entries[i])
            .filter(|e| range.contains(e.created_at))
            .filter(|e| after.map_or(true, |cursor| e.cursor() > cursor))
            .take(limit)
            .cloned()
            .collect();

        Ok(page)
    }

    async fn entries_for_reference(&self, reference: &str) -> AppResult<Vec<LedgerEntry>> {
        let state = self.state.lock();
        Ok(state
            .by_reference
            .get(reference)
            .into_iter()
            .flatten()
            .map(|&i| state.entries[i].clone())
            .collect())
    }

    async fn expired_holds(
        &self,
        now: DateTime<Utc>,
        after: Option<HoldCursor>,
        limit: i64,
    ) -> AppResult<Vec<Hold>> {
        let state = self.state.lock();
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        let start = match after {
            Some(cursor) => Bound::Excluded((cursor.expires_at, cursor.reference)),
            None => Bound::Unbounded,
        };

        let holds = state
            .active_holds
            .range((start, Bound::Unbounded))
            .take_while(|(expires_at, _)| *expires_at <= now)
            .take(limit)
            .filter_map(|(_, reference)| {
                let entries = state.by_reference.get(reference)?;
                Hold::from_entries(entries.iter().map(|&i| &state.entries[i]))
            })
            .collect();

        Ok(holds)
    }

    async fn insert_recharge(&self, record: RechargeRecord) -> AppResult<RechargeRecord> {
        let mut state = self.state.lock();
        if !state.clients.contains_key(&record.client_id) {
            return Err(LedgerError::UnknownClient(record.client_id).into());
        }
        let stored = state
            .recharges
            .entry(record.id.clone())
            .or_insert(record);
        Ok(stored.clone())
    }

    async fn recharge(&self, recharge_id: &str) -> AppResult<Option<RechargeRecord>> {
        Ok(self.state.lock().recharges.get(recharge_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 14, 0, 0).unwrap()
    }

    async fn funded_client(store: &MemoryLedgerStore, amount: Decimal) -> Uuid {
        let client = Uuid::new_v4();
        store.register_client(client, None, t0()).await.unwrap();
        store
            .append(vec![NewEntry::credit(client, format!("seed-{}", client), amount, t0())], t0())
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn test_append_rejects_unknown_client() {
        let store = MemoryLedgerStore::new();
        let err = store
            .append(vec![NewEntry::credit(Uuid::new_v4(), "R1", dec!(10), t0())], t0())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Ledger(LedgerError::UnknownClient(_))));
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = MemoryLedgerStore::new();
        let client = funded_client(&store, dec!(50.00)).await;
        let expires = t0() + Duration::hours(72);

        let err = store
            .append(
                vec![
                    NewEntry::hold(client, "LBL1", dec!(30.00), t0(), expires),
                    NewEntry::hold(client, "LBL2", dec!(30.00), t0(), expires),
                ],
                t0(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::InsufficientBalance { .. })
        ));

        assert_eq!(store.balance(client).await.unwrap().available, dec!(50.00));
        assert!(store.entries_for_reference("LBL1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_terminal_entry_per_reference() {
        let store = MemoryLedgerStore::new();
        let client = funded_client(&store, dec!(100.00)).await;
        let expires = t0() + Duration::hours(72);
        store
            .append(vec![NewEntry::hold(client, "LBL1", dec!(30.00), t0(), expires)], t0())
            .await
            .unwrap();

        let hold = Hold::from_entries(&store.entries_for_reference("LBL1").await.unwrap()).unwrap();
        store
            .append(vec![NewEntry::consume(&hold, t0())], t0())
            .await
            .unwrap();

        let err = store
            .append(
                vec![NewEntry::release(&hold, ReleaseReason::Expired, t0())],
                t0(),
            )
            .await
            .unwrap_err();
        match err {
            AppError::Ledger(LedgerError::DuplicateReference { kind, .. }) => {
                assert_eq!(kind, EntryKind::Consume)
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let snapshot = store.balance(client).await.unwrap();
        assert_eq!(snapshot.available, dec!(70.00));
        assert_eq!(snapshot.consumed, dec!(30.00));
        assert_eq!(snapshot.held, dec!(0));
    }

    #[tokio::test]
    async fn test_resolution_must_match_hold() {
        let store = MemoryLedgerStore::new();
        let client = funded_client(&store, dec!(100.00)).await;
        store
            .append(
                vec![NewEntry::hold(client, "LBL1", dec!(30.00), t0(), t0() + Duration::hours(72))],
                t0(),
            )
            .await
            .unwrap();

        let mut consume = NewEntry {
            client_id: client,
            kind: EntryKind::Consume,
            amount: dec!(29.99),
            reference: "LBL1".into(),
            memo: None,
            occurred_at: t0(),
            expires_at: None,
        };
        assert!(matches!(
            store.append(vec![consume.clone()], t0()).await.unwrap_err(),
            AppError::Hold(HoldError::ResolutionMismatch { .. })
        ));

        consume.reference = "LBL-missing".into();
        assert!(matches!(
            store.append(vec![consume], t0()).await.unwrap_err(),
            AppError::Hold(HoldError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_holds_drop_out_once_resolved() {
        let store = MemoryLedgerStore::new();
        let client = funded_client(&store, dec!(100.00)).await;
        for (reference, hours) in [("LBL-a", 1), ("LBL-b", 2), ("LBL-c", 100)] {
            store
                .append(
                    vec![NewEntry::hold(client, reference, dec!(10.00), t0(), t0() + Duration::hours(hours))],
                    t0(),
                )
                .await
                .unwrap();
        }

        let now = t0() + Duration::hours(3);
        let expired = store.expired_holds(now, None, 10).await.unwrap();
        let refs: Vec<_> = expired.iter().map(|h| h.reference.as_str()).collect();
        assert_eq!(refs, vec!["LBL-a", "LBL-b"]);
        assert_eq!(store.expired_holds(now, None, 1).await.unwrap().len(), 1);

        let after_first = store
            .expired_holds(now, Some(expired[0].deadline_cursor()), 10)
            .await
            .unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].reference, "LBL-b");
        assert!(store
            .expired_holds(now, Some(expired[1].deadline_cursor()), 10)
            .await
            .unwrap()
            .is_empty());

        store
            .append(vec![NewEntry::release(&expired[0], ReleaseReason::Expired, now)], now)
            .await
            .unwrap();
        let expired = store.expired_holds(now, None, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].reference, "LBL-b");
    }

    #[tokio::test]
    async fn test_entries_page_follows_append_order() {
        let store = MemoryLedgerStore::new();
        let client = funded_client(&store, dec!(10.00)).await;
        for i in 0..4 {
            store
                .append(vec![NewEntry::credit(client, format!("R{i}"), dec!(1.00), t0())], t0())
                .await
                .unwrap();
        }

        let first = store
            .entries_page(client, HistoryRange::all(), None, 2)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        let rest = store
            .entries_page(client, HistoryRange::all(), Some(first[1].cursor()), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert!(first[1].cursor() < rest[0].cursor());
        assert_eq!(rest.last().unwrap().reference, "R3");
    }

    #[tokio::test]
    async fn test_credit_past_the_money_range_is_rejected() {
        let store = MemoryLedgerStore::new();
        let client = funded_client(&store, MAX_AMOUNT).await;

        let err = store
            .append(vec![NewEntry::credit(client, "R-over", dec!(1.00), t0())], t0())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::BalanceLimit { kind: EntryKind::Credit, .. })
        ));

        let err = store
            .append(vec![NewEntry::credit(client, "R-max", Decimal::MAX, t0())], t0())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Ledger(LedgerError::InvalidAmount(_))));

        let audit = store.audit_balance(client).await.unwrap();
        assert_eq!(audit.materialized.available, MAX_AMOUNT);
        assert_eq!(audit.recomputed.available(), MAX_AMOUNT);
        assert!(store.entries_for_reference("R-over").await.unwrap().is_empty());
    }
}
