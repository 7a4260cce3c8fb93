use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use rust_decimal::Decimal;
use sqlx::{prelude::FromRow, PgPool, Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use super::models::*;
use super::store::{check_batch, LedgerStore};
use crate::error::{AppError, AppResult, HoldError, LedgerError};

const ENTRY_COLUMNS: &str =
    "id, client_id, kind, amount, reference, memo, occurred_at, expires_at, created_at";

const CLIENT_COLUMNS: &str =
    "id, display_name, credited, consumed, held, available, created_at, updated_at";

const UNIQUE_VIOLATION: &str = "23505";

/// Client row as seen by an append holding its lock
#[derive(FromRow)]
struct LockedClient {
    #[sqlx(flatten)]
    account: ClientAccount,
    last_entry_at: Option<DateTime<Utc>>,
}

/// `created_at` for the next entry of a client. Postgres keeps microseconds,
/// so stamps are truncated first and then kept strictly increasing.
fn next_created_at(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    match last {
        Some(last) if now <= last => last + Duration::microseconds(1),
        _ => now,
    }
}

/// Postgres-backed ledger - THE source of truth for all balances
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Locks the client row for the rest of the transaction.
    /// This is the per-client serialization point for every append.
    async fn lock_client(
        tx: &mut Transaction<'_, Postgres>,
        client_id: Uuid,
    ) -> AppResult<LockedClient> {
        let sql = format!(
            "SELECT {CLIENT_COLUMNS}, last_entry_at FROM clients WHERE id = $1 FOR UPDATE"
        );
        sqlx::query_as::<_, LockedClient>(&sql)
            .bind(client_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| LedgerError::UnknownClient(client_id).into())
    }

    async fn existing_kind(
        tx: &mut Transaction<'_, Postgres>,
        reference: &str,
        kinds: &[EntryKind],
    ) -> AppResult<Option<EntryKind>> {
        let kind = sqlx::query_scalar::<_, EntryKind>(
            r#"
            SELECT kind FROM ledger_entries
            WHERE reference = $1 AND kind::text = ANY($2)
            LIMIT 1
            "#,
        )
        .bind(reference)
        .bind(kinds.iter().map(EntryKind::as_str).collect::<Vec<_>>())
        .fetch_optional(&mut **tx)
        .await?;

        Ok(kind)
    }

    async fn check_entry(
        tx: &mut Transaction<'_, Postgres>,
        entry: &NewEntry,
    ) -> AppResult<()> {
        match entry.kind {
            EntryKind::Credit | EntryKind::Hold => {
                if let Some(kind) = Self::existing_kind(tx, &entry.reference, &[entry.kind]).await? {
                    return Err(LedgerError::DuplicateReference {
                        reference: entry.reference.clone(),
                        kind,
                    }
                    .into());
                }
            }
            EntryKind::Consume | EntryKind::Release => {
                let hold = sqlx::query_as::<_, (Uuid, Decimal)>(
                    r#"
                    SELECT client_id, amount FROM ledger_entries
                    WHERE reference = $1 AND kind = 'hold'
                    "#,
                )
                .bind(&entry.reference)
                .fetch_optional(&mut **tx)
                .await?
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

                let terminal = [EntryKind::Consume, EntryKind::Release];
                if let Some(kind) = Self::existing_kind(tx, &entry.reference, &terminal).await? {
                    return Err(LedgerError::DuplicateReference {
                        reference: entry.reference.clone(),
                        kind,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    async fn insert_entry(
        tx: &mut Transaction<'_, Postgres>,
        entry: NewEntry,
        created_at: DateTime<Utc>,
    ) -> AppResult<LedgerEntry> {
        let sql = format!(
            r#"
            INSERT INTO ledger_entries
                (id, client_id, kind, amount, reference, memo, occurred_at, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {ENTRY_COLUMNS}
            "#
        );

        sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(Uuid::new_v4())
            .bind(entry.client_id)
            .bind(entry.kind)
            .bind(entry.amount)
            .bind(&entry.reference)
            .bind(&entry.memo)
            .bind(entry.occurred_at)
            .bind(entry.expires_at)
            .bind(created_at)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_unique_violation(e, &entry))
    }
}

/// A unique index firing means another client raced us to the same reference.
fn map_unique_violation(error: sqlx::Error, entry: &NewEntry) -> AppError {
    if let sqlx::Error::Database(db) = &error {
        if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
            warn!(
                "Unique index {:?} rejected {} entry for {}",
                db.constraint(),
                entry.kind,
                entry.reference
            );
            return LedgerError::DuplicateReference {
                reference: entry.reference.clone(),
                kind: entry.kind,
            }
            .into();
        }
    }
    error.into()
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    async fn register_client(
        &self,
        client_id: Uuid,
        display_name: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<ClientAccount> {
        sqlx::query(
            r#"
            INSERT INTO clients (id, display_name, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(client_id)
        .bind(display_name)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.client(client_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("client {} vanished after insert", client_id)))
    }

    async fn client(&self, client_id: Uuid) -> AppResult<Option<ClientAccount>> {
        let sql = format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = $1");
        let account = sqlx::query_as::<_, ClientAccount>(&sql)
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account)
    }

    async fn append(&self, entries: Vec<NewEntry>, now: DateTime<Utc>) -> AppResult<Vec<LedgerEntry>> {
        let client_id = check_batch(&entries)?;
        let mut tx = self.begin_tx().await?;

        let LockedClient {
            account,
            mut last_entry_at,
        } = Self::lock_client(&mut tx, client_id).await?;
        let mut totals = BalanceTotals {
            credited: account.credited,
            consumed: account.consumed,
            held: account.held,
        };

        let mut written = Vec::with_capacity(entries.len());
        for entry in entries {
            Self::check_entry(&mut tx, &entry).await?;

            let available_before = totals.available();
            totals.apply(entry.kind, entry.amount)?;
            if totals.available() < Decimal::ZERO {
                // Dropping `tx` rolls back everything staged so far.
                return Err(LedgerError::InsufficientBalance {
                    client_id,
                    required: entry.amount,
                    available: available_before,
                }
                .into());
            }

            // Stamped under the row lock so `(created_at, id)` follows commit order.
            let created_at = next_created_at(last_entry_at, now);
            last_entry_at = Some(created_at);
            written.push(Self::insert_entry(&mut tx, entry, created_at).await?);
        }

        sqlx::query(
            r#"
            UPDATE clients
            SET credited = $2, consumed = $3, held = $4, available = $5,
                updated_at = $6, last_entry_at = $7
            WHERE id = $1
            "#,
        )
        .bind(client_id)
        .bind(totals.credited)
        .bind(totals.consumed)
        .bind(totals.held)
        .bind(totals.available())
        .bind(now)
        .bind(last_entry_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!("Appended {} entries for client {}", written.len(), client_id);
        Ok(written)
    }

    async fn balance(&self, client_id: Uuid) -> AppResult<BalanceSnapshot> {
        self.client(client_id)
            .await?
            .map(|account| account.snapshot())
            .ok_or_else(|| LedgerError::UnknownClient(client_id).into())
    }

    async fn audit_balance(&self, client_id: Uuid) -> AppResult<BalanceAudit> {
        let mut tx = self.begin_tx().await?;

        // FOR SHARE waits out, and then blocks, appends holding FOR UPDATE.
        let sql = format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = $1 FOR SHARE");
        let account = sqlx::query_as::<_, ClientAccount>(&sql)
            .bind(client_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(LedgerError::UnknownClient(client_id))?;

        let (credited, consumed, held) = sqlx::query_as::<_, (Decimal, Decimal, Decimal)>(
            r#"
            SELECT
                COALESCE(SUM(amount) FILTER (WHERE kind = 'credit'), 0),
                COALESCE(SUM(amount) FILTER (WHERE kind = 'consume'), 0),
                COALESCE(SUM(amount) FILTER (WHERE kind = 'hold'), 0)
                    - COALESCE(SUM(amount) FILTER (WHERE kind IN ('consume', 'release')), 0)
            FROM ledger_entries
            WHERE client_id = $1
            "#,
        )
        .bind(client_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(BalanceAudit {
            materialized: account.snapshot(),
            recomputed: BalanceTotals {
                credited,
                consumed,
                held,
            },
        })
    }

    async fn entries_page(
        &self,
        client_id: Uuid,
        range: HistoryRange,
        after: Option<EntryCursor>,
        limit: i64,
    ) -> AppResult<Vec<LedgerEntry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM ledger_entries
            WHERE client_id = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
              AND ($3::timestamptz IS NULL OR created_at < $3)
              AND ($4::timestamptz IS NULL OR (created_at, id) > ($4, $5::uuid))
            ORDER BY created_at, id
            LIMIT $6
            "#
        );

        let entries = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(client_id)
            .bind(range.from)
            .bind(range.to)
            .bind(after.map(|c| c.created_at))
            .bind(after.map(|c| c.id))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(entries)
    }

    async fn entries_for_reference(&self, reference: &str) -> AppResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE reference = $1 ORDER BY created_at, id"
        );
        let entries = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(reference)
            .fetch_all(&self.pool)
            .await?;

        Ok(entries)
    }

    async fn expired_holds(
        &self,
        now: DateTime<Utc>,
        after: Option<HoldCursor>,
        limit: i64,
    ) -> AppResult<Vec<Hold>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM ledger_entries h
            WHERE h.kind = 'hold'
              AND h.expires_at <= $1
              AND ($2::timestamptz IS NULL OR (h.expires_at, h.reference) > ($2, $3::text))
              AND NOT EXISTS (
                  SELECT 1 FROM ledger_entries t
                  WHERE t.reference = h.reference AND t.kind IN ('consume', 'release')
              )
            ORDER BY h.expires_at, h.reference
            LIMIT $4
            "#
        );

        let (after_at, after_reference) = match after {
            Some(cursor) => (Some(cursor.expires_at), Some(cursor.reference)),
            None => (None, None),
        };

        let rows = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(now)
            .bind(after_at)
            .bind(after_reference)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().filter_map(|e| Hold::from_entries([e])).collect())
    }

    async fn insert_recharge(&self, record: RechargeRecord) -> AppResult<RechargeRecord> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO recharges (id, client_id, amount, source, created_at)
            SELECT $1, $2, $3, $4, $5
            WHERE EXISTS (SELECT 1 FROM clients WHERE id = $2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(record.client_id)
        .bind(record.amount)
        .bind(record.source)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        match self.recharge(&record.id).await? {
            Some(stored) => Ok(stored),
            None if inserted == 0 => Err(LedgerError::UnknownClient(record.client_id).into()),
            None => Err(AppError::Internal(format!(
                "recharge {} vanished after insert",
                record.id
            ))),
        }
    }

    async fn recharge(&self, recharge_id: &str) -> AppResult<Option<RechargeRecord>> {
        let record = sqlx::query_as::<_, RechargeRecord>(
            r#"
            SELECT id, client_id, amount, source, created_at
            FROM recharges
            WHERE id = $1
            "#,
        )
        .bind(recharge_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
