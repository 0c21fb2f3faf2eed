//! PostgreSQL entry store shared by every node of a cluster.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single transaction so
//! concurrent claimers on different nodes never receive the same row and
//! never block on each other. Updates carry an optimistic predicate on
//! state, owner and `updated_time`; zero affected rows means the claim was
//! lost to the reaper or a shutdown release.
//!
//! Table names come from configuration and are validated as plain SQL
//! identifiers before being interpolated into statements.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::{debug, warn};

use super::{memory::claim_cutoff, EngineKind, EntryStore, ReapPolicy, StoreFuture};
use crate::{
    error::{CoreError, Result},
    models::{Entry, EntryId, EntryState, NewEntry, NodeId, Payload, SearchKeys},
    notifier::{CommitNotifier, TransactionEvent},
    time::{Clock, RealClock},
};

const ENTRY_COLUMNS: &str = "id, event_type, body, creating_owner, processing_owner, state, \
                             error_count, created_time, updated_time, next_available_time, \
                             search_key1, search_key2";

/// Live and history table names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// Table holding live entries.
    pub table: String,
    /// Table receiving purged terminal entries.
    pub history: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            table: crate::DEFAULT_TABLE_NAME.to_string(),
            history: crate::DEFAULT_HISTORY_TABLE_NAME.to_string(),
        }
    }
}

impl TableNames {
    /// Validates both names as unquoted SQL identifiers.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for empty names, names longer than
    /// 63 bytes, names containing anything but ASCII letters, digits and
    /// underscores, names starting with a digit, or identical names.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.table)?;
        validate_identifier(&self.history)?;
        if self.table == self.history {
            return Err(CoreError::InvalidInput(
                "history table must differ from the entry table".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(format!("invalid table name: {name:?}")))
    }
}

/// Entry store over a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresEntryStore {
    pool: PgPool,
    tables: TableNames,
    clock: Arc<dyn Clock>,
    notifier: Option<CommitNotifier>,
}

impl PostgresEntryStore {
    /// Creates a store over `pool` using `tables`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if a table name is not a valid
    /// identifier.
    pub fn new(pool: PgPool, tables: TableNames) -> Result<Self> {
        tables.validate()?;
        Ok(Self { pool, tables, clock: Arc::new(RealClock::new()), notifier: None })
    }

    /// Stamps times from `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fires `notifier` after each append transaction ends.
    #[must_use]
    pub fn with_notifier(mut self, notifier: CommitNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Returns the configured table names.
    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Creates the entry table, its history table and the claim index if
    /// they do not exist.
    ///
    /// # Errors
    ///
    /// Returns error if any DDL statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        let table = &self.tables.table;
        let history = &self.tables.history;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                event_type TEXT NOT NULL,
                body BYTEA NOT NULL,
                creating_owner TEXT NOT NULL,
                processing_owner TEXT,
                state TEXT NOT NULL CHECK (state IN
                    ('AVAILABLE', 'IN_PROCESSING', 'PROCESSED', 'FAILED', 'REAPED')),
                error_count INTEGER NOT NULL DEFAULT 0 CHECK (error_count >= 0),
                created_time TIMESTAMPTZ NOT NULL,
                updated_time TIMESTAMPTZ NOT NULL,
                next_available_time TIMESTAMPTZ NOT NULL,
                search_key1 TEXT,
                search_key2 TEXT,
                CHECK ((processing_owner IS NOT NULL) = (state = 'IN_PROCESSING'))
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE INDEX IF NOT EXISTS {table}_claim_idx
            ON {table} (next_available_time, id)
            WHERE state = 'AVAILABLE'
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE INDEX IF NOT EXISTS {table}_claimed_idx
            ON {table} (updated_time)
            WHERE state = 'IN_PROCESSING'
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_search_idx ON {table} (search_key1, search_key2)"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!("CREATE TABLE IF NOT EXISTS {history} (LIKE {table})"))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn notify(&self, event: TransactionEvent) {
        if let Some(notifier) = &self.notifier {
            notifier.fire(&event);
        }
    }

    async fn append_impl(&self, new: NewEntry) -> Result<Entry> {
        let now = self.clock.now_utc();
        let owner = new.creating_owner.clone();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO {} (event_type, body, creating_owner, state, error_count,
                            created_time, updated_time, next_available_time,
                            search_key1, search_key2)
            VALUES ($1, $2, $3, 'AVAILABLE', 0, $4, $4, $4, $5, $6)
            RETURNING {ENTRY_COLUMNS}
            "#,
            self.tables.table
        ))
        .bind(&new.payload.event_type)
        .bind(&new.payload.body)
        .bind(new.creating_owner.as_str())
        .bind(now)
        .bind(new.search_keys.key1.as_deref())
        .bind(new.search_keys.key2.as_deref())
        .fetch_one(&mut *tx)
        .await;

        let row = match inserted {
            Ok(row) => row,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "append rollback failed");
                }
                self.notify(TransactionEvent::rolled_back(owner, Vec::new()));
                return Err(err.into());
            },
        };

        tx.commit().await?;
        let entry = entry_from_row(&row)?;
        self.notify(TransactionEvent::committed(owner, vec![entry.id]));
        Ok(entry)
    }

    async fn claim_impl(
        &self,
        max_count: usize,
        claimer: &NodeId,
        owner_filter: Option<&NodeId>,
    ) -> Result<Vec<Entry>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(max_count).unwrap_or(i64::MAX);
        let now = self.clock.now_utc();
        let table = &self.tables.table;

        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(&format!(
            r#"
            SELECT id FROM {table}
            WHERE state = 'AVAILABLE'
              AND next_available_time <= $1
              AND ($2::TEXT IS NULL OR creating_owner = $2)
            ORDER BY id ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(owner_filter.map(NodeId::as_str))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET state = 'IN_PROCESSING', processing_owner = $2, updated_time = $3
            WHERE id = ANY($1)
            RETURNING {ENTRY_COLUMNS}
            "#
        ))
        .bind(&ids)
        .bind(claimer.as_str())
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut claimed = rows.iter().map(entry_from_row).collect::<Result<Vec<_>>>()?;
        claimed.sort_by_key(|e| e.id);
        Ok(claimed)
    }

    async fn update_impl(&self, claimed: &Entry, next: &Entry) -> Result<()> {
        if !EntryState::InProcessing.can_transition_to(next.state) {
            return Err(CoreError::InvalidTransition {
                id: claimed.id,
                from: EntryState::InProcessing,
                to: next.state,
            });
        }
        let Some(owner) = claimed.processing_owner.as_ref() else {
            return Err(CoreError::ConcurrentModification { id: claimed.id });
        };
        let error_count = i32::try_from(next.error_count)
            .map_err(|_| CoreError::InvalidInput("error count out of range".to_string()))?;

        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET state = $1,
                processing_owner = NULL,
                error_count = GREATEST(error_count, $2),
                next_available_time = $3,
                updated_time = $4
            WHERE id = $5
              AND state = 'IN_PROCESSING'
              AND processing_owner = $6
              AND updated_time = $7
            "#,
            self.tables.table
        ))
        .bind(next.state.as_str())
        .bind(error_count)
        .bind(next.next_available_time)
        .bind(self.clock.now_utc())
        .bind(claimed.id)
        .bind(owner.as_str())
        .bind(claimed.updated_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(entry_id = %claimed.id, "optimistic update matched no row");
            return Err(CoreError::ConcurrentModification { id: claimed.id });
        }
        Ok(())
    }

    async fn reap_impl(&self, policy: ReapPolicy) -> Result<Vec<Entry>> {
        let now = self.clock.now_utc();
        let cutoff = claim_cutoff(now, &policy)?;
        let penalty = i32::from(policy.penalize);
        let max = i64::from(policy.max_failure_retries);

        let rows = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET error_count = error_count + $1,
                state = CASE WHEN error_count + $1 < $2 THEN 'AVAILABLE' ELSE 'REAPED' END,
                processing_owner = NULL,
                updated_time = $3,
                next_available_time = $3
            WHERE state = 'IN_PROCESSING'
              AND updated_time < $4
            RETURNING {ENTRY_COLUMNS}
            "#,
            self.tables.table
        ))
        .bind(penalty)
        .bind(max)
        .bind(now)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn release_impl(&self, owner: &NodeId) -> Result<Vec<Entry>> {
        let now = self.clock.now_utc();
        let rows = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET state = 'AVAILABLE', processing_owner = NULL,
                updated_time = $2, next_available_time = $2
            WHERE state = 'IN_PROCESSING' AND processing_owner = $1
            RETURNING {ENTRY_COLUMNS}
            "#,
            self.tables.table
        ))
        .bind(owner.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn count_impl(&self, state: EntryState) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE state = $1", self.tables.table))
                .bind(state.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn find_impl(&self, id: EntryId) -> Result<Option<Entry>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM {table} WHERE id = $1
            UNION ALL
            SELECT {ENTRY_COLUMNS} FROM {history} WHERE id = $1
            LIMIT 1
            "#,
            table = self.tables.table,
            history = self.tables.history,
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn search_impl(&self, key1: Option<&str>, key2: Option<&str>) -> Result<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM {}
            WHERE ($1::TEXT IS NULL OR search_key1 = $1)
              AND ($2::TEXT IS NULL OR search_key2 = $2)
            ORDER BY id ASC
            "#,
            self.tables.table
        ))
        .bind(key1)
        .bind(key2)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn purge_impl(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            WITH moved AS (
                DELETE FROM {table}
                WHERE state IN ('PROCESSED', 'FAILED', 'REAPED')
                  AND updated_time < $1
                RETURNING {ENTRY_COLUMNS}
            )
            INSERT INTO {history} ({ENTRY_COLUMNS})
            SELECT {ENTRY_COLUMNS} FROM moved
            "#,
            table = self.tables.table,
            history = self.tables.history,
        ))
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn entry_from_row(row: &PgRow) -> Result<Entry> {
    let state: String = row.try_get("state")?;
    let error_count: i32 = row.try_get("error_count")?;
    let processing_owner: Option<String> = row.try_get("processing_owner")?;
    let creating_owner: String = row.try_get("creating_owner")?;

    Ok(Entry {
        id: row.try_get("id")?,
        payload: Payload { event_type: row.try_get("event_type")?, body: row.try_get("body")? },
        creating_owner: NodeId::new(creating_owner),
        processing_owner: processing_owner.map(NodeId::new),
        state: state.parse()?,
        error_count: u32::try_from(error_count)
            .map_err(|_| CoreError::InvalidInput(format!("negative error count {error_count}")))?,
        created_time: row.try_get("created_time")?,
        updated_time: row.try_get("updated_time")?,
        next_available_time: row.try_get("next_available_time")?,
        search_keys: SearchKeys { key1: row.try_get("search_key1")?, key2: row.try_get("search_key2")? },
    })
}

impl EntryStore for PostgresEntryStore {
    fn engine_kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    fn append(&self, entry: NewEntry) -> StoreFuture<'_, Entry> {
        Box::pin(self.append_impl(entry))
    }

    fn claim_batch<'a>(
        &'a self,
        max_count: usize,
        claimer: &'a NodeId,
        owner_filter: Option<&'a NodeId>,
    ) -> StoreFuture<'a, Vec<Entry>> {
        Box::pin(self.claim_impl(max_count, claimer, owner_filter))
    }

    fn update<'a>(&'a self, claimed: &'a Entry, next: &'a Entry) -> StoreFuture<'a, ()> {
        Box::pin(self.update_impl(claimed, next))
    }

    fn reap_stale(&self, policy: ReapPolicy) -> StoreFuture<'_, Vec<Entry>> {
        Box::pin(self.reap_impl(policy))
    }

    fn release_claimed<'a>(&'a self, owner: &'a NodeId) -> StoreFuture<'a, Vec<Entry>> {
        Box::pin(self.release_impl(owner))
    }

    fn count_by_state(&self, state: EntryState) -> StoreFuture<'_, u64> {
        Box::pin(self.count_impl(state))
    }

    fn find_by_id(&self, id: EntryId) -> StoreFuture<'_, Option<Entry>> {
        Box::pin(self.find_impl(id))
    }

    fn find_by_search_keys<'a>(
        &'a self,
        key1: Option<&'a str>,
        key2: Option<&'a str>,
    ) -> StoreFuture<'a, Vec<Entry>> {
        Box::pin(self.search_impl(key1, key2))
    }

    fn purge(&self, older_than: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(self.purge_impl(older_than))
    }
}
