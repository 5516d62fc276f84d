//! Trial Grant Database Module
//! SQLite-backed `TrialStore`

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::models::trial::{
    format_stored_timestamp, parse_timestamp, AttemptOutcome, ConditionalGrant,
    TrialAttempt, TrialGrant, TrialLookup,
};
use crate::trial::store::TrialStore;

pub struct SqliteTrialStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
    audit_table: String,
}

impl SqliteTrialStore {
    /// Open (or create) the database file and make sure the schema exists.
    /// Table names must already be validated identifiers.
    pub fn open(path: &Path, table: &str, audit_table: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("failed to create db dir: {}", e)))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn, table, audit_table)
    }

    pub fn open_in_memory(table: &str, audit_table: &str) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, table, audit_table)
    }

    fn with_connection(conn: Connection, table: &str, audit_table: &str) -> Result<Self, StoreError> {
        init_schema(&conn, table, audit_table)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
            audit_table: audit_table.to_string(),
        })
    }

    /// Run a blocking closure against the connection off the async runtime.
    fn blocking<'a, T, F>(&'a self, f: F) -> BoxFuture<'a, Result<T, StoreError>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        async move {
            tokio::task::spawn_blocking(move || {
                let mut guard = conn.lock();
                f(&mut *guard)
            })
            .await
            .map_err(|e| StoreError::Unavailable(format!("sqlite task failed: {}", e)))?
        }
        .boxed()
    }

    /// All attempts for one identifier, oldest first.
    pub fn list_attempts(&self, identifier: &str) -> Result<Vec<TrialAttempt>, StoreError> {
        let conn = self.conn.lock();
        list_attempts_with_conn(&conn, &self.audit_table, identifier)
    }
}

// ============================================================================
// Schema
// ============================================================================

fn init_schema(conn: &Connection, table: &str, audit_table: &str) -> Result<(), StoreError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            user_identifier TEXT PRIMARY KEY,
            trial_granted_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS {audit} (
            id TEXT PRIMARY KEY,
            user_identifier TEXT NOT NULL,
            attempted_at TEXT NOT NULL,
            outcome TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{audit}_identifier
            ON {audit} (user_identifier, attempted_at);",
        table = table,
        audit = audit_table,
    ))?;
    Ok(())
}

// ============================================================================
// Queries
// ============================================================================

fn column_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn grant_from_row(row: &Row<'_>) -> rusqlite::Result<TrialGrant> {
    Ok(TrialGrant {
        identifier: row.get(0)?,
        granted_at: column_timestamp(row, 1)?,
        expires_at: column_timestamp(row, 2)?,
    })
}

fn lookup_with_conn(
    conn: &Connection,
    table: &str,
    identifier: &str,
) -> Result<TrialLookup, StoreError> {
    let sql = format!(
        "SELECT user_identifier, trial_granted_at, expires_at FROM {} WHERE user_identifier = ?1",
        table
    );
    let found = conn
        .query_row(&sql, params![identifier], grant_from_row)
        .optional()?;
    Ok(match found {
        Some(grant) => TrialLookup::Found(grant),
        None => TrialLookup::NotFound,
    })
}

fn upsert_with_conn(conn: &Connection, table: &str, grant: &TrialGrant) -> Result<(), StoreError> {
    let sql = format!(
        "INSERT INTO {t} (user_identifier, trial_granted_at, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_identifier) DO UPDATE SET
            trial_granted_at = excluded.trial_granted_at,
            expires_at = excluded.expires_at",
        t = table
    );
    conn.execute(
        &sql,
        params![
            grant.identifier,
            format_stored_timestamp(&grant.granted_at),
            format_stored_timestamp(&grant.expires_at)
        ],
    )?;
    Ok(())
}

/// Insert-or-replace-if-expired in one transaction. Timestamps share one
/// fixed-width UTC format, so string comparison orders them correctly.
fn grant_if_eligible_with_conn(
    conn: &mut Connection,
    table: &str,
    grant: &TrialGrant,
    now: DateTime<Utc>,
) -> Result<ConditionalGrant, StoreError> {
    let tx = conn.transaction()?;
    let sql = format!(
        "INSERT INTO {t} (user_identifier, trial_granted_at, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_identifier) DO UPDATE SET
            trial_granted_at = excluded.trial_granted_at,
            expires_at = excluded.expires_at
         WHERE {t}.expires_at <= ?4",
        t = table
    );
    let changed = tx.execute(
        &sql,
        params![
            grant.identifier,
            format_stored_timestamp(&grant.granted_at),
            format_stored_timestamp(&grant.expires_at),
            format_stored_timestamp(&now)
        ],
    )?;

    let result = if changed > 0 {
        ConditionalGrant::Inserted(grant.clone())
    } else {
        match lookup_with_conn(&tx, table, &grant.identifier)? {
            TrialLookup::Found(existing) => ConditionalGrant::Active(existing),
            TrialLookup::NotFound => {
                return Err(StoreError::Query(
                    "conditional grant wrote nothing and no record exists".to_string(),
                ))
            }
        }
    };
    tx.commit()?;
    Ok(result)
}

fn append_attempt_with_conn(
    conn: &Connection,
    audit_table: &str,
    attempt: &TrialAttempt,
) -> Result<(), StoreError> {
    let sql = format!(
        "INSERT INTO {} (id, user_identifier, attempted_at, outcome, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        audit_table
    );
    conn.execute(
        &sql,
        params![
            attempt.id,
            attempt.identifier,
            format_stored_timestamp(&attempt.attempted_at),
            attempt.outcome.as_str(),
            format_stored_timestamp(&attempt.expires_at)
        ],
    )?;
    Ok(())
}

fn list_attempts_with_conn(
    conn: &Connection,
    audit_table: &str,
    identifier: &str,
) -> Result<Vec<TrialAttempt>, StoreError> {
    let sql = format!(
        "SELECT id, user_identifier, attempted_at, outcome, expires_at FROM {}
         WHERE user_identifier = ?1 ORDER BY attempted_at ASC, rowid ASC",
        audit_table
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![identifier], |row| {
        let outcome: String = row.get(3)?;
        let outcome = AttemptOutcome::parse(&outcome).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown outcome {:?}", outcome).into(),
            )
        })?;
        Ok(TrialAttempt {
            id: row.get(0)?,
            identifier: row.get(1)?,
            attempted_at: column_timestamp(row, 2)?,
            outcome,
            expires_at: column_timestamp(row, 4)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

// ============================================================================
// TrialStore
// ============================================================================

impl TrialStore for SqliteTrialStore {
    fn lookup<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, Result<TrialLookup, StoreError>> {
        let table = self.table.clone();
        let identifier = identifier.to_string();
        self.blocking(move |conn| lookup_with_conn(conn, &table, &identifier))
    }

    fn upsert<'a>(&'a self, grant: &'a TrialGrant) -> BoxFuture<'a, Result<(), StoreError>> {
        let table = self.table.clone();
        let grant = grant.clone();
        self.blocking(move |conn| upsert_with_conn(conn, &table, &grant))
    }

    fn grant_if_eligible<'a>(
        &'a self,
        grant: &'a TrialGrant,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<ConditionalGrant, StoreError>> {
        let table = self.table.clone();
        let grant = grant.clone();
        self.blocking(move |conn| grant_if_eligible_with_conn(conn, &table, &grant, now))
    }

    fn append_attempt<'a>(
        &'a self,
        attempt: &'a TrialAttempt,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        let audit_table = self.audit_table.clone();
        let attempt = attempt.clone();
        self.blocking(move |conn| append_attempt_with_conn(conn, &audit_table, &attempt))
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trial::TrialDecision;
    use crate::trial::service::{TrialGrantService, TrialServiceOptions};
    use chrono::TimeZone;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
    }

    fn setup_test_store() -> SqliteTrialStore {
        SqliteTrialStore::open_in_memory("trial_users", "trial_attempts").unwrap()
    }

    #[test]
    fn test_init_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, "trial_users", "trial_attempts").unwrap();
        init_schema(&conn, "trial_users", "trial_attempts").unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('trial_users', 'trial_attempts')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_lookup_not_found() {
        let store = setup_test_store();
        assert_eq!(store.lookup("abc").await.unwrap(), TrialLookup::NotFound);
    }

    #[tokio::test]
    async fn test_upsert_then_lookup_roundtrip() {
        let store = setup_test_store();
        let grant = TrialGrant::open("abc", at(1, 0));
        store.upsert(&grant).await.unwrap();
        assert_eq!(store.lookup("abc").await.unwrap(), TrialLookup::Found(grant));
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_per_identifier() {
        let store = setup_test_store();
        store.upsert(&TrialGrant::open("abc", at(1, 0))).await.unwrap();
        let newer = TrialGrant::open("abc", at(3, 0));
        store.upsert(&newer).await.unwrap();

        let count: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM trial_users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.lookup("abc").await.unwrap(), TrialLookup::Found(newer));
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_a_fault_not_not_found() {
        let store = setup_test_store();
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO trial_users VALUES ('abc', 'yesterday', 'tomorrow')",
                [],
            )
            .unwrap();
        let err = store.lookup("abc").await.unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }

    #[tokio::test]
    async fn test_missing_table_is_a_fault() {
        let store = setup_test_store();
        store
            .conn
            .lock()
            .execute_batch("DROP TABLE trial_users")
            .unwrap();
        assert!(matches!(store.lookup("abc").await, Err(StoreError::Query(_))));
    }

    #[tokio::test]
    async fn test_grant_if_eligible() {
        let store = setup_test_store();
        let first = TrialGrant::open("abc", at(1, 0));
        assert_eq!(
            store.grant_if_eligible(&first, at(1, 0)).await.unwrap(),
            ConditionalGrant::Inserted(first.clone())
        );

        let retry = TrialGrant::open("abc", at(1, 12));
        assert_eq!(
            store.grant_if_eligible(&retry, at(1, 12)).await.unwrap(),
            ConditionalGrant::Active(first.clone())
        );

        // Expiry instant itself is eligible
        let at_expiry = TrialGrant::open("abc", at(2, 0));
        assert_eq!(
            store.grant_if_eligible(&at_expiry, at(2, 0)).await.unwrap(),
            ConditionalGrant::Inserted(at_expiry.clone())
        );
        assert_eq!(store.lookup("abc").await.unwrap(), TrialLookup::Found(at_expiry));
    }

    #[tokio::test]
    async fn test_append_and_list_attempts() {
        let store = setup_test_store();
        let granted = TrialDecision::Granted { expires_at: at(2, 0) };
        let active = TrialDecision::AlreadyActive { expires_at: at(2, 0) };
        store
            .append_attempt(&TrialAttempt::record("abc", at(1, 0), &granted))
            .await
            .unwrap();
        store
            .append_attempt(&TrialAttempt::record("abc", at(1, 5), &active))
            .await
            .unwrap();
        store
            .append_attempt(&TrialAttempt::record("other", at(1, 6), &granted))
            .await
            .unwrap();

        let attempts = store.list_attempts("abc").unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Granted);
        assert_eq!(attempts[1].outcome, AttemptOutcome::AlreadyActive);
        assert_eq!(attempts[1].attempted_at, at(1, 5));
    }

    #[tokio::test]
    async fn test_file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trials.db");
        let grant = TrialGrant::open("abc", at(1, 0));
        {
            let store = SqliteTrialStore::open(&path, "trial_users", "trial_attempts").unwrap();
            store.upsert(&grant).await.unwrap();
        }
        let reopened = SqliteTrialStore::open(&path, "trial_users", "trial_attempts").unwrap();
        assert_eq!(reopened.lookup("abc").await.unwrap(), TrialLookup::Found(grant));
    }

    #[tokio::test]
    async fn test_service_timeline_on_sqlite() {
        let store = Arc::new(setup_test_store());
        let service = TrialGrantService::new(store, TrialServiceOptions::default());

        let first = service.request_trial("abc", at(1, 0)).await.unwrap();
        let second = service.request_trial("abc", at(1, 12)).await.unwrap();
        let third = service.request_trial("abc", at(3, 0)).await.unwrap();

        assert_eq!(first, TrialDecision::Granted { expires_at: at(2, 0) });
        assert_eq!(second, TrialDecision::AlreadyActive { expires_at: at(2, 0) });
        assert_eq!(third, TrialDecision::Granted { expires_at: at(4, 0) });
    }

    #[tokio::test]
    async fn test_sub_millisecond_expiry_round_trips() {
        let store = setup_test_store();
        let now = at(1, 0) + chrono::Duration::nanoseconds(500_000);
        let grant = TrialGrant::open("abc", now);
        store.upsert(&grant).await.unwrap();
        assert_eq!(store.lookup("abc").await.unwrap(), TrialLookup::Found(grant.clone()));

        // A quarter millisecond before expiry the grant is still active
        let just_before = grant.expires_at - chrono::Duration::nanoseconds(250_000);
        let retry = TrialGrant::open("abc", just_before);
        assert_eq!(
            store.grant_if_eligible(&retry, just_before).await.unwrap(),
            ConditionalGrant::Active(grant.clone())
        );
        assert!(matches!(
            store.grant_if_eligible(&retry, grant.expires_at).await.unwrap(),
            ConditionalGrant::Inserted(_)
        ));
    }
}
