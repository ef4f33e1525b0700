//! SQLite-backed ledger store.
//!
//! Owns the clients, employees and ledger_entries tables and executes
//! allocation plans transactionally. All writes that touch more than one
//! row run inside an explicit `BEGIN IMMEDIATE` transaction so the write
//! lock is taken up front; busy/locked conditions surface as retryable
//! [`LedgerError::Concurrency`].

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::ledger::allocator::AllocationPlan;
use crate::ledger::error::LedgerError;
use crate::models::{Client, Employee, LedgerEntry};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS clients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    phone TEXT NOT NULL DEFAULT '',
    pinned INTEGER NOT NULL DEFAULT 0,
    balance INTEGER NOT NULL DEFAULT 0,
    last_activity INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS employees (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id INTEGER NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
    debt_value INTEGER NOT NULL,
    original_value INTEGER NOT NULL,
    is_valid INTEGER NOT NULL DEFAULT 1,
    history TEXT NOT NULL DEFAULT '',
    employee_id INTEGER NOT NULL REFERENCES employees(id),
    created_at INTEGER NOT NULL,
    repaid_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_entries_client_created
    ON ledger_entries(client_id, created_at ASC, id ASC);
CREATE INDEX IF NOT EXISTS idx_entries_client_valid
    ON ledger_entries(client_id, is_valid);
CREATE INDEX IF NOT EXISTS idx_clients_activity
    ON clients(pinned DESC, last_activity DESC);
"#;

/// Aggregate drift found by reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub client_id: i64,
    pub name: String,
    /// Cached aggregate on the client row.
    pub balance: i64,
    /// Sum of valid entry values.
    pub entry_sum: i64,
    /// `balance - entry_sum`; nonzero means the invariant is broken.
    pub drift: i64,
}

#[derive(Clone)]
pub struct LedgerDb {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerDb {
    pub fn new(db_path: &str, busy_timeout_ms: u64) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path).context("open ledger db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))
            .context("set busy timeout")?;

        conn.execute_batch(SCHEMA_SQL)
            .context("init ledger schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ===== Clients =====

    pub async fn create_client(
        &self,
        name: &str,
        description: &str,
        phone: &str,
        now: DateTime<Utc>,
    ) -> Result<Client, LedgerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::InvalidName);
        }

        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO clients (name, description, phone, pinned, balance, last_activity, created_at)
             VALUES (?1, ?2, ?3, 0, 0, ?4, ?4)",
            params![name, description, phone, ms(now)],
        );
        match result {
            Ok(_) => Self::get_client_on(&conn, conn.last_insert_rowid()),
            Err(err) if unique_violation(&err) => Err(LedgerError::DuplicateName {
                name: name.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_client(&self, client_id: i64) -> Result<Client, LedgerError> {
        let conn = self.conn.lock().await;
        Self::get_client_on(&conn, client_id)
    }

    pub async fn find_client_by_name(&self, name: &str) -> Result<Option<Client>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, description, phone, pinned, balance, last_activity, created_at
             FROM clients WHERE name = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![name.trim()])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_client(row)?)),
            None => Ok(None),
        }
    }

    /// Case-insensitive substring search over client names. Pinned clients
    /// come first, then most recent activity.
    pub async fn search_clients(
        &self,
        query: &str,
        include_settled: bool,
        limit: usize,
    ) -> Result<Vec<Client>, LedgerError> {
        let limit = limit.clamp(1, 500) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, description, phone, pinned, balance, last_activity, created_at
             FROM clients
             WHERE name LIKE '%' || ?1 || '%' COLLATE NOCASE
               AND (?2 OR balance != 0)
             ORDER BY pinned DESC, last_activity DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![query.trim(), include_settled, limit], |row| {
            Self::row_to_client(row)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn set_pinned(
        &self,
        client_id: i64,
        pinned: bool,
        now: DateTime<Utc>,
    ) -> Result<Client, LedgerError> {
        let conn = self.conn.lock().await;
        let changes = conn.execute(
            "UPDATE clients SET pinned = ?1, last_activity = ?2 WHERE id = ?3",
            params![pinned, ms(now), client_id],
        )?;
        if changes == 0 {
            return Err(LedgerError::ClientNotFound { client_id });
        }
        Self::get_client_on(&conn, client_id)
    }

    pub async fn update_client(
        &self,
        client_id: i64,
        description: &str,
        phone: &str,
        now: DateTime<Utc>,
    ) -> Result<Client, LedgerError> {
        let conn = self.conn.lock().await;
        let changes = conn.execute(
            "UPDATE clients SET description = ?1, phone = ?2, last_activity = ?3 WHERE id = ?4",
            params![description, phone, ms(now), client_id],
        )?;
        if changes == 0 {
            return Err(LedgerError::ClientNotFound { client_id });
        }
        Self::get_client_on(&conn, client_id)
    }

    /// Remove a client and, through the cascade, every entry on its ledger.
    pub async fn delete_client(&self, client_id: i64) -> Result<(), LedgerError> {
        let conn = self.conn.lock().await;
        let changes = conn.execute("DELETE FROM clients WHERE id = ?1", params![client_id])?;
        if changes == 0 {
            return Err(LedgerError::ClientNotFound { client_id });
        }
        Ok(())
    }

    // ===== Employees =====

    pub async fn create_employee(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Employee, LedgerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::InvalidName);
        }

        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO employees (name, created_at) VALUES (?1, ?2)",
            params![name, ms(now)],
        );
        match result {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                Ok(Employee {
                    id,
                    name: name.to_string(),
                    created_at: now,
                })
            }
            Err(err) if unique_violation(&err) => Err(LedgerError::DuplicateName {
                name: name.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_employee(&self, employee_id: i64) -> Result<Option<Employee>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT id, name, created_at FROM employees WHERE id = ?1 LIMIT 1")?;
        let mut rows = stmt.query(params![employee_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_employee(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_employees(&self) -> Result<Vec<Employee>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT id, name, created_at FROM employees ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| Self::row_to_employee(row))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ===== Entries =====

    /// All entries of a client, oldest first. The id tiebreak keeps
    /// same-millisecond entries in insertion order.
    pub async fn list_entries(&self, client_id: i64) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, client_id, debt_value, original_value, is_valid, history, employee_id, created_at, repaid_at
             FROM ledger_entries WHERE client_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![client_id], |row| Self::row_to_entry(row))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Valid entries of a client in allocation order (oldest first).
    pub async fn open_entries(&self, client_id: i64) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, client_id, debt_value, original_value, is_valid, history, employee_id, created_at, repaid_at
             FROM ledger_entries WHERE client_id = ?1 AND is_valid = 1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![client_id], |row| Self::row_to_entry(row))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn get_entry(&self, entry_id: i64) -> Result<Option<LedgerEntry>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, client_id, debt_value, original_value, is_valid, history, employee_id, created_at, repaid_at
             FROM ledger_entries WHERE id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![entry_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_entry(row)?)),
            None => Ok(None),
        }
    }

    /// Execute an allocation plan in one write transaction: entry mutations,
    /// the new entry if any, and the client aggregate update.
    ///
    /// The aggregate update is guarded on the balance the plan was built
    /// from; if another writer moved it the whole transaction rolls back
    /// with a retryable conflict.
    pub async fn apply_plan(
        &self,
        plan: &AllocationPlan,
        employee_id: i64,
    ) -> Result<Client, LedgerError> {
        let conn = self.conn.lock().await;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = Self::apply_plan_tx(&conn, plan, employee_id);
        if let Err(err) = result {
            let _ = conn.execute("ROLLBACK", []);
            return Err(err);
        }

        conn.execute("COMMIT", [])?;
        Self::get_client_on(&conn, plan.client_id)
    }

    fn apply_plan_tx(
        conn: &Connection,
        plan: &AllocationPlan,
        employee_id: i64,
    ) -> Result<(), LedgerError> {
        let now_ms = ms(plan.at);

        let changes = conn.execute(
            "UPDATE clients SET balance = ?1, last_activity = ?2
             WHERE id = ?3 AND balance = ?4",
            params![plan.balance_after, now_ms, plan.client_id, plan.balance_before],
        )?;
        if changes == 0 {
            // Either the client vanished or its balance moved after planning.
            return match Self::get_client_on(conn, plan.client_id) {
                Ok(_) => Err(LedgerError::Concurrency {
                    reason: format!("client {} balance moved during allocation", plan.client_id),
                }),
                Err(err) => Err(err),
            };
        }

        for m in &plan.mutations {
            let changes = if m.kind.closes_entry() {
                conn.execute(
                    "UPDATE ledger_entries
                     SET debt_value = ?1, is_valid = 0, repaid_at = ?2, employee_id = ?3,
                         history = CASE WHEN history = '' THEN ?4 ELSE history || char(10) || ?4 END
                     WHERE id = ?5 AND is_valid = 1",
                    params![m.value_after, now_ms, employee_id, m.note, m.entry_id],
                )?
            } else {
                conn.execute(
                    "UPDATE ledger_entries
                     SET debt_value = ?1, employee_id = ?2,
                         history = CASE WHEN history = '' THEN ?3 ELSE history || char(10) || ?3 END
                     WHERE id = ?4 AND is_valid = 1",
                    params![m.value_after, employee_id, m.note, m.entry_id],
                )?
            };
            if changes == 0 {
                return Err(LedgerError::Concurrency {
                    reason: format!("entry {} mutated during allocation", m.entry_id),
                });
            }
        }

        if let Some(new) = &plan.new_entry {
            // A normalizing plan records its new entry born closed.
            let (valid, repaid) = if plan.normalized {
                (false, Some(now_ms))
            } else {
                (true, None)
            };
            conn.execute(
                "INSERT INTO ledger_entries
                 (client_id, debt_value, original_value, is_valid, history, employee_id, created_at, repaid_at)
                 VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![plan.client_id, new.value, valid, new.note, employee_id, now_ms, repaid],
            )?;
        }

        Ok(())
    }

    /// Hard-delete one entry regardless of state and subtract its current
    /// value from the client aggregate.
    ///
    /// Deleting a closed entry that kept a residual value moves the
    /// aggregate away from the valid-entry sum; `reconcile` exists to
    /// detect exactly that.
    pub async fn delete_entry(
        &self,
        entry_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(Client, LedgerEntry), LedgerError> {
        let conn = self.conn.lock().await;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<(Client, LedgerEntry), LedgerError> {
            let entry = Self::get_entry_on(&conn, entry_id)?
                .ok_or(LedgerError::EntryNotFound { entry_id })?;
            conn.execute(
                "UPDATE clients SET balance = balance - ?1, last_activity = ?2 WHERE id = ?3",
                params![entry.value, ms(now), entry.client_id],
            )?;
            conn.execute(
                "DELETE FROM ledger_entries WHERE id = ?1",
                params![entry_id],
            )?;
            let client = Self::get_client_on(&conn, entry.client_id)?;
            Ok((client, entry))
        })();

        match result {
            Ok(out) => {
                conn.execute("COMMIT", [])?;
                Ok(out)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(err)
            }
        }
    }

    /// Hard-delete every entry of a client and zero the aggregate.
    pub async fn wipe_client_history(
        &self,
        client_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Client, LedgerError> {
        let conn = self.conn.lock().await;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<Client, LedgerError> {
            Self::get_client_on(&conn, client_id)?;
            conn.execute(
                "DELETE FROM ledger_entries WHERE client_id = ?1",
                params![client_id],
            )?;
            conn.execute(
                "UPDATE clients SET balance = 0, last_activity = ?1 WHERE id = ?2",
                params![ms(now), client_id],
            )?;
            Self::get_client_on(&conn, client_id)
        })();

        match result {
            Ok(client) => {
                conn.execute("COMMIT", [])?;
                Ok(client)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(err)
            }
        }
    }

    /// Compare every client's cached aggregate against its valid-entry sum.
    /// Returns only the drifted clients; with `fix` the aggregates are
    /// rewritten to the entry sums in one transaction.
    pub async fn reconcile(&self, fix: bool) -> Result<Vec<DriftReport>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT c.id, c.name, c.balance,
                    COALESCE(SUM(CASE WHEN e.is_valid = 1 THEN e.debt_value ELSE 0 END), 0)
             FROM clients c
             LEFT JOIN ledger_entries e ON e.client_id = c.id
             GROUP BY c.id, c.name, c.balance
             ORDER BY c.id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let client_id: i64 = row.get(0)?;
            let name: String = row.get(1)?;
            let balance: i64 = row.get(2)?;
            let entry_sum: i64 = row.get(3)?;
            Ok(DriftReport {
                client_id,
                name,
                balance,
                entry_sum,
                drift: balance - entry_sum,
            })
        })?;

        let mut drifted = Vec::new();
        for row in rows {
            let report = row?;
            if report.drift != 0 {
                drifted.push(report);
            }
        }
        drop(stmt);

        if fix && !drifted.is_empty() {
            conn.execute("BEGIN IMMEDIATE", [])?;
            for report in &drifted {
                let changes = conn.execute(
                    "UPDATE clients SET balance = ?1 WHERE id = ?2 AND balance = ?3",
                    params![report.entry_sum, report.client_id, report.balance],
                )?;
                if changes == 0 {
                    let _ = conn.execute("ROLLBACK", []);
                    return Err(LedgerError::Concurrency {
                        reason: format!(
                            "client {} mutated during reconcile",
                            report.client_id
                        ),
                    });
                }
            }
            conn.execute("COMMIT", [])?;
        }

        Ok(drifted)
    }

    // ===== Row converters =====

    fn get_client_on(conn: &Connection, client_id: i64) -> Result<Client, LedgerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, description, phone, pinned, balance, last_activity, created_at
             FROM clients WHERE id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![client_id])?;
        match rows.next()? {
            Some(row) => Ok(Self::row_to_client(row)?),
            None => Err(LedgerError::ClientNotFound { client_id }),
        }
    }

    fn get_entry_on(
        conn: &Connection,
        entry_id: i64,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, client_id, debt_value, original_value, is_valid, history, employee_id, created_at, repaid_at
             FROM ledger_entries WHERE id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![entry_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_entry(row)?)),
            None => Ok(None),
        }
    }

    #[inline]
    fn row_to_client(row: &rusqlite::Row) -> rusqlite::Result<Client> {
        Ok(Client {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            phone: row.get(3)?,
            pinned: row.get(4)?,
            balance: row.get(5)?,
            last_activity: from_ms(row.get(6)?),
            created_at: from_ms(row.get(7)?),
        })
    }

    #[inline]
    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<LedgerEntry> {
        Ok(LedgerEntry {
            id: row.get(0)?,
            client_id: row.get(1)?,
            value: row.get(2)?,
            original_value: row.get(3)?,
            is_valid: row.get(4)?,
            history: row.get(5)?,
            employee_id: row.get(6)?,
            created_at: from_ms(row.get(7)?),
            repaid_at: row.get::<_, Option<i64>>(8)?.map(from_ms),
        })
    }

    #[inline]
    fn row_to_employee(row: &rusqlite::Row) -> rusqlite::Result<Employee> {
        Ok(Employee {
            id: row.get(0)?,
            name: row.get(1)?,
            created_at: from_ms(row.get(2)?),
        })
    }
}

#[inline]
fn ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

#[inline]
fn from_ms(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _)
        if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
}

#[cfg(test)]
impl LedgerDb {
    /// Overwrite a client aggregate directly, bypassing the allocator.
    /// Test-only door for manufacturing drift.
    pub(crate) async fn force_balance(&self, client_id: i64, balance: i64) {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE clients SET balance = ?1 WHERE id = ?2",
            params![balance, client_id],
        )
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::allocator::plan_allocation;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (LedgerDb, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let db = LedgerDb::new(file.path().to_str().unwrap(), 5000).unwrap();
        (db, file)
    }

    async fn seed(db: &LedgerDb) -> (Client, Employee) {
        let client = db
            .create_client("Ivanov", "regular", "+7 900 000-00-00", Utc::now())
            .await
            .unwrap();
        let employee = db.create_employee("Petrov", Utc::now()).await.unwrap();
        (client, employee)
    }

    async fn apply(db: &LedgerDb, client: &Client, amount: i64, employee_id: i64) -> Client {
        let balance = db.get_client(client.id).await.unwrap().balance;
        let open = db.open_entries(client.id).await.unwrap();
        let plan = plan_allocation(client.id, balance, &open, amount, Utc::now(), "test");
        db.apply_plan(&plan, employee_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_fetch_client() {
        let (db, _file) = create_test_db();
        let (client, _) = seed(&db).await;

        assert_eq!(client.balance, 0);
        assert!(!client.pinned);

        let fetched = db.get_client(client.id).await.unwrap();
        assert_eq!(fetched.name, "Ivanov");

        let by_name = db.find_client_by_name("Ivanov").await.unwrap();
        assert_eq!(by_name.unwrap().id, client.id);

        let missing = db.get_client(9999).await;
        assert_eq!(
            missing.unwrap_err(),
            LedgerError::ClientNotFound { client_id: 9999 }
        );
    }

    #[tokio::test]
    async fn test_duplicate_and_empty_names_rejected() {
        let (db, _file) = create_test_db();
        seed(&db).await;

        let dup = db.create_client("Ivanov", "", "", Utc::now()).await;
        assert_eq!(
            dup.unwrap_err(),
            LedgerError::DuplicateName {
                name: "Ivanov".to_string()
            }
        );

        let empty = db.create_client("   ", "", "", Utc::now()).await;
        assert_eq!(empty.unwrap_err(), LedgerError::InvalidName);
    }

    #[tokio::test]
    async fn test_apply_plan_writes_entry_and_balance() {
        let (db, _file) = create_test_db();
        let (client, employee) = seed(&db).await;

        let updated = apply(&db, &client, 100, employee.id).await;
        assert_eq!(updated.balance, 100);

        let entries = db.list_entries(client.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, 100);
        assert_eq!(entries[0].original_value, 100);
        assert!(entries[0].is_valid);
        assert!(entries[0].repaid_at.is_none());
        assert_eq!(entries[0].employee_id, employee.id);
        assert!(entries[0].history.contains("opened with 100"));
    }

    #[tokio::test]
    async fn test_apply_plan_settlement_updates_in_place() {
        let (db, _file) = create_test_db();
        let (client, employee) = seed(&db).await;

        apply(&db, &client, 100, employee.id).await;
        let updated = apply(&db, &client, -100, employee.id).await;
        assert_eq!(updated.balance, 0);

        let entries = db.list_entries(client.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, 0);
        assert!(!entries[0].is_valid);
        assert!(entries[0].repaid_at.is_some());
        assert!(entries[0].history.contains("settled by payment 100"));

        assert!(db.open_entries(client.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_plan_balance_guard_rejects_stale_plan() {
        let (db, _file) = create_test_db();
        let (client, employee) = seed(&db).await;

        let open = db.open_entries(client.id).await.unwrap();
        // Planned against balance 0, but the stored balance moves first.
        let stale = plan_allocation(client.id, 0, &open, 100, Utc::now(), "stale");
        db.force_balance(client.id, 50).await;

        let err = db.apply_plan(&stale, employee.id).await.unwrap_err();
        assert!(err.is_retryable());

        // Nothing committed.
        assert!(db.list_entries(client.id).await.unwrap().is_empty());
        assert_eq!(db.get_client(client.id).await.unwrap().balance, 50);
    }

    #[tokio::test]
    async fn test_normalizing_plan_records_new_entry_closed() {
        let (db, _file) = create_test_db();
        let (client, employee) = seed(&db).await;

        // Drifted negative aggregate with no backing entries. The fallback
        // debt entry lands the balance exactly on zero, so it must be
        // written already closed or the aggregate would drift forever.
        db.force_balance(client.id, -30).await;
        let plan = plan_allocation(client.id, -30, &[], 30, Utc::now(), "fallback");
        let updated = db.apply_plan(&plan, employee.id).await.unwrap();
        assert_eq!(updated.balance, 0);

        let entries = db.list_entries(client.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].is_valid);
        assert_eq!(entries[0].value, 30);
        assert!(entries[0].repaid_at.is_some());
        assert!(entries[0].history.contains("zero-balance normalization"));
        assert!(db.open_entries(client.id).await.unwrap().is_empty());

        assert!(db.reconcile(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_entry_adjusts_balance() {
        let (db, _file) = create_test_db();
        let (client, employee) = seed(&db).await;

        apply(&db, &client, 100, employee.id).await;
        apply(&db, &client, 200, employee.id).await;

        let entries = db.list_entries(client.id).await.unwrap();
        let (updated, removed) = db.delete_entry(entries[0].id, Utc::now()).await.unwrap();
        assert_eq!(removed.value, 100);
        assert_eq!(updated.balance, 200);
        assert_eq!(db.list_entries(client.id).await.unwrap().len(), 1);

        let missing = db.delete_entry(entries[0].id, Utc::now()).await;
        assert_eq!(
            missing.unwrap_err(),
            LedgerError::EntryNotFound {
                entry_id: entries[0].id
            }
        );
    }

    #[tokio::test]
    async fn test_wipe_client_history() {
        let (db, _file) = create_test_db();
        let (client, employee) = seed(&db).await;

        apply(&db, &client, 100, employee.id).await;
        apply(&db, &client, -30, employee.id).await;

        let wiped = db.wipe_client_history(client.id, Utc::now()).await.unwrap();
        assert_eq!(wiped.balance, 0);
        assert!(db.list_entries(client.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_client_cascades_entries() {
        let (db, _file) = create_test_db();
        let (client, employee) = seed(&db).await;

        apply(&db, &client, 100, employee.id).await;
        let entries = db.list_entries(client.id).await.unwrap();

        db.delete_client(client.id).await.unwrap();
        assert!(db.get_entry(entries[0].id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_orders_pinned_then_recent() {
        let (db, _file) = create_test_db();
        let (client, employee) = seed(&db).await;

        let other = db
            .create_client("Ivanova", "", "", Utc::now())
            .await
            .unwrap();
        db.create_client("Sidorov", "", "", Utc::now()).await.unwrap();

        // Give both a balance so the settled filter keeps them, pin one.
        apply(&db, &client, 100, employee.id).await;
        apply(&db, &other, 50, employee.id).await;
        db.set_pinned(client.id, true, Utc::now()).await.unwrap();

        let found = db.search_clients("ivan", false, 50).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, client.id);

        let all = db.search_clients("", true, 50).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_reconcile_detects_and_fixes_drift() {
        let (db, _file) = create_test_db();
        let (client, employee) = seed(&db).await;

        apply(&db, &client, 300, employee.id).await;
        assert!(db.reconcile(false).await.unwrap().is_empty());

        // Drifted aggregate: pay 100 against a forced balance of 100 while
        // the only entry holds 300. Normalization closes the residual.
        db.force_balance(client.id, 100).await;
        let balance = db.get_client(client.id).await.unwrap().balance;
        let open = db.open_entries(client.id).await.unwrap();
        let plan = plan_allocation(client.id, balance, &open, -100, Utc::now(), "drift");
        db.apply_plan(&plan, employee.id).await.unwrap();

        let entries = db.list_entries(client.id).await.unwrap();
        assert!(!entries[0].is_valid);
        assert_eq!(entries[0].value, 200);

        // Deleting the residual-value closed entry pushes the aggregate to
        // -200 while the valid-entry sum stays 0.
        db.delete_entry(entries[0].id, Utc::now()).await.unwrap();
        let drifted = db.reconcile(false).await.unwrap();
        assert_eq!(drifted.len(), 1);
        assert_eq!(drifted[0].balance, -200);
        assert_eq!(drifted[0].entry_sum, 0);
        assert_eq!(drifted[0].drift, -200);

        let fixed = db.reconcile(true).await.unwrap();
        assert_eq!(fixed.len(), 1);
        assert_eq!(db.get_client(client.id).await.unwrap().balance, 0);
        assert!(db.reconcile(false).await.unwrap().is_empty());
    }
}
