//! Store cash journal.
//!
//! Append-only record of money moving through the till, independent of any
//! client ledger. Income is positive, expenses are negative; the journal is
//! queried by calendar day (UTC) for the daily close.

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::ledger::error::LedgerError;
use crate::models::{CashFlow, FlowFilter};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cash_flows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    amount INTEGER NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cash_flows_created
    ON cash_flows(created_at DESC);
"#;

/// Signed totals for one journal day. `expense` keeps its negative sign;
/// `net` is `income + expense`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DayTotals {
    pub income: i64,
    pub expense: i64,
    pub net: i64,
}

#[derive(Clone)]
pub struct CashBook {
    conn: Arc<Mutex<Connection>>,
}

impl CashBook {
    /// Open the journal, creating its table if needed. Shares the database
    /// file with the ledger store through its own connection.
    pub fn new(db_path: &str, busy_timeout_ms: u64) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path).context("open cash journal db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))
            .context("set busy timeout")?;

        conn.execute_batch(SCHEMA_SQL)
            .context("init cash journal schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append one journal line. Zero amounts are rejected.
    pub async fn record(&self, amount: i64, description: &str) -> Result<CashFlow, LedgerError> {
        self.insert(amount, description, Utc::now()).await
    }

    async fn insert(
        &self,
        amount: i64,
        description: &str,
        at: DateTime<Utc>,
    ) -> Result<CashFlow, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO cash_flows (amount, description, created_at) VALUES (?1, ?2, ?3)",
            params![amount, description, at.timestamp_millis()],
        )?;

        Ok(CashFlow {
            id: conn.last_insert_rowid(),
            amount,
            description: description.to_string(),
            created_at: at,
        })
    }

    /// Journal lines for one UTC calendar day, newest first.
    pub async fn entries_for_day(
        &self,
        day: NaiveDate,
        filter: FlowFilter,
    ) -> Result<Vec<CashFlow>, LedgerError> {
        let (start, end) = day_bounds_ms(day);
        let conn = self.conn.lock().await;

        let sql = match filter {
            FlowFilter::All => {
                "SELECT id, amount, description, created_at FROM cash_flows
                 WHERE created_at >= ?1 AND created_at < ?2
                 ORDER BY created_at DESC, id DESC"
            }
            FlowFilter::Income => {
                "SELECT id, amount, description, created_at FROM cash_flows
                 WHERE created_at >= ?1 AND created_at < ?2 AND amount > 0
                 ORDER BY created_at DESC, id DESC"
            }
            FlowFilter::Expense => {
                "SELECT id, amount, description, created_at FROM cash_flows
                 WHERE created_at >= ?1 AND created_at < ?2 AND amount < 0
                 ORDER BY created_at DESC, id DESC"
            }
        };
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok(CashFlow {
                id: row.get(0)?,
                amount: row.get(1)?,
                description: row.get(2)?,
                created_at: DateTime::from_timestamp_millis(row.get(3)?).unwrap_or_default(),
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Income, expense and net for one UTC calendar day.
    pub async fn day_totals(&self, day: NaiveDate) -> Result<DayTotals, LedgerError> {
        let (start, end) = day_bounds_ms(day);
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT COALESCE(SUM(CASE WHEN amount > 0 THEN amount ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN amount < 0 THEN amount ELSE 0 END), 0)
             FROM cash_flows WHERE created_at >= ?1 AND created_at < ?2",
        )?;
        let (income, expense) = stmt.query_row(params![start, end], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;

        Ok(DayTotals {
            income,
            expense,
            net: income + expense,
        })
    }
}

fn day_bounds_ms(day: NaiveDate) -> (i64, i64) {
    let start = day.and_time(NaiveTime::MIN).and_utc();
    let end = start + chrono::Duration::days(1);
    (start.timestamp_millis(), end.timestamp_millis())
}
