use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::query::DEFAULT_CACHE_TTL_SECS;

/// A client of the store, carrying the cached signed ledger balance.
///
/// `balance > 0` means the client owes the store; `balance < 0` means the
/// store owes the client (prepayment credit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub phone: String,
    /// Favourite flag: pinned clients sort first in search results.
    pub pinned: bool,
    /// Cached aggregate: sum of `value` over this client's valid entries.
    pub balance: i64,
    /// Touched on every mutation involving the client.
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Client {
    /// True when the ledger is fully settled in either direction.
    pub fn is_settled(&self) -> bool {
        self.balance == 0
    }

    pub fn has_credit(&self) -> bool {
        self.balance < 0
    }
}

/// One debt or credit position on a client's ledger.
///
/// `value > 0` is money the client owes; `value < 0` is store credit held
/// for the client. The amount is mutated in place as payments are allocated;
/// `original_value` keeps the opening amount and `history` accumulates one
/// line per mutation, so the full lifecycle stays reconstructible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub client_id: i64,
    /// Current signed amount. Only moves toward zero, except the credit
    /// folding path which closes the entry outright.
    pub value: i64,
    /// Signed amount at creation. Never changes.
    pub original_value: i64,
    /// False once settled, consumed, or closed by zero-balance
    /// normalization. Invalid entries are historical and never reopen.
    pub is_valid: bool,
    /// Newline-delimited append-only audit log.
    pub history: String,
    /// Most recent responsible employee, updated on every mutation.
    pub employee_id: i64,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, when the entry transitions to invalid.
    pub repaid_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    /// Lifecycle state derived from the stored fields.
    pub fn state(&self) -> EntryState {
        if self.is_valid {
            if self.value < 0 {
                if self.value > self.original_value {
                    EntryState::CreditPartiallyConsumed
                } else {
                    EntryState::CreditOpen
                }
            } else if self.value < self.original_value {
                EntryState::PartiallySettled
            } else {
                EntryState::Open
            }
        } else if self.original_value < 0 {
            EntryState::CreditConsumed
        } else {
            EntryState::Settled
        }
    }
}

/// Lifecycle states of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Open,
    PartiallySettled,
    Settled,
    CreditOpen,
    CreditPartiallyConsumed,
    CreditConsumed,
}

impl EntryState {
    pub fn as_str(&self) -> &str {
        match self {
            EntryState::Open => "open",
            EntryState::PartiallySettled => "partially_settled",
            EntryState::Settled => "settled",
            EntryState::CreditOpen => "credit_open",
            EntryState::CreditPartiallyConsumed => "credit_partially_consumed",
            EntryState::CreditConsumed => "credit_consumed",
        }
    }
}

/// Listing order for entry queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrder {
    /// Oldest first (allocation order).
    Chronological,
    /// Newest first (review order).
    ReverseChronological,
}

impl EntryOrder {
    pub fn as_str(&self) -> &str {
        match self {
            EntryOrder::Chronological => "chronological",
            EntryOrder::ReverseChronological => "reverse_chronological",
        }
    }
}

/// An employee who can act as the responsible party for ledger mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Employee {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One line of the store cash journal. Signed: income > 0, expense < 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashFlow {
    pub id: i64,
    pub amount: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Direction filter for cash journal queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowFilter {
    All,
    Income,
    Expense,
}

impl FlowFilter {
    pub fn as_str(&self) -> &str {
        match self {
            FlowFilter::All => "all",
            FlowFilter::Income => "income",
            FlowFilter::Expense => "expense",
        }
    }

    pub fn from_str(s: &str) -> Option<FlowFilter> {
        match s {
            "all" => Some(FlowFilter::All),
            "income" => Some(FlowFilter::Income),
            "expense" => Some(FlowFilter::Expense),
            _ => None,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub cache_ttl_secs: u64,
    pub cache_enabled: bool,
    pub busy_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path = std::env::var("DEBTBOOK_DB_PATH")
            .unwrap_or_else(|_| "./debtbook.db".to_string());

        let cache_ttl_secs = std::env::var("DEBTBOOK_CACHE_TTL_SECS")
            .unwrap_or_else(|_| DEFAULT_CACHE_TTL_SECS.to_string())
            .parse()
            .unwrap_or(DEFAULT_CACHE_TTL_SECS);

        let cache_enabled = std::env::var("DEBTBOOK_CACHE_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        let busy_timeout_ms = std::env::var("DEBTBOOK_BUSY_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .unwrap_or(5000);

        Ok(Self {
            database_path,
            cache_ttl_secs,
            cache_enabled,
            busy_timeout_ms,
        })
    }
}
