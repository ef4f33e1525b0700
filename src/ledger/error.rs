//! Ledger error taxonomy.
//!
//! Validation failures reject the call before any state is touched;
//! `Concurrency` is the only retryable kind and maps from SQLite busy/locked
//! conditions as well as the optimistic balance guard inside plan execution.

/// Errors surfaced by the ledger service and store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Zero or unrepresentable adjustment amounts, rejected up front.
    InvalidAmount,
    /// The responsible employee id does not exist.
    MissingResponsibleParty { employee_id: i64 },
    /// Credit consumption found no open credit entry for a client whose
    /// balance says one should exist. Reported through the audit log while
    /// the call falls back to opening a plain debt entry.
    InconsistentCreditState { client_id: i64 },
    /// Lost a race on the client row or the database write lock. Safe to
    /// retry the whole call.
    Concurrency { reason: String },
    EntryNotFound { entry_id: i64 },
    ClientNotFound { client_id: i64 },
    DuplicateName { name: String },
    /// Registry names must be non-empty after trimming.
    InvalidName,
    /// Underlying storage failure, not retryable.
    Storage(String),
}

impl LedgerError {
    /// True for transient conflicts where retrying the call is expected to
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Concurrency { .. })
    }
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::InvalidAmount => {
                write!(f, "Adjustment amount is zero or out of range")
            }
            LedgerError::MissingResponsibleParty { employee_id } => {
                write!(f, "Responsible employee {} does not exist", employee_id)
            }
            LedgerError::InconsistentCreditState { client_id } => {
                write!(
                    f,
                    "Client {} has a negative balance but no open credit entry",
                    client_id
                )
            }
            LedgerError::Concurrency { reason } => {
                write!(f, "Concurrent ledger mutation: {}", reason)
            }
            LedgerError::EntryNotFound { entry_id } => {
                write!(f, "Ledger entry {} does not exist", entry_id)
            }
            LedgerError::ClientNotFound { client_id } => {
                write!(f, "Client {} does not exist", client_id)
            }
            LedgerError::DuplicateName { name } => {
                write!(f, "Name '{}' is already taken", name)
            }
            LedgerError::InvalidName => write!(f, "Name must not be empty"),
            LedgerError::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            match e.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    return LedgerError::Concurrency {
                        reason: err.to_string(),
                    };
                }
                _ => {}
            }
        }
        LedgerError::Storage(err.to_string())
    }
}
