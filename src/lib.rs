//! Debtbook Backend Library
//!
//! Retail back-office client debt ledger: signed per-client entries driven
//! by the allocation policy in `ledger`, plus the store cash journal in
//! `cashflow`. Consumed as a library by embedding applications and by the
//! `ledger_inspect` administrative binary.

pub mod cashflow;
pub mod ledger;
pub mod models;

pub use cashflow::CashBook;
pub use ledger::{LedgerError, LedgerService};
pub use models::Config;
