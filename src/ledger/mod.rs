//! Client Debt Ledger
//!
//! This module handles:
//! 1. Signed ledger entries per client (debt > 0, credit < 0)
//! 2. The allocation policy mapping adjustments onto entries
//! 3. Transactional plan execution over SQLite
//! 4. Cached entry listings with synchronous invalidation
//!
//! Architecture:
//! - `service` validates, serializes per client and emits audit events
//! - `allocator` plans the mutation set without touching storage
//! - `store` executes plans atomically and owns the schema
//! - `query` keeps per-client listings until the next mutation

pub mod allocator;
pub mod error;
pub mod query;
pub mod service;
pub mod store;

pub use allocator::{
    plan_allocation, AllocationCase, AllocationPlan, EntryMutation, MutationKind, NewEntry,
};
pub use error::LedgerError;
pub use query::{EntryCache, DEFAULT_CACHE_TTL_SECS};
pub use service::LedgerService;
pub use store::{DriftReport, LedgerDb};
