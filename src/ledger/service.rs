//! Function-call boundary of the debt ledger.
//!
//! `LedgerService` composes the store, the listing cache and a registry of
//! per-client allocation locks. One adjustment call runs as: validate,
//! take the client lock, read balance and open entries, plan, execute the
//! plan transactionally, invalidate the cache, emit the audit event.
//! Adjustments for the same client serialize on the lock; different
//! clients proceed in parallel.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ledger::allocator::plan_allocation;
use crate::ledger::error::LedgerError;
use crate::ledger::query::EntryCache;
use crate::ledger::store::{DriftReport, LedgerDb};
use crate::models::{Client, Config, Employee, EntryOrder, LedgerEntry};

/// Registry of per-client allocation locks.
///
/// Lock objects are created on first use and shared by every caller
/// touching that client; the owned guard spans the whole
/// read-plan-execute window of an adjustment. A client's slot is dropped
/// when the client is deleted; guards still held keep their lock alive
/// through the `Arc`.
struct ClientLocks {
    inner: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl ClientLocks {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn for_client(&self, client_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock();
        map.entry(client_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn remove(&self, client_id: i64) {
        self.inner.lock().remove(&client_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[derive(Clone)]
pub struct LedgerService {
    db: LedgerDb,
    cache: Arc<EntryCache>,
    locks: Arc<ClientLocks>,
}

impl LedgerService {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let db = LedgerDb::new(&config.database_path, config.busy_timeout_ms)?;
        Ok(Self::with_store(
            db,
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_enabled,
        ))
    }

    pub fn with_store(db: LedgerDb, cache_ttl: Duration, cache_enabled: bool) -> Self {
        Self {
            db,
            cache: Arc::new(EntryCache::new(cache_ttl, cache_enabled)),
            locks: Arc::new(ClientLocks::new()),
        }
    }

    // ===== Allocation =====

    /// Apply a signed adjustment to a client's ledger through the
    /// allocation policy and return the refreshed client.
    ///
    /// Positive amounts record new debt (or consume credit), negative
    /// amounts are payments distributed oldest-first. The resulting
    /// balance is always `balance + amount`. Amounts of zero, `i64::MIN`
    /// or anything that would overflow the aggregate are rejected as
    /// [`LedgerError::InvalidAmount`].
    pub async fn apply_adjustment(
        &self,
        client_id: i64,
        amount: i64,
        employee_id: i64,
    ) -> Result<Client, LedgerError> {
        // Zero is meaningless and i64::MIN has no negation to distribute.
        if amount == 0 || amount.checked_neg().is_none() {
            return Err(LedgerError::InvalidAmount);
        }
        if self.db.get_employee(employee_id).await?.is_none() {
            return Err(LedgerError::MissingResponsibleParty { employee_id });
        }

        let lock = self.locks.for_client(client_id);
        let _guard = lock.lock_owned().await;

        let client = self.db.get_client(client_id).await?;
        if client.balance.checked_add(amount).is_none() {
            return Err(LedgerError::InvalidAmount);
        }
        let open = self.db.open_entries(client_id).await?;

        let mut tag = Uuid::new_v4().simple().to_string();
        tag.truncate(8);
        let plan = plan_allocation(client_id, client.balance, &open, amount, Utc::now(), &tag);

        if plan.credit_fallback {
            let err = LedgerError::InconsistentCreditState { client_id };
            warn!(
                client_id,
                balance = client.balance,
                error = %err,
                "allocation fallback: opening plain debt entry"
            );
        }

        let updated = self.db.apply_plan(&plan, employee_id).await?;
        self.cache.invalidate(client_id);

        info!(
            client_id,
            amount,
            balance = updated.balance,
            case = plan.case.as_str(),
            tag = %tag,
            "ledger adjustment applied"
        );

        Ok(updated)
    }

    // ===== Queries =====

    /// List a client's entries, optionally only the valid ones.
    pub async fn list_entries(
        &self,
        client_id: i64,
        valid_only: bool,
        order: EntryOrder,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut entries = match self.cache.get(client_id) {
            Some(entries) => entries,
            None => {
                // Unknown clients stay an error instead of an empty list.
                self.db.get_client(client_id).await?;
                let entries = self.db.list_entries(client_id).await?;
                self.cache.put(client_id, entries.clone());
                entries
            }
        };

        if valid_only {
            entries.retain(|e| e.is_valid);
        }
        if order == EntryOrder::ReverseChronological {
            entries.reverse();
        }
        Ok(entries)
    }

    // ===== Administrative mutations =====

    /// Hard-delete one entry regardless of state, adjusting the aggregate
    /// by the entry's current value. Bypasses the allocation policy.
    pub async fn delete_entry(&self, entry_id: i64) -> Result<Client, LedgerError> {
        // Resolve the owner first so the delete serializes with that
        // client's allocations.
        let entry = self
            .db
            .get_entry(entry_id)
            .await?
            .ok_or(LedgerError::EntryNotFound { entry_id })?;
        let lock = self.locks.for_client(entry.client_id);
        let _guard = lock.lock_owned().await;

        let (client, removed) = self.db.delete_entry(entry_id, Utc::now()).await?;
        self.cache.invalidate(client.id);

        info!(
            client_id = client.id,
            entry_id,
            removed_value = removed.value,
            balance = client.balance,
            "ledger entry deleted"
        );
        Ok(client)
    }

    /// Hard-delete a client's whole entry history and zero the aggregate.
    pub async fn wipe_client_history(&self, client_id: i64) -> Result<Client, LedgerError> {
        let lock = self.locks.for_client(client_id);
        let _guard = lock.lock_owned().await;

        let client = self.db.wipe_client_history(client_id, Utc::now()).await?;
        self.cache.invalidate(client_id);

        info!(client_id, "client ledger history wiped");
        Ok(client)
    }

    /// Check every client's cached aggregate against its valid-entry sum,
    /// optionally rewriting drifted aggregates.
    pub async fn reconcile(&self, fix: bool) -> Result<Vec<DriftReport>, LedgerError> {
        let reports = self.db.reconcile(fix).await?;
        if fix {
            for report in &reports {
                self.cache.invalidate(report.client_id);
                info!(
                    client_id = report.client_id,
                    drift = report.drift,
                    balance = report.entry_sum,
                    "aggregate drift repaired"
                );
            }
        } else {
            for report in &reports {
                warn!(
                    client_id = report.client_id,
                    balance = report.balance,
                    entry_sum = report.entry_sum,
                    drift = report.drift,
                    "aggregate drift detected"
                );
            }
        }
        Ok(reports)
    }

    // ===== Client registry =====

    pub async fn create_client(
        &self,
        name: &str,
        description: &str,
        phone: &str,
    ) -> Result<Client, LedgerError> {
        let client = self.db.create_client(name, description, phone, Utc::now()).await?;
        info!(client_id = client.id, name = %client.name, "client created");
        Ok(client)
    }

    pub async fn get_client(&self, client_id: i64) -> Result<Client, LedgerError> {
        self.db.get_client(client_id).await
    }

    pub async fn find_client_by_name(&self, name: &str) -> Result<Option<Client>, LedgerError> {
        self.db.find_client_by_name(name).await
    }

    pub async fn search_clients(
        &self,
        query: &str,
        include_settled: bool,
        limit: usize,
    ) -> Result<Vec<Client>, LedgerError> {
        self.db.search_clients(query, include_settled, limit).await
    }

    pub async fn set_pinned(&self, client_id: i64, pinned: bool) -> Result<Client, LedgerError> {
        self.db.set_pinned(client_id, pinned, Utc::now()).await
    }

    pub async fn update_client(
        &self,
        client_id: i64,
        description: &str,
        phone: &str,
    ) -> Result<Client, LedgerError> {
        self.db
            .update_client(client_id, description, phone, Utc::now())
            .await
    }

    /// Remove a client and every entry on its ledger.
    pub async fn delete_client(&self, client_id: i64) -> Result<(), LedgerError> {
        let lock = self.locks.for_client(client_id);
        let _guard = lock.lock_owned().await;

        self.db.delete_client(client_id).await?;
        self.cache.invalidate(client_id);
        self.locks.remove(client_id);

        info!(client_id, "client deleted");
        Ok(())
    }

    // ===== Employees =====

    pub async fn create_employee(&self, name: &str) -> Result<Employee, LedgerError> {
        self.db.create_employee(name, Utc::now()).await
    }

    pub async fn list_employees(&self) -> Result<Vec<Employee>, LedgerError> {
        self.db.list_employees().await
    }
}
