//! Read-through cache for entry listings.
//!
//! Listing a client's ledger is the hottest read in the back office while
//! mutations are comparatively rare, so full per-client listings are kept
//! in memory until either the TTL runs out or a mutation invalidates them.
//! The cache is purely an optimization: every mutation path drops the
//! client's slot before returning and misses fall through to the store, so
//! running with the cache disabled produces identical results.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::LedgerEntry;

/// Default listing cache lifetime. Matches the back office's five minute
/// staleness tolerance for review screens.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

struct CachedEntries {
    loaded_at: Instant,
    entries: Vec<LedgerEntry>,
}

/// Per-client cache of full chronological entry listings.
pub struct EntryCache {
    ttl: Duration,
    enabled: bool,
    slots: RwLock<HashMap<i64, CachedEntries>>,
}

impl EntryCache {
    pub fn new(ttl: Duration, enabled: bool) -> Self {
        Self {
            ttl,
            enabled,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// The cached listing for a client, if present and fresh.
    pub fn get(&self, client_id: i64) -> Option<Vec<LedgerEntry>> {
        if !self.enabled {
            return None;
        }
        let slots = self.slots.read();
        let cached = slots.get(&client_id)?;
        if cached.loaded_at.elapsed() >= self.ttl {
            return None;
        }
        Some(cached.entries.clone())
    }

    pub fn put(&self, client_id: i64, entries: Vec<LedgerEntry>) {
        if !self.enabled {
            return;
        }
        self.slots.write().insert(
            client_id,
            CachedEntries {
                loaded_at: Instant::now(),
                entries,
            },
        );
    }

    /// Drop a client's slot. Called synchronously by every committed
    /// mutation for that client.
    pub fn invalidate(&self, client_id: i64) {
        self.slots.write().remove(&client_id);
    }

    pub fn clear(&self) {
        self.slots.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: i64) -> LedgerEntry {
        LedgerEntry {
            id,
            client_id: 7,
            value: 100,
            original_value: 100,
            is_valid: true,
            history: String::new(),
            employee_id: 1,
            created_at: Utc::now(),
            repaid_at: None,
        }
    }

    #[test]
    fn test_hit_and_invalidate() {
        let cache = EntryCache::new(Duration::from_secs(60), true);
        assert!(cache.get(7).is_none());

        cache.put(7, vec![entry(1), entry(2)]);
        let hit = cache.get(7).unwrap();
        assert_eq!(hit.len(), 2);

        cache.invalidate(7);
        assert!(cache.get(7).is_none());
    }

    #[test]
    fn test_zero_ttl_is_always_stale() {
        let cache = EntryCache::new(Duration::from_secs(0), true);
        cache.put(7, vec![entry(1)]);
        assert!(cache.get(7).is_none());
    }

    #[test]
    fn test_disabled_cache_never_stores() {
        let cache = EntryCache::new(Duration::from_secs(60), false);
        cache.put(7, vec![entry(1)]);
        assert!(cache.get(7).is_none());
    }

    #[test]
    fn test_clear_drops_every_slot() {
        let cache = EntryCache::new(Duration::from_secs(60), true);
        cache.put(1, vec![entry(1)]);
        cache.put(2, vec![entry(2)]);
        cache.clear();
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_none());
    }
}
