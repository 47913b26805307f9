//! In-process session cache with TTL-based auto-expiry.
//!
//! Optional read-through layer in front of the store's session lookup. The
//! cache is an explicit handle constructed at startup and passed into the
//! gateway state — never a lazily-built global — and correctness never
//! depends on it: a miss simply falls through to SQLite, and logout
//! invalidates the entry before the row is deleted.
//!
//! Entries are keyed by the token hash so plaintext tokens are never held
//! beyond the request that carried them.

use crate::store::User;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct CacheSlot {
    user: User,
    expires_at: Instant,
}

/// TTL-bounded map from session token hash to the owning user.
pub struct SessionCache {
    slots: Mutex<HashMap<String, CacheSlot>>,
    ttl: Duration,
}

impl SessionCache {
    pub fn with_ttl(ttl_secs: u64) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Fetch a cached user for the given token hash, if still fresh.
    pub fn get(&self, token_hash: &str) -> Option<User> {
        let mut slots = self.slots.lock();
        match slots.get(token_hash) {
            Some(slot) if slot.expires_at > Instant::now() => Some(slot.user.clone()),
            Some(_) => {
                slots.remove(token_hash);
                None
            }
            None => None,
        }
    }

    /// Record a resolved session.
    pub fn put(&self, token_hash: &str, user: User) {
        let mut slots = self.slots.lock();
        slots.insert(
            token_hash.to_string(),
            CacheSlot {
                user,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop a cached session (logout).
    pub fn invalidate(&self, token_hash: &str) {
        self.slots.lock().remove(token_hash);
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| slot.expires_at > now);
        before - slots.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessTier;
    use std::collections::HashSet;

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            name: format!("user-{id}"),
            access: AccessTier::Shared,
            keys: HashSet::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn put_get_round_trip() {
        let cache = SessionCache::with_ttl(60);
        cache.put("hash1", user("u1"));
        assert_eq!(cache.get("hash1").unwrap().id, "u1");
        assert!(cache.get("hash2").is_none());
    }

    #[test]
    fn invalidate_removes_the_entry() {
        let cache = SessionCache::with_ttl(60);
        cache.put("hash1", user("u1"));
        cache.invalidate("hash1");
        assert!(cache.get("hash1").is_none());
    }

    #[test]
    fn expired_entries_are_not_served() {
        let cache = SessionCache::with_ttl(0);
        cache.put("hash1", user("u1"));
        assert!(cache.get("hash1").is_none());
        // The dead entry was also evicted on read.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let fresh = SessionCache::with_ttl(60);
        fresh.put("hash1", user("u1"));
        assert_eq!(fresh.sweep_expired(), 0);
        assert_eq!(fresh.len(), 1);

        let stale = SessionCache::with_ttl(0);
        stale.put("hash1", user("u1"));
        stale.put("hash2", user("u2"));
        assert_eq!(stale.sweep_expired(), 2);
        assert_eq!(stale.len(), 0);
    }
}
