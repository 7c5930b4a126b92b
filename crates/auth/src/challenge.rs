//! Short-lived ceremony state keyed by a random correlation id.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::{
    credential_store::generate_token,
    error::{AuthError, Resource, Result},
};

struct Pending<T> {
    state: T,
    created_at: Instant,
}

/// TTL-indexed map with single-use reads. Taking an entry removes it before
/// the expiry check, so a correlation id can never be used twice, and expired
/// entries are treated as absent whether or not a sweep has run.
pub struct ChallengeStore<T> {
    entries: DashMap<String, Pending<T>>,
    ttl: Duration,
}

impl<T> ChallengeStore<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, state: T) -> String {
        self.insert_at(state, Instant::now())
    }

    /// Store `state` and return its correlation id.
    pub fn insert_at(&self, state: T, now: Instant) -> String {
        self.sweep_at(now);
        let id = generate_token();
        self.entries.insert(id.clone(), Pending {
            state,
            created_at: now,
        });
        id
    }

    pub fn take(&self, id: &str) -> Result<T> {
        self.take_at(id, Instant::now())
    }

    pub fn take_at(&self, id: &str, now: Instant) -> Result<T> {
        let (_, pending) = self
            .entries
            .remove(id)
            .ok_or(AuthError::NotFound(Resource::Ceremony))?;
        if now.saturating_duration_since(pending.created_at) >= self.ttl {
            return Err(AuthError::NotFound(Resource::Ceremony));
        }
        Ok(pending.state)
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, p| now.saturating_duration_since(p.created_at) < ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc};

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn take_is_single_use() {
        let store = ChallengeStore::new(TTL);
        let id = store.insert("state");
        assert_eq!(store.take(&id).unwrap(), "state");
        assert!(matches!(
            store.take(&id),
            Err(AuthError::NotFound(Resource::Ceremony))
        ));
    }

    #[test]
    fn expired_entry_fails_without_sweep() {
        let store = ChallengeStore::new(TTL);
        let t0 = Instant::now();
        let id = store.insert_at(1u8, t0);
        assert!(matches!(
            store.take_at(&id, t0 + TTL + Duration::from_secs(1)),
            Err(AuthError::NotFound(Resource::Ceremony))
        ));
        // The failed read still consumed it.
        assert!(store.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let store = ChallengeStore::new(TTL);
        let t0 = Instant::now();
        store.insert_at(1u8, t0);
        let fresh = store.insert_at(2u8, t0 + Duration::from_secs(200));
        assert_eq!(store.sweep_at(t0 + Duration::from_secs(301)), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store
                .take_at(&fresh, t0 + Duration::from_secs(301))
                .unwrap(),
            2
        );
    }

    #[test]
    fn unknown_id_is_not_found() {
        let store: ChallengeStore<()> = ChallengeStore::new(TTL);
        assert!(matches!(
            store.take("nope"),
            Err(AuthError::NotFound(Resource::Ceremony))
        ));
    }

    #[test]
    fn concurrent_takes_yield_one_winner() {
        let store = Arc::new(ChallengeStore::new(TTL));
        let id = store.insert(7u32);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let id = id.clone();
                std::thread::spawn(move || store.take(&id).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
    }
}
