//! In-memory deduplication of event ids.
//!
//! The browser pixel and the server both report the same conversion with a shared
//! `event_id`, and clients retry. Ids are remembered for a fixed TTL, in a cache
//! bounded in size, so a repeated id is only forwarded once per process lifetime
//! and TTL window. This is best effort: the state is lost on restart and is not
//! shared between replicas.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{debug, warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, OffsetDateTime>,
    // Insertion order. Entries are never refreshed, so this is also age order.
    order: VecDeque<(String, OffsetDateTime)>,
}

impl CacheState {
    fn sweep(&mut self, now: OffsetDateTime, ttl: Duration) -> usize {
        let mut removed = 0;
        while let Some((id, inserted_at)) = self.order.front() {
            if now - *inserted_at <= ttl {
                break;
            }
            self.entries.remove(id);
            self.order.pop_front();
            removed += 1;
        }
        removed
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (id, _) = self.order.pop_front()?;
        self.entries.remove(&id);
        Some(id)
    }
}

#[derive(Clone)]
pub struct DeduplicationCache {
    ttl: Duration,
    max_entries: usize,
    state: Arc<Mutex<CacheState>>,
}

impl DeduplicationCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            state: Default::default(),
        }
    }

    /// Returns true if `event_id` was already admitted within the TTL window.
    /// Otherwise the id is recorded as admitted at `now` and false is returned.
    ///
    /// Expired entries are swept on every call, and the whole check-then-insert
    /// runs under a single lock: two concurrent requests carrying the same id
    /// can not both be admitted.
    pub fn is_duplicate(&self, event_id: &str, now: OffsetDateTime) -> bool {
        let mut state = self.lock();

        let expired = state.sweep(now, self.ttl);
        if expired > 0 {
            debug!(expired, "swept expired event ids from the dedup cache");
            counter!("relay_dedup_expired_total").increment(expired as u64);
        }

        if state.entries.contains_key(event_id) {
            debug!(event_id, "blocked duplicate event");
            return true;
        }

        if state.entries.len() >= self.max_entries {
            if let Some(evicted) = state.evict_oldest() {
                debug!(evicted = %evicted, "dedup cache full, evicted oldest event id");
                counter!("relay_dedup_evicted_total").increment(1);
            }
        }

        state.entries.insert(event_id.to_string(), now);
        state.order.push_back((event_id.to_string(), now));
        gauge!("relay_dedup_cache_size").set(state.entries.len() as f64);

        false
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // A panic while holding the lock leaves a consistent map, keep serving it
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("poisoned dedup cache mutex");
            poisoned.into_inner()
        })
    }
}

impl Default for DeduplicationCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}
