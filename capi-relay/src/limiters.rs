//! Per client address sliding window rate limiting.
//!
//! Each address keeps the log of its accepted requests over the trailing window.
//! A request is accepted while fewer than `max_requests` are logged; rejected
//! requests are not logged, so a client hammering the endpoint recovers as soon
//! as its oldest accepted request leaves the window.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::gauge;
use rand::Rng;
use time::OffsetDateTime;
use tracing::{debug, warn};

pub const DEFAULT_MAX_REQUESTS: usize = 30;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: Arc<Mutex<HashMap<String, VecDeque<OffsetDateTime>>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Default::default(),
        }
    }

    /// Records a request from `address` at `now` and returns true, unless the
    /// address already used up its allowance for the trailing window.
    pub fn allow(&self, address: &str, now: OffsetDateTime) -> bool {
        let mut windows = self.lock();
        let requests = windows.entry(address.to_string()).or_default();

        while let Some(oldest) = requests.front() {
            if now - *oldest < self.window {
                break;
            }
            requests.pop_front();
        }

        if requests.len() >= self.max_requests {
            return false;
        }

        requests.push_back(now);
        true
    }

    /// Forgets the addresses that have no request left in the window. They would
    /// be treated exactly like unseen addresses, this only reclaims memory.
    pub fn evict_stale(&self, now: OffsetDateTime) -> usize {
        let mut windows = self.lock();
        let before = windows.len();

        windows.retain(|_, requests| match requests.back() {
            Some(newest) => now - *newest < self.window,
            None => false,
        });
        windows.shrink_to_fit();

        before - windows.len()
    }

    pub fn tracked_addresses(&self) -> usize {
        self.lock().len()
    }

    /// Reports the number of tracked addresses to prometheus every 10 seconds,
    /// needs to be spawned in a separate task.
    pub async fn report_metrics(&self) {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(10));
        loop {
            interval.tick().await;
            gauge!("relay_rate_limiter_key_count").set(self.tracked_addresses() as f64);
        }
    }

    /// Clean up the limiter state about once per minute, so that addresses that
    /// stopped sending do not accumulate forever.
    pub async fn clean_state(&self) {
        // Jitter the interval so that replicas started together don't sweep in sync
        let interval_secs = rand::thread_rng().gen_range(60..70);

        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;

            let evicted = self.evict_stale(OffsetDateTime::now_utc());
            debug!(evicted, "evicted idle addresses from the rate limiter");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<OffsetDateTime>>> {
        self.windows.lock().unwrap_or_else(|poisoned| {
            warn!("poisoned rate limiter mutex");
            poisoned.into_inner()
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}
