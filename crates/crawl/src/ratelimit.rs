//! Process-global rate limiter.
//!
//! A strict minimum-interval gate keyed by domain or API name. Every outbound
//! HTTP request acquires the gate for its key before issuing. Ordering among
//! blocked callers is not guaranteed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct RateLimiter {
    // The per-key mutex is held across the sleep so concurrent callers for
    // the same key serialize; map insertion is guarded by the DashMap shard
    // locks.
    keys: DashMap<String, Arc<Mutex<Option<Instant>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep until `min_interval` has elapsed since the previous release for
    /// `key`, then claim the slot. Returns the time actually slept.
    pub async fn wait(&self, key: &str, min_interval: Duration) -> Duration {
        let slot = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let mut last = slot.lock().await;
        let waited = match *last {
            Some(prev) => {
                let elapsed = prev.elapsed();
                if elapsed < min_interval {
                    let remaining = min_interval - elapsed;
                    tokio::time::sleep(remaining).await;
                    remaining
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        };
        *last = Some(Instant::now());
        waited
    }

    /// Drop recorded state for a key (or all keys), e.g. between test cases.
    pub fn reset(&self, key: Option<&str>) {
        match key {
            Some(k) => {
                self.keys.remove(k);
            }
            None => self.keys.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_call_does_not_sleep() {
        let limiter = RateLimiter::new();
        let waited = limiter.wait("propublica", Duration::from_millis(200)).await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn second_call_waits_out_the_interval() {
        let limiter = RateLimiter::new();
        limiter.wait("website", Duration::from_millis(50)).await;
        let start = Instant::now();
        limiter.wait("website", Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new();
        limiter.wait("a", Duration::from_millis(500)).await;
        let waited = limiter.wait("b", Duration::from_millis(500)).await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn concurrent_callers_serialize() {
        let limiter = Arc::new(RateLimiter::new());
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.wait("shared", Duration::from_millis(40)).await;
                Instant::now()
            }));
        }
        let mut times: Vec<Instant> = Vec::new();
        for h in handles {
            times.push(h.await.unwrap());
        }
        times.sort();
        // Three releases spaced at least ~40ms apart after the first.
        assert!(times[2].duration_since(start) >= Duration::from_millis(70));
    }
}
