//! Concurrent map from client identifier to token bucket state.
//!
//! Entries live in a sharded [`DashMap`]. Every mutation, whether from a
//! request (`admit`) or from the reaper (`evict_idle`), goes through the same
//! shard lock, so calls for one client are linearizable while unrelated
//! clients proceed in parallel.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::LimiterConfig;
use crate::token_bucket::ClientState;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    /// Whole tokens left after this check.
    pub remaining: u32,
    /// Set on denial: time until one token is available.
    pub retry_after: Option<Duration>,
}

/// Read-only view of a tracked client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub client: String,
    pub available_tokens: f64,
    pub burst: u32,
    pub idle_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub clients: usize,
    pub allowed_total: u64,
    pub rejected_total: u64,
    pub evicted_total: u64,
}

pub struct ClientRegistry {
    clients: DashMap<String, ClientState>,
    config: LimiterConfig,
    allowed_total: AtomicU64,
    rejected_total: AtomicU64,
    evicted_total: AtomicU64,
}

impl ClientRegistry {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            clients: DashMap::new(),
            config,
            allowed_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            evicted_total: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Admit or reject one request from `client`.
    pub fn admit(&self, client: &str) -> bool {
        self.check_at(client, Instant::now()).allowed
    }

    pub fn admit_at(&self, client: &str, now: Instant) -> bool {
        self.check_at(client, now).allowed
    }

    /// Like [`admit`](Self::admit), but reports remaining tokens and retry time.
    pub fn check(&self, client: &str) -> Admission {
        self.check_at(client, Instant::now())
    }

    pub fn check_at(&self, client: &str, now: Instant) -> Admission {
        let LimiterConfig {
            refill_rate, burst, ..
        } = self.config;

        let decide = |state: &mut ClientState| {
            let allowed = state.admit(now, refill_rate, burst);
            Admission {
                allowed,
                remaining: state.remaining(),
                retry_after: if allowed {
                    None
                } else {
                    state.retry_after(refill_rate)
                },
            }
        };

        // Known clients skip the key allocation.
        let admission = match self.clients.get_mut(client) {
            Some(mut state) => decide(state.value_mut()),
            None => {
                let mut state = self
                    .clients
                    .entry(client.to_string())
                    .or_insert_with(|| ClientState::new(now, burst));
                decide(state.value_mut())
            }
        };

        if admission.allowed {
            self.allowed_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(client = %client, "admission denied");
        }

        admission
    }

    /// Peek at a client's bucket without consuming a token.
    pub fn status(&self, client: &str) -> Option<ClientStatus> {
        let now = Instant::now();
        self.clients.get(client).map(|state| ClientStatus {
            client: client.to_string(),
            available_tokens: state.available(now, self.config.refill_rate, self.config.burst),
            burst: self.config.burst,
            idle_secs: now.saturating_duration_since(state.last_seen()).as_secs_f64(),
        })
    }

    /// Forget a client; its next request starts with a full bucket.
    pub fn reset(&self, client: &str) -> bool {
        self.clients.remove(client).is_some()
    }

    /// Remove every client idle for longer than `idle_timeout` as of `now`.
    ///
    /// Staleness is judged while holding the entry's shard lock, so a client
    /// refreshed by a concurrent `admit` is kept.
    pub fn evict_idle(&self, now: Instant, idle_timeout: Duration) -> usize {
        let before = self.clients.len();
        self.clients
            .retain(|_, state| !state.is_idle(now, idle_timeout));
        let evicted = before.saturating_sub(self.clients.len());

        self.evicted_total
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    pub fn contains(&self, client: &str) -> bool {
        self.clients.contains_key(client)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            clients: self.clients.len(),
            allowed_total: self.allowed_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry(rate: f64, burst: u32) -> ClientRegistry {
        ClientRegistry::new(LimiterConfig::new(rate, burst))
    }

    #[test]
    fn test_first_burst_admitted_then_denied() {
        let registry = registry(10.0, 20);
        let now = Instant::now();

        for i in 0..20 {
            assert!(registry.admit_at("A", now), "request {} should pass", i);
        }
        assert!(!registry.admit_at("A", now));

        // 100ms at 10/s refills exactly one token.
        let later = now + Duration::from_millis(100);
        assert!(registry.admit_at("A", later));
        assert!(!registry.admit_at("A", later));
    }

    #[test]
    fn test_clients_are_independent() {
        let registry = registry(1.0, 2);
        let now = Instant::now();

        assert!(registry.admit_at("a", now));
        assert!(registry.admit_at("a", now));
        assert!(!registry.admit_at("a", now));
        assert!(registry.admit_at("b", now));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_long_run_rate_converges() {
        let rate = 5.0;
        let burst = 10;
        let registry = registry(rate, burst);
        let start = Instant::now();

        // Offer 4x the allowed rate for 60 simulated seconds.
        let step = Duration::from_millis(50);
        let steps = 1200;
        let mut accepted = 0u32;
        for i in 0..=steps {
            if registry.admit_at("steady", start + step * i) {
                accepted += 1;
            }
        }

        let expected = burst as f64 + rate * 60.0;
        assert!(
            (accepted as f64 - expected).abs() <= 2.0,
            "accepted {} expected about {}",
            accepted,
            expected
        );
    }

    #[test]
    fn test_check_reports_remaining_and_retry() {
        let registry = registry(2.0, 2);
        let now = Instant::now();

        let first = registry.check_at("c", now);
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.retry_after, None);

        registry.check_at("c", now);
        let denied = registry.check_at("c", now);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_millis(500)));

        let stats = registry.stats();
        assert_eq!(stats.allowed_total, 2);
        assert_eq!(stats.rejected_total, 1);
    }

    #[test]
    fn test_evict_idle_keeps_fresh_clients() {
        let registry = registry(1.0, 5);
        let start = Instant::now();
        let idle = Duration::from_secs(180);

        registry.admit_at("stale", start);
        registry.admit_at("fresh", start + Duration::from_secs(100));

        let evicted = registry.evict_idle(start + Duration::from_secs(200), idle);
        assert_eq!(evicted, 1);
        assert!(!registry.contains("stale"));
        assert!(registry.contains("fresh"));
        assert_eq!(registry.stats().evicted_total, 1);
    }

    #[test]
    fn test_reset_and_status() {
        let registry = registry(1.0, 3);
        assert!(registry.status("x").is_none());

        registry.admit("x");
        let status = registry.status("x").unwrap();
        assert_eq!(status.burst, 3);
        assert!(status.available_tokens >= 2.0 && status.available_tokens < 3.0);

        assert!(registry.reset("x"));
        assert!(!registry.reset("x"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_admissions_never_double_spend() {
        // A negligible refill rate keeps the total admitted equal to the burst.
        let registry = Arc::new(registry(1e-9, 100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || (0..50).filter(|_| registry.admit("shared")).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }
}
