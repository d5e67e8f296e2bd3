//! Background eviction of idle clients.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::ClientRegistry;

/// Owned handle to the sweep task. Dropping it cancels the task.
pub struct Reaper {
    registry: Arc<ClientRegistry>,
    idle_timeout: Duration,
    shutdown_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Spawn the sweep loop on the current tokio runtime.
    pub fn start(
        registry: Arc<ClientRegistry>,
        sweep_interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        let shutdown_token = CancellationToken::new();
        let handle = tokio::spawn(run(
            registry.clone(),
            sweep_interval,
            idle_timeout,
            shutdown_token.clone(),
        ));

        debug!(
            sweep_interval_secs = sweep_interval.as_secs_f64(),
            idle_timeout_secs = idle_timeout.as_secs_f64(),
            "Reaper started"
        );

        Self {
            registry,
            idle_timeout,
            shutdown_token,
            handle: Some(handle),
        }
    }

    /// Run one sweep immediately on the caller's thread.
    pub fn sweep_now(&self) -> usize {
        self.registry
            .evict_idle(Instant::now().into_std(), self.idle_timeout)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the sweep loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.shutdown_token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "Reaper task ended abnormally");
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

async fn run(
    registry: Arc<ClientRegistry>,
    sweep_interval: Duration,
    idle_timeout: Duration,
    shutdown_token: CancellationToken,
) {
    let mut interval = tokio::time::interval(sweep_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; nothing can be idle yet.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => {
                debug!("Reaper shutting down");
                break;
            }
            _ = interval.tick() => {
                // tokio's clock, so a paused runtime drives eviction deterministically.
                let evicted = registry.evict_idle(Instant::now().into_std(), idle_timeout);
                if evicted > 0 {
                    debug!(evicted, remaining = registry.len(), "Evicted idle clients");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;

    fn registry() -> Arc<ClientRegistry> {
        Arc::new(ClientRegistry::new(LimiterConfig::new(10.0, 20)))
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let reaper = Reaper::start(registry(), Duration::from_secs(60), Duration::from_secs(180));
        assert!(reaper.is_running());

        tokio::time::timeout(Duration::from_secs(1), reaper.shutdown())
            .await
            .expect("reaper should stop promptly");
    }

    /// Let the spawned sweep loop observe the advanced clock.
    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_now_evicts_idle_clients() {
        let registry = registry();
        let reaper = Reaper::start(registry.clone(), Duration::from_secs(60), Duration::from_secs(20));

        registry.admit_at("idle", Instant::now().into_std());
        tokio::time::advance(Duration::from_secs(40)).await;
        registry.admit_at("active", Instant::now().into_std());

        assert_eq!(reaper.sweep_now(), 1);
        assert!(!registry.contains("idle"));
        assert!(registry.contains("active"));

        reaper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_evicts_idle_clients() {
        let registry = registry();
        registry.admit_at("idle", Instant::now().into_std());

        let reaper = Reaper::start(
            registry.clone(),
            Duration::from_secs(60),
            Duration::from_secs(180),
        );
        settle().await;

        // First sweep at 60s: nothing has been idle for 180s yet.
        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert!(registry.contains("idle"));
        assert_eq!(registry.stats().evicted_total, 0);

        registry.admit_at("fresh", Instant::now().into_std());

        // Sweep at 120s: "idle" has been quiet for 121s.
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(registry.contains("idle"));

        // Sweep at 180s: "idle" is past 180s, "fresh" only 120s.
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        assert!(!registry.contains("idle"));
        assert!(registry.contains("fresh"));
        assert_eq!(registry.stats().evicted_total, 1);
        reaper.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_cancels_task() {
        let token;
        {
            let reaper = Reaper::start(registry(), Duration::from_secs(60), Duration::from_secs(60));
            token = reaper.shutdown_token.clone();
        }
        assert!(token.is_cancelled());
    }
}
