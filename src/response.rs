use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::compression::PoolStats;
use crate::config::LimiterConfig;
use crate::registry::RegistryStats;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self { status: "ok" }
    }
}

#[derive(Debug, Serialize)]
pub struct HelloResponse {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub tracked_clients: usize,
}

#[derive(Debug, Serialize)]
pub struct LimiterSettings {
    pub refill_rate: f64,
    pub burst: u32,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl From<&LimiterConfig> for LimiterSettings {
    fn from(config: &LimiterConfig) -> Self {
        Self {
            refill_rate: config.refill_rate,
            burst: config.burst,
            idle_timeout_secs: config.idle_timeout.as_secs(),
            sweep_interval_secs: config.sweep_interval.as_secs(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LimiterStatsResponse {
    pub settings: LimiterSettings,
    pub registry: RegistryStats,
    pub compression: PoolStats,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub client: String,
    pub removed: bool,
}
