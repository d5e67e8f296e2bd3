use envconfig::Envconfig;
use humantime_serde::re::humantime;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Duration read from the environment in humantime syntax ("90s", "3m").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl FromStr for HumanDuration {
    type Err = humantime::DurationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        humantime::parse_duration(s.trim()).map(HumanDuration)
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

/// Comma separated list; blank entries are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvList(pub Vec<String>);

impl FromStr for CsvList {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(CsvList(
            s.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }
}

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:8080")]
    pub bind_addr: SocketAddr,

    /// Log level for the crate's own targets
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Token refill rate per client, requests per second
    #[envconfig(from = "RATE_LIMIT_RPS", default = "10")]
    pub rate_limit_rps: f64,

    /// Token bucket capacity per client
    #[envconfig(from = "RATE_LIMIT_BURST", default = "20")]
    pub rate_limit_burst: u32,

    /// Clients unseen for longer than this are evicted
    #[envconfig(from = "RATE_LIMIT_IDLE_TIMEOUT", default = "3m")]
    pub idle_timeout: HumanDuration,

    /// How often the reaper sweeps the client registry
    #[envconfig(from = "RATE_LIMIT_SWEEP_INTERVAL", default = "1m")]
    pub sweep_interval: HumanDuration,

    /// Paths that bypass rate limiting
    #[envconfig(from = "RATE_LIMIT_SKIP_PATHS", default = "/,/healthz")]
    pub skip_paths: CsvList,

    /// Client identifiers that bypass rate limiting
    #[envconfig(from = "RATE_LIMIT_WHITELIST", default = "")]
    pub whitelist: CsvList,

    /// CORS origins; "*" allows any
    #[envconfig(from = "ALLOWED_ORIGINS", default = "http://localhost:3000")]
    pub allowed_origins: CsvList,

    /// Smallest body, in bytes, considered for gzip
    #[envconfig(from = "COMPRESSION_MIN_SIZE", default = "1024")]
    pub compression_min_size: usize,

    /// Idle compressors kept for reuse
    #[envconfig(from = "COMPRESSION_POOL_SIZE", default = "64")]
    pub compression_pool_size: usize,

    /// max-age for cacheable GET responses; 0 disables caching
    #[envconfig(from = "CACHE_MAX_AGE_SECS", default = "0")]
    pub cache_max_age_secs: u64,
}

/// Process-wide token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterConfig {
    pub refill_rate: f64,
    pub burst: u32,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl LimiterConfig {
    pub fn new(refill_rate: f64, burst: u32) -> Self {
        Self {
            refill_rate,
            burst,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            return Err(Error::Configuration(
                "Refill rate must be a positive number".to_string(),
            ));
        }
        if self.burst == 0 {
            return Err(Error::Configuration(
                "Burst capacity must be greater than 0".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::Configuration(
                "Idle timeout must be greater than 0".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Configuration(
                "Sweep interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            refill_rate: 10.0,
            burst: 20,
            idle_timeout: Duration::from_secs(180),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Response encoder tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    pub min_compress_size: usize,
    pub pool_size: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            min_compress_size: 1024,
            pool_size: 64,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config::init_from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.limiter().validate()?;
        if self.compression_pool_size == 0 {
            return Err(Error::Configuration(
                "Compression pool size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn limiter(&self) -> LimiterConfig {
        LimiterConfig {
            refill_rate: self.rate_limit_rps,
            burst: self.rate_limit_burst,
            idle_timeout: self.idle_timeout.0,
            sweep_interval: self.sweep_interval.0,
        }
    }

    pub fn encoder(&self) -> EncoderConfig {
        EncoderConfig {
            min_compress_size: self.compression_min_size,
            pool_size: self.compression_pool_size,
        }
    }

    /// Cache lifetime for GET responses, if caching is enabled.
    pub fn cache_ttl(&self) -> Option<u64> {
        (self.cache_max_age_secs > 0).then_some(self.cache_max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        assert_ok!(config.validate());

        let limiter = config.limiter();
        assert_eq!(limiter.refill_rate, 10.0);
        assert_eq!(limiter.burst, 20);
        assert_eq!(limiter.idle_timeout, Duration::from_secs(180));
        assert_eq!(limiter.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.skip_paths.0, vec!["/", "/healthz"]);
        assert!(config.whitelist.0.is_empty());
        assert_eq!(config.cache_ttl(), None);
    }

    #[test]
    fn test_overrides() {
        let config = Config::init_from_hashmap(&env(&[
            ("RATE_LIMIT_RPS", "2.5"),
            ("RATE_LIMIT_IDLE_TIMEOUT", "90s"),
            ("RATE_LIMIT_WHITELIST", "10.0.0.1, ,10.0.0.2"),
            ("CACHE_MAX_AGE_SECS", "30"),
        ]))
        .unwrap();

        assert_eq!(config.limiter().refill_rate, 2.5);
        assert_eq!(config.idle_timeout.0, Duration::from_secs(90));
        assert_eq!(config.whitelist.0, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(config.cache_ttl(), Some(30));
    }

    #[test]
    fn test_invalid_limiter_values() {
        assert_err!(LimiterConfig::new(0.0, 20).validate());
        assert_err!(LimiterConfig::new(f64::NAN, 20).validate());
        assert_err!(LimiterConfig::new(10.0, 0).validate());

        let mut limiter = LimiterConfig::default();
        limiter.sweep_interval = Duration::ZERO;
        assert_err!(limiter.validate());
    }

    #[test]
    fn test_bad_duration_rejected() {
        let result = Config::init_from_hashmap(&env(&[("RATE_LIMIT_SWEEP_INTERVAL", "soon")]));
        assert!(result.is_err());
    }
}
