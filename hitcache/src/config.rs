//! Cache and load management configuration
//!
//! All options are independently settable from JSON (camelCase keys). Missing
//! keys take their defaults; an explicit `null` on one of the three capacity
//! limits means "unlimited", while `0` turns caching off entirely.

use crate::interface::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bytes in one megabyte (decimal, as used by all `*Megs` options)
pub const ONE_MB_BYTES: u64 = 1_000_000;

/// Very rough size of one stored result object: 3 ints plus object overhead.
pub const SIZE_OF_HIT: u64 = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Maximum number of cached searches
    pub max_number_of_searches: Option<u64>,
    /// Maximum estimated cache size
    pub max_size_megs: Option<u64>,
    /// Finished searches unused for longer than this are evicted
    pub max_search_age_sec: Option<u64>,
    /// Running searches are cancelled after this much wall time
    pub max_search_time_sec: u64,
    /// At most this many searches may run at once
    pub max_concurrent_searches: usize,
    /// Running count tasks nobody polled for this long are aborted
    pub abandoned_count_abort_time_sec: u64,
    /// Finished searches are evicted while free memory is below this
    pub target_free_mem_megs: u64,
    /// New searches are refused while free memory is below this
    pub min_free_mem_for_search_megs: u64,
    /// Interval between load manager sweeps
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_number_of_searches: Some(100),
            max_size_megs: Some(500),
            max_search_age_sec: Some(3600),
            max_search_time_sec: 300,
            max_concurrent_searches: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            abandoned_count_abort_time_sec: 30,
            target_free_mem_megs: 100,
            min_free_mem_for_search_megs: 50,
            sweep_interval_ms: 500,
        }
    }
}

impl CacheConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_searches == 0 {
            return Err(ConfigError::Invalid("maxConcurrentSearches must be at least 1".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("sweepIntervalMs must be at least 1".into()));
        }
        Ok(())
    }

    /// Any capacity limit set to zero disables caching: searches still run,
    /// but are never registered.
    pub fn is_cache_disabled(&self) -> bool {
        self.max_number_of_searches == Some(0)
            || self.max_search_age_sec == Some(0)
            || self.max_size_megs == Some(0)
    }

    /// Configured maximum size in bytes, `None` when unlimited.
    pub fn max_size_bytes(&self) -> Option<u64> {
        self.max_size_megs.map(|megs| megs.saturating_mul(ONE_MB_BYTES))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn limits(&self) -> SweepLimits {
        SweepLimits {
            max_entries: self.max_number_of_searches,
            max_size_megs: self.max_size_megs,
            max_age: self.max_search_age_sec.map(Duration::from_secs),
            max_search_time: Duration::from_secs(self.max_search_time_sec),
            max_concurrent: self.max_concurrent_searches,
            abandoned_count_timeout: Duration::from_secs(self.abandoned_count_abort_time_sec),
            target_free_mem_megs: self.target_free_mem_megs,
        }
    }
}

/// The subset of configuration the sweep planner works from, in native units.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepLimits {
    pub max_entries: Option<u64>,
    pub max_size_megs: Option<u64>,
    pub max_age: Option<Duration>,
    pub max_search_time: Duration,
    pub max_concurrent: usize,
    pub abandoned_count_timeout: Duration,
    pub target_free_mem_megs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_enable_caching() {
        let config = CacheConfig::default();
        assert!(!config.is_cache_disabled());
        assert!(config.max_concurrent_searches >= 1);
        assert_eq!(config.max_size_bytes(), Some(500 * ONE_MB_BYTES));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CacheConfig::from_json_str(r#"{ "maxNumberOfSearches": 7, "maxSearchTimeSec": 10 }"#).unwrap();
        assert_eq!(config.max_number_of_searches, Some(7));
        assert_eq!(config.max_search_time_sec, 10);
        assert_eq!(config.max_size_megs, Some(500));
        assert_eq!(config.target_free_mem_megs, 100);
    }

    #[test]
    fn test_null_means_unlimited() {
        let config = CacheConfig::from_json_str(r#"{ "maxSizeMegs": null, "maxSearchAgeSec": null }"#).unwrap();
        assert_eq!(config.max_size_megs, None);
        assert_eq!(config.max_size_bytes(), None);
        assert_eq!(config.limits().max_age, None);
        assert!(!config.is_cache_disabled());
    }

    #[test]
    fn test_any_zero_capacity_disables_cache() {
        for json in [
            r#"{ "maxNumberOfSearches": 0 }"#,
            r#"{ "maxSizeMegs": 0 }"#,
            r#"{ "maxSearchAgeSec": 0 }"#,
        ] {
            let config = CacheConfig::from_json_str(json).unwrap();
            assert!(config.is_cache_disabled(), "{json} should disable the cache");
        }
    }

    #[test]
    fn test_invalid_concurrency_rejected() {
        let err = CacheConfig::from_json_str(r#"{ "maxConcurrentSearches": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = CacheConfig::from_json_str("{ maxSizeMegs: ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "minFreeMemForSearchMegs": 5, "sweepIntervalMs": 50 }}"#).unwrap();

        let config = CacheConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.min_free_mem_for_search_megs, 5);
        assert_eq!(config.sweep_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_huge_size_limit_saturates() {
        let config = CacheConfig { max_size_megs: Some(u64::MAX / 2), ..CacheConfig::default() };
        assert_eq!(config.max_size_bytes(), Some(u64::MAX));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CacheConfig::from_json_file(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
