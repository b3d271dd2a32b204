use std::env;
use std::path::PathBuf;

use crate::{AppError, AppResult};

pub const LOG_ENV: &str = "CLINIC_BUNDLE_LOG";
pub const LOG_DIR_ENV: &str = "CLINIC_BUNDLE_LOG_DIR";
pub const EXPORT_CONCURRENCY_ENV: &str = "CLINIC_BUNDLE_EXPORT_CONCURRENCY";
pub const RECORDS_PER_SECOND_ENV: &str = "CLINIC_BUNDLE_RECORDS_PER_SECOND";

pub const DEFAULT_LOG_FILTER: &str = "clinic_bundle=info,sqlx=warn";
pub const DEFAULT_EXPORT_CONCURRENCY: usize = 8;
/// Import throughput used for duration estimates.
pub const DEFAULT_RECORDS_PER_SECOND: u64 = 500;

/// Runtime knobs shared by the exporter, validator and binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleConfig {
    pub log_filter: String,
    pub log_dir: Option<PathBuf>,
    pub export_concurrency: usize,
    pub records_per_second: u64,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_dir: None,
            export_concurrency: DEFAULT_EXPORT_CONCURRENCY,
            records_per_second: DEFAULT_RECORDS_PER_SECOND,
        }
    }
}

impl BundleConfig {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests never touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(filter) = lookup(LOG_ENV).filter(|v| !v.trim().is_empty()) {
            config.log_filter = filter;
        }
        if let Some(dir) = lookup(LOG_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            config.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = lookup(EXPORT_CONCURRENCY_ENV) {
            config.export_concurrency = parse_positive(EXPORT_CONCURRENCY_ENV, &raw)?;
        }
        if let Some(raw) = lookup(RECORDS_PER_SECOND_ENV) {
            config.records_per_second = parse_positive(RECORDS_PER_SECOND_ENV, &raw)?;
        }
        Ok(config)
    }
}

fn parse_positive<T>(key: &str, raw: &str) -> AppResult<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(
            AppError::new("CONFIG/INVALID", format!("{key} must be a positive integer"))
                .with_context("key", key)
                .with_context("value", raw),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = BundleConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, BundleConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let config = BundleConfig::from_lookup(lookup(&[
            (LOG_ENV, "clinic_bundle=debug"),
            (LOG_DIR_ENV, "/tmp/bundle-logs"),
            (EXPORT_CONCURRENCY_ENV, "3"),
            (RECORDS_PER_SECOND_ENV, "250"),
        ]))
        .unwrap();
        assert_eq!(config.log_filter, "clinic_bundle=debug");
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/bundle-logs")));
        assert_eq!(config.export_concurrency, 3);
        assert_eq!(config.records_per_second, 250);
    }

    #[test]
    fn rejects_zero_and_garbage() {
        let err = BundleConfig::from_lookup(lookup(&[(EXPORT_CONCURRENCY_ENV, "0")])).unwrap_err();
        assert_eq!(err.code(), "CONFIG/INVALID");
        let err =
            BundleConfig::from_lookup(lookup(&[(RECORDS_PER_SECOND_ENV, "fast")])).unwrap_err();
        assert_eq!(err.context().get("key").map(String::as_str), Some(RECORDS_PER_SECOND_ENV));
    }
}
