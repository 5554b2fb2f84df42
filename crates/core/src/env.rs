//! Environment-variable configuration contract.
//!
//! Recognized variables:
//!
//! | Variable | Maps to |
//! |---|---|
//! | `S3_BUCKET` | `gc.bucket` |
//! | `AWS_REGION` | `gc.region` |
//! | `S3GC_MODE` | `gc.mode` (`dry_run` / `audit_only` / `execute`) |
//! | `S3GC_VAULT_PATH` | `gc.vault_path` |
//! | `S3GC_RETENTION_DAYS` | `gc.retention_days` |
//! | `S3GC_EXCLUDE_PREFIXES` | `gc.exclude_prefixes` (comma-separated) |
//! | `S3GC_SCHEDULE_CRON` | `gc.schedule` (`HH:MM` UTC) |
//! | `S3GC_TABLES` | `gc.tables` (JSON `{"table": ["column", ...]}`) |
//! | `DATABASE_URL` | `gc.cdc_connection_url` (backend inferred from scheme) |
//! | `S3GC_CDC_BACKEND` | `gc.cdc_backend` (`postgres` / `mysql` override) |
//! | `S3GC_ADMIN_API_KEY` | `admin.api_key` |
//!
//! Environment values override any file-provided configuration.

use crate::config::{AppConfig, CdcBackend, GcMode, Schedule, WatchedTables};
use crate::error::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;

/// Build a complete configuration from the process environment.
pub fn from_env() -> Result<AppConfig> {
    let mut config = AppConfig::default();
    overlay_with(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

/// Apply environment overrides on top of a file-loaded configuration.
///
/// Does not validate; the caller validates the merged result.
pub fn overlay(config: &mut AppConfig) -> Result<()> {
    overlay_with(config, |name| std::env::var(name).ok())
}

/// Overlay using an arbitrary variable source, collecting every parse failure.
fn overlay_with<F>(config: &mut AppConfig, get: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors: Vec<String> = Vec::new();

    if let Some(bucket) = get("S3_BUCKET") {
        config.gc.bucket = bucket;
    }
    if let Some(region) = get("AWS_REGION") {
        config.gc.region = region;
    }
    if let Some(mode) = get("S3GC_MODE") {
        match GcMode::from_str(&mode) {
            Ok(mode) => config.gc.mode = mode,
            Err(e) => errors.push(e.to_string()),
        }
    }
    if let Some(path) = get("S3GC_VAULT_PATH") {
        config.gc.vault_path = PathBuf::from(path);
    }
    if let Some(days) = get("S3GC_RETENTION_DAYS") {
        match days.parse::<u32>() {
            Ok(days) => config.gc.retention_days = days,
            Err(_) => errors.push(format!(
                "invalid S3GC_RETENTION_DAYS value {days:?}: must be a non-negative integer"
            )),
        }
    }
    if let Some(prefixes) = get("S3GC_EXCLUDE_PREFIXES") {
        config.gc.exclude_prefixes = prefixes
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(schedule) = get("S3GC_SCHEDULE_CRON") {
        match Schedule::from_str(&schedule) {
            Ok(schedule) => config.gc.schedule = Some(schedule),
            Err(e) => errors.push(e.to_string()),
        }
    }
    if let Some(tables) = get("S3GC_TABLES") {
        match serde_json::from_str::<WatchedTables>(&tables) {
            Ok(tables) => config.gc.tables = tables,
            Err(e) => errors.push(format!(
                "invalid S3GC_TABLES value: {e} (expected JSON like {{\"table\": [\"column\"]}})"
            )),
        }
    }

    let db_url = get("DATABASE_URL");
    if let Some(url) = &db_url {
        config.gc.cdc_connection_url = Some(url.clone());
        if config.gc.cdc_backend.is_none() {
            config.gc.cdc_backend = CdcBackend::infer_from_url(url);
        }
    }
    if let Some(backend) = get("S3GC_CDC_BACKEND") {
        match CdcBackend::from_str(&backend) {
            Ok(backend) => config.gc.cdc_backend = Some(backend),
            Err(e) => errors.push(e.to_string()),
        }
    }

    if let Some(key) = get("S3GC_ADMIN_API_KEY") {
        config.admin.api_key = key;
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let vars = env(pairs);
        let mut config = AppConfig::default();
        overlay_with(&mut config, |name| vars.get(name).cloned())?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_environment() {
        let config = load(&[
            ("S3_BUCKET", "app-uploads"),
            ("S3GC_TABLES", r#"{"users": ["avatar_url"]}"#),
            ("S3GC_ADMIN_API_KEY", "k"),
        ])
        .unwrap();
        assert_eq!(config.gc.bucket, "app-uploads");
        assert_eq!(config.gc.mode, GcMode::DryRun);
        assert_eq!(config.gc.retention_days, 7);
        assert!(config.gc.cdc_backend.is_none());
    }

    #[test]
    fn full_environment() {
        let config = load(&[
            ("S3_BUCKET", "app-uploads"),
            ("AWS_REGION", "eu-west-1"),
            ("S3GC_MODE", "execute"),
            ("S3GC_VAULT_PATH", "/var/lib/gleaner"),
            ("S3GC_RETENTION_DAYS", "30"),
            ("S3GC_EXCLUDE_PREFIXES", "backups/, system/"),
            ("S3GC_SCHEDULE_CRON", "02:30"),
            ("S3GC_TABLES", r#"{"users": ["avatar_url"], "posts": ["hero_image"]}"#),
            ("DATABASE_URL", "postgres://gc:pw@db/app"),
            ("S3GC_ADMIN_API_KEY", "k"),
        ])
        .unwrap();
        assert_eq!(config.gc.mode, GcMode::Execute);
        assert_eq!(config.gc.retention_days, 30);
        assert_eq!(config.gc.exclude_prefixes, vec!["backups/", "system/"]);
        assert_eq!(config.gc.schedule.unwrap().to_string(), "02:30");
        assert_eq!(config.gc.cdc_backend, Some(CdcBackend::Postgres));
        assert_eq!(config.gc.tables.len(), 2);
    }

    #[test]
    fn backend_inferred_from_mysql_url() {
        let config = load(&[
            ("S3_BUCKET", "app-uploads"),
            ("S3GC_TABLES", r#"{"users": ["avatar_url"]}"#),
            ("DATABASE_URL", "mysql://gc@db/app"),
            ("S3GC_ADMIN_API_KEY", "k"),
        ])
        .unwrap();
        assert_eq!(config.gc.cdc_backend, Some(CdcBackend::Mysql));
    }

    #[test]
    fn explicit_backend_wins_over_inference() {
        let config = load(&[
            ("S3_BUCKET", "app-uploads"),
            ("S3GC_TABLES", r#"{"users": ["avatar_url"]}"#),
            ("DATABASE_URL", "postgres://gc@db/app"),
            ("S3GC_CDC_BACKEND", "postgres"),
            ("S3GC_ADMIN_API_KEY", "k"),
        ])
        .unwrap();
        assert_eq!(config.gc.cdc_backend, Some(CdcBackend::Postgres));
    }

    #[test]
    fn missing_bucket_is_fatal() {
        let err = load(&[
            ("S3GC_TABLES", r#"{"users": ["avatar_url"]}"#),
            ("S3GC_ADMIN_API_KEY", "k"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("S3_BUCKET"));
    }

    #[test]
    fn bad_values_are_reported_together() {
        let err = load(&[
            ("S3_BUCKET", "app-uploads"),
            ("S3GC_TABLES", "not json"),
            ("S3GC_MODE", "yolo"),
            ("S3GC_RETENTION_DAYS", "-3"),
            ("S3GC_ADMIN_API_KEY", "k"),
        ])
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("S3GC_TABLES"));
        assert!(message.contains("yolo"));
        assert!(message.contains("S3GC_RETENTION_DAYS"));
    }
}
