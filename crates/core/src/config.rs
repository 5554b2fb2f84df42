//! Configuration types shared across crates.
//!
//! The configuration is immutable after startup: a single frozen [`AppConfig`]
//! is built at initialization and threaded by value to every component.
//! Reloading requires a full lifecycle restart.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Watched columns: table name to the columns holding object keys.
pub type WatchedTables = BTreeMap<String, Vec<String>>;

/// Garbage collection execution mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcMode {
    /// Report only, no side effects.
    #[default]
    DryRun,
    /// Write vault records, never delete.
    AuditOnly,
    /// Full pipeline: backup, record, delete.
    Execute,
}

impl GcMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::AuditOnly => "audit_only",
            Self::Execute => "execute",
        }
    }
}

impl fmt::Display for GcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GcMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "dry_run" => Ok(Self::DryRun),
            "audit_only" => Ok(Self::AuditOnly),
            "execute" => Ok(Self::Execute),
            other => Err(Error::InvalidMode(other.to_string())),
        }
    }
}

/// Change-data-capture backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CdcBackend {
    Postgres,
    Mysql,
}

impl CdcBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }

    /// Best-effort backend inference from a DSN scheme.
    pub fn infer_from_url(url: &str) -> Option<Self> {
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::Mysql)
        } else {
            None
        }
    }
}

impl fmt::Display for CdcBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CdcBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "postgres" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            other => Err(Error::InvalidCdcBackend(other.to_string())),
        }
    }
}

/// Daily trigger time in UTC (`HH:MM`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Schedule {
    pub hour: u8,
    pub minute: u8,
}

impl FromStr for Schedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidSchedule(s.to_string());
        let (hour, minute) = s.split_once(':').ok_or_else(invalid)?;
        let hour: u8 = hour.parse().map_err(|_| invalid())?;
        let minute: u8 = minute.parse().map_err(|_| invalid())?;
        if hour > 23 || minute > 59 {
            return Err(invalid());
        }
        Ok(Self { hour, minute })
    }
}

impl TryFrom<String> for Schedule {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<Schedule> for String {
    fn from(s: Schedule) -> String {
        s.to_string()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Garbage collection configuration, frozen at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Target bucket. Empty fails validation (set via S3_BUCKET).
    #[serde(default)]
    pub bucket: String,
    /// Object store region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Watched columns. An empty column list for a table is invalid.
    #[serde(default)]
    pub tables: WatchedTables,
    /// Execution mode (default: dry_run for safety).
    #[serde(default)]
    pub mode: GcMode,
    /// Minimum object age in days before deletion. 0 is disallowed in execute.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Key prefixes that are never candidates.
    #[serde(default)]
    pub exclude_prefixes: Vec<String>,
    /// Root directory for the audit database and backup blobs.
    #[serde(default = "default_vault_path")]
    pub vault_path: PathBuf,
    /// CDC backend; absent means scan-only mode.
    #[serde(default)]
    pub cdc_backend: Option<CdcBackend>,
    /// DSN for CDC and live verification; required iff cdc_backend is set.
    #[serde(default)]
    pub cdc_connection_url: Option<String>,
    /// Daily trigger time (UTC); absent disables auto-run.
    #[serde(default)]
    pub schedule: Option<Schedule>,
    /// Concurrent verification/action workers per cycle.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bucket listing page size.
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_retention_days() -> u32 {
    7
}

fn default_vault_path() -> PathBuf {
    PathBuf::from("./gleaner_vault")
}

fn default_workers() -> usize {
    crate::DEFAULT_WORKERS
}

fn default_list_page_size() -> usize {
    crate::DEFAULT_LIST_PAGE_SIZE
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: default_region(),
            tables: WatchedTables::new(),
            mode: GcMode::default(),
            retention_days: default_retention_days(),
            exclude_prefixes: Vec::new(),
            vault_path: default_vault_path(),
            cdc_backend: None,
            cdc_connection_url: None,
            schedule: None,
            workers: default_workers(),
            list_page_size: default_list_page_size(),
        }
    }
}

impl GcConfig {
    /// Retention floor as a duration.
    pub fn retention(&self) -> time::Duration {
        time::Duration::days(self.retention_days as i64)
    }

    /// Whether a key matches any excluded prefix.
    pub fn is_excluded(&self, key: &str) -> bool {
        self.exclude_prefixes.iter().any(|p| key.starts_with(p))
    }

    /// Iterate all watched `(table, column)` pairs.
    pub fn watched_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tables
            .iter()
            .flat_map(|(table, cols)| cols.iter().map(move |c| (table.as_str(), c.as_str())))
    }

    /// Collect validation failures without short-circuiting.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = validate_bucket_name(&self.bucket) {
            errors.push(e);
        }

        for (table, columns) in &self.tables {
            if table.is_empty() {
                errors.push("watched table name must be non-empty".to_string());
            }
            if columns.is_empty() {
                errors.push(format!("watched table '{table}' declares no columns"));
            }
            if columns.iter().any(|c| c.is_empty()) {
                errors.push(format!("watched table '{table}' declares an empty column name"));
            }
        }

        if self.mode == GcMode::Execute && self.retention_days == 0 {
            errors.push("retention_days = 0 is disallowed in execute mode".to_string());
        }

        match (&self.cdc_backend, &self.cdc_connection_url) {
            (Some(_), None) => {
                errors.push("cdc_connection_url is required when cdc_backend is set".to_string());
            }
            (None, Some(_)) => {
                errors.push("cdc_connection_url is set but cdc_backend is not".to_string());
            }
            _ => {}
        }

        if self.workers == 0 {
            errors.push("workers must be >= 1".to_string());
        }

        errors
    }

    /// Redacted JSON snapshot suitable for the admin config endpoint.
    ///
    /// The DSN keeps scheme and host but drops userinfo.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(url) = self.cdc_connection_url.as_deref() {
            value["cdc_connection_url"] = serde_json::Value::String(mask_dsn(url));
        }
        value
    }

    /// SHA-256 digest of the redacted config snapshot, recorded per operation.
    pub fn digest(&self) -> String {
        let json = self.redacted().to_string();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Mask credentials in a DSN for logging and the config endpoint.
pub fn mask_dsn(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

/// Validate a bucket name against AWS rules.
fn validate_bucket_name(bucket: &str) -> Result<(), String> {
    if bucket.is_empty() {
        return Err("bucket is not configured (set S3_BUCKET)".to_string());
    }
    if bucket.len() < 3 || bucket.len() > 63 {
        return Err(format!("invalid bucket name '{bucket}': must be 3-63 characters"));
    }
    let bytes = bucket.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return Err(format!(
            "invalid bucket name '{bucket}': must start and end with a lowercase letter or digit"
        ));
    }
    if !bytes.iter().all(|&b| alnum(b) || b == b'-' || b == b'.') {
        return Err(format!(
            "invalid bucket name '{bucket}': only lowercase letters, digits, hyphens, and periods"
        ));
    }
    if bucket.contains("..") {
        return Err(format!("invalid bucket name '{bucket}': consecutive periods"));
    }
    if bucket.split('.').count() == 4 && bucket.split('.').all(|p| p.parse::<u8>().is_ok()) {
        return Err(format!("invalid bucket name '{bucket}': formatted as an IP address"));
    }
    Ok(())
}

/// Admin API configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Bearer token required by every admin endpoint. Empty fails validation.
    #[serde(default)]
    pub api_key: String,
}

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// S3 client options beyond bucket and region.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct S3Config {
    /// Optional endpoint URL (for MinIO, etc.).
    pub endpoint: Option<String>,
    /// Force path-style URLs. Required for MinIO and some S3-compatible services.
    #[serde(default)]
    pub force_path_style: bool,
    /// AWS access key ID. Falls back to the ambient credential chain if not set.
    pub access_key_id: Option<String>,
    /// AWS secret access key.
    pub secret_access_key: Option<String>,
}

impl S3Config {
    pub fn validate(&self) -> Vec<String> {
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            vec![
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ]
        } else {
            Vec::new()
        }
    }
}

/// Complete application configuration.
///
/// Every section is optional at parse time so the environment overlay can
/// supply missing values; validation runs on the merged result.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Admin token configuration (required by validation).
    #[serde(default)]
    pub admin: AdminConfig,
    /// S3 client options.
    #[serde(default)]
    pub s3: S3Config,
    /// Garbage collection configuration.
    #[serde(default)]
    pub gc: GcConfig,
}

impl AppConfig {
    /// Validate the whole configuration, reporting every failure at once.
    pub fn validate(&self) -> crate::Result<()> {
        let mut errors = self.gc.validate();
        errors.extend(self.s3.validate());
        if self.admin.api_key.is_empty() {
            errors.push("admin API key is not configured (set S3GC_ADMIN_API_KEY)".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(errors))
        }
    }

    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Watches `users.avatar_url` in dry-run mode.
    pub fn for_testing() -> Self {
        let mut tables = WatchedTables::new();
        tables.insert("users".to_string(), vec!["avatar_url".to_string()]);
        Self {
            server: ServerConfig::default(),
            admin: AdminConfig {
                api_key: "test-admin-key".to_string(),
            },
            s3: S3Config::default(),
            gc: GcConfig {
                bucket: "test-bucket".to_string(),
                region: default_region(),
                tables,
                mode: GcMode::DryRun,
                retention_days: 7,
                exclude_prefixes: Vec::new(),
                vault_path: default_vault_path(),
                cdc_backend: None,
                cdc_connection_url: None,
                schedule: None,
                workers: default_workers(),
                list_page_size: default_list_page_size(),
            },
        }
    }
}
