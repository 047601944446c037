// SPDX-License-Identifier: MIT OR Apache-2.0
//! Layered configuration: built-in defaults safe for local development,
//! an optional TOML file, then environment variables (highest precedence).
#![warn(missing_docs)]

use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// Semantic validation failed (one or more hard problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent the service from starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended field is unset, so a less-capable default applies.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// A numeric value is set but outside the sensible range for production.
    UnusualValue {
        /// Name of the field.
        field: String,
        /// Description of what was observed.
        detail: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::UnusualValue { field, detail } => {
                write!(f, "unusual value for '{field}': {detail}")
            }
        }
    }
}

/// Per-task timeouts for planner/critic/image/canon provider calls, plus the
/// streaming (SSE) response timeout.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TaskTimeouts {
    #[serde(default = "default_planner_timeout_secs")]
    pub planner_secs: u64,
    #[serde(default = "default_critic_timeout_secs")]
    pub critic_secs: u64,
    #[serde(default = "default_image_timeout_secs")]
    pub image_secs: u64,
    #[serde(default = "default_canon_timeout_secs")]
    pub canon_secs: u64,
    #[serde(default = "default_streaming_timeout_secs")]
    pub streaming_secs: u64,
}

fn default_planner_timeout_secs() -> u64 {
    20
}
fn default_critic_timeout_secs() -> u64 {
    15
}
fn default_image_timeout_secs() -> u64 {
    60
}
fn default_canon_timeout_secs() -> u64 {
    20
}
fn default_streaming_timeout_secs() -> u64 {
    120
}

impl Default for TaskTimeouts {
    fn default() -> Self {
        TaskTimeouts {
            planner_secs: default_planner_timeout_secs(),
            critic_secs: default_critic_timeout_secs(),
            image_secs: default_image_timeout_secs(),
            canon_secs: default_canon_timeout_secs(),
            streaming_secs: default_streaming_timeout_secs(),
        }
    }
}

/// Cache TTLs, in seconds, for the content families the ingest/render
/// pipelines cache.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CacheTtls {
    #[serde(default = "default_embed_ttl_secs")]
    pub embed_secs: u64,
    #[serde(default = "default_canon_ttl_secs")]
    pub canon_secs: u64,
    #[serde(default = "default_render_result_ttl_secs")]
    pub render_result_secs: u64,
}

fn default_embed_ttl_secs() -> u64 {
    24 * 3600
}
fn default_canon_ttl_secs() -> u64 {
    7 * 24 * 3600
}
fn default_render_result_ttl_secs() -> u64 {
    30 * 24 * 3600
}

impl Default for CacheTtls {
    fn default() -> Self {
        CacheTtls {
            embed_secs: default_embed_ttl_secs(),
            canon_secs: default_canon_ttl_secs(),
            render_result_secs: default_render_result_ttl_secs(),
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SgdConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_service_env")]
    pub service_env: String,
    #[serde(default)]
    pub service_region: Option<String>,

    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub qdrant_url: Option<String>,
    #[serde(default)]
    pub qdrant_api_key: Option<String>,
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default)]
    pub storage_access_key: Option<String>,
    #[serde(default)]
    pub storage_secret_key: Option<String>,
    #[serde(default)]
    pub storage_bucket: Option<String>,

    #[serde(default)]
    pub openrouter_api_key: Option<String>,

    #[serde(default)]
    pub task_timeouts: TaskTimeouts,
    #[serde(default)]
    pub cache_ttls: CacheTtls,

    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    #[serde(default)]
    pub cors_allow_origins: Vec<String>,
    #[serde(default)]
    pub ref_url_allow_hosts: Vec<String>,

    #[serde(default = "default_daily_budget_usd")]
    pub daily_budget_usd: f64,
    #[serde(default)]
    pub budget_alert_webhook: Option<String>,

    #[serde(default = "default_max_render_workers")]
    pub max_render_workers: usize,
}

fn default_service_name() -> String {
    "synthetic-graphic-designer".to_string()
}
fn default_service_env() -> String {
    "development".to_string()
}
fn default_rate_limit_rpm() -> u32 {
    100
}
fn default_rate_limit_burst() -> u32 {
    20
}
fn default_daily_budget_usd() -> f64 {
    50.0
}
fn default_max_render_workers() -> usize {
    3
}

impl Default for SgdConfig {
    fn default() -> Self {
        SgdConfig {
            service_name: default_service_name(),
            service_env: default_service_env(),
            service_region: None,
            redis_url: None,
            qdrant_url: None,
            qdrant_api_key: None,
            database_url: None,
            storage_access_key: None,
            storage_secret_key: None,
            storage_bucket: None,
            openrouter_api_key: None,
            task_timeouts: TaskTimeouts::default(),
            cache_ttls: CacheTtls::default(),
            rate_limit_rpm: default_rate_limit_rpm(),
            rate_limit_burst: default_rate_limit_burst(),
            cors_allow_origins: Vec::new(),
            ref_url_allow_hosts: Vec::new(),
            daily_budget_usd: default_daily_budget_usd(),
            budget_alert_webhook: None,
            max_render_workers: default_max_render_workers(),
        }
    }
}

impl SgdConfig {
    /// `true` when `service_env` denotes a production deployment — used by
    /// callers that gate behavior on environment (e.g. requiring a real
    /// malware scanner).
    pub fn is_production(&self) -> bool {
        self.service_env.eq_ignore_ascii_case("production")
    }
}

/// Load configuration from an optional TOML file, then apply environment
/// variable overrides. `path = None` starts from [`SgdConfig::default`].
pub fn load_config(path: Option<&Path>) -> Result<SgdConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => SgdConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into an [`SgdConfig`].
pub fn parse_toml(content: &str) -> Result<SgdConfig, ConfigError> {
    toml::from_str::<SgdConfig>(content).map_err(|e| ConfigError::ParseError { reason: e.to_string() })
}

/// Apply environment variable overrides, highest precedence. Covers every
/// variable named in the service's config surface: `SERVICE_{NAME,ENV,REGION}`,
/// `REDIS_URL`, `QDRANT_URL`/`QDRANT_API_KEY`, `DATABASE_URL`, storage
/// credentials, `OPENROUTER_API_KEY`, `RATE_LIMIT_RPM`/`RATE_LIMIT_BURST`,
/// `CORS_ALLOW_ORIGINS`, `REF_URL_ALLOW_HOSTS`, `DAILY_BUDGET_USD`,
/// `BUDGET_ALERT_WEBHOOK`, `MAX_RENDER_WORKERS`.
pub fn apply_env_overrides(config: &mut SgdConfig) {
    if let Ok(v) = std::env::var("SERVICE_NAME") {
        config.service_name = v;
    }
    if let Ok(v) = std::env::var("SERVICE_ENV") {
        config.service_env = v;
    }
    if let Ok(v) = std::env::var("SERVICE_REGION") {
        config.service_region = Some(v);
    }
    if let Ok(v) = std::env::var("REDIS_URL") {
        config.redis_url = Some(v);
    }
    if let Ok(v) = std::env::var("QDRANT_URL") {
        config.qdrant_url = Some(v);
    }
    if let Ok(v) = std::env::var("QDRANT_API_KEY") {
        config.qdrant_api_key = Some(v);
    }
    if let Ok(v) = std::env::var("DATABASE_URL") {
        config.database_url = Some(v);
    }
    if let Ok(v) = std::env::var("STORAGE_ACCESS_KEY") {
        config.storage_access_key = Some(v);
    }
    if let Ok(v) = std::env::var("STORAGE_SECRET_KEY") {
        config.storage_secret_key = Some(v);
    }
    if let Ok(v) = std::env::var("STORAGE_BUCKET") {
        config.storage_bucket = Some(v);
    }
    if let Ok(v) = std::env::var("OPENROUTER_API_KEY") {
        config.openrouter_api_key = Some(v);
    }
    if let Ok(v) = std::env::var("RATE_LIMIT_RPM") {
        if let Ok(n) = v.parse() {
            config.rate_limit_rpm = n;
        }
    }
    if let Ok(v) = std::env::var("RATE_LIMIT_BURST") {
        if let Ok(n) = v.parse() {
            config.rate_limit_burst = n;
        }
    }
    if let Ok(v) = std::env::var("CORS_ALLOW_ORIGINS") {
        config.cors_allow_origins = split_csv(&v);
    }
    if let Ok(v) = std::env::var("REF_URL_ALLOW_HOSTS") {
        config.ref_url_allow_hosts = split_csv(&v);
    }
    if let Ok(v) = std::env::var("DAILY_BUDGET_USD") {
        if let Ok(n) = v.parse() {
            config.daily_budget_usd = n;
        }
    }
    if let Ok(v) = std::env::var("BUDGET_ALERT_WEBHOOK") {
        config.budget_alert_webhook = Some(v);
    }
    if let Ok(v) = std::env::var("MAX_RENDER_WORKERS") {
        if let Ok(n) = v.parse() {
            config.max_render_workers = n;
        }
    }
}

fn split_csv(v: &str) -> Vec<String> {
    v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Validate a parsed configuration, returning advisory warnings. Hard
/// errors (invalid env name, zero RPM, out-of-range timeout) come back as a
/// [`ConfigError::ValidationError`]; soft issues are [`ConfigWarning`]s.
pub fn validate_config(config: &SgdConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.service_name.trim().is_empty() {
        errors.push("service_name must not be empty".to_string());
    }
    if config.rate_limit_rpm == 0 {
        errors.push("rate_limit_rpm must be greater than zero".to_string());
    }
    if config.daily_budget_usd <= 0.0 {
        errors.push("daily_budget_usd must be positive".to_string());
    }
    if config.max_render_workers == 0 {
        errors.push("max_render_workers must be greater than zero".to_string());
    }

    for (field, secs) in [
        ("task_timeouts.planner_secs", config.task_timeouts.planner_secs),
        ("task_timeouts.critic_secs", config.task_timeouts.critic_secs),
        ("task_timeouts.image_secs", config.task_timeouts.image_secs),
        ("task_timeouts.canon_secs", config.task_timeouts.canon_secs),
        ("task_timeouts.streaming_secs", config.task_timeouts.streaming_secs),
    ] {
        if secs == 0 || secs > MAX_TIMEOUT_SECS {
            errors.push(format!("{field} {secs}s out of range (1..{MAX_TIMEOUT_SECS})"));
        }
    }

    if config.is_production() && config.openrouter_api_key.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "openrouter_api_key".to_string(),
            hint: "production deployments need a real provider key".to_string(),
        });
    }
    if config.redis_url.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "redis_url".to_string(),
            hint: "falling back to an in-memory cache/queue backend".to_string(),
        });
    }
    if config.qdrant_url.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "qdrant_url".to_string(),
            hint: "falling back to an in-memory vector index".to_string(),
        });
    }
    if config.ref_url_allow_hosts.is_empty() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "ref_url_allow_hosts".to_string(),
            hint: "no remote reference URLs will be fetchable".to_string(),
        });
    }
    if config.rate_limit_rpm > 10_000 {
        warnings.push(ConfigWarning::UnusualValue {
            field: "rate_limit_rpm".to_string(),
            detail: format!("{} rpm is unusually high", config.rate_limit_rpm),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid_with_warnings() {
        let cfg = SgdConfig::default();
        let warnings = validate_config(&cfg).expect("default config should be valid");
        assert!(!warnings.is_empty());
    }

    #[test]
    fn default_config_has_safe_local_dev_defaults() {
        let cfg = SgdConfig::default();
        assert!(cfg.redis_url.is_none());
        assert!(cfg.qdrant_url.is_none());
        assert_eq!(cfg.rate_limit_rpm, 100);
        assert_eq!(cfg.max_render_workers, 3);
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml_str = r#"
            service_name = "sgd"
            service_env = "production"
            daily_budget_usd = 200.0
        "#;
        let cfg = parse_toml(toml_str).unwrap();
        assert_eq!(cfg.service_name, "sgd");
        assert!(cfg.is_production());
        assert_eq!(cfg.daily_budget_usd, 200.0);
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let err = parse_toml("not [ valid = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_catches_zero_rpm() {
        let mut cfg = SgdConfig::default();
        cfg.rate_limit_rpm = 0;
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_timeout_out_of_range() {
        let mut cfg = SgdConfig::default();
        cfg.task_timeouts.image_secs = 0;
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("image_secs")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn production_without_api_key_warns() {
        let mut cfg = SgdConfig::default();
        cfg.service_env = "production".to_string();
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings.iter().any(|w| matches!(
            w,
            ConfigWarning::MissingOptionalField { field, .. } if field == "openrouter_api_key"
        )));
    }

    #[test]
    fn env_overrides_apply_on_top_of_file() {
        // SAFETY (test-only): single-threaded env mutation scoped to this test.
        unsafe {
            std::env::set_var("SERVICE_NAME", "overridden");
            std::env::set_var("RATE_LIMIT_RPM", "250");
        }
        let mut cfg = SgdConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.service_name, "overridden");
        assert_eq!(cfg.rate_limit_rpm, 250);
        unsafe {
            std::env::remove_var("SERVICE_NAME");
            std::env::remove_var("RATE_LIMIT_RPM");
        }
    }

    #[test]
    fn cors_allow_origins_env_is_comma_split() {
        unsafe {
            std::env::set_var("CORS_ALLOW_ORIGINS", "https://a.example, https://b.example");
        }
        let mut cfg = SgdConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.cors_allow_origins, vec!["https://a.example", "https://b.example"]);
        unsafe {
            std::env::remove_var("CORS_ALLOW_ORIGINS");
        }
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sgd.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "service_name = \"from-file\"").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.service_name, "from-file");
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/sgd.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = SgdConfig {
            openrouter_api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: SgdConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }
}
