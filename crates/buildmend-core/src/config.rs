//! Layered configuration: defaults, then a TOML file, then `BUILDMEND_*`
//! environment variables.
//!
//! [`BuildmendConfig::from_sources`] is pure over the file text and an env
//! lookup function; [`BuildmendConfig::load`] wires it to the filesystem and
//! the process environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use tracing::Level;

use crate::build::{BuildCommand, DEFAULT_ERROR_MARKER};
use crate::debounce::{PathFilter, DEFAULT_EXCLUDED_DIRS, DEFAULT_EXTENSIONS};
use crate::error::Result;
use crate::orchestrator::{Backoff, RetryPolicy};

/// Configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("cannot parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Project root; also the build working directory.
    pub path: PathBuf,
    pub name: Option<String>,
    pub scheme: Option<String>,
    pub configuration: String,
    pub derived_data_path: Option<PathBuf>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            name: None,
            scheme: None,
            configuration: "Debug".to_string(),
            derived_data_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Whitespace-separated override of the xcodebuild template.
    pub command: Option<String>,
    pub clean_command: Option<String>,
    /// 0 disables the timeout.
    pub timeout_secs: u64,
    pub error_marker: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: None,
            clean_command: None,
            timeout_secs: 300,
            error_marker: DEFAULT_ERROR_MARKER.to_string(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub base_url: String,
    #[serde(serialize_with = "redact")]
    pub api_key: String,
    pub timeout_secs: u64,
    pub project_type: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout_secs: 300,
            project_type: "ios".to_string(),
        }
    }
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .field("project_type", &self.project_type)
            .finish()
    }
}

fn redact<S: Serializer>(value: &str, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(if value.is_empty() { "" } else { "<redacted>" })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub debounce_ms: u64,
    pub extensions: Vec<String>,
    pub excluded_dirs: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_000,
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            excluded_dirs: DEFAULT_EXCLUDED_DIRS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<PathBuf>,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    pub dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Effective configuration, built once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildmendConfig {
    pub project: ProjectConfig,
    pub build: BuildConfig,
    pub service: ServiceConfig,
    pub watch: WatchConfig,
    pub retry: RetryPolicy,
    pub log: LogConfig,
    pub report: ReportConfig,
}

impl BuildmendConfig {
    /// Load from an optional TOML file and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let text = match file {
            Some(path) => Some(std::fs::read_to_string(path)?),
            None => None,
        };
        Ok(Self::from_sources(text.as_deref(), |key| {
            std::env::var(key).ok()
        })?)
    }

    /// Merge defaults, `file_text` and `env`, then validate.
    pub fn from_sources<F>(file_text: Option<&str>, env: F) -> std::result::Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: BuildmendConfig = match file_text {
            Some(text) => toml::from_str(text)?,
            None => BuildmendConfig::default(),
        };
        config.apply_env(|key| env(key).filter(|v| !v.trim().is_empty()))?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, env: F) -> std::result::Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("BUILDMEND_PROJECT_PATH") {
            self.project.path = PathBuf::from(v);
        }
        if let Some(v) = env("BUILDMEND_PROJECT_NAME") {
            self.project.name = Some(v);
        }
        if let Some(v) = env("BUILDMEND_SCHEME") {
            self.project.scheme = Some(v);
        }
        if let Some(v) = env("BUILDMEND_CONFIGURATION") {
            self.project.configuration = v;
        }
        if let Some(v) = env("BUILDMEND_DERIVED_DATA_PATH") {
            self.project.derived_data_path = Some(PathBuf::from(v));
        }

        if let Some(v) = env("BUILDMEND_BUILD_COMMAND") {
            self.build.command = Some(v);
        }
        if let Some(v) = env("BUILDMEND_CLEAN_COMMAND") {
            self.build.clean_command = Some(v);
        }
        if let Some(v) = env("BUILDMEND_BUILD_TIMEOUT_SECS") {
            self.build.timeout_secs = parse_number("BUILDMEND_BUILD_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = env("BUILDMEND_ERROR_MARKER") {
            self.build.error_marker = v;
        }

        if let Some(v) = env("BUILDMEND_API_URL") {
            self.service.base_url = v;
        }
        if let Some(v) = env("BUILDMEND_API_KEY") {
            self.service.api_key = v;
        }
        if let Some(v) = env("BUILDMEND_API_TIMEOUT_SECS") {
            self.service.timeout_secs = parse_number("BUILDMEND_API_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = env("BUILDMEND_PROJECT_TYPE") {
            self.service.project_type = v;
        }

        if let Some(v) = env("BUILDMEND_DEBOUNCE_MS") {
            self.watch.debounce_ms = parse_number("BUILDMEND_DEBOUNCE_MS", &v)?;
        }
        if let Some(v) = env("BUILDMEND_EXTENSIONS") {
            self.watch.extensions = split_list(&v);
        }
        if let Some(v) = env("BUILDMEND_EXCLUDED_DIRS") {
            self.watch.excluded_dirs = split_list(&v);
        }

        if let Some(v) = env("BUILDMEND_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_number("BUILDMEND_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = env("BUILDMEND_RETRY_DELAY_MS") {
            self.retry.delay_ms = parse_number("BUILDMEND_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = env("BUILDMEND_RETRY_BACKOFF") {
            self.retry.backoff = match v.trim().to_lowercase().as_str() {
                "fixed" => Backoff::Fixed,
                "exponential" => Backoff::Exponential,
                other => {
                    return Err(ConfigError::invalid(
                        "BUILDMEND_RETRY_BACKOFF",
                        format!("expected `fixed` or `exponential`, got `{other}`"),
                    ))
                }
            };
        }

        if let Some(v) = env("BUILDMEND_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = env("BUILDMEND_LOG_FILE") {
            self.log.file = Some(PathBuf::from(v));
        }
        if let Some(v) = env("BUILDMEND_LOG_JSON") {
            self.log.json = parse_bool("BUILDMEND_LOG_JSON", &v)?;
        }

        if let Some(v) = env("BUILDMEND_REPORT_DIR") {
            self.report.dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.project.path.as_os_str().is_empty() {
            missing.push("project.path (BUILDMEND_PROJECT_PATH)");
        }
        if self.build.command.is_none() {
            if self.project.name.is_none() {
                missing.push("project.name (BUILDMEND_PROJECT_NAME)");
            }
            if self.project.scheme.is_none() {
                missing.push("project.scheme (BUILDMEND_SCHEME)");
            }
        }
        if self.service.base_url.trim().is_empty() {
            missing.push("service.base_url (BUILDMEND_API_URL)");
        }
        if self.service.api_key.trim().is_empty() {
            missing.push("service.api_key (BUILDMEND_API_KEY)");
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys(
                missing.into_iter().map(str::to_string).collect(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if let Some(command) = &self.build.command {
            if command.split_whitespace().next().is_none() {
                return Err(ConfigError::invalid("build.command", "must not be blank"));
            }
        }
        if self.build.error_marker.is_empty() {
            return Err(ConfigError::invalid("build.error_marker", "must not be empty"));
        }
        if self.watch.extensions.is_empty() {
            return Err(ConfigError::invalid("watch.extensions", "must list at least one extension"));
        }
        self.log_level()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Derived values
    // -----------------------------------------------------------------------

    pub fn log_level(&self) -> std::result::Result<Level, ConfigError> {
        self.log
            .level
            .trim()
            .parse::<Level>()
            .map_err(|e| ConfigError::invalid("log.level", e.to_string()))
    }

    /// Custom command when configured, otherwise the xcodebuild template.
    pub fn build_command(&self) -> BuildCommand {
        let root = self.project.path.clone();
        match &self.build.command {
            Some(command) => BuildCommand::custom(
                root,
                split_command(command),
                self.build.clean_command.as_deref().map(split_command),
            ),
            None => BuildCommand::xcodebuild(
                root,
                self.project.name.as_deref().unwrap_or_default(),
                self.project.scheme.as_deref().unwrap_or_default(),
                &self.project.configuration,
                self.project.derived_data_path.as_deref(),
            ),
        }
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        (self.build.timeout_secs > 0).then(|| Duration::from_secs(self.build.timeout_secs))
    }

    pub fn path_filter(&self) -> PathFilter {
        PathFilter::new(
            self.project.path.clone(),
            &self.watch.extensions,
            &self.watch.excluded_dirs,
        )
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.watch.debounce_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service.timeout_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> std::result::Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, format!("`{value}`: {e}")))
}

fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("expected a boolean, got `{other}`"))),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
