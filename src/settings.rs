//! # Settings
//!
//! Deployment settings are read from a JSON or YAML file and then overlaid
//! with environment variables. Every field has a default, so an empty file
//! (or no file) is a valid configuration.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `STACKPILOT_REGION`, else `AWS_REGION`, else `AWS_DEFAULT_REGION` | `region` |
//! | `AWS_PROFILE` | `profile` |
//! | `STACKPILOT_ENDPOINT_URL` | `endpoint_url` |
//! | `STACKPILOT_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `STACKPILOT_MAX_CONCURRENCY` | `max_concurrency` |
//! | `STACKPILOT_LOG` | `log_level` |

use crate::error::{StackpilotError, StackpilotResult};
use serde::{Deserialize, Serialize};
use stackpilot_aws::{AwsRegion, ClientConfig, RetryConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub region: String,
    /// Shared-config profile; `None` means `default`.
    pub profile: Option<String>,
    /// Role to assume on top of the base credentials.
    pub role_arn: Option<String>,
    /// Custom endpoint URL (for LocalStack and similar).
    pub endpoint_url: Option<String>,
    pub stack_name: String,
    pub retry: RetryConfig,
    pub max_concurrency: usize,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Interval between Cloud Control status checks.
    pub poll_interval_ms: u64,
    pub max_polls: u32,
    /// Where `<stack>.json` state files live.
    pub state_dir: PathBuf,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            profile: None,
            role_arn: None,
            endpoint_url: None,
            stack_name: "stackpilot".to_string(),
            retry: RetryConfig::default(),
            max_concurrency: 4,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            poll_interval_ms: 2_000,
            max_polls: 900,
            state_dir: default_state_dir(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("stackpilot").join("state"))
        .unwrap_or_else(|| PathBuf::from(".stackpilot"))
}

impl Settings {
    /// Parse a settings file; `.json` as JSON, anything else as YAML.
    pub async fn load(path: &Path) -> StackpilotResult<Self> {
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StackpilotError::io(&format!("cannot read {}", path.display()), e))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str(&body).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&body).map_err(|e| e.to_string())
        };
        parsed.map_err(|e| {
            StackpilotError::configuration(format!("invalid settings in {}: {}", path.display(), e))
        })
    }

    /// Load `path` when given (defaults otherwise), apply the environment
    /// and validate.
    pub async fn resolve(path: Option<&Path>) -> StackpilotResult<Self> {
        let mut settings = match path {
            Some(p) => Self::load(p).await?,
            None => Self::default(),
        };
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Overlay values from the environment.
    pub fn apply_env(&mut self) -> StackpilotResult<()> {
        if let Some(region) = ["STACKPILOT_REGION", "AWS_REGION", "AWS_DEFAULT_REGION"]
            .iter()
            .find_map(|k| non_empty_var(k))
        {
            self.region = region;
        }
        if let Some(profile) = non_empty_var("AWS_PROFILE") {
            self.profile = Some(profile);
        }
        if let Some(url) = non_empty_var("STACKPILOT_ENDPOINT_URL") {
            self.endpoint_url = Some(url);
        }
        if let Some(raw) = non_empty_var("STACKPILOT_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_var("STACKPILOT_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = non_empty_var("STACKPILOT_MAX_CONCURRENCY") {
            self.max_concurrency = parse_var("STACKPILOT_MAX_CONCURRENCY", &raw)?;
        }
        if let Some(level) = non_empty_var("STACKPILOT_LOG") {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> StackpilotResult<()> {
        self.retry.validate().map_err(StackpilotError::configuration)?;
        if self.max_concurrency == 0 {
            return Err(StackpilotError::configuration("max_concurrency must be at least 1"));
        }
        if self.region.trim().is_empty() {
            return Err(StackpilotError::configuration("region must not be empty"));
        }
        if self.stack_name.trim().is_empty() {
            return Err(StackpilotError::configuration("stack_name must not be empty"));
        }
        if !AwsRegion::new(&self.region).is_valid() {
            log::warn!("'{}' is not a known region; continuing", self.region);
        }
        Ok(())
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(AwsRegion::new(&self.region))
            .with_retry(self.retry.clone())
            .with_endpoint(self.endpoint_url.clone());
        config.request_timeout_secs = self.request_timeout_secs;
        config.connect_timeout_secs = self.connect_timeout_secs;
        config
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> StackpilotResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| StackpilotError::configuration(format!("{} has invalid value '{}'", key, raw)))
}
