//! Credential resolution.
//!
//! A [`CredentialProvider`] knows how to obtain one set of credentials:
//! static keys, the process environment, the shared `~/.aws` files, or an STS
//! `AssumeRole` exchange. [`ChainProvider`] tries several in order, and
//! [`CachingCredentialResolver`] sits in front of any provider so concurrent
//! signers share one cached set and at most one refresh runs at a time.

use crate::error::{AwsError, AwsResult};
use crate::sts::{AssumeRoleInput, StsClient};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

// ── Credentials ─────────────────────────────────────────────────────────

/// AWS access credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsCredentials {
    /// Access key ID (starts with AKIA for long-term, ASIA for temporary).
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Present for temporary credentials issued by STS.
    pub session_token: Option<String>,
    /// None for long-term IAM credentials.
    pub expiration: Option<DateTime<Utc>>,
    /// Provider name for debugging.
    pub provider_name: Option<String>,
}

impl AwsCredentials {
    /// Create new long-term credentials.
    pub fn new(access_key_id: &str, secret_access_key: &str) -> Self {
        Self {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            session_token: None,
            expiration: None,
            provider_name: Some("static".to_string()),
        }
    }

    /// Create temporary credentials with a session token.
    pub fn new_temporary(
        access_key_id: &str,
        secret_access_key: &str,
        session_token: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            session_token: Some(session_token.to_string()),
            expiration,
            provider_name: Some("sts".to_string()),
        }
    }

    fn with_provider(mut self, name: &str) -> Self {
        self.provider_name = Some(name.to_string());
        self
    }

    /// Check if these credentials have expired.
    pub fn is_expired(&self) -> bool {
        self.expires_within(Duration::zero())
    }

    /// True when the credentials expire within `buffer` from now.
    pub fn expires_within(&self, buffer: Duration) -> bool {
        match self.expiration {
            Some(exp) => Utc::now() + buffer >= exp,
            None => false,
        }
    }

    /// Check if credentials are temporary (have a session token).
    pub fn is_temporary(&self) -> bool {
        self.session_token.is_some()
    }

    /// Resolve credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`
    /// and `AWS_SESSION_TOKEN`.
    pub fn from_environment() -> Option<Self> {
        let access_key = non_empty_env("AWS_ACCESS_KEY_ID")?;
        let secret_key = non_empty_env("AWS_SECRET_ACCESS_KEY")?;
        Some(Self {
            access_key_id: access_key,
            secret_access_key: secret_key,
            session_token: non_empty_env("AWS_SESSION_TOKEN"),
            expiration: None,
            provider_name: Some("environment".to_string()),
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

// ── Provider trait ──────────────────────────────────────────────────────

/// A source of credentials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn provide_credentials(&self) -> AwsResult<AwsCredentials>;
}

/// Fixed credentials.
#[derive(Debug, Clone)]
pub struct StaticProvider {
    credentials: AwsCredentials,
}

impl StaticProvider {
    pub fn new(credentials: AwsCredentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialProvider for StaticProvider {
    async fn provide_credentials(&self) -> AwsResult<AwsCredentials> {
        Ok(self.credentials.clone())
    }
}

/// Credentials from the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentProvider;

#[async_trait]
impl CredentialProvider for EnvironmentProvider {
    async fn provide_credentials(&self) -> AwsResult<AwsCredentials> {
        AwsCredentials::from_environment().ok_or_else(|| {
            AwsError::credential_error(
                "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY are not both set",
            )
        })
    }
}

// ── Shared profile files ────────────────────────────────────────────────

/// Settings of one named profile, merged from the credentials and config files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileSection {
    pub name: String,
    pub values: BTreeMap<String, String>,
}

impl ProfileSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn region(&self) -> Option<&str> {
        self.get("region")
    }

    pub fn role_arn(&self) -> Option<&str> {
        self.get("role_arn")
    }

    fn credentials(&self) -> Option<AwsCredentials> {
        let access_key = self.get("aws_access_key_id")?;
        let secret_key = self.get("aws_secret_access_key")?;
        let creds = match self.get("aws_session_token") {
            Some(token) => AwsCredentials::new_temporary(access_key, secret_key, token, None),
            None => AwsCredentials::new(access_key, secret_key),
        };
        Some(creds.with_provider(&format!("profile:{}", self.name)))
    }
}

/// Credentials from `~/.aws/credentials` and `~/.aws/config`.
///
/// Honours `AWS_SHARED_CREDENTIALS_FILE`, `AWS_CONFIG_FILE` and
/// `AWS_PROFILE`. Keys in the credentials file win over the config file.
#[derive(Debug, Clone)]
pub struct ProfileProvider {
    profile: String,
    credentials_file: Option<PathBuf>,
    config_file: Option<PathBuf>,
}

impl ProfileProvider {
    /// Use `profile`, else `AWS_PROFILE`, else `default`.
    pub fn new(profile: Option<&str>) -> Self {
        let profile = profile
            .map(|p| p.to_string())
            .or_else(|| non_empty_env("AWS_PROFILE"))
            .unwrap_or_else(|| "default".to_string());
        Self {
            profile,
            credentials_file: non_empty_env("AWS_SHARED_CREDENTIALS_FILE")
                .map(PathBuf::from)
                .or_else(|| aws_dir_file("credentials")),
            config_file: non_empty_env("AWS_CONFIG_FILE")
                .map(PathBuf::from)
                .or_else(|| aws_dir_file("config")),
        }
    }

    /// Read from explicit file locations.
    pub fn with_files(mut self, credentials_file: Option<PathBuf>, config_file: Option<PathBuf>) -> Self {
        self.credentials_file = credentials_file;
        self.config_file = config_file;
        self
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Load and merge the profile from both files.
    pub async fn load_profile(&self) -> AwsResult<ProfileSection> {
        let mut section = ProfileSection {
            name: self.profile.clone(),
            values: BTreeMap::new(),
        };
        let mut found = false;

        // In the config file non-default profiles are written `[profile name]`.
        if let Some(content) = read_optional(self.config_file.as_ref()).await? {
            let sections = parse_ini(&content);
            let key = if self.profile == "default" {
                "default".to_string()
            } else {
                format!("profile {}", self.profile)
            };
            if let Some(values) = sections.get(&key).or_else(|| sections.get(&self.profile)) {
                section.values.extend(values.clone());
                found = true;
            }
        }

        if let Some(content) = read_optional(self.credentials_file.as_ref()).await? {
            if let Some(values) = parse_ini(&content).remove(&self.profile) {
                section.values.extend(values);
                found = true;
            }
        }

        if !found {
            return Err(AwsError::credential_error(&format!(
                "profile '{}' not found in shared config files",
                self.profile
            )));
        }
        Ok(section)
    }
}

#[async_trait]
impl CredentialProvider for ProfileProvider {
    async fn provide_credentials(&self) -> AwsResult<AwsCredentials> {
        let section = self.load_profile().await?;
        section.credentials().ok_or_else(|| {
            AwsError::credential_error(&format!(
                "profile '{}' has no aws_access_key_id / aws_secret_access_key",
                self.profile
            ))
        })
    }
}

fn aws_dir_file(name: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".aws").join(name))
}

async fn read_optional(path: Option<&PathBuf>) -> AwsResult<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AwsError::credential_error(&format!(
            "failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Parse the INI dialect used by the shared AWS files.
pub fn parse_ini(content: &str) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1]
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        if let (Some(section), Some((key, value))) = (current.as_ref(), line.split_once('=')) {
            sections
                .entry(section.clone())
                .or_default()
                .insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }
    sections
}

// ── Assume role ─────────────────────────────────────────────────────────

/// Temporary credentials from STS `AssumeRole`.
///
/// The [`StsClient`] passed in signs with the source credentials.
pub struct AssumeRoleProvider {
    sts: StsClient,
    input: AssumeRoleInput,
}

impl AssumeRoleProvider {
    pub fn new(sts: StsClient, role_arn: &str) -> Self {
        Self {
            sts,
            input: AssumeRoleInput {
                role_arn: role_arn.to_string(),
                role_session_name: format!("stackpilot-{}", Utc::now().timestamp()),
                duration_seconds: None,
                external_id: None,
            },
        }
    }

    pub fn with_session_name(mut self, name: &str) -> Self {
        self.input.role_session_name = name.to_string();
        self
    }

    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.input.external_id = Some(external_id.to_string());
        self
    }

    pub fn with_duration(mut self, seconds: u32) -> Self {
        self.input.duration_seconds = Some(seconds);
        self
    }
}

#[async_trait]
impl CredentialProvider for AssumeRoleProvider {
    async fn provide_credentials(&self) -> AwsResult<AwsCredentials> {
        log::debug!("Assuming role {}", self.input.role_arn);
        let output = self.sts.assume_role(&self.input).await?;
        let creds = output.credentials;
        let expiration = DateTime::parse_from_rfc3339(&creds.expiration)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                AwsError::decode(
                    "sts",
                    &format!("invalid credential expiration '{}': {}", creds.expiration, e),
                    200,
                )
            })?;
        Ok(AwsCredentials::new_temporary(
            &creds.access_key_id,
            &creds.secret_access_key,
            &creds.session_token,
            Some(expiration),
        )
        .with_provider("assume-role"))
    }
}

// ── Chain ───────────────────────────────────────────────────────────────

/// Tries each provider in order and returns the first success.
pub struct ChainProvider {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl ChainProvider {
    pub fn new(providers: Vec<Arc<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }

    /// Environment first, then the shared profile files.
    pub fn default_chain(profile: Option<&str>) -> Self {
        Self::new(vec![
            Arc::new(EnvironmentProvider),
            Arc::new(ProfileProvider::new(profile)),
        ])
    }
}

#[async_trait]
impl CredentialProvider for ChainProvider {
    async fn provide_credentials(&self) -> AwsResult<AwsCredentials> {
        let mut failures = Vec::new();
        for provider in &self.providers {
            match provider.provide_credentials().await {
                Ok(creds) => return Ok(creds),
                Err(e) => {
                    log::debug!("Credential provider skipped: {}", e.message);
                    failures.push(e.message);
                }
            }
        }
        Err(AwsError::credential_error(&format!(
            "no credential provider succeeded: {}",
            failures.join("; ")
        )))
    }
}

// ── Caching resolver ────────────────────────────────────────────────────

/// Caches credentials from an inner provider and refreshes them before expiry.
///
/// Reads take the `RwLock` concurrently. A refresh holds `refresh_lock` and
/// re-checks the cache after acquiring it, so concurrent callers that all
/// saw stale credentials trigger a single provider call.
pub struct CachingCredentialResolver {
    provider: Arc<dyn CredentialProvider>,
    cached: RwLock<Option<AwsCredentials>>,
    refresh_lock: Mutex<()>,
    refresh_buffer: Duration,
    refreshes: AtomicU64,
}

impl CachingCredentialResolver {
    /// Wrap `provider` with the default five-minute refresh buffer.
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            cached: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refresh_buffer: Duration::minutes(5),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    /// Return cached credentials, refreshing them if missing or about to expire.
    pub async fn get(&self) -> AwsResult<AwsCredentials> {
        if let Some(creds) = self.fresh_cached().await {
            return Ok(creds);
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(creds) = self.fresh_cached().await {
            return Ok(creds);
        }

        let creds = self.provider.provide_credentials().await?;
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        log::debug!(
            "Refreshed credentials from {}",
            creds.provider_name.as_deref().unwrap_or("provider")
        );
        *self.cached.write().await = Some(creds.clone());
        Ok(creds)
    }

    /// Drop `stale` from the cache if it is still the cached set.
    ///
    /// Callers that saw the same rejected credentials invalidate once; a set
    /// already replaced by another caller's refresh is kept.
    pub async fn invalidate(&self, stale: &AwsCredentials) {
        let mut cached = self.cached.write().await;
        if let Some(current) = cached.as_ref() {
            if current.access_key_id == stale.access_key_id
                && current.session_token == stale.session_token
            {
                *cached = None;
            }
        }
    }

    /// Drop whatever is cached.
    pub async fn clear(&self) {
        *self.cached.write().await = None;
    }

    /// Number of times the inner provider has been called successfully.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    async fn fresh_cached(&self) -> Option<AwsCredentials> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|c| !c.expires_within(self.refresh_buffer))
            .cloned()
    }
}

#[async_trait]
impl CredentialProvider for CachingCredentialResolver {
    async fn provide_credentials(&self) -> AwsResult<AwsCredentials> {
        self.get().await
    }
}
