//! Region handling, retry policy, and client settings.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Regions ─────────────────────────────────────────────────────────────

/// All standard AWS regions as of 2025.
pub const AWS_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "af-south-1",
    "ap-east-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-northeast-3",
    "ca-central-1",
    "ca-west-1",
    "eu-central-1",
    "eu-central-2",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "eu-south-1",
    "eu-south-2",
    "eu-north-1",
    "il-central-1",
    "me-south-1",
    "me-central-1",
    "sa-east-1",
    // GovCloud
    "us-gov-east-1",
    "us-gov-west-1",
    // China
    "cn-north-1",
    "cn-northwest-1",
];

/// AWS region configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwsRegion {
    /// Region code (e.g., "us-east-1").
    pub name: String,
}

impl AwsRegion {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Return the service endpoint for a given service in this region.
    /// Follows the standard pattern `https://{service}.{region}.{url_suffix}`.
    pub fn endpoint(&self, service: &str) -> String {
        match service {
            "iam" => "https://iam.amazonaws.com".to_string(),
            "sts" if self.name == "us-east-1" => "https://sts.amazonaws.com".to_string(),
            _ => format!("https://{}.{}.{}", service, self.name, self.url_suffix()),
        }
    }

    /// Check if this is a known AWS region.
    pub fn is_valid(&self) -> bool {
        AWS_REGIONS.contains(&self.name.as_str())
    }

    /// Return the partition for this region (aws, aws-cn, aws-us-gov).
    pub fn partition(&self) -> &str {
        if self.name.starts_with("cn-") {
            "aws-cn"
        } else if self.name.starts_with("us-gov-") {
            "aws-us-gov"
        } else {
            "aws"
        }
    }

    /// Domain suffix used by endpoints in this region's partition.
    pub fn url_suffix(&self) -> &str {
        if self.name.starts_with("cn-") {
            "amazonaws.com.cn"
        } else {
            "amazonaws.com"
        }
    }
}

impl Default for AwsRegion {
    fn default() -> Self {
        Self {
            name: "us-east-1".to_string(),
        }
    }
}

// ── Retry Configuration ─────────────────────────────────────────────────

/// Retry policy for the dispatcher.
///
/// The delay before retry `n` (0-based) is
/// `min(max_delay, base_delay * 2^n) * random(0.5..1.0)`; with `jitter`
/// disabled the random factor is 1.0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one (default: 3).
    pub max_attempts: u32,
    /// Base backoff in milliseconds (default: 500).
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds (default: 20_000).
    pub max_delay_ms: u64,
    /// Apply the random(0.5..1.0) factor.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 20_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Capped exponential delay before retry `attempt`, without jitter.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(exponential.min(self.max_delay_ms))
    }

    /// Delay before retry `attempt`, with jitter when enabled.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if !self.jitter {
            return capped;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.0);
        capped.mul_f64(factor)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            ));
        }
        Ok(())
    }
}

// ── Client Config ───────────────────────────────────────────────────────

/// Behavioural settings for a [`crate::client::AwsClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub region: AwsRegion,
    pub retry: RetryConfig,
    /// Custom endpoint URL (for LocalStack and similar).
    pub endpoint_url: Option<String>,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    pub user_agent: String,
}

impl ClientConfig {
    pub fn new(region: AwsRegion) -> Self {
        Self {
            region,
            retry: RetryConfig::default(),
            endpoint_url: None,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            user_agent: format!("stackpilot/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_endpoint(mut self, endpoint_url: Option<String>) -> Self {
        self.endpoint_url = endpoint_url;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(AwsRegion::default())
    }
}
