//! HTTP transport seam.
//!
//! The dispatcher hands a [`SignedRequest`] to an [`HttpTransport`] and gets
//! back status, headers and body. [`ReqwestTransport`] is the production
//! implementation; [`ScriptedTransport`] replays canned responses so retry,
//! pagination and provisioning logic can run without a network.

use crate::config::ClientConfig;
use crate::error::{AwsError, AwsResult};
use crate::signing::SignedRequest;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Response from an AWS API call.
#[derive(Debug, Clone, Default)]
pub struct AwsResponse {
    pub status: u16,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl AwsResponse {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Request id from `x-amzn-requestid` or `x-amz-request-id`.
    pub fn request_id(&self) -> Option<String> {
        self.headers
            .get("x-amzn-requestid")
            .or_else(|| self.headers.get("x-amz-request-id"))
            .cloned()
    }
}

/// Sends one signed request. Implementations must not retry.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &SignedRequest) -> AwsResult<AwsResponse>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
    user_agent: String,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> AwsResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| AwsError::configuration(&format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            user_agent: config.user_agent.clone(),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &SignedRequest) -> AwsResult<AwsResponse> {
        let method: reqwest::Method = request.method().parse().map_err(|_| {
            AwsError::configuration(&format!("invalid HTTP method: {}", request.method()))
        })?;

        let mut req = self.http.request(method, request.url());
        for (key, value) in request.headers() {
            // reqwest derives Host from the URL.
            if key == "host" {
                continue;
            }
            req = req.header(key.as_str(), value.as_str());
        }
        req = req.header("user-agent", &self.user_agent);
        if !request.body().is_empty() {
            req = req.body(request.body().to_vec());
        }

        let resp = req.send().await.map_err(|e| {
            let mut err = AwsError::from(e);
            err.service = request.service().to_string();
            err
        })?;

        let status = resp.status().as_u16();
        let mut headers = BTreeMap::new();
        for (key, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(key.as_str().to_lowercase(), v.to_string());
            }
        }
        let body = resp.text().await.map_err(AwsError::from)?;

        Ok(AwsResponse {
            status,
            headers,
            body,
        })
    }
}

/// Replays a fixed sequence of outcomes and records every request it sees.
///
/// Once the script runs out every further call fails with a non-retryable
/// client error.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<AwsResult<AwsResponse>>>,
    seen: Mutex<Vec<SignedRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<AwsResult<AwsResponse>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Append another outcome.
    pub fn push(&self, outcome: AwsResult<AwsResponse>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    /// Number of requests sent so far.
    pub fn calls(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Copies of the requests sent so far.
    pub fn requests(&self) -> Vec<SignedRequest> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &SignedRequest) -> AwsResult<AwsResponse> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| {
            Err(AwsError::with_kind(
                crate::error::ErrorKind::Client,
                request.service(),
                "ScriptExhausted",
                "no scripted response left",
                0,
            ))
        })
    }
}
