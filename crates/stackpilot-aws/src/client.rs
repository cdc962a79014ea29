//! Base AWS client with SigV4 signing and retries.
//!
//! [`AwsClient`] turns an [`ApiRequest`] into a signed HTTP exchange. Every
//! attempt resolves credentials and signs again with a fresh timestamp, so a
//! retry after a long backoff never replays a stale signature. Failures are
//! classified into an [`ErrorKind`]; retryable kinds back off with capped
//! exponential delay and jitter, and running out of attempts yields
//! [`ErrorKind::RetryExhausted`] wrapping the last failure.

use crate::config::{AwsRegion, ClientConfig};
use crate::credentials::CachingCredentialResolver;
use crate::error::{AwsError, AwsResult, ErrorKind};
use crate::signing::{build_query_string, SigV4Signer, UnsignedRequest};
use crate::transport::{AwsResponse, HttpTransport, ReqwestTransport};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A logical API call before endpoint resolution and signing.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// Signing name of the service (e.g. "cloudcontrolapi").
    pub service: String,
    /// Operation name used in logs and errors.
    pub action: String,
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ApiRequest {
    /// A POST to `/` with no body.
    pub fn new(service: &str, action: &str) -> Self {
        Self {
            service: service.to_string(),
            action: action.to_string(),
            method: "POST".to_string(),
            path: "/".to_string(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// AWS JSON 1.0 call: `x-amz-target: <target_prefix>.<action>`.
    pub fn json<T: Serialize>(
        service: &str,
        target_prefix: &str,
        action: &str,
        input: &T,
    ) -> AwsResult<Self> {
        let body = serde_json::to_vec(input).map_err(|e| {
            AwsError::validation(service, &format!("failed to serialise {} input: {}", action, e))
        })?;
        Ok(Self::new(service, action)
            .header("content-type", "application/x-amz-json-1.0")
            .header("x-amz-target", &format!("{}.{}", target_prefix, action))
            .body(body))
    }

    /// AWS Query protocol call with a form-encoded body.
    pub fn query(service: &str, params: &BTreeMap<String, String>) -> Self {
        let action = params.get("Action").cloned().unwrap_or_default();
        Self::new(service, &action)
            .header(
                "content-type",
                "application/x-www-form-urlencoded; charset=utf-8",
            )
            .body(build_query_string(params).into_bytes())
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn query_param(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

/// Outcome of a dispatch including retry bookkeeping.
#[derive(Debug)]
pub struct DispatchReport<T> {
    pub result: AwsResult<T>,
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Backoff slept before each retry, in order.
    pub delays: Vec<Duration>,
}

impl<T> DispatchReport<T> {
    pub fn into_result(self) -> AwsResult<T> {
        self.result
    }
}

/// Base AWS client that handles signing, retries, and HTTP communication.
#[derive(Clone)]
pub struct AwsClient {
    transport: Arc<dyn HttpTransport>,
    credentials: Arc<CachingCredentialResolver>,
    config: ClientConfig,
}

impl std::fmt::Debug for AwsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AwsClient {
    /// Create a client that talks HTTP through `reqwest`.
    pub fn new(config: ClientConfig, credentials: Arc<CachingCredentialResolver>) -> AwsResult<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::with_transport(config, credentials, transport))
    }

    /// Create a client over a custom transport.
    pub fn with_transport(
        config: ClientConfig,
        credentials: Arc<CachingCredentialResolver>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            transport,
            credentials,
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn region(&self) -> &AwsRegion {
        &self.config.region
    }

    /// Get the region name.
    pub fn region_name(&self) -> &str {
        &self.config.region.name
    }

    pub fn credentials(&self) -> &Arc<CachingCredentialResolver> {
        &self.credentials
    }

    /// Get the base endpoint for a service.
    pub fn endpoint(&self, service: &str) -> String {
        match self.config.endpoint_url {
            Some(ref url) => url.trim_end_matches('/').to_string(),
            None => self.config.region.endpoint(service),
        }
    }

    /// Dispatch and decode a JSON response body.
    ///
    /// An empty 2xx body decodes to `{}`; malformed JSON is a non-retryable
    /// [`ErrorKind::Decode`] failure.
    pub async fn dispatch_json(&self, request: &ApiRequest) -> DispatchReport<Value> {
        let service = request.service.clone();
        self.dispatch_with(request, move |resp| decode_json_body(&service, resp))
            .await
    }

    /// Dispatch and return the raw 2xx response.
    pub async fn dispatch(&self, request: &ApiRequest) -> DispatchReport<AwsResponse> {
        self.dispatch_with(request, Ok).await
    }

    /// Dispatch a JSON call and deserialize the response into `T`.
    pub async fn call_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> AwsResult<T> {
        let value = self.dispatch_json(request).await.into_result()?;
        serde_json::from_value(value).map_err(|e| {
            AwsError::decode(
                &request.service,
                &format!("unexpected {} response shape: {}", request.action, e),
                200,
            )
            .with_action(&request.action)
        })
    }

    /// Execute a signed AWS Query API request (form-encoded body, XML response).
    pub async fn query_request(
        &self,
        service: &str,
        params: &BTreeMap<String, String>,
    ) -> AwsResult<AwsResponse> {
        self.dispatch(&ApiRequest::query(service, params))
            .await
            .into_result()
    }

    /// Run the retry loop, applying `decode` to each 2xx response.
    pub async fn dispatch_with<T, F>(&self, request: &ApiRequest, decode: F) -> DispatchReport<T>
    where
        F: Fn(AwsResponse) -> AwsResult<T>,
    {
        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut delays = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let error = match self.execute_signed(request).await.and_then(&decode) {
                Ok(value) => {
                    return DispatchReport {
                        result: Ok(value),
                        attempts: attempt,
                        delays,
                    }
                }
                Err(e) => e.with_action(&request.action).with_attempts(attempt),
            };

            if !error.retryable() {
                log::debug!(
                    "AWS {} {} failed with non-retryable {} error: {}",
                    request.service,
                    request.action,
                    error.kind,
                    error.code
                );
                return DispatchReport {
                    result: Err(error),
                    attempts: attempt,
                    delays,
                };
            }

            if attempt >= max_attempts {
                log::warn!(
                    "AWS {} {} giving up after {} attempts: {}",
                    request.service,
                    request.action,
                    attempt,
                    error.code
                );
                return DispatchReport {
                    result: Err(AwsError::retry_exhausted(error, attempt)),
                    attempts: attempt,
                    delays,
                };
            }

            let delay = retry.backoff(attempt - 1);
            log::warn!(
                "AWS {} {} retryable error (attempt {}/{}): {} - retrying in {}ms",
                request.service,
                request.action,
                attempt,
                max_attempts,
                error.code,
                delay.as_millis()
            );
            delays.push(delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Resolve credentials, sign with the current time, and send once.
    async fn execute_signed(&self, request: &ApiRequest) -> AwsResult<AwsResponse> {
        let credentials = self.credentials.get().await?;

        let unsigned = UnsignedRequest {
            method: request.method.clone(),
            endpoint: self.endpoint(&request.service),
            path: request.path.clone(),
            query: request.query.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        };
        let signer = SigV4Signer::new(&request.service, self.region_name());
        let signed = signer.sign(unsigned, &credentials, Utc::now())?;

        let response = self.transport.send(&signed).await?;
        if response.is_success() {
            return Ok(response);
        }

        let mut error = AwsError::parse_error_body(&request.service, response.status, &response.body);
        if error.request_id.is_none() {
            error.request_id = response.request_id();
        }
        if error.kind == ErrorKind::Authentication {
            // Let the next call pick up fresh credentials.
            self.credentials.invalidate(&credentials).await;
        }
        Err(error)
    }
}

fn decode_json_body(service: &str, response: AwsResponse) -> AwsResult<Value> {
    if response.body.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(&response.body).map_err(|e| {
        let mut err = AwsError::decode(
            service,
            &format!("malformed JSON response: {}", e),
            response.status,
        );
        err.request_id = response.request_id();
        err
    })
}

/// Helper to build Query API parameters with common fields.
pub fn build_query_params(action: &str, version: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("Action".to_string(), action.to_string());
    params.insert("Version".to_string(), version.to_string());
    params
}

/// Simple XML value extractor for AWS responses.
pub fn xml_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml_unescape(&xml[start..start + end]))
}

/// Extract an XML block (including nested content) for a given tag.
pub fn xml_block(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)?;
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end + close.len()].to_string())
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
