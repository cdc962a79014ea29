//! Error types for signed control-plane calls.
//!
//! Every failure the dispatcher can observe is folded into a single
//! [`AwsError`] carrying an [`ErrorKind`]. The kind decides retry behaviour:
//! throttling, transient network failures, and 5xx responses are retried with
//! backoff; everything else surfaces on the first attempt. When retries run
//! out the last failure is wrapped in an [`ErrorKind::RetryExhausted`] error so
//! callers can tell "gave up" apart from "rejected outright".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Dangling or circular dependency, duplicate resource, bad settings.
    Configuration,
    /// Signature rejected, expired or missing credential.
    Authentication,
    /// Explicit throttling response.
    Throttling,
    /// Connection reset, DNS failure, timeout.
    TransientNetwork,
    /// 5xx or an internal-failure code from the remote service.
    ServiceUnavailable,
    /// The remote service rejected the payload shape.
    Validation,
    /// Any other 4xx.
    Client,
    /// A success status with a body that could not be decoded.
    Decode,
    /// Wraps the last retryable failure once attempts are exhausted.
    RetryExhausted,
    /// The caller cancelled the operation.
    Cancelled,
    /// An asynchronous resource operation reported a terminal failure.
    ResourceFailed,
}

impl ErrorKind {
    /// Whether the dispatcher retries this kind with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Throttling | ErrorKind::TransientNetwork | ErrorKind::ServiceUnavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Throttling => "throttling",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Validation => "validation",
            ErrorKind::Client => "client",
            ErrorKind::Decode => "decode",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ResourceFailed => "resource_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottledException",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "BandwidthLimitExceeded",
    "RequestThrottled",
    "SlowDown",
    "EC2ThrottledException",
    "PriorRequestNotComplete",
];

/// Hard quota errors. Waiting does not lift them.
const QUOTA_CODES: &[&str] = &[
    "LimitExceededException",
    "LimitExceeded",
    "ServiceQuotaExceededException",
    "ServiceLimitExceeded",
];

const TRANSIENT_CODES: &[&str] = &[
    "InternalError",
    "InternalFailure",
    "InternalServerError",
    "InternalServiceError",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "RequestTimeout",
    "RequestTimeoutException",
    "IDPCommunicationError",
    "TransactionInProgressException",
];

const AUTHENTICATION_CODES: &[&str] = &[
    "ExpiredToken",
    "ExpiredTokenException",
    "RequestExpired",
    "InvalidClientTokenId",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "InvalidSignatureException",
    "IncompleteSignature",
    "UnrecognizedClientException",
    "MissingAuthenticationToken",
    "MissingAuthenticationTokenException",
    "AuthFailure",
    "AccessDenied",
    "AccessDeniedException",
    "NotAuthorized",
];

const VALIDATION_CODES: &[&str] = &[
    "ValidationException",
    "ValidationError",
    "InvalidRequest",
    "InvalidRequestException",
    "InvalidInput",
    "InvalidParameter",
    "InvalidParameterValue",
    "InvalidParameterValueException",
    "InvalidParameterException",
    "InvalidParameterCombination",
    "MissingParameter",
    "MalformedPolicyDocument",
    "TypeNotFoundException",
];

/// Top-level error type for all control-plane operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsError {
    pub kind: ErrorKind,
    /// The service error code (e.g. "ThrottlingException"), or a local code.
    pub code: String,
    pub message: String,
    /// HTTP status, 0 when no response was received.
    pub status_code: u16,
    pub request_id: Option<String>,
    /// The service that produced the error (e.g. "cloudcontrolapi", "sts").
    pub service: String,
    pub action: Option<String>,
    /// Attempts made before this error surfaced.
    pub attempts: u32,
    /// For [`ErrorKind::RetryExhausted`]: the last observed failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AwsError>>,
}

impl fmt::Display for AwsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AWS {} {} error [{}]: {}",
            self.service, self.kind, self.code, self.message
        )?;
        if self.status_code != 0 {
            write!(f, " (HTTP {})", self.status_code)?;
        }
        if let Some(ref req_id) = self.request_id {
            write!(f, " [RequestId: {}]", req_id)?;
        }
        if let Some(ref cause) = self.cause {
            write!(f, " after {} attempts; last error: {}", self.attempts, cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for AwsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl AwsError {
    /// Create an error from a service code and HTTP status, classifying it.
    pub fn new(service: &str, code: &str, message: &str, status_code: u16) -> Self {
        Self::with_kind(
            Self::classify(code, status_code),
            service,
            code,
            message,
            status_code,
        )
    }

    /// Create an error with an explicit kind.
    pub fn with_kind(
        kind: ErrorKind,
        service: &str,
        code: &str,
        message: &str,
        status_code: u16,
    ) -> Self {
        Self {
            kind,
            code: code.to_string(),
            message: message.to_string(),
            status_code,
            request_id: None,
            service: service.to_string(),
            action: None,
            attempts: 1,
            cause: None,
        }
    }

    /// Build a configuration error (bad settings, invalid graph).
    pub fn configuration(message: &str) -> Self {
        Self::with_kind(
            ErrorKind::Configuration,
            "stackpilot",
            "ConfigurationError",
            message,
            0,
        )
    }

    /// Build a credential resolution error.
    pub fn credential_error(message: &str) -> Self {
        Self::with_kind(
            ErrorKind::Authentication,
            "credentials",
            "CredentialError",
            message,
            0,
        )
    }

    /// Build a validation error.
    pub fn validation(service: &str, message: &str) -> Self {
        Self::with_kind(ErrorKind::Validation, service, "ValidationError", message, 400)
    }

    /// Build a transport-level error that never produced a response.
    pub fn transient(service: &str, message: &str) -> Self {
        Self::with_kind(ErrorKind::TransientNetwork, service, "HttpError", message, 0)
    }

    /// Build a decode error for a success response that could not be parsed.
    pub fn decode(service: &str, message: &str, status_code: u16) -> Self {
        Self::with_kind(ErrorKind::Decode, service, "ParseError", message, status_code)
    }

    /// Build a cancellation error.
    pub fn cancelled(message: &str) -> Self {
        Self::with_kind(ErrorKind::Cancelled, "stackpilot", "Cancelled", message, 0)
    }

    /// Wrap the last retryable failure after `attempts` tries.
    pub fn retry_exhausted(last: AwsError, attempts: u32) -> Self {
        let mut err = Self::with_kind(
            ErrorKind::RetryExhausted,
            &last.service,
            "RetryExhausted",
            &format!("request failed after {} attempts", attempts),
            last.status_code,
        );
        err.request_id = last.request_id.clone();
        err.action = last.action.clone();
        err.attempts = attempts;
        err.cause = Some(Box::new(last));
        err
    }

    /// With request ID.
    pub fn with_request_id(mut self, id: String) -> Self {
        self.request_id = Some(id);
        self
    }

    /// With action.
    pub fn with_action(mut self, action: &str) -> Self {
        self.action = Some(action.to_string());
        self
    }

    /// With attempt count.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Whether the dispatcher should retry this failure.
    pub fn retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// The innermost error: the wrapped cause for retry exhaustion, else self.
    pub fn root_cause(&self) -> &AwsError {
        match self.cause {
            Some(ref cause) => cause.root_cause(),
            None => self,
        }
    }

    /// Map a service code and HTTP status onto an [`ErrorKind`].
    pub fn classify(code: &str, status_code: u16) -> ErrorKind {
        if QUOTA_CODES.contains(&code) {
            return ErrorKind::Client;
        }
        if status_code == 429 || THROTTLING_CODES.contains(&code) {
            return ErrorKind::Throttling;
        }
        if AUTHENTICATION_CODES.contains(&code) || status_code == 401 || status_code == 403 {
            return ErrorKind::Authentication;
        }
        if TRANSIENT_CODES.contains(&code) || status_code >= 500 {
            return ErrorKind::ServiceUnavailable;
        }
        if VALIDATION_CODES.contains(&code) {
            return ErrorKind::Validation;
        }
        ErrorKind::Client
    }

    /// Parse an AWS XML error response.
    ///
    /// AWS XML error format:
    /// ```xml
    /// <ErrorResponse>
    ///   <Error>
    ///     <Code>InvalidParameterValue</Code>
    ///     <Message>The filter ...</Message>
    ///   </Error>
    ///   <RequestId>abc-123</RequestId>
    /// </ErrorResponse>
    /// ```
    pub fn parse_xml_error(service: &str, status_code: u16, body: &str) -> Self {
        let code = crate::client::xml_text(body, "Code").unwrap_or_else(|| "UnknownError".to_string());
        let message = crate::client::xml_text(body, "Message")
            .unwrap_or_else(|| format!("HTTP {} from {}", status_code, service));
        let request_id = crate::client::xml_text(body, "RequestId")
            .or_else(|| crate::client::xml_text(body, "RequestID"));

        let mut err = Self::new(service, &code, &message, status_code);
        err.request_id = request_id;
        err
    }

    /// Parse an AWS JSON error response.
    ///
    /// AWS JSON error format:
    /// ```json
    /// {
    ///   "__type": "com.amazon.coral.validate#ValidationException",
    ///   "message": "1 validation error detected"
    /// }
    /// ```
    pub fn parse_json_error(service: &str, status_code: u16, body: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(val) => {
                let code = val
                    .get("__type")
                    .or_else(|| val.get("code"))
                    .or_else(|| val.get("Code"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.rsplit('#').next().unwrap_or(s).to_string())
                    .unwrap_or_else(|| "UnknownError".to_string());
                let message = val
                    .get("message")
                    .or_else(|| val.get("Message"))
                    .or_else(|| val.get("errorMessage"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown error")
                    .to_string();
                Self::new(service, &code, &message, status_code)
            }
            Err(_) => {
                let snippet: String = body.chars().take(200).collect();
                let message = if snippet.is_empty() {
                    format!("HTTP {} with empty body", status_code)
                } else {
                    snippet
                };
                Self::new(service, "UnknownError", &message, status_code)
            }
        }
    }

    /// Parse an error body in whichever format the service used.
    pub fn parse_error_body(service: &str, status_code: u16, body: &str) -> Self {
        if body.trim_start().starts_with('<') {
            Self::parse_xml_error(service, status_code, body)
        } else {
            Self::parse_json_error(service, status_code, body)
        }
    }
}

impl From<reqwest::Error> for AwsError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            ErrorKind::TransientNetwork
        } else if err.is_decode() {
            ErrorKind::Decode
        } else {
            ErrorKind::Client
        };
        Self::with_kind(
            kind,
            "http",
            "HttpError",
            &err.to_string(),
            err.status().map(|s| s.as_u16()).unwrap_or(0),
        )
    }
}

/// Convenience result type for control-plane operations.
pub type AwsResult<T> = Result<T, AwsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = AwsError::new("cloudcontrolapi", "ValidationException", "bad shape", 400);
        let s = err.to_string();
        assert!(s.contains("cloudcontrolapi"));
        assert!(s.contains("ValidationException"));
        assert!(s.contains("400"));
    }

    #[test]
    fn error_display_with_request_id() {
        let err = AwsError::new("sts", "ExpiredToken", "token expired", 403)
            .with_request_id("req-abc-123".into());
        assert!(err.to_string().contains("req-abc-123"));
    }

    #[test]
    fn parse_xml_error_basic() {
        let xml = r#"<ErrorResponse><Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error><RequestId>xyz-789</RequestId></ErrorResponse>"#;
        let err = AwsError::parse_xml_error("sts", 403, xml);
        assert_eq!(err.code, "AccessDenied");
        assert_eq!(err.message, "Access Denied");
        assert_eq!(err.request_id.as_deref(), Some("xyz-789"));
        assert_eq!(err.kind, ErrorKind::Authentication);
    }

    #[test]
    fn parse_json_error_strips_namespace() {
        let json = r#"{"__type":"com.amazon.coral.validate#ValidationException","message":"1 validation error detected"}"#;
        let err = AwsError::parse_json_error("cloudcontrolapi", 400, json);
        assert_eq!(err.code, "ValidationException");
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(!err.retryable());
    }

    #[test]
    fn quota_errors_are_not_retried() {
        let json = r#"{"__type":"LimitExceededException","message":"Maximum number of queues reached"}"#;
        let err = AwsError::parse_json_error("cloudcontrolapi", 400, json);
        assert_eq!(err.kind, ErrorKind::Client);
        assert!(!err.retryable());
        assert_eq!(AwsError::classify("RequestLimitExceeded", 400), ErrorKind::Throttling);
    }

    #[test]
    fn parse_json_error_unparseable_body() {
        let err = AwsError::parse_json_error("cloudcontrolapi", 502, "<<gateway>>");
        assert_eq!(err.code, "UnknownError");
        assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
    }

    #[test]
    fn throttling_is_retryable() {
        let err = AwsError::new("cloudcontrolapi", "ThrottlingException", "Rate exceeded", 400);
        assert_eq!(err.kind, ErrorKind::Throttling);
        assert!(err.retryable());
        assert_eq!(AwsError::classify("Anything", 429), ErrorKind::Throttling);
    }

    #[test]
    fn server_errors_are_retryable() {
        assert_eq!(AwsError::classify("UnknownError", 503), ErrorKind::ServiceUnavailable);
        assert_eq!(AwsError::classify("InternalFailure", 400), ErrorKind::ServiceUnavailable);
        assert!(ErrorKind::ServiceUnavailable.is_retryable());
    }

    #[test]
    fn auth_is_not_retryable() {
        let err = AwsError::new("sts", "SignatureDoesNotMatch", "bad sig", 403);
        assert_eq!(err.kind, ErrorKind::Authentication);
        assert!(!err.retryable());
        assert_eq!(AwsError::classify("Whatever", 401), ErrorKind::Authentication);
    }

    #[test]
    fn other_client_errors() {
        assert_eq!(AwsError::classify("ResourceNotFoundException", 404), ErrorKind::Client);
        assert!(!ErrorKind::Client.is_retryable());
    }

    #[test]
    fn retry_exhausted_wraps_last_error() {
        let last = AwsError::new("cloudcontrolapi", "ThrottlingException", "slow down", 400)
            .with_request_id("r-1".into());
        let err = AwsError::retry_exhausted(last, 3);
        assert_eq!(err.kind, ErrorKind::RetryExhausted);
        assert_eq!(err.attempts, 3);
        assert!(!err.retryable());
        assert_eq!(err.root_cause().code, "ThrottlingException");
        assert_eq!(err.request_id.as_deref(), Some("r-1"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn serde_keeps_kind_and_cause() {
        let err = AwsError::retry_exhausted(
            AwsError::new("cloudcontrolapi", "InternalFailure", "boom", 500),
            4,
        )
        .with_action("CreateResource");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"retry_exhausted\""));
        let back: AwsError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::RetryExhausted);
        assert_eq!(back.action.as_deref(), Some("CreateResource"));
        assert_eq!(back.cause.unwrap().code, "InternalFailure");
    }
}
