//! AWS Cloud Control API client.
//!
//! Cloud Control exposes uniform create/read/update/delete/list verbs over
//! any CloudFormation resource type, using the JSON 1.0 protocol with the
//! `CloudApiService` target prefix. Mutations are asynchronous: they return a
//! [`ProgressEvent`] whose request token is polled with
//! `GetResourceRequestStatus` until it reaches a terminal status.
//!
//! Reference: <https://docs.aws.amazon.com/cloudcontrolapi/latest/APIReference/>

use crate::client::{ApiRequest, AwsClient};
use crate::error::{AwsError, AwsResult, ErrorKind};
use crate::pagination::{paginate, Page};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const SERVICE: &str = "cloudcontrolapi";
const TARGET_PREFIX: &str = "CloudApiService";

// ── Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    CancelInProgress,
    CancelComplete,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Success | OperationStatus::Failed | OperationStatus::CancelComplete
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Status of an asynchronous resource operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ProgressEvent {
    #[serde(default)]
    pub type_name: Option<String>,
    /// Primary identifier; known once the handler has created the resource.
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub request_token: Option<String>,
    #[serde(default)]
    pub operation: Option<Operation>,
    pub operation_status: OperationStatus,
    #[serde(default)]
    pub event_time: Option<f64>,
    /// JSON string of the resource model, when the handler returns one.
    #[serde(default)]
    pub resource_model: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
    /// Handler error code, e.g. "AlreadyExists", "Throttling".
    #[serde(default)]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateResourceInput {
    pub type_name: String,
    /// JSON-encoded properties.
    pub desired_state: String,
    pub client_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateResourceInput {
    pub type_name: String,
    pub identifier: String,
    /// JSON-encoded RFC 6902 patch.
    pub patch_document: String,
    pub client_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteResourceInput {
    pub type_name: String,
    pub identifier: String,
    pub client_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetResourceInput {
    pub type_name: String,
    pub identifier: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListResourcesInput {
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_results: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetResourceRequestStatusInput {
    request_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceDescription {
    pub identifier: String,
    /// JSON-encoded current properties.
    #[serde(default)]
    pub properties: Option<String>,
}

impl ResourceDescription {
    /// Decoded properties, `{}` when absent.
    pub fn properties_value(&self) -> AwsResult<Value> {
        match self.properties {
            Some(ref raw) => serde_json::from_str(raw).map_err(|e| {
                AwsError::decode(SERVICE, &format!("invalid resource properties: {}", e), 200)
            }),
            None => Ok(Value::Object(Default::default())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProgressEventOutput {
    progress_event: ProgressEvent,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetResourceOutput {
    resource_description: ResourceDescription,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListResourcesOutput {
    #[serde(default)]
    resource_descriptions: Vec<ResourceDescription>,
    #[serde(default)]
    next_token: Option<String>,
}

// ── Cloud Control Client ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CloudControlClient {
    client: AwsClient,
    poll_interval: Duration,
    max_polls: u32,
}

impl CloudControlClient {
    pub fn new(client: AwsClient) -> Self {
        Self {
            client,
            poll_interval: Duration::from_secs(2),
            max_polls: 900,
        }
    }

    /// Set how often and how many times a request token is polled.
    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls.max(1);
        self
    }

    pub fn client(&self) -> &AwsClient {
        &self.client
    }

    /// Start creating a resource.
    pub async fn create_resource(&self, type_name: &str, desired_state: &Value) -> AwsResult<ProgressEvent> {
        let input = CreateResourceInput {
            type_name: type_name.to_string(),
            desired_state: desired_state.to_string(),
            client_token: uuid::Uuid::new_v4().to_string(),
        };
        self.progress_call("CreateResource", &input).await
    }

    /// Start updating a resource with a JSON patch.
    pub async fn update_resource(&self, type_name: &str, identifier: &str, patch: &[Value]) -> AwsResult<ProgressEvent> {
        let input = UpdateResourceInput {
            type_name: type_name.to_string(),
            identifier: identifier.to_string(),
            patch_document: Value::Array(patch.to_vec()).to_string(),
            client_token: uuid::Uuid::new_v4().to_string(),
        };
        self.progress_call("UpdateResource", &input).await
    }

    /// Start deleting a resource.
    pub async fn delete_resource(&self, type_name: &str, identifier: &str) -> AwsResult<ProgressEvent> {
        let input = DeleteResourceInput {
            type_name: type_name.to_string(),
            identifier: identifier.to_string(),
            client_token: uuid::Uuid::new_v4().to_string(),
        };
        self.progress_call("DeleteResource", &input).await
    }

    pub async fn get_resource(&self, type_name: &str, identifier: &str) -> AwsResult<ResourceDescription> {
        let input = GetResourceInput {
            type_name: type_name.to_string(),
            identifier: identifier.to_string(),
        };
        let request = ApiRequest::json(SERVICE, TARGET_PREFIX, "GetResource", &input)?;
        let out: GetResourceOutput = self.client.call_json(&request).await?;
        Ok(out.resource_description)
    }

    /// List every resource of a type, following continuation tokens.
    pub async fn list_resources(&self, type_name: &str) -> AwsResult<Vec<ResourceDescription>> {
        paginate(
            &self.client,
            |token| {
                let input = ListResourcesInput {
                    type_name: type_name.to_string(),
                    next_token: token.map(String::from),
                    max_results: None,
                };
                ApiRequest::json(SERVICE, TARGET_PREFIX, "ListResources", &input)
            },
            |value| {
                let out: ListResourcesOutput = serde_json::from_value(value.clone()).map_err(|e| {
                    AwsError::decode(SERVICE, &format!("unexpected ListResources shape: {}", e), 200)
                })?;
                Ok(Page {
                    items: out.resource_descriptions,
                    next_token: out.next_token,
                })
            },
        )
        .await
    }

    pub async fn get_resource_request_status(&self, request_token: &str) -> AwsResult<ProgressEvent> {
        let input = GetResourceRequestStatusInput {
            request_token: request_token.to_string(),
        };
        self.progress_call("GetResourceRequestStatus", &input).await
    }

    /// Poll until `event` reaches a terminal status.
    ///
    /// `SUCCESS` returns the final event. `FAILED` and `CANCEL_COMPLETE`
    /// become errors classified from the handler error code.
    pub async fn wait_for_completion(&self, event: ProgressEvent) -> AwsResult<ProgressEvent> {
        let mut current = event;
        let mut polls = 0u32;

        while !current.operation_status.is_terminal() {
            if polls >= self.max_polls {
                return Err(AwsError::with_kind(
                    ErrorKind::ResourceFailed,
                    SERVICE,
                    "StabilizationTimeout",
                    &format!(
                        "{} did not finish after {} status checks",
                        describe(&current),
                        polls
                    ),
                    0,
                ));
            }
            let token = current.request_token.clone().ok_or_else(|| {
                AwsError::decode(SERVICE, "progress event without RequestToken", 200)
            })?;
            tokio::time::sleep(self.poll_interval).await;
            polls += 1;
            let next = self.get_resource_request_status(&token).await?;
            log::debug!(
                "Cloud Control {} is {:?}",
                describe(&next),
                next.operation_status
            );
            current = next;
        }

        match current.operation_status {
            OperationStatus::Success => Ok(current),
            _ => Err(progress_error(&current)),
        }
    }

    async fn progress_call<T: Serialize>(&self, action: &str, input: &T) -> AwsResult<ProgressEvent> {
        let request = ApiRequest::json(SERVICE, TARGET_PREFIX, action, input)?;
        let out: ProgressEventOutput = self.client.call_json(&request).await?;
        Ok(out.progress_event)
    }
}

fn describe(event: &ProgressEvent) -> String {
    format!(
        "{} {}",
        event.type_name.as_deref().unwrap_or("resource"),
        event
            .identifier
            .as_deref()
            .or(event.request_token.as_deref())
            .unwrap_or("<pending>")
    )
}

/// Map a failed progress event onto an error kind.
fn progress_error(event: &ProgressEvent) -> AwsError {
    let code = event.error_code.as_deref().unwrap_or("GeneralServiceException");
    let kind = match code {
        "Throttling" => ErrorKind::Throttling,
        "ServiceInternalError" | "NetworkFailure" | "InternalFailure" => ErrorKind::ServiceUnavailable,
        "AccessDenied" | "InvalidCredentials" => ErrorKind::Authentication,
        "InvalidRequest" => ErrorKind::Validation,
        _ => ErrorKind::ResourceFailed,
    };
    let message = event
        .status_message
        .clone()
        .unwrap_or_else(|| format!("{} ended in {:?}", describe(event), event.operation_status));
    AwsError::with_kind(kind, SERVICE, code, &message, 0)
}

/// Top-level RFC 6902 patch turning `old` properties into `new`.
pub fn patch_document(old: &Value, new: &Value) -> Vec<Value> {
    let empty = serde_json::Map::new();
    let old = old.as_object().unwrap_or(&empty);
    let new = new.as_object().unwrap_or(&empty);
    let mut ops = Vec::new();

    for (key, value) in new {
        let path = format!("/{}", escape_pointer(key));
        match old.get(key) {
            None => ops.push(serde_json::json!({"op": "add", "path": path, "value": value})),
            Some(prev) if prev != value => {
                ops.push(serde_json::json!({"op": "replace", "path": path, "value": value}))
            }
            Some(_) => {}
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            ops.push(serde_json::json!({"op": "remove", "path": format!("/{}", escape_pointer(key))}));
        }
    }
    ops
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}
