//! Resource provisioning backends.
//!
//! The orchestrator talks to a [`ResourceProvisioner`]; the production
//! implementation drives the Cloud Control API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stackpilot_aws::cloudcontrol::{patch_document, CloudControlClient, ProgressEvent};
use stackpilot_aws::{AwsError, AwsResult, ErrorKind};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

/// A resource that exists in the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub logical_id: String,
    pub resource_type: String,
    /// Primary identifier; what `Ref` resolves to.
    pub physical_id: String,
    /// Current properties, including read-only ones; what `Fn::GetAtt` reads.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Properties last sent to the provider.
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
}

impl ProvisionedResource {
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// A resolved create or update request for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    pub logical_id: String,
    pub resource_type: String,
    /// Properties with every intrinsic already resolved.
    pub properties: Value,
    pub dependencies: BTreeSet<String>,
}

#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    async fn create(&self, request: &ProvisionRequest) -> AwsResult<ProvisionedResource>;

    async fn update(
        &self,
        request: &ProvisionRequest,
        current: &ProvisionedResource,
    ) -> AwsResult<ProvisionedResource>;

    async fn delete(&self, current: &ProvisionedResource) -> AwsResult<()>;
}

/// Provisioner backed by the Cloud Control API.
#[derive(Debug, Clone)]
pub struct CloudControlProvisioner {
    client: CloudControlClient,
}

impl CloudControlProvisioner {
    pub fn new(client: CloudControlClient) -> Self {
        Self { client }
    }

    /// Run `call`, and run it once more if it failed on authentication.
    ///
    /// The dispatcher has already dropped the rejected credentials from the
    /// cache, so the second attempt signs with a fresh set.
    async fn with_auth_retry<T, F, Fut>(&self, what: &str, call: F) -> AwsResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = AwsResult<T>>,
    {
        match call().await {
            Err(e) if e.kind == ErrorKind::Authentication => {
                log::warn!("{} rejected credentials ({}); refreshing and retrying once", what, e.code);
                call().await
            }
            other => other,
        }
    }

    /// Wait for a mutation to finish. Status checks that hit an
    /// authentication failure resume polling once with fresh credentials.
    async fn settle(&self, what: &str, event: ProgressEvent) -> AwsResult<ProgressEvent> {
        match self.client.wait_for_completion(event.clone()).await {
            Err(e) if e.kind == ErrorKind::Authentication && event.request_token.is_some() => {
                log::warn!("{} status check rejected credentials; polling again", what);
                self.client.wait_for_completion(event).await
            }
            other => other,
        }
    }

    /// Start a mutation with `start` and wait for it to finish.
    ///
    /// A handler that ends in a retryable failure (throttling, internal
    /// errors) re-issues the whole mutation under the client's retry policy.
    async fn mutate<F, Fut>(&self, what: &str, logical_id: &str, start: F) -> AwsResult<ProgressEvent>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = AwsResult<ProgressEvent>>,
    {
        let retry = &self.client.client().config().retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let event = self.with_auth_retry(what, &start).await?;
            let error = match self.settle(logical_id, event).await {
                Err(e) if e.retryable() => e.with_attempts(attempt),
                other => return other,
            };
            if attempt >= max_attempts {
                log::warn!(
                    "{} of {} giving up after {} attempts: {}",
                    what,
                    logical_id,
                    attempt,
                    error.code
                );
                return Err(AwsError::retry_exhausted(error, attempt));
            }
            let delay = retry.backoff(attempt - 1);
            log::warn!(
                "{} of {} failed in the handler (attempt {}/{}): {} - retrying in {}ms",
                what,
                logical_id,
                attempt,
                max_attempts,
                error.code,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn describe(
        &self,
        request: &ProvisionRequest,
        physical_id: String,
    ) -> AwsResult<ProvisionedResource> {
        let attributes = match self
            .with_auth_retry("GetResource", || {
                self.client.get_resource(&request.resource_type, &physical_id)
            })
            .await
            .and_then(|d| d.properties_value())
        {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            Ok(_) => BTreeMap::new(),
            Err(e) => {
                log::warn!(
                    "Could not read back {} ({}): {}; using desired properties",
                    request.logical_id,
                    physical_id,
                    e
                );
                match request.properties {
                    Value::Object(ref map) => map.clone().into_iter().collect(),
                    _ => BTreeMap::new(),
                }
            }
        };
        Ok(ProvisionedResource {
            logical_id: request.logical_id.clone(),
            resource_type: request.resource_type.clone(),
            physical_id,
            attributes,
            properties: request.properties.clone(),
            dependencies: request.dependencies.clone(),
        })
    }
}

#[async_trait]
impl ResourceProvisioner for CloudControlProvisioner {
    async fn create(&self, request: &ProvisionRequest) -> AwsResult<ProvisionedResource> {
        log::info!("Creating {} ({})", request.logical_id, request.resource_type);
        let done = self
            .mutate("CreateResource", &request.logical_id, || {
                self.client.create_resource(&request.resource_type, &request.properties)
            })
            .await?;
        let physical_id = done.identifier.ok_or_else(|| {
            AwsError::decode(
                "cloudcontrolapi",
                &format!("create of {} finished without an identifier", request.logical_id),
                200,
            )
        })?;
        self.describe(request, physical_id).await
    }

    async fn update(
        &self,
        request: &ProvisionRequest,
        current: &ProvisionedResource,
    ) -> AwsResult<ProvisionedResource> {
        let patch = patch_document(&current.properties, &request.properties);
        if patch.is_empty() {
            log::info!("{} is unchanged", request.logical_id);
            let mut unchanged = current.clone();
            unchanged.dependencies = request.dependencies.clone();
            return Ok(unchanged);
        }
        log::info!(
            "Updating {} ({}) with {} patch operation(s)",
            request.logical_id,
            current.physical_id,
            patch.len()
        );
        self.mutate("UpdateResource", &request.logical_id, || {
            self.client
                .update_resource(&request.resource_type, &current.physical_id, &patch)
        })
        .await?;
        self.describe(request, current.physical_id.clone()).await
    }

    async fn delete(&self, current: &ProvisionedResource) -> AwsResult<()> {
        log::info!("Deleting {} ({})", current.logical_id, current.physical_id);
        let outcome = self
            .mutate("DeleteResource", &current.logical_id, || {
                self.client
                    .delete_resource(&current.resource_type, &current.physical_id)
            })
            .await;
        match outcome.map(|_| ()) {
            Err(e) if is_not_found(&e) => {
                log::info!("{} was already gone", current.logical_id);
                Ok(())
            }
            other => other,
        }
    }
}

fn is_not_found(err: &AwsError) -> bool {
    let code = err.root_cause().code.as_str();
    code == "NotFound" || code == "ResourceNotFoundException"
}
