//! Layered deployment of a resource graph.
//!
//! Layers run strictly one after another. Members of a layer run
//! concurrently, bounded by a semaphore, and the whole layer is awaited
//! before the next starts. A failure anywhere in a layer stops later layers;
//! cancellation aborts the layer in flight.

use crate::error::{DeployError, DeployResult};
use crate::graph::{DependencyGraph, ResourceNode};
use crate::provisioner::{ProvisionRequest, ProvisionedResource, ResourceProvisioner};
use crate::resolve::{resolve, DeploymentContext};
use crate::state::StackState;
use crate::template::DeploymentUnit;
use serde::{Deserialize, Serialize};
use stackpilot_aws::{AwsError, AwsResult, ErrorKind};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// What a node is going to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub id: String,
    pub resource_type: String,
    pub action: ActionType,
}

/// Dry-run view of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// Create/update layers in execution order.
    pub layers: Vec<Vec<PlannedAction>>,
    /// Removals of resources no longer in the unit, run after the layers.
    pub deletions: Vec<Vec<PlannedAction>>,
    /// Ids whose last operation was cut off by cancellation. A create
    /// planned for one of these may find the resource already exists.
    #[serde(default)]
    pub interrupted: Vec<String>,
}

impl DeploymentPlan {
    pub fn count(&self, action: ActionType) -> usize {
        self.layers
            .iter()
            .chain(self.deletions.iter())
            .flatten()
            .filter(|a| a.action == action)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedResource {
    pub id: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl FailedResource {
    fn from_aws(id: &str, err: &AwsError) -> Self {
        Self {
            id: id.to_string(),
            kind: err.kind,
            message: err.to_string(),
        }
    }

    fn from_deploy(id: &str, err: &DeployError) -> Self {
        Self {
            id: id.to_string(),
            kind: err.kind,
            message: err.message.clone(),
        }
    }

    fn cancelled(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: ErrorKind::Cancelled,
            message: "deployment cancelled while the operation was in flight".to_string(),
        }
    }
}

/// Outcome of a deploy or destroy run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub unit: String,
    /// Created or updated ids, in layer order.
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedResource>,
    /// Ids in layers that never started.
    pub not_attempted: Vec<String>,
    pub deleted: Vec<String>,
    pub cancelled: bool,
    /// Ids whose operation had started when cancellation aborted it; the
    /// provider may have applied it.
    pub interrupted: Vec<String>,
    /// Every resource known to exist after the run.
    pub resources: BTreeMap<String, ProvisionedResource>,
    pub duration_ms: u64,
}

impl DeploymentReport {
    fn new(unit: &str, resources: BTreeMap<String, ProvisionedResource>) -> Self {
        Self {
            unit: unit.to_string(),
            resources,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled && self.not_attempted.is_empty()
    }

    pub fn failure(&self, id: &str) -> Option<&FailedResource> {
        self.failed.iter().find(|f| f.id == id)
    }

    fn skip_layers(&mut self, layers: &[Vec<String>]) {
        self.not_attempted.extend(layers.iter().flatten().cloned());
    }
}

enum Outcome {
    Provisioned(ProvisionedResource),
    Deleted,
}

type Job = Pin<Box<dyn Future<Output = AwsResult<Outcome>> + Send + 'static>>;

#[derive(Default)]
struct LayerResult {
    done: Vec<(String, Outcome)>,
    failed: Vec<FailedResource>,
    interrupted: Vec<String>,
    cancelled: bool,
}

/// Drives a [`ResourceProvisioner`] over the layers of a deployment unit.
pub struct Orchestrator {
    provisioner: Arc<dyn ResourceProvisioner>,
    max_concurrency: usize,
    context: DeploymentContext,
}

impl Orchestrator {
    pub fn new(provisioner: Arc<dyn ResourceProvisioner>, context: DeploymentContext) -> Self {
        Self {
            provisioner,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            context,
        }
    }

    /// Cap on in-flight operations within one layer; at least 1.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn context(&self) -> &DeploymentContext {
        &self.context
    }

    /// Preview the actions of [`Orchestrator::deploy`] without calling out.
    pub fn plan(&self, unit: &DeploymentUnit, state: &StackState) -> DeployResult<DeploymentPlan> {
        let graph = &unit.graph;
        let layers = graph
            .layers()?
            .into_iter()
            .map(|layer| {
                layer
                    .into_iter()
                    .map(|id| {
                        let action = if state.contains(&id) {
                            ActionType::Update
                        } else {
                            ActionType::Create
                        };
                        PlannedAction {
                            resource_type: graph.get(&id).map(|n| n.resource_type.clone()).unwrap_or_default(),
                            id,
                            action,
                        }
                    })
                    .collect()
            })
            .collect();

        let deletions = orphan_graph(unit, state)?
            .deletion_layers()?
            .into_iter()
            .map(|layer| {
                layer
                    .into_iter()
                    .map(|id| PlannedAction {
                        resource_type: state.get(&id).map(|r| r.resource_type.clone()).unwrap_or_default(),
                        id,
                        action: ActionType::Delete,
                    })
                    .collect()
            })
            .collect();

        Ok(DeploymentPlan {
            layers,
            deletions,
            interrupted: state.interrupted.iter().cloned().collect(),
        })
    }

    /// Create or update every node of `unit`, then delete what `state` holds
    /// that the unit no longer declares.
    ///
    /// Graph errors are returned before any provisioner call. Everything
    /// after that lands in the report.
    pub async fn deploy(
        &self,
        unit: &DeploymentUnit,
        state: &StackState,
        cancel: &CancellationToken,
    ) -> DeployResult<DeploymentReport> {
        let started = Instant::now();
        let layers = unit.graph.layers()?;
        let orphans = orphan_graph(unit, state)?;
        let deletion_layers = orphans.deletion_layers()?;
        let context = self.context_for(unit);

        log::info!(
            "Deploying '{}': {} resource(s) in {} layer(s)",
            unit.name,
            unit.graph.len(),
            layers.len()
        );

        for id in &state.interrupted {
            log::warn!(
                "{} was interrupted by an earlier cancelled run; it may already exist",
                id
            );
        }

        let mut report = DeploymentReport::new(&unit.name, state.resources.clone());
        let halted = self
            .run_apply_layers(unit, &layers, state, &context, &mut report, cancel)
            .await;

        if !halted && !deletion_layers.is_empty() {
            log::info!("Removing {} resource(s) no longer declared", orphans.len());
            self.run_delete_layers(&deletion_layers, state, &mut report, cancel)
                .await;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        log_summary(&report);
        Ok(report)
    }

    /// Delete every resource in `state`, dependents first.
    pub async fn destroy(
        &self,
        unit: &DeploymentUnit,
        state: &StackState,
        cancel: &CancellationToken,
    ) -> DeployResult<DeploymentReport> {
        let graph = teardown_graph(unit, state)?;
        self.teardown(&unit.name, &graph, state, cancel).await
    }

    /// Delete `id` and everything in `state` that transitively depends on it.
    pub async fn destroy_closure(
        &self,
        unit: &DeploymentUnit,
        id: &str,
        state: &StackState,
        cancel: &CancellationToken,
    ) -> DeployResult<DeploymentReport> {
        let graph = teardown_graph(unit, state)?;
        let closure = graph.teardown_closure(id);
        if closure.is_empty() {
            log::info!("'{}' is not deployed; nothing to tear down", id);
        }
        self.teardown(&unit.name, &graph.subgraph(&closure), state, cancel)
            .await
    }

    async fn teardown(
        &self,
        unit: &str,
        graph: &DependencyGraph,
        state: &StackState,
        cancel: &CancellationToken,
    ) -> DeployResult<DeploymentReport> {
        let started = Instant::now();
        let layers = graph.deletion_layers()?;
        log::info!("Tearing down {} resource(s) of '{}'", graph.len(), unit);
        let mut report = DeploymentReport::new(unit, state.resources.clone());
        self.run_delete_layers(&layers, state, &mut report, cancel).await;
        report.duration_ms = started.elapsed().as_millis() as u64;
        log_summary(&report);
        Ok(report)
    }

    fn context_for(&self, unit: &DeploymentUnit) -> DeploymentContext {
        let mut context = self.context.clone();
        if context.stack_name.is_empty() {
            context.stack_name = unit.name.clone();
        }
        for (name, value) in &unit.parameter_defaults {
            context
                .parameters
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        context
    }

    /// Returns true when the run stopped early.
    async fn run_apply_layers(
        &self,
        unit: &DeploymentUnit,
        layers: &[Vec<String>],
        state: &StackState,
        context: &DeploymentContext,
        report: &mut DeploymentReport,
        cancel: &CancellationToken,
    ) -> bool {
        for (index, layer) in layers.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.skip_layers(&layers[index..]);
                return true;
            }
            log::debug!("Layer {}/{}: {:?}", index + 1, layers.len(), layer);

            let mut early_failures = Vec::new();
            let mut jobs: Vec<(String, Job)> = Vec::with_capacity(layer.len());
            for id in layer {
                let Some(node) = unit.graph.get(id) else {
                    continue;
                };
                match self.provision_job(node, state, context, &report.resources) {
                    Ok(job) => jobs.push((id.clone(), job)),
                    Err(e) => {
                        log::error!("Cannot resolve {}: {}", id, e);
                        early_failures.push(FailedResource::from_deploy(id, &e));
                    }
                }
            }

            let mut result = self.run_layer(jobs, cancel).await;
            result.failed.extend(early_failures);
            let stop = merge_layer(report, layer, result);
            if stop {
                report.skip_layers(&layers[index + 1..]);
                return true;
            }
        }
        false
    }

    async fn run_delete_layers(
        &self,
        layers: &[Vec<String>],
        state: &StackState,
        report: &mut DeploymentReport,
        cancel: &CancellationToken,
    ) {
        for (index, layer) in layers.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.skip_layers(&layers[index..]);
                return;
            }
            let jobs = layer
                .iter()
                .filter_map(|id| state.get(id))
                .map(|current| {
                    let provisioner = self.provisioner.clone();
                    let id = current.logical_id.clone();
                    let current = current.clone();
                    let job: Job = Box::pin(async move {
                        provisioner.delete(&current).await.map(|_| Outcome::Deleted)
                    });
                    (id, job)
                })
                .collect();

            let result = self.run_layer(jobs, cancel).await;
            if merge_layer(report, layer, result) {
                report.skip_layers(&layers[index + 1..]);
                return;
            }
        }
    }

    fn provision_job(
        &self,
        node: &ResourceNode,
        state: &StackState,
        context: &DeploymentContext,
        outputs: &BTreeMap<String, ProvisionedResource>,
    ) -> DeployResult<Job> {
        let properties = resolve(&node.properties(), outputs, context)?;
        let request = ProvisionRequest {
            logical_id: node.id.clone(),
            resource_type: node.resource_type.clone(),
            properties,
            dependencies: node.dependencies().clone(),
        };
        let current = state.get(&node.id).cloned();
        let provisioner = self.provisioner.clone();
        Ok(Box::pin(async move {
            let provisioned = match current {
                Some(ref current) => provisioner.update(&request, current).await?,
                None => provisioner.create(&request).await?,
            };
            Ok(Outcome::Provisioned(provisioned))
        }))
    }

    /// Run one layer's jobs concurrently and collect what finished.
    async fn run_layer(&self, jobs: Vec<(String, Job)>, cancel: &CancellationToken) -> LayerResult {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        // id -> whether the job got a permit and started calling out
        let mut pending: BTreeMap<String, Arc<AtomicBool>> = BTreeMap::new();
        let mut set = JoinSet::new();

        for (id, job) in jobs {
            let started = Arc::new(AtomicBool::new(false));
            pending.insert(id.clone(), started.clone());
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                started.store(true, Ordering::SeqCst);
                let outcome = job.await;
                (id, outcome)
            });
        }

        let mut result = LayerResult::default();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    set.abort_all();
                    result.cancelled = true;
                    break;
                }
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok((id, outcome))) => {
                        pending.remove(&id);
                        match outcome {
                            Ok(done) => result.done.push((id, done)),
                            Err(e) => {
                                log::error!("{} failed: {}", id, e);
                                result.failed.push(FailedResource::from_aws(&id, &e));
                            }
                        }
                    }
                    Some(Err(e)) => log::error!("Provisioning task ended abnormally: {}", e),
                },
            }
        }

        for (id, started) in pending {
            if result.cancelled {
                if started.load(Ordering::SeqCst) {
                    log::warn!("{} was in flight when cancelled; its outcome is unknown", id);
                    result.interrupted.push(id.clone());
                }
                result.failed.push(FailedResource::cancelled(&id));
            } else {
                result.failed.push(FailedResource {
                    id,
                    kind: ErrorKind::ResourceFailed,
                    message: "provisioning task panicked".to_string(),
                });
            }
        }
        result
    }
}

/// Fold a layer's outcome into `report`, in layer order. Returns true when
/// later layers must not start.
fn merge_layer(report: &mut DeploymentReport, layer: &[String], result: LayerResult) -> bool {
    let position: HashMap<&str, usize> = layer
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let rank = |id: &str| position.get(id).copied().unwrap_or(usize::MAX);

    let mut done = result.done;
    done.sort_by_key(|(id, _)| rank(id));
    for (id, outcome) in done {
        match outcome {
            Outcome::Provisioned(resource) => {
                report.resources.insert(id.clone(), resource);
                report.succeeded.push(id);
            }
            Outcome::Deleted => {
                report.resources.remove(&id);
                report.deleted.push(id);
            }
        }
    }

    let mut interrupted = result.interrupted;
    interrupted.sort_by_key(|id| rank(id));
    report.interrupted.extend(interrupted);

    let mut failed = result.failed;
    failed.sort_by_key(|f| rank(&f.id));
    let stop = !failed.is_empty() || result.cancelled;
    report.failed.extend(failed);
    report.cancelled |= result.cancelled;
    stop
}

fn log_summary(report: &DeploymentReport) {
    if report.is_success() {
        log::info!(
            "'{}' finished in {}ms: {} applied, {} deleted",
            report.unit,
            report.duration_ms,
            report.succeeded.len(),
            report.deleted.len()
        );
    } else {
        log::warn!(
            "'{}' stopped after {}ms: {} applied, {} failed, {} not attempted{}",
            report.unit,
            report.duration_ms,
            report.succeeded.len(),
            report.failed.len(),
            report.not_attempted.len(),
            if report.cancelled { " (cancelled)" } else { "" }
        );
    }
}

/// Graph over everything in `state`, with edges from both the recorded
/// dependencies and the unit's current definitions.
fn teardown_graph(unit: &DeploymentUnit, state: &StackState) -> DeployResult<DependencyGraph> {
    let mut graph = DependencyGraph::new();
    for (id, resource) in &state.resources {
        let mut deps = resource.dependencies.clone();
        if let Some(node) = unit.graph.get(id) {
            deps.extend(node.dependencies().iter().cloned());
        }
        deps.retain(|d| d != id && state.contains(d));
        graph.add_node(ResourceNode::with_dependencies(id, &resource.resource_type, deps))?;
    }
    Ok(graph)
}

/// Teardown graph restricted to state entries the unit no longer declares.
fn orphan_graph(unit: &DeploymentUnit, state: &StackState) -> DeployResult<DependencyGraph> {
    let orphans: BTreeSet<String> = state
        .resources
        .keys()
        .filter(|id| !unit.graph.contains(id))
        .cloned()
        .collect();
    if orphans.is_empty() {
        return Ok(DependencyGraph::new());
    }
    Ok(teardown_graph(unit, state)?.subgraph(&orphans))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use stackpilot_aws::AwsRegion;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct StubProvisioner {
        events: Mutex<Vec<String>>,
        received: Mutex<BTreeMap<String, Value>>,
        fail: BTreeSet<String>,
        slow: BTreeSet<String>,
        panics: BTreeSet<String>,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StubProvisioner {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn index_of(&self, event: &str) -> usize {
            self.events()
                .iter()
                .position(|e| e == event)
                .unwrap_or_else(|| panic!("no event {event:?} in {:?}", self.events()))
        }

        async fn run(&self, verb: &str, id: &str) -> AwsResult<()> {
            self.events.lock().unwrap().push(format!("{verb}:{id}"));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = if self.slow.contains(id) {
                Duration::from_secs(60)
            } else {
                self.delay
            };
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.panics.contains(id) {
                panic!("stub blew up on {id}");
            }
            self.events.lock().unwrap().push(format!("end:{id}"));
            if self.fail.contains(id) {
                return Err(AwsError::validation("cloudcontrolapi", "bad property value"));
            }
            Ok(())
        }

        fn provisioned(request: &ProvisionRequest) -> ProvisionedResource {
            ProvisionedResource {
                logical_id: request.logical_id.clone(),
                resource_type: request.resource_type.clone(),
                physical_id: format!("{}-phys", request.logical_id),
                attributes: BTreeMap::from([(
                    "Arn".to_string(),
                    json!(format!("arn:test:{}", request.logical_id)),
                )]),
                properties: request.properties.clone(),
                dependencies: request.dependencies.clone(),
            }
        }
    }

    #[async_trait]
    impl ResourceProvisioner for StubProvisioner {
        async fn create(&self, request: &ProvisionRequest) -> AwsResult<ProvisionedResource> {
            self.received
                .lock()
                .unwrap()
                .insert(request.logical_id.clone(), request.properties.clone());
            self.run("create", &request.logical_id).await?;
            Ok(Self::provisioned(request))
        }

        async fn update(
            &self,
            request: &ProvisionRequest,
            _current: &ProvisionedResource,
        ) -> AwsResult<ProvisionedResource> {
            self.run("update", &request.logical_id).await?;
            Ok(Self::provisioned(request))
        }

        async fn delete(&self, current: &ProvisionedResource) -> AwsResult<()> {
            self.run("delete", &current.logical_id).await
        }
    }

    fn unit(defs: &[(&str, Value)]) -> DeploymentUnit {
        let mut graph = DependencyGraph::new();
        for (id, def) in defs {
            graph.add_resource(id, "AWS::Test::Thing", def.clone()).unwrap();
        }
        DeploymentUnit::new("test", graph)
    }

    fn context() -> DeploymentContext {
        DeploymentContext::new(&AwsRegion::new("us-east-1"), "111122223333", "test")
    }

    fn orchestrator(stub: &Arc<StubProvisioner>) -> Orchestrator {
        Orchestrator::new(stub.clone(), context())
    }

    fn deployed(id: &str, deps: &[&str]) -> (String, ProvisionedResource) {
        (
            id.to_string(),
            ProvisionedResource {
                logical_id: id.to_string(),
                resource_type: "AWS::Test::Thing".into(),
                physical_id: format!("{id}-phys"),
                attributes: BTreeMap::new(),
                properties: json!({}),
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
            },
        )
    }

    fn fan_out() -> DeploymentUnit {
        unit(&[
            ("A", json!({})),
            ("B", json!({"Properties": {"Source": {"Ref": "A"}}})),
            ("C", json!({"Properties": {"Arn": {"Fn::GetAtt": ["A", "Arn"]}}})),
        ])
    }

    #[tokio::test]
    async fn later_layer_starts_after_earlier_layer_resolves() {
        let stub = Arc::new(StubProvisioner {
            delay: Duration::from_millis(10),
            ..Default::default()
        });
        let report = orchestrator(&stub)
            .deploy(&fan_out(), &StackState::new("test"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.succeeded, vec!["A", "B", "C"]);
        assert!(stub.index_of("end:A") < stub.index_of("create:B"));
        assert!(stub.index_of("end:A") < stub.index_of("create:C"));
        assert_eq!(report.resources.len(), 3);
    }

    #[tokio::test]
    async fn outputs_of_earlier_layers_are_substituted() {
        let stub = Arc::new(StubProvisioner::default());
        orchestrator(&stub)
            .deploy(&fan_out(), &StackState::new("test"), &CancellationToken::new())
            .await
            .unwrap();
        let received = stub.received.lock().unwrap().clone();
        assert_eq!(received["B"], json!({"Source": "A-phys"}));
        assert_eq!(received["C"], json!({"Arn": "arn:test:A"}));
    }

    #[tokio::test]
    async fn concurrency_is_capped() {
        let defs: Vec<(String, Value)> = (0..6).map(|i| (format!("R{i}"), json!({}))).collect();
        let refs: Vec<(&str, Value)> = defs.iter().map(|(id, d)| (id.as_str(), d.clone())).collect();
        let stub = Arc::new(StubProvisioner {
            delay: Duration::from_millis(25),
            ..Default::default()
        });
        let report = orchestrator(&stub)
            .with_max_concurrency(2)
            .deploy(&unit(&refs), &StackState::new("test"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.succeeded.len(), 6);
        assert_eq!(stub.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_stops_downstream_but_not_siblings() {
        let stub = Arc::new(StubProvisioner {
            fail: BTreeSet::from(["B".to_string()]),
            ..Default::default()
        });
        let u = unit(&[
            ("A", json!({})),
            ("B", json!({"DependsOn": "A"})),
            ("C", json!({"DependsOn": "A"})),
            ("D", json!({"DependsOn": "B"})),
            ("E", json!({"DependsOn": "C"})),
        ]);
        let report = orchestrator(&stub)
            .deploy(&u, &StackState::new("test"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.succeeded, vec!["A", "C"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, "B");
        assert_eq!(report.failed[0].kind, ErrorKind::Validation);
        assert_eq!(report.not_attempted, vec!["D", "E"]);
        assert!(!report.is_success());
        assert!(!stub.events().iter().any(|e| e.ends_with(":D") || e.ends_with(":E")));
    }

    #[tokio::test]
    async fn unresolvable_reference_fails_only_that_node() {
        let stub = Arc::new(StubProvisioner::default());
        let u = unit(&[
            ("A", json!({})),
            ("B", json!({"Properties": {"X": {"Fn::GetAtt": ["A", "Missing"]}}})),
            ("C", json!({"DependsOn": "A"})),
        ]);
        let report = orchestrator(&stub)
            .deploy(&u, &StackState::new("test"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.succeeded, vec!["A", "C"]);
        let failure = report.failure("B").unwrap();
        assert_eq!(failure.kind, ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn graph_errors_abort_before_any_call() {
        let stub = Arc::new(StubProvisioner::default());
        let u = unit(&[("A", json!({"DependsOn": "Ghost"}))]);
        let err = orchestrator(&stub)
            .deploy(&u, &StackState::new("test"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert!(stub.events().is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_layer() {
        let stub = Arc::new(StubProvisioner {
            slow: BTreeSet::from(["Slow".to_string()]),
            ..Default::default()
        });
        let u = unit(&[
            ("Fast", json!({})),
            ("Slow", json!({})),
            ("After", json!({"DependsOn": "Slow"})),
        ]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let report = orchestrator(&stub).deploy(&u, &StackState::new("test"), &cancel).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.succeeded, vec!["Fast"]);
        assert_eq!(report.failure("Slow").unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(report.not_attempted, vec!["After"]);
        assert_eq!(report.interrupted, vec!["Slow"]);
        assert!(!report.resources.contains_key("Slow"));
    }

    #[tokio::test]
    async fn queued_jobs_are_not_interrupted_on_cancel() {
        let stub = Arc::new(StubProvisioner {
            slow: BTreeSet::from(["S1".to_string(), "S2".to_string()]),
            ..Default::default()
        });
        let u = unit(&[("S1", json!({})), ("S2", json!({}))]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let report = orchestrator(&stub)
            .with_max_concurrency(1)
            .deploy(&u, &StackState::new("test"), &cancel)
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.interrupted.len(), 1);
        assert_eq!(stub.events(), vec![format!("create:{}", report.interrupted[0])]);
    }

    #[tokio::test]
    async fn plan_lists_interrupted_ids_from_state() {
        let stub = Arc::new(StubProvisioner::default());
        let mut state = StackState::new("test");
        state.interrupted = BTreeSet::from(["B".to_string()]);
        let plan = orchestrator(&stub).plan(&fan_out(), &state).unwrap();
        assert_eq!(plan.interrupted, vec!["B"]);
        assert_eq!(plan.count(ActionType::Create), 3);
    }

    #[tokio::test]
    async fn cancelled_before_start_does_nothing() {
        let stub = Arc::new(StubProvisioner::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = orchestrator(&stub)
            .deploy(&fan_out(), &StackState::new("test"), &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.not_attempted, vec!["A", "B", "C"]);
        assert!(stub.events().is_empty());
    }

    #[tokio::test]
    async fn panicking_task_is_reported_as_failed() {
        let stub = Arc::new(StubProvisioner {
            panics: BTreeSet::from(["A".to_string()]),
            ..Default::default()
        });
        let report = orchestrator(&stub)
            .deploy(&fan_out(), &StackState::new("test"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failure("A").unwrap().kind, ErrorKind::ResourceFailed);
        assert_eq!(report.not_attempted, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn existing_resources_update_and_orphans_are_deleted() {
        let stub = Arc::new(StubProvisioner::default());
        let mut state = StackState::new("test");
        state.resources = BTreeMap::from([deployed("A", &[]), deployed("Old", &["A"])]);

        let o = orchestrator(&stub);
        let plan = o.plan(&fan_out(), &state).unwrap();
        assert_eq!(plan.layers[0][0].action, ActionType::Update);
        assert_eq!(plan.count(ActionType::Create), 2);
        assert_eq!(plan.deletions, vec![vec![PlannedAction {
            id: "Old".into(),
            resource_type: "AWS::Test::Thing".into(),
            action: ActionType::Delete,
        }]]);

        let report = o.deploy(&fan_out(), &state, &CancellationToken::new()).await.unwrap();
        assert!(report.is_success());
        assert!(stub.events().contains(&"update:A".to_string()));
        assert!(stub.events().contains(&"create:B".to_string()));
        assert_eq!(report.deleted, vec!["Old"]);
        assert!(!report.resources.contains_key("Old"));
        assert!(stub.index_of("end:C") < stub.index_of("delete:Old"));
    }

    #[tokio::test]
    async fn destroy_removes_dependents_first() {
        let stub = Arc::new(StubProvisioner::default());
        let mut state = StackState::new("test");
        state.resources = BTreeMap::from([
            deployed("Vpc", &[]),
            deployed("Subnet", &["Vpc"]),
            deployed("Instance", &["Subnet"]),
            deployed("Bucket", &[]),
        ]);
        let empty = DeploymentUnit::new("test", DependencyGraph::new());
        let report = orchestrator(&stub)
            .destroy(&empty, &state, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.deleted.len(), 4);
        assert!(report.resources.is_empty());
        assert!(stub.index_of("end:Instance") < stub.index_of("delete:Subnet"));
        assert!(stub.index_of("end:Subnet") < stub.index_of("delete:Vpc"));
    }

    #[tokio::test]
    async fn destroy_closure_keeps_unrelated_resources() {
        let stub = Arc::new(StubProvisioner::default());
        let mut state = StackState::new("test");
        state.resources = BTreeMap::from([
            deployed("Vpc", &[]),
            deployed("Subnet", &["Vpc"]),
            deployed("Bucket", &[]),
        ]);
        let empty = DeploymentUnit::new("test", DependencyGraph::new());
        let report = orchestrator(&stub)
            .destroy_closure(&empty, "Vpc", &state, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.deleted, vec!["Subnet", "Vpc"]);
        assert_eq!(report.resources.keys().collect::<Vec<_>>(), vec!["Bucket"]);
    }
}
