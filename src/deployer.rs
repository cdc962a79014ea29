//! Wires settings, credentials, the AWS client, state and the orchestrator
//! into one entry point.

use crate::error::StackpilotResult;
use crate::logging;
use crate::settings::Settings;
use crate::state::StateStore;
use stackpilot_aws::cloudcontrol::CloudControlClient;
use stackpilot_aws::credentials::{AssumeRoleProvider, ChainProvider, CredentialProvider};
use stackpilot_aws::sts::StsClient;
use stackpilot_aws::{AwsClient, CachingCredentialResolver};
use stackpilot_deploy::{
    CloudControlProvisioner, DeploymentContext, DeploymentPlan, DeploymentReport, DeploymentUnit,
    Orchestrator, StackState, Template,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Deployer {
    settings: Settings,
    client: AwsClient,
    store: StateStore,
}

impl Deployer {
    /// Build the production stack: log output per the settings, default
    /// credential chain, optional assumed role, `reqwest` transport.
    pub fn from_settings(settings: Settings) -> StackpilotResult<Self> {
        settings.validate()?;
        if logging::init_from_settings(&settings) {
            log::debug!("Logging at '{}' as {:?}", settings.log_level, settings.log_format);
        }
        let config = settings.client_config();
        let base: Arc<dyn CredentialProvider> =
            Arc::new(ChainProvider::default_chain(settings.profile.as_deref()));
        let base = Arc::new(CachingCredentialResolver::new(base));

        let credentials = match settings.role_arn {
            Some(ref role_arn) => {
                log::info!("Deploying as {}", role_arn);
                let sts = StsClient::new(AwsClient::new(config.clone(), base)?);
                Arc::new(CachingCredentialResolver::new(Arc::new(AssumeRoleProvider::new(
                    sts, role_arn,
                ))))
            }
            None => base,
        };

        let client = AwsClient::new(config, credentials)?;
        Ok(Self::with_client(settings, client))
    }

    /// Use a pre-built client, e.g. one over a scripted transport.
    pub fn with_client(settings: Settings, client: AwsClient) -> Self {
        let store = StateStore::new(settings.state_dir.clone());
        Self {
            settings,
            client,
            store,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Account that the configured credentials belong to.
    pub async fn account_id(&self) -> StackpilotResult<String> {
        let identity = StsClient::new(self.client.clone()).get_caller_identity().await?;
        Ok(identity.account)
    }

    /// Compute the plan for `template` against saved state. No network calls.
    pub async fn plan(&self, template: &Template) -> StackpilotResult<DeploymentPlan> {
        let unit = self.unit(template)?;
        let state = self.store.load(&unit.name).await?;
        let orchestrator = self.orchestrator(DeploymentContext::new(
            self.client.region(),
            "",
            &unit.name,
        ));
        Ok(orchestrator.plan(&unit, &state)?)
    }

    /// Deploy `template` and persist whatever now exists, even on failure.
    pub async fn deploy(
        &self,
        template: &Template,
        cancel: &CancellationToken,
    ) -> StackpilotResult<DeploymentReport> {
        let unit = self.unit(template)?;
        let state = self.store.load(&unit.name).await?;
        let orchestrator = self.orchestrator(self.context(&unit).await?);
        let report = orchestrator.deploy(&unit, &state, cancel).await?;
        self.persist(state, &report).await?;
        Ok(report)
    }

    /// Delete every resource recorded for the stack.
    pub async fn destroy(
        &self,
        template: &Template,
        cancel: &CancellationToken,
    ) -> StackpilotResult<DeploymentReport> {
        let unit = self.unit(template)?;
        let state = self.store.load(&unit.name).await?;
        let orchestrator = self.orchestrator(self.context(&unit).await?);
        let report = orchestrator.destroy(&unit, &state, cancel).await?;
        self.persist(state, &report).await?;
        Ok(report)
    }

    /// Delete `id` and everything that depends on it.
    pub async fn destroy_resource(
        &self,
        template: &Template,
        id: &str,
        cancel: &CancellationToken,
    ) -> StackpilotResult<DeploymentReport> {
        let unit = self.unit(template)?;
        let state = self.store.load(&unit.name).await?;
        let orchestrator = self.orchestrator(self.context(&unit).await?);
        let report = orchestrator.destroy_closure(&unit, id, &state, cancel).await?;
        self.persist(state, &report).await?;
        Ok(report)
    }

    /// Build and order-check the unit so graph errors surface before any call.
    fn unit(&self, template: &Template) -> StackpilotResult<DeploymentUnit> {
        let unit = DeploymentUnit::from_template(&self.settings.stack_name, template)?;
        unit.graph.topological_sort()?;
        Ok(unit)
    }

    async fn context(&self, unit: &DeploymentUnit) -> StackpilotResult<DeploymentContext> {
        let account_id = self.account_id().await?;
        Ok(DeploymentContext::new(self.client.region(), &account_id, &unit.name))
    }

    fn orchestrator(&self, context: DeploymentContext) -> Orchestrator {
        let cloudcontrol = CloudControlClient::new(self.client.clone())
            .with_polling(self.settings.poll_interval(), self.settings.max_polls);
        Orchestrator::new(Arc::new(CloudControlProvisioner::new(cloudcontrol)), context)
            .with_max_concurrency(self.settings.max_concurrency)
    }

    async fn persist(&self, mut state: StackState, report: &DeploymentReport) -> StackpilotResult<()> {
        state.replace_resources(report.resources.clone());
        state.reconcile_interrupted(&report.interrupted, &report.deleted);
        if state.is_empty() {
            self.store.clear(&state.stack_name).await
        } else {
            self.store.save(&state).await
        }
    }
}
