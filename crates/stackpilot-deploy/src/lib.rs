//! # stackpilot-deploy – dependency-ordered deployment
//!
//! ```text
//! Template ──► DependencyGraph ──► layers()
//!                                     │
//!                 Orchestrator ◄──────┘
//!                 ├── resolve (Ref / GetAtt / Sub against earlier layers)
//!                 └── ResourceProvisioner (Cloud Control)
//! ```

pub mod error;
pub mod refs;
pub mod graph;
pub mod template;
pub mod resolve;
pub mod state;
pub mod provisioner;
pub mod orchestrator;

pub use error::{DeployError, DeployResult, GraphError, GraphResult};
pub use graph::{DependencyGraph, ResourceNode};
pub use orchestrator::{
    ActionType, DeploymentPlan, DeploymentReport, FailedResource, Orchestrator, PlannedAction,
};
pub use provisioner::{
    CloudControlProvisioner, ProvisionRequest, ProvisionedResource, ResourceProvisioner,
};
pub use resolve::DeploymentContext;
pub use state::StackState;
pub use template::{DeploymentUnit, Template};
