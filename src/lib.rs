//! # stackpilot
//!
//! Deploys CloudFormation-shaped templates through the AWS Cloud Control
//! API in dependency order.
//!
//! ```text
//! Settings ─► Deployer ─► Orchestrator ─► CloudControlProvisioner
//!                │              │                  │
//!            StateStore   DependencyGraph      AwsClient (SigV4, retry)
//! ```
//!
//! The graph and orchestrator live in `stackpilot-deploy`; signing,
//! credentials and the dispatcher live in `stackpilot-aws`. This crate adds
//! settings, logging, persisted state and the [`Deployer`] facade.

pub mod deployer;
pub mod error;
pub mod logging;
pub mod settings;
pub mod state;

pub use deployer::Deployer;
pub use error::{StackpilotError, StackpilotResult};
pub use settings::{LogFormat, Settings};
pub use state::StateStore;

pub use stackpilot_aws as aws;
pub use stackpilot_deploy as deploy;
