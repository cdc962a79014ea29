use serde::{Deserialize, Serialize};
use stackpilot_aws::{AwsError, ErrorKind};
use stackpilot_deploy::{DeployError, GraphError};
use std::fmt;

/// Top-level error for settings, state files and the deployer facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackpilotError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StackpilotError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn io(context: &str, err: std::io::Error) -> Self {
        Self::new(ErrorKind::Configuration, format!("{}: {}", context, err))
    }
}

impl fmt::Display for StackpilotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for StackpilotError {}

impl From<AwsError> for StackpilotError {
    fn from(err: AwsError) -> Self {
        Self::new(err.kind, err.to_string())
    }
}

impl From<DeployError> for StackpilotError {
    fn from(err: DeployError) -> Self {
        Self::new(err.kind, err.to_string())
    }
}

impl From<GraphError> for StackpilotError {
    fn from(err: GraphError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

pub type StackpilotResult<T> = Result<T, StackpilotError>;
