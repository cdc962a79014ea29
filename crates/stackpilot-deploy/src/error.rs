//! Error types for graph construction and deployment.

use serde::{Deserialize, Serialize};
use stackpilot_aws::{AwsError, ErrorKind};
use std::fmt;

/// A structural problem in the resource graph.
///
/// Raised synchronously, before any network call, and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphError {
    /// Two resources share a logical id.
    DuplicateResource { id: String },
    /// `id` depends on `missing`, which is not in the graph.
    DanglingDependency { id: String, missing: String },
    /// A cycle was detected when the walk reached `id` again.
    CircularDependency { id: String },
}

impl GraphError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }

    /// The ids this error is about.
    pub fn resource_ids(&self) -> Vec<&str> {
        match self {
            GraphError::DuplicateResource { id } | GraphError::CircularDependency { id } => {
                vec![id.as_str()]
            }
            GraphError::DanglingDependency { id, missing } => vec![id.as_str(), missing.as_str()],
        }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::DuplicateResource { id } => {
                write!(f, "resource '{}' is declared more than once", id)
            }
            GraphError::DanglingDependency { id, missing } => {
                write!(f, "resource '{}' depends on unknown resource '{}'", id, missing)
            }
            GraphError::CircularDependency { id } => {
                write!(f, "circular dependency detected at resource '{}'", id)
            }
        }
    }
}

impl std::error::Error for GraphError {}

pub type GraphResult<T> = Result<T, GraphError>;

/// Failure of a deployment step that is not tied to a single API call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployError {
    pub kind: ErrorKind,
    pub message: String,
    /// Logical id the error is about, if any.
    pub resource_id: Option<String>,
}

impl DeployError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            resource_id: None,
        }
    }

    pub fn with_resource(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    /// Malformed template document.
    pub fn template(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// A reference that cannot be resolved from earlier outputs.
    pub fn unresolved(id: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message).with_resource(id)
    }
}

impl fmt::Display for DeployError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource_id {
            Some(ref id) => write!(f, "{} error for '{}': {}", self.kind, id, self.message),
            None => write!(f, "{} error: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for DeployError {}

impl From<GraphError> for DeployError {
    fn from(err: GraphError) -> Self {
        let ids = err.resource_ids();
        let mut out = Self::new(err.kind(), err.to_string());
        out.resource_id = ids.first().map(|s| s.to_string());
        out
    }
}

impl From<AwsError> for DeployError {
    fn from(err: AwsError) -> Self {
        Self::new(err.kind, err.to_string())
    }
}

pub type DeployResult<T> = Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_names_ids() {
        let err = GraphError::DanglingDependency {
            id: "Web".into(),
            missing: "Db".into(),
        };
        assert_eq!(err.resource_ids(), vec!["Web", "Db"]);
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("'Db'"));
    }

    #[test]
    fn graph_error_converts_to_deploy_error() {
        let err: DeployError = GraphError::CircularDependency { id: "A".into() }.into();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert_eq!(err.resource_id.as_deref(), Some("A"));
    }

    #[test]
    fn graph_error_serializes_tagged() {
        let json = serde_json::to_value(GraphError::DuplicateResource { id: "X".into() }).unwrap();
        assert_eq!(json["type"], "duplicate_resource");
        assert_eq!(json["id"], "X");
    }
}
