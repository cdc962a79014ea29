//! CloudFormation-shaped template documents.

use crate::error::{DeployError, DeployResult};
use crate::graph::DependencyGraph;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// A parsed template. Resources keep document order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: IndexMap<String, Value>,
    #[serde(default)]
    pub resources: IndexMap<String, Value>,
}

impl Template {
    pub fn from_json_str(body: &str) -> DeployResult<Self> {
        serde_json::from_str(body)
            .map_err(|e| DeployError::template(format!("invalid JSON template: {}", e)))
    }

    pub fn from_yaml_str(body: &str) -> DeployResult<Self> {
        serde_yaml::from_str(body)
            .map_err(|e| DeployError::template(format!("invalid YAML template: {}", e)))
    }

    /// Read a template file; `.json` parses as JSON, anything else as YAML.
    pub async fn load(path: &Path) -> DeployResult<Self> {
        let body = tokio::fs::read_to_string(path).await.map_err(|e| {
            DeployError::template(format!("cannot read template {}: {}", path.display(), e))
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&body)
        } else {
            Self::from_yaml_str(&body)
        }
    }

    /// Default value declared for a parameter.
    pub fn parameter_default(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name).and_then(|p| p.get("Default"))
    }

    /// Build the dependency graph of the `Resources` section.
    ///
    /// Every resource needs a string `Type`. Parameters become non-node
    /// symbols. The graph is validated before it is returned.
    pub fn build_graph(&self) -> DeployResult<DependencyGraph> {
        let mut graph = DependencyGraph::with_parameters(self.parameters.keys().cloned());
        for (id, definition) in &self.resources {
            let resource_type = definition
                .get("Type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| {
                    DeployError::template(format!("resource '{}' has no string Type", id))
                        .with_resource(id.as_str())
                })?;
            graph.add_resource(id, resource_type, definition.clone())?;
        }
        graph.validate()?;
        Ok(graph)
    }
}

/// One independently deployable set of resources.
#[derive(Debug, Clone)]
pub struct DeploymentUnit {
    pub name: String,
    pub graph: DependencyGraph,
    /// Template parameter defaults, overridable at resolution time.
    pub parameter_defaults: IndexMap<String, Value>,
}

impl DeploymentUnit {
    pub fn new(name: &str, graph: DependencyGraph) -> Self {
        Self {
            name: name.to_string(),
            graph,
            parameter_defaults: IndexMap::new(),
        }
    }

    pub fn from_template(name: &str, template: &Template) -> DeployResult<Self> {
        let graph = template.build_graph()?;
        let parameter_defaults = template
            .parameters
            .keys()
            .filter_map(|k| template.parameter_default(k).map(|v| (k.clone(), v.clone())))
            .collect();
        Ok(Self {
            name: name.to_string(),
            graph,
            parameter_defaults,
        })
    }
}
