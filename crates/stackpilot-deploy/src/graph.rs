//! Resource dependency graph.
//!
//! Nodes keep insertion order; each node's dependency set is derived from its
//! definition and never edited by hand. Ordering is a depth-first walk with
//! three-colour marking: roots in insertion order, dependencies in sorted
//! order, so an unchanged graph always yields the same order.

use crate::error::{GraphError, GraphResult};
use crate::refs::{collect_references, explicit_dependencies};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// One infrastructure resource under management.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceNode {
    pub id: String,
    /// Provider type name, e.g. `AWS::S3::Bucket`.
    pub resource_type: String,
    /// Resource body: `Properties`, `DependsOn`, and anything else.
    pub definition: Value,
    dependencies: BTreeSet<String>,
}

impl ResourceNode {
    /// Build a node and derive its dependencies from `definition`.
    pub fn new(id: &str, resource_type: &str, definition: Value, parameters: &BTreeSet<String>) -> Self {
        let mut node = Self {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            definition: Value::Null,
            dependencies: BTreeSet::new(),
        };
        node.set_definition(definition, parameters);
        node
    }

    /// Build a node with a known dependency set and no definition.
    pub fn with_dependencies(id: &str, resource_type: &str, dependencies: BTreeSet<String>) -> Self {
        Self {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            definition: Value::Null,
            dependencies,
        }
    }

    /// Replace the definition and recompute dependencies.
    pub fn set_definition(&mut self, definition: Value, parameters: &BTreeSet<String>) {
        let mut deps = explicit_dependencies(&definition);
        deps.extend(collect_references(&definition, parameters));
        self.dependencies = deps;
        self.definition = definition;
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    /// The `Properties` object, or `{}`.
    pub fn properties(&self) -> Value {
        match self.definition.get("Properties") {
            Some(p) if !p.is_null() => p.clone(),
            _ => Value::Object(Default::default()),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// The set of resources of one deployment unit and their edges.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: IndexMap<String, ResourceNode>,
    /// Declared template parameters; never treated as resources.
    parameters: BTreeSet<String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph whose references to `parameters` are not dependencies.
    pub fn with_parameters<I, S>(parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: IndexMap::new(),
            parameters: parameters.into_iter().map(Into::into).collect(),
        }
    }

    pub fn parameters(&self) -> &BTreeSet<String> {
        &self.parameters
    }

    /// Add a resource, deriving its dependencies from `definition`.
    pub fn add_resource(&mut self, id: &str, resource_type: &str, definition: Value) -> GraphResult<()> {
        let node = ResourceNode::new(id, resource_type, definition, &self.parameters);
        self.add_node(node)
    }

    /// Add a pre-built node.
    pub fn add_node(&mut self, node: ResourceNode) -> GraphResult<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateResource { id: node.id });
        }
        if node.dependencies.contains(&node.id) {
            return Err(GraphError::CircularDependency { id: node.id });
        }
        log::debug!("Graph node {} depends on {:?}", node.id, node.dependencies);
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|k| k.as_str())
    }

    /// Check that every dependency names a node in the graph.
    pub fn validate(&self) -> GraphResult<()> {
        for node in self.nodes.values() {
            if let Some(missing) = node.dependencies.iter().find(|d| !self.nodes.contains_key(*d)) {
                return Err(GraphError::DanglingDependency {
                    id: node.id.clone(),
                    missing: missing.clone(),
                });
            }
        }
        Ok(())
    }

    /// Dependencies-first order of every node.
    pub fn topological_sort(&self) -> GraphResult<Vec<String>> {
        self.validate()?;
        let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(self.nodes.len());
        let mut order: Vec<&str> = Vec::with_capacity(self.nodes.len());
        for id in self.nodes.keys() {
            self.visit(id, &mut marks, &mut order)?;
        }
        Ok(order.into_iter().map(String::from).collect())
    }

    /// Depth-first from `root` with an explicit stack of pending
    /// dependency iterators, so chain length is not bounded by the call stack.
    fn visit<'a>(
        &'a self,
        root: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        order: &mut Vec<&'a str>,
    ) -> GraphResult<()> {
        if marks.contains_key(root) {
            return Ok(());
        }
        marks.insert(root, Mark::InProgress);
        let mut stack = vec![(root, self.dependency_iter(root))];

        while let Some((id, deps)) = stack.last_mut() {
            match deps.next() {
                Some(dep) => match marks.get(dep.as_str()) {
                    Some(Mark::Done) => {}
                    Some(Mark::InProgress) => {
                        return Err(GraphError::CircularDependency { id: dep.clone() })
                    }
                    None => {
                        marks.insert(dep.as_str(), Mark::InProgress);
                        stack.push((dep.as_str(), self.dependency_iter(dep)));
                    }
                },
                None => {
                    let id = *id;
                    marks.insert(id, Mark::Done);
                    order.push(id);
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    fn dependency_iter<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a String> + 'a {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|node| node.dependencies.iter())
    }

    /// Group nodes so each sits one layer above its deepest dependency.
    ///
    /// Members of a layer are independent of each other and keep
    /// topological order.
    pub fn layers(&self) -> GraphResult<Vec<Vec<String>>> {
        let order = self.topological_sort()?;
        let mut level: HashMap<&str, usize> = HashMap::with_capacity(order.len());
        let mut layers: Vec<Vec<String>> = Vec::new();

        for id in &order {
            let depth = self.nodes[id.as_str()]
                .dependencies
                .iter()
                .filter_map(|d| level.get(d.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(id.as_str(), depth);
            if layers.len() <= depth {
                layers.resize_with(depth + 1, Vec::new);
            }
            layers[depth].push(id.clone());
        }
        Ok(layers)
    }

    /// `layers()` reversed: dependents are removed before what they use.
    pub fn deletion_layers(&self) -> GraphResult<Vec<Vec<String>>> {
        let mut layers = self.layers()?;
        layers.reverse();
        Ok(layers)
    }

    /// Ids whose dependency set contains `id`, in insertion order.
    pub fn get_dependents(&self, id: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.dependencies.contains(id))
            .map(|n| n.id.clone())
            .collect()
    }

    /// `id` plus everything that transitively depends on it.
    pub fn teardown_closure(&self, id: &str) -> BTreeSet<String> {
        let mut closure = BTreeSet::new();
        if !self.nodes.contains_key(id) {
            return closure;
        }
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if closure.insert(current.clone()) {
                stack.extend(self.get_dependents(&current));
            }
        }
        closure
    }

    /// The induced subgraph over `ids`; edges to nodes outside are dropped.
    pub fn subgraph(&self, ids: &BTreeSet<String>) -> DependencyGraph {
        let mut sub = DependencyGraph {
            nodes: IndexMap::new(),
            parameters: self.parameters.clone(),
        };
        for node in self.nodes.values().filter(|n| ids.contains(&n.id)) {
            let mut node = node.clone();
            node.dependencies.retain(|d| ids.contains(d));
            sub.nodes.insert(node.id.clone(), node);
        }
        sub
    }
}
