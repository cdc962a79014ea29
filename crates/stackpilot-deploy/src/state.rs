//! What a deployment unit currently has in the cloud.

use crate::provisioner::ProvisionedResource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    pub stack_name: String,
    #[serde(default)]
    pub resources: BTreeMap<String, ProvisionedResource>,
    /// Ids whose operation was aborted mid-flight and may exist without
    /// being recorded in `resources`.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub interrupted: BTreeSet<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StackState {
    pub fn new(stack_name: &str) -> Self {
        Self {
            stack_name: stack_name.to_string(),
            ..Self::default()
        }
    }

    pub fn get(&self, id: &str) -> Option<&ProvisionedResource> {
        self.resources.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    /// Nothing recorded and nothing in doubt.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.interrupted.is_empty()
    }

    /// Replace the resource set and stamp the time.
    pub fn replace_resources(&mut self, resources: BTreeMap<String, ProvisionedResource>) {
        self.resources = resources;
        self.updated_at = Some(Utc::now());
    }

    /// Fold in the ids a run left in doubt. Ids now recorded in
    /// `resources`, or confirmed deleted, are no longer in doubt.
    pub fn reconcile_interrupted<'a>(
        &mut self,
        interrupted: impl IntoIterator<Item = &'a String>,
        deleted: impl IntoIterator<Item = &'a String>,
    ) {
        self.interrupted.extend(interrupted.into_iter().cloned());
        for id in deleted {
            self.interrupted.remove(id);
        }
        let resources = &self.resources;
        self.interrupted.retain(|id| !resources.contains_key(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_round_trips_through_json() {
        let mut state = StackState::new("demo");
        let resource: ProvisionedResource = serde_json::from_value(json!({
            "logical_id": "Bucket",
            "resource_type": "AWS::S3::Bucket",
            "physical_id": "demo-bucket"
        }))
        .unwrap();
        state.replace_resources(BTreeMap::from([("Bucket".to_string(), resource)]));
        assert!(state.updated_at.is_some());

        let text = serde_json::to_string(&state).unwrap();
        let back: StackState = serde_json::from_str(&text).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.get("Bucket").unwrap().physical_id, "demo-bucket");
    }

    #[test]
    fn interrupted_ids_clear_once_recorded_or_deleted() {
        let none: [String; 0] = [];
        let mut state = StackState::new("demo");
        state.reconcile_interrupted(&["Queue".to_string(), "Topic".to_string()], &none);
        assert!(!state.is_empty());

        let resource: ProvisionedResource = serde_json::from_value(json!({
            "logical_id": "Queue",
            "resource_type": "AWS::SQS::Queue",
            "physical_id": "q"
        }))
        .unwrap();
        state.replace_resources(BTreeMap::from([("Queue".to_string(), resource)]));
        state.reconcile_interrupted(&none, &["Topic".to_string()]);
        assert!(state.interrupted.is_empty());
    }
}
