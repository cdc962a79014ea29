//! # State Store
//!
//! Persists the [`StackState`] of each stack as pretty-printed JSON in
//! `<state_dir>/<stack>.json`.
//!
//! Writes go to a sibling temp file first and are renamed into place, so a
//! crash mid-write leaves the previous state intact. A stack that has never
//! been deployed has no file and loads as empty state.
//!
//! ## Example
//!
//! ```rust,no_run
//! # async fn example() -> stackpilot::StackpilotResult<()> {
//! let store = stackpilot::StateStore::new("/var/lib/stackpilot");
//! let mut state = store.load("web").await?;
//! state.replace_resources(Default::default());
//! store.save(&state).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{StackpilotError, StackpilotResult};
use stackpilot_deploy::StackState;
use std::path::{Path, PathBuf};

pub struct StateStore {
    /// Directory holding one file per stack.
    dir: PathBuf,
}

impl StateStore {
    /// Creates a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the state file for `stack`.
    ///
    /// Characters outside `[A-Za-z0-9._-]` are replaced with `_` so a stack
    /// name can never escape the state directory.
    pub fn path_for(&self, stack: &str) -> PathBuf {
        let safe: String = stack
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    /// Checks whether `stack` has persisted state.
    pub async fn exists(&self, stack: &str) -> bool {
        tokio::fs::try_exists(self.path_for(stack)).await.unwrap_or(false)
    }

    /// Loads the state of `stack`.
    ///
    /// # Returns
    ///
    /// The stored state, or an empty [`StackState`] if no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(&self, stack: &str) -> StackpilotResult<StackState> {
        let path = self.path_for(stack);
        let body = match tokio::fs::read_to_string(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No state for '{}' at {}", stack, path.display());
                return Ok(StackState::new(stack));
            }
            Err(e) => return Err(StackpilotError::io(&format!("cannot read {}", path.display()), e)),
        };
        serde_json::from_str(&body).map_err(|e| {
            StackpilotError::configuration(format!("corrupt state file {}: {}", path.display(), e))
        })
    }

    /// Saves `state` under its stack name.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written or renamed.
    pub async fn save(&self, state: &StackState) -> StackpilotResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StackpilotError::io(&format!("cannot create {}", self.dir.display()), e))?;
        let path = self.path_for(&state.stack_name);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| StackpilotError::configuration(format!("cannot encode state: {}", e)))?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StackpilotError::io(&format!("cannot write {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StackpilotError::io(&format!("cannot replace {}", path.display()), e))?;
        log::debug!(
            "Saved state for '{}' ({} resources)",
            state.stack_name,
            state.resources.len()
        );
        Ok(())
    }

    /// Deletes the state file of `stack`; a missing file is not an error.
    pub async fn clear(&self, stack: &str) -> StackpilotResult<()> {
        let path = self.path_for(stack);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StackpilotError::io(&format!("cannot remove {}", path.display()), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stackpilot_deploy::ProvisionedResource;
    use std::collections::{BTreeMap, BTreeSet};

    fn bucket() -> ProvisionedResource {
        ProvisionedResource {
            logical_id: "Bucket".into(),
            resource_type: "AWS::S3::Bucket".into(),
            physical_id: "web-bucket".into(),
            attributes: BTreeMap::from([("Arn".to_string(), json!("arn:aws:s3:::web-bucket"))]),
            properties: json!({"BucketName": "web-bucket"}),
            dependencies: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = store.load("web").await.unwrap();
        assert_eq!(state.stack_name, "web");
        assert!(state.is_empty());
        assert!(!store.exists("web").await);
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested"));
        let mut state = StackState::new("web");
        state.replace_resources(BTreeMap::from([("Bucket".to_string(), bucket())]));
        store.save(&state).await.unwrap();

        assert!(store.exists("web").await);
        assert!(!store.path_for("web").with_extension("json.tmp").exists());
        let loaded = store.load("web").await.unwrap();
        assert_eq!(loaded, state);

        store.clear("web").await.unwrap();
        assert!(!store.exists("web").await);
        store.clear("web").await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        tokio::fs::write(store.path_for("web"), "not json").await.unwrap();
        assert!(store.load("web").await.is_err());
    }

    #[test]
    fn stack_names_stay_inside_the_directory() {
        let store = StateStore::new("/state");
        assert_eq!(store.path_for("../etc/passwd"), PathBuf::from("/state/.._etc_passwd.json"));
        assert_eq!(store.path_for("web-prod_1"), PathBuf::from("/state/web-prod_1.json"));
    }
}
