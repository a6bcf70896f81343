//! On-disk instance records, one JSON file per instance.

use crate::error::Result;
use crate::instance::{Instance, InstanceId};
use std::path::{Path, PathBuf};

/// Persists instance records under a directory as `<id>.json`.
#[derive(Debug, Clone)]
pub struct InstanceStore {
    dir: PathBuf,
}

impl InstanceStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &InstanceId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Write (or overwrite) an instance record.
    pub async fn save(&self, instance: &Instance) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&instance.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(instance)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::trace!(instance_id = %instance.id, path = %path.display(), "Instance record saved");
        Ok(())
    }

    /// Remove an instance record. Missing records are not an error.
    pub async fn remove(&self, id: &InstanceId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every readable record. Unreadable or malformed files are
    /// skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<Instance>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut instances = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable instance record");
                    continue;
                }
            };
            match serde_json::from_slice::<Instance>(&data) {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping malformed instance record");
                }
            }
        }

        tracing::debug!(dir = %self.dir.display(), count = instances.len(), "Instance records loaded");
        Ok(instances)
    }
}
