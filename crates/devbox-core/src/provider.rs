//! Provider contract - the capability surface every backend implements.

use crate::error::Result;
use crate::instance::{Instance, InstanceConfig, InstanceId, InstanceStatus, InstanceUpdate, ProviderType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a provider can do. Callers check this before offering an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    pub start_stop: bool,
    pub logs: bool,
    pub exec: bool,
    pub live_update: bool,
    pub networking: bool,
    pub persistent_storage: bool,
}

/// Filter for `list_instances`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceFilter {
    /// Only instances in this status.
    #[serde(default)]
    pub status: Option<InstanceStatus>,
    /// Only instances whose name contains this substring.
    #[serde(default)]
    pub name_contains: Option<String>,
}

impl InstanceFilter {
    /// Whether an instance passes the filter.
    pub fn matches(&self, instance: &Instance) -> bool {
        if let Some(status) = self.status {
            if instance.status != status {
                return false;
            }
        }
        if let Some(needle) = &self.name_contains {
            if !instance.name.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Options for `get_instance_logs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOptions {
    /// Only the last N lines.
    #[serde(default)]
    pub tail: Option<u32>,
    /// Only lines since this timestamp or relative duration (`10m`).
    #[serde(default)]
    pub since: Option<String>,
    /// Prefix lines with timestamps.
    #[serde(default)]
    pub timestamps: bool,
}

/// Result of a command executed inside an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    /// Exit code of the command (0 = success, -1 if unknown).
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

/// A backend implementation of the instance lifecycle.
///
/// Concrete providers compose the helpers in [`crate::base`] for id
/// generation, validation and base instance construction, and implement
/// only the backend-specific calls here.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend type this provider serves.
    fn provider_type(&self) -> ProviderType;

    /// Prepare the backend (connectivity checks, networks, persisted state).
    async fn initialize(&self) -> Result<()>;

    /// Report supported operations.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Provision a new instance.
    async fn create_instance(&self, config: InstanceConfig) -> Result<Instance>;

    /// Look up an instance by id.
    async fn get_instance(&self, id: &InstanceId) -> Result<Option<Instance>>;

    /// List instances, optionally filtered.
    async fn list_instances(&self, filter: Option<InstanceFilter>) -> Result<Vec<Instance>>;

    /// Start a stopped instance.
    async fn start_instance(&self, id: &InstanceId) -> Result<Instance>;

    /// Stop a running instance. `force` kills instead of a graceful stop.
    async fn stop_instance(&self, id: &InstanceId, force: bool) -> Result<Instance>;

    /// Delete an instance. Returns false if it did not exist.
    async fn delete_instance(&self, id: &InstanceId) -> Result<bool>;

    /// Apply a partial configuration update.
    async fn update_instance(&self, id: &InstanceId, update: InstanceUpdate) -> Result<Instance>;

    /// Fetch instance logs.
    async fn get_instance_logs(&self, id: &InstanceId, options: LogOptions) -> Result<String>;

    /// Execute a command inside the instance.
    async fn execute_command(&self, id: &InstanceId, command: &[String]) -> Result<ExecResult>;
}
