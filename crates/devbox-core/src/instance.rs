//! Instance data model - the unit a provider manages.

use crate::error::ProviderError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Unique identifier for an instance, generated by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Which backend owns an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    /// Docker engine.
    Docker,
    /// Podman engine (docker-compatible CLI).
    Podman,
    /// Remote virtual machine backend.
    RemoteVm,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Podman => write!(f, "podman"),
            Self::RemoteVm => write!(f, "remote-vm"),
        }
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            "remote-vm" | "remote_vm" | "vm" => Ok(Self::RemoteVm),
            other => Err(format!("unknown provider type: {other}")),
        }
    }
}

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Backend resources are being provisioned.
    Creating,
    /// Instance is up.
    Running,
    /// Instance exists but is not running.
    Stopped,
    /// Teardown in progress.
    Deleting,
    /// Gone. Terminal.
    Deleted,
    /// Backend reported a failure.
    Error,
}

impl InstanceStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Forward-only, except that `Running` and `Stopped` are the same rank
    /// and `Error` is reachable from every non-terminal state.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Error) => self != Error,
            (Creating, Running | Stopped | Deleting) => true,
            (Running, Stopped | Deleting) => true,
            (Stopped, Running | Deleting) => true,
            (Deleting, Deleted) => true,
            (Error, Deleting) => true,
            _ => false,
        }
    }

    /// True for `Deleted`.
    pub fn is_terminal(self) -> bool {
        self == InstanceStatus::Deleted
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "deleting" => Ok(Self::Deleting),
            "deleted" => Ok(Self::Deleted),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

// ============================================================================
// Creation request
// ============================================================================

/// Requested CPU.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuRequest {
    /// Number of cores (fractional allowed).
    #[serde(default)]
    pub cores: Option<f64>,
    /// Hard limit in millicores. Defaults to `cores * 1000`.
    #[serde(default)]
    pub limit: Option<u64>,
}

/// Requested memory, in engine notation (`512m`, `2g`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryRequest {
    /// Guaranteed minimum.
    #[serde(default)]
    pub min: Option<String>,
    /// Ceiling. Defaults to `min`.
    #[serde(default)]
    pub max: Option<String>,
}

/// Requested storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageRequest {
    /// Size in engine notation.
    pub size: String,
}

/// Resource block of an instance configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default)]
    pub cpu: Option<CpuRequest>,
    #[serde(default)]
    pub memory: Option<MemoryRequest>,
    #[serde(default)]
    pub storage: Option<StorageRequest>,
}

/// Host-to-container port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// The create-time request for an instance. Immutable once the instance
/// exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub name: String,
    pub image: String,
    pub workspace_path: String,
    #[serde(default)]
    pub resources: Option<ResourceRequest>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

impl InstanceConfig {
    /// Create a config with the required fields and the given CPU/memory
    /// request.
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        workspace_path: impl Into<String>,
        cores: f64,
        memory_min: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            workspace_path: workspace_path.into(),
            resources: Some(ResourceRequest {
                cpu: Some(CpuRequest {
                    cores: Some(cores),
                    limit: None,
                }),
                memory: Some(MemoryRequest {
                    min: Some(memory_min.into()),
                    max: None,
                }),
                storage: None,
            }),
            ..Default::default()
        }
    }

    /// Requested core count, if any.
    pub fn cpu_cores(&self) -> Option<f64> {
        self.resources.as_ref()?.cpu.as_ref()?.cores
    }

    /// Effective memory ceiling in engine notation (`max`, else `min`).
    pub fn memory_ceiling(&self) -> Option<&str> {
        let memory = self.resources.as_ref()?.memory.as_ref()?;
        memory.max.as_deref().or(memory.min.as_deref())
    }
}

// ============================================================================
// Resource accounting
// ============================================================================

/// Usage and enforced ceiling for one resource dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Advisory telemetry.
    pub used: u64,
    /// Ceiling handed to the backend.
    pub limit: u64,
}

/// Per-dimension resource accounting. CPU is in millicores, memory and
/// storage in bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceResources {
    pub cpu: ResourceUsage,
    pub memory: ResourceUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<ResourceUsage>,
}

/// Parse an engine-notation size (`512m`, `2g`, `1.5GiB`, `1024`) to bytes.
///
/// Units are binary multiples, matching the docker CLI.
pub fn parse_memory_bytes(value: &str) -> Option<u64> {
    let value = value.trim().to_lowercase();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    if number < 0.0 {
        return None;
    }

    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" | "ki" | "kib" => 1 << 10,
        "m" | "mb" | "mi" | "mib" => 1 << 20,
        "g" | "gb" | "gi" | "gib" => 1 << 30,
        "t" | "tb" | "ti" | "tib" => 1 << 40,
        _ => return None,
    };

    Some((number * multiplier as f64) as u64)
}

// ============================================================================
// Network
// ============================================================================

/// Network endpoints of an instance. Empty until the backend reports them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceNetwork {
    #[serde(default)]
    pub internal_ip: Option<String>,
    #[serde(default)]
    pub external_ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub urls: Vec<String>,
}

// ============================================================================
// Instance
// ============================================================================

/// A provisioned development environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub provider_instance_id: String,
    pub provider_type: ProviderType,
    pub status: InstanceStatus,
    pub config: InstanceConfig,
    pub resources: InstanceResources,
    pub network: InstanceNetwork,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Instance {
    /// Move to `next`, enforcing the status state machine.
    pub fn transition(&mut self, next: InstanceStatus) -> Result<(), ProviderError> {
        if !self.status.can_transition_to(next) {
            return Err(ProviderError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(instance_id = %self.id, from = %self.status, to = %next, "Instance status changed");
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Bump `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether this instance still holds its name.
    pub fn is_live(&self) -> bool {
        !matches!(self.status, InstanceStatus::Deleting | InstanceStatus::Deleted)
    }
}

/// Partial configuration accepted by `update_instance`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceUpdate {
    /// New display name.
    #[serde(default)]
    pub name: Option<String>,
    /// New resource ceilings.
    #[serde(default)]
    pub resources: Option<ResourceUpdate>,
    /// Metadata entries merged into the current ones.
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Resource ceilings accepted by `update_instance`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUpdate {
    #[serde(default)]
    pub cpu_cores: Option<f64>,
    #[serde(default)]
    pub memory_max: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceStatus::*;

    #[test]
    fn test_forward_transitions() {
        assert!(Creating.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Running.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        assert!(!Running.can_transition_to(Creating));
        assert!(!Deleting.can_transition_to(Running));
        assert!(!Deleted.can_transition_to(Deleting));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_error_reachable_from_non_terminal() {
        for status in [Creating, Running, Stopped, Deleting] {
            assert!(status.can_transition_to(Error), "{status} -> error");
        }
        assert!(!Deleted.can_transition_to(Error));
        assert!(!Error.can_transition_to(Error));
        assert!(Error.can_transition_to(Deleting));
        assert!(!Error.can_transition_to(Running));
    }

    #[test]
    fn test_status_roundtrip_str() {
        for status in [Creating, Running, Stopped, Deleting, Deleted, Error] {
            assert_eq!(status.to_string().parse::<InstanceStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_provider_type_parse() {
        assert_eq!("docker".parse::<ProviderType>(), Ok(ProviderType::Docker));
        assert_eq!("PODMAN".parse::<ProviderType>(), Ok(ProviderType::Podman));
        assert_eq!("remote-vm".parse::<ProviderType>(), Ok(ProviderType::RemoteVm));
        assert!("kvm".parse::<ProviderType>().is_err());
    }

    #[test]
    fn test_parse_memory_bytes() {
        assert_eq!(parse_memory_bytes("1024"), Some(1024));
        assert_eq!(parse_memory_bytes("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("2GiB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("1.5k"), Some(1536));
        assert_eq!(parse_memory_bytes("lots"), None);
        assert_eq!(parse_memory_bytes("10x"), None);
    }

    #[test]
    fn test_memory_ceiling_prefers_max() {
        let mut config = InstanceConfig::new("dev", "img", "/ws", 1.0, "512m");
        assert_eq!(config.memory_ceiling(), Some("512m"));

        if let Some(memory) = config
            .resources
            .as_mut()
            .and_then(|r| r.memory.as_mut())
        {
            memory.max = Some("1g".into());
        }
        assert_eq!(config.memory_ceiling(), Some("1g"));
    }

    #[test]
    fn test_config_serde_camel_case() {
        let config = InstanceConfig::new("dev", "img", "/ws", 2.0, "1g");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["workspacePath"], "/ws");
        assert_eq!(json["resources"]["cpu"]["cores"], 2.0);
    }
}
