//! Backend-independent provider logic.
//!
//! Concrete providers hold a [`ProviderBase`] and call it explicitly for id
//! generation, configuration validation and base instance construction, so
//! every backend produces structurally identical [`Instance`] values.

use crate::error::{ProviderError, Result};
use crate::instance::{
    parse_memory_bytes, Instance, InstanceConfig, InstanceId, InstanceNetwork, InstanceResources,
    InstanceStatus, ProviderType, ResourceUsage,
};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Length of the random id suffix.
const SUFFIX_LEN: usize = 5;

/// Alphabet for base36 encoding and the random suffix.
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Shared helpers for one provider instance.
#[derive(Debug)]
pub struct ProviderBase {
    provider_type: ProviderType,
    prefix: String,
    /// Last timestamp (ms) handed out; ids never reuse a timestamp.
    last_stamp: AtomicU64,
}

impl ProviderBase {
    /// Create helpers for a provider with the given id prefix.
    pub fn new(provider_type: ProviderType, prefix: impl Into<String>) -> Self {
        Self {
            provider_type,
            prefix: prefix.into(),
            last_stamp: AtomicU64::new(0),
        }
    }

    /// Backend type stamped on built instances.
    pub fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    /// Generate an instance id: `{prefix}-{base36 timestamp}-{5 random chars}`.
    ///
    /// The timestamp component is strictly increasing per `ProviderBase`, so
    /// bursts within one millisecond still get distinct stamps. Across
    /// processes uniqueness is probabilistic; a duplicate rejected by the
    /// backend surfaces as a create failure.
    pub fn generate_instance_id(&self) -> InstanceId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut prev = self.last_stamp.load(Ordering::Relaxed);
        let stamp = loop {
            let next = now.max(prev + 1);
            match self.last_stamp.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break next,
                Err(actual) => prev = actual,
            }
        };

        let mut rng = rand::thread_rng();
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
            .collect();

        InstanceId::new(format!("{}-{}-{}", self.prefix, to_base36(stamp), suffix))
    }

    /// Validate an instance configuration before any backend call.
    ///
    /// Checks, in order: `name`, `image`, `workspacePath`, `resources`,
    /// `resources.cpu.cores`, `resources.memory.min`. Fails on the first
    /// missing or invalid field only.
    pub fn validate_instance_config(config: &InstanceConfig) -> Result<()> {
        if config.name.trim().is_empty() {
            return Err(ProviderError::missing("name"));
        }
        if config.image.trim().is_empty() {
            return Err(ProviderError::missing("image"));
        }
        if config.workspace_path.trim().is_empty() {
            return Err(ProviderError::missing("workspacePath"));
        }

        let resources = config
            .resources
            .as_ref()
            .ok_or_else(|| ProviderError::missing("resources"))?;

        let cores = resources
            .cpu
            .as_ref()
            .and_then(|cpu| cpu.cores)
            .ok_or_else(|| ProviderError::missing("resources.cpu.cores"))?;
        if !cores.is_finite() || cores <= 0.0 {
            return Err(ProviderError::Validation {
                field: "resources.cpu.cores",
                message: format!("resources.cpu.cores must be a positive number, got {cores}"),
            });
        }

        let memory_min = resources
            .memory
            .as_ref()
            .and_then(|memory| memory.min.as_deref())
            .filter(|min| !min.trim().is_empty())
            .ok_or_else(|| ProviderError::missing("resources.memory.min"))?;
        if parse_memory_bytes(memory_min).is_none() {
            return Err(ProviderError::Validation {
                field: "resources.memory.min",
                message: format!("resources.memory.min is not a valid size: {memory_min}"),
            });
        }

        Ok(())
    }

    /// Build the canonical instance object for a freshly created backend
    /// resource.
    ///
    /// Status is `Creating`, usage is zero, limits come from the request
    /// (CPU defaults to `cores * 1000` millicores, memory to the minimum
    /// when no maximum is given), storage is present only if requested,
    /// and network fields stay empty until the backend reports them.
    pub fn build_base_instance(
        &self,
        id: InstanceId,
        name: impl Into<String>,
        provider_instance_id: impl Into<String>,
        config: InstanceConfig,
    ) -> Instance {
        let resources = config.resources.clone().unwrap_or_default();

        let cpu_limit = resources
            .cpu
            .as_ref()
            .and_then(|cpu| {
                cpu.limit
                    .or_else(|| cpu.cores.map(|cores| (cores * 1000.0).round() as u64))
            })
            .unwrap_or(0);

        let memory_limit = resources
            .memory
            .as_ref()
            .and_then(|memory| {
                memory
                    .max
                    .as_deref()
                    .and_then(parse_memory_bytes)
                    .or_else(|| memory.min.as_deref().and_then(parse_memory_bytes))
            })
            .unwrap_or(0);

        let storage = resources.storage.as_ref().map(|storage| ResourceUsage {
            used: 0,
            limit: parse_memory_bytes(&storage.size).unwrap_or(0),
        });

        let now = Utc::now();
        Instance {
            id,
            name: name.into(),
            provider_instance_id: provider_instance_id.into(),
            provider_type: self.provider_type,
            status: InstanceStatus::Creating,
            config,
            resources: InstanceResources {
                cpu: ResourceUsage {
                    used: 0,
                    limit: cpu_limit,
                },
                memory: ResourceUsage {
                    used: 0,
                    limit: memory_limit,
                },
                storage,
            },
            network: InstanceNetwork::default(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }
}

/// Encode a number in lowercase base36.
fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".into();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{CpuRequest, MemoryRequest, ResourceRequest, StorageRequest};
    use std::collections::HashSet;

    fn base() -> ProviderBase {
        ProviderBase::new(ProviderType::Docker, "devbox")
    }

    fn valid_config() -> InstanceConfig {
        InstanceConfig::new("dev", "codercom/code-server:latest", "/home/me/project", 2.0, "1g")
    }

    fn field_of(config: &InstanceConfig) -> Option<&'static str> {
        ProviderBase::validate_instance_config(config)
            .err()
            .and_then(|e| e.field())
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_295), "zz");
    }

    #[test]
    fn test_id_format() {
        let id = base().generate_instance_id();
        let parts: Vec<&str> = id.as_str().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "devbox");
        assert!(u64::from_str_radix(parts[1], 36).is_ok());
        assert_eq!(parts[2].len(), SUFFIX_LEN);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_ids_distinct_in_tight_loop() {
        let base = base();
        let ids: HashSet<InstanceId> = (0..10_000).map(|_| base.generate_instance_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(ProviderBase::validate_instance_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_each_missing_field_reported_alone() {
        let mut config = valid_config();
        config.name.clear();
        assert_eq!(field_of(&config), Some("name"));

        let mut config = valid_config();
        config.image.clear();
        assert_eq!(field_of(&config), Some("image"));

        let mut config = valid_config();
        config.workspace_path.clear();
        assert_eq!(field_of(&config), Some("workspacePath"));

        let mut config = valid_config();
        config.resources = None;
        assert_eq!(field_of(&config), Some("resources"));

        let mut config = valid_config();
        if let Some(r) = config.resources.as_mut() {
            r.cpu = Some(CpuRequest::default());
        }
        assert_eq!(field_of(&config), Some("resources.cpu.cores"));

        let mut config = valid_config();
        if let Some(r) = config.resources.as_mut() {
            r.memory = None;
        }
        assert_eq!(field_of(&config), Some("resources.memory.min"));
    }

    #[test]
    fn test_validation_message_names_field() {
        let mut config = valid_config();
        config.image = "   ".into();
        let err = ProviderBase::validate_instance_config(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("image"));
        assert!(!message.contains("name"));
    }

    #[test]
    fn test_validation_order_first_missing_wins() {
        let config = InstanceConfig::default();
        assert_eq!(field_of(&config), Some("name"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = valid_config();
        if let Some(cpu) = config.resources.as_mut().and_then(|r| r.cpu.as_mut()) {
            cpu.cores = Some(0.0);
        }
        assert_eq!(field_of(&config), Some("resources.cpu.cores"));

        let mut config = valid_config();
        if let Some(memory) = config.resources.as_mut().and_then(|r| r.memory.as_mut()) {
            memory.min = Some("plenty".into());
        }
        assert_eq!(field_of(&config), Some("resources.memory.min"));
    }

    #[test]
    fn test_cpu_limit_defaults_to_millicores() {
        let config = InstanceConfig {
            resources: Some(ResourceRequest {
                cpu: Some(CpuRequest {
                    cores: Some(2.0),
                    limit: None,
                }),
                memory: Some(MemoryRequest {
                    min: Some("512m".into()),
                    max: None,
                }),
                storage: None,
            }),
            ..valid_config()
        };
        let instance = base().build_base_instance("id-1".into(), "dev", "", config);
        assert_eq!(instance.resources.cpu.limit, 2000);
        assert_eq!(instance.resources.cpu.used, 0);
        assert_eq!(instance.resources.memory.limit, 512 * 1024 * 1024);
        assert!(instance.resources.storage.is_none());
    }

    #[test]
    fn test_explicit_limits_win() {
        let config = InstanceConfig {
            resources: Some(ResourceRequest {
                cpu: Some(CpuRequest {
                    cores: Some(2.0),
                    limit: Some(1500),
                }),
                memory: Some(MemoryRequest {
                    min: Some("512m".into()),
                    max: Some("2g".into()),
                }),
                storage: Some(StorageRequest { size: "10g".into() }),
            }),
            ..valid_config()
        };
        let instance = base().build_base_instance("id-2".into(), "dev", "", config);
        assert_eq!(instance.resources.cpu.limit, 1500);
        assert_eq!(instance.resources.memory.limit, 2 * 1024 * 1024 * 1024);
        assert_eq!(
            instance.resources.storage,
            Some(ResourceUsage {
                used: 0,
                limit: 10 * 1024 * 1024 * 1024
            })
        );
    }

    #[test]
    fn test_base_instance_shape() {
        let instance = base().build_base_instance("id-3".into(), "dev", "abc123", valid_config());
        assert_eq!(instance.status, InstanceStatus::Creating);
        assert_eq!(instance.provider_type, ProviderType::Docker);
        assert_eq!(instance.provider_instance_id, "abc123");
        assert_eq!(instance.network, InstanceNetwork::default());
        assert_eq!(instance.created_at, instance.updated_at);
        assert!(instance.metadata.is_empty());
    }
}
