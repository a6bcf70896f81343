//! Container-engine-backed provider (`docker`, `podman`).

use crate::base::ProviderBase;
use crate::config::ProviderConfig;
use crate::error::{ProviderError, Result};
use crate::instance::{
    parse_memory_bytes, Instance, InstanceConfig, InstanceId, InstanceStatus, InstanceUpdate,
    PortMapping, ProviderType,
};
use crate::provider::{ExecResult, InstanceFilter, LogOptions, Provider, ProviderCapabilities};
use crate::store::InstanceStore;
use async_trait::async_trait;
use devbox_engine::{CommandOutput, ContainerEngine};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Label carrying the devbox instance id on every container.
const ID_LABEL: &str = "devbox.instance-id";

/// Label carrying the instance name.
const NAME_LABEL: &str = "devbox.instance-name";

/// Environment variable listing requested editor extensions.
const EXTENSIONS_ENV: &str = "DEVBOX_EXTENSIONS";

/// Provider that realizes instances as containers on a local engine.
///
/// Instances live in memory behind a `RwLock`, optionally mirrored to an
/// [`InstanceStore`]. Creation holds a per-name reservation for its whole
/// duration, so concurrent creates of the same name cannot both reach the
/// engine. Start, stop, update and delete of one instance are serialized
/// by a per-instance operation lock held across the engine call.
pub struct ContainerProvider {
    base: ProviderBase,
    config: ProviderConfig,
    engine: ContainerEngine,
    instances: RwLock<HashMap<InstanceId, Instance>>,
    pending_names: StdMutex<HashSet<String>>,
    operations: StdMutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
    store: Option<InstanceStore>,
}

/// Holds a name in `pending_names` until dropped.
struct NameReservation<'a> {
    names: &'a StdMutex<HashSet<String>>,
    name: String,
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

impl ContainerProvider {
    /// Create a provider whose engine follows the configuration.
    pub fn new(config: ProviderConfig) -> Self {
        let engine = ContainerEngine::new(config.engine_binary())
            .with_base_args(config.engine_args.iter().cloned());
        Self::with_engine(config, engine)
    }

    /// Create a provider with an explicit engine handle.
    pub fn with_engine(config: ProviderConfig, engine: ContainerEngine) -> Self {
        tracing::info!(
            provider_type = %config.provider_type,
            engine = %engine.binary(),
            network = %config.network_name,
            "Creating container provider"
        );
        Self {
            base: ProviderBase::new(config.provider_type, config.instance_prefix.clone()),
            store: config.storage_dir.clone().map(InstanceStore::new),
            config,
            engine,
            instances: RwLock::new(HashMap::new()),
            pending_names: StdMutex::new(HashSet::new()),
            operations: StdMutex::new(HashMap::new()),
        }
    }

    /// Constructor in the shape the provider registry expects.
    pub fn construct(config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
        Ok(Arc::new(Self::new(config.clone())))
    }

    /// The engine handle.
    pub fn engine(&self) -> &ContainerEngine {
        &self.engine
    }

    /// Claim a name for the duration of a create.
    fn reserve_name(&self, name: &str) -> Result<NameReservation<'_>> {
        let mut names = self
            .pending_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !names.insert(name.to_string()) {
            return Err(ProviderError::DuplicateName(name.to_string()));
        }
        Ok(NameReservation {
            names: &self.pending_names,
            name: name.to_string(),
        })
    }

    /// Whether a live instance other than `except` already uses `name`.
    async fn name_in_use(&self, name: &str, except: Option<&InstanceId>) -> bool {
        self.instances
            .read()
            .await
            .values()
            .any(|i| i.is_live() && i.name == name && Some(&i.id) != except)
    }

    async fn fetch(&self, id: &InstanceId) -> Result<Instance> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.clone()))
    }

    /// Take the operation lock for `id` and read the instance under it.
    ///
    /// The guard must be held until the operation has committed.
    async fn lock_instance(&self, id: &InstanceId) -> Result<(OwnedMutexGuard<()>, Instance)> {
        let lock = self
            .operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.clone())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        match self.fetch(id).await {
            Ok(instance) => Ok((guard, instance)),
            Err(e) => {
                drop(guard);
                self.release_lock(id);
                Err(e)
            }
        }
    }

    fn release_lock(&self, id: &InstanceId) {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Record a new instance in memory and on disk.
    async fn insert(&self, instance: Instance) -> Result<Instance> {
        let mut instances = self.instances.write().await;
        self.persist(&instance).await?;
        instances.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    /// Replace a known instance in memory and on disk.
    ///
    /// Fails with `NotFound` once the instance has been removed, so a late
    /// writer cannot bring a deleted record back.
    async fn commit(&self, instance: Instance) -> Result<Instance> {
        let mut instances = self.instances.write().await;
        if !instances.contains_key(&instance.id) {
            return Err(ProviderError::NotFound(instance.id));
        }
        self.persist(&instance).await?;
        instances.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn persist(&self, instance: &Instance) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.save(instance).await.map_err(|e| {
            tracing::warn!(instance_id = %instance.id, error = %e, "Failed to persist instance record");
            ProviderError::Store(format!("saving {}: {e}", instance.id))
        })
    }

    /// Apply `change` to the current record, if it still exists. Used on
    /// failure paths, where the original error is what gets reported.
    async fn amend(&self, id: &InstanceId, change: impl FnOnce(&mut Instance)) {
        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(id) else {
            return;
        };
        change(instance);
        // Already logged; the caller reports the original failure
        let _ = self.persist(instance).await;
    }

    /// Mark the current record `Error` with the backend's message.
    async fn mark_error(&self, id: &InstanceId, message: &str) {
        self.amend(id, |instance| {
            if instance.transition(InstanceStatus::Error).is_ok() {
                instance
                    .metadata
                    .insert("lastError".into(), message.into());
            }
        })
        .await;
    }

    /// Turn a failed lifecycle command into an error, marking the instance
    /// `Error` if its container has disappeared.
    async fn backend_failure(
        &self,
        instance: &Instance,
        operation: &'static str,
        output: CommandOutput,
    ) -> ProviderError {
        if output.is_spawn_failure() {
            return ProviderError::EngineUnavailable(output.stderr);
        }
        let stderr = output.stderr.trim().to_string();
        if !self.engine.container_exists(&instance.provider_instance_id).await {
            self.mark_error(&instance.id, &stderr).await;
        }
        ProviderError::BackendCommand { operation, stderr }
    }

    /// Build the `run` invocation for a new instance.
    fn run_args(&self, id: &InstanceId, config: &InstanceConfig) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            id.to_string(),
            "--hostname".into(),
            hostname_for(&config.name),
            "--network".into(),
            self.config.network_name.clone(),
            "--label".into(),
            format!("{ID_LABEL}={id}"),
            "--label".into(),
            format!("{NAME_LABEL}={}", config.name),
        ];

        if let Some(cores) = config.cpu_cores() {
            args.push("--cpus".into());
            args.push(format_cores(cores));
        }
        if let Some(memory) = config.memory_ceiling() {
            args.push("--memory".into());
            args.push(memory.to_string());
        }
        if let Some(storage) = config.resources.as_ref().and_then(|r| r.storage.as_ref()) {
            args.push("--storage-opt".into());
            args.push(format!("size={}", storage.size));
        }

        if config.ports.is_empty() {
            args.push("-p".into());
            args.push(self.config.container_port.to_string());
        }
        for port in &config.ports {
            args.push("-p".into());
            args.push(format!("{}:{}", port.host, port.container));
        }

        args.push("-v".into());
        args.push(format!(
            "{}:{}",
            config.workspace_path, self.config.workspace_mount
        ));

        let mut env: Vec<(&String, &String)> = config.environment.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        if !config.extensions.is_empty() {
            args.push("-e".into());
            args.push(format!("{EXTENSIONS_ENV}={}", config.extensions.join(",")));
        }

        args.push(self.config.qualify_image(&config.image));
        args
    }

    /// Host ports published for the container's development port.
    async fn published_ports(&self, container: &str, config: &InstanceConfig) -> Vec<PortMapping> {
        if !config.ports.is_empty() {
            return config.ports.clone();
        }
        let port = self.config.container_port.to_string();
        let out = self.engine.execute(&["port", container, port.as_str()]).await;
        if !out.success() {
            return Vec::new();
        }
        out.stdout
            .lines()
            .filter_map(parse_published_port)
            .take(1)
            .map(|host| PortMapping {
                host,
                container: self.config.container_port,
            })
            .collect()
    }

    /// Refresh network fields from the engine.
    async fn refresh_network(&self, instance: &mut Instance) {
        instance.network.internal_ip = self
            .engine
            .container_ip(&instance.provider_instance_id)
            .await;
        instance.network.hostname = Some(hostname_for(&instance.name));
        if instance.network.external_ip.is_none() {
            instance.network.external_ip = Some("localhost".into());
        }
        let host = instance
            .network
            .external_ip
            .clone()
            .unwrap_or_else(|| "localhost".into());
        instance.network.urls = instance
            .network
            .ports
            .iter()
            .map(|p| format!("http://{host}:{}", p.host))
            .collect();
    }
}

#[async_trait]
impl Provider for ContainerProvider {
    fn provider_type(&self) -> ProviderType {
        self.config.provider_type
    }

    async fn initialize(&self) -> Result<()> {
        tracing::info!(engine = %self.engine.binary(), "Initializing container provider");

        if !self.engine.is_engine_available().await {
            return Err(ProviderError::EngineUnavailable(format!(
                "{} is not installed or its daemon is not reachable",
                self.engine.binary()
            )));
        }

        let network = self.config.network_name.as_str();
        if !self.engine.network_exists(network).await
            && !self.engine.create_network(network).await
            && !self.engine.network_exists(network).await
        {
            return Err(ProviderError::BackendCommand {
                operation: "network create",
                stderr: format!("could not create network {network}"),
            });
        }

        if let Some(store) = &self.store {
            let records = store.load_all().await?;
            let mut restored = 0usize;
            for mut instance in records {
                if instance.status.is_terminal() {
                    continue;
                }
                let container = instance.provider_instance_id.clone();
                let exists = self.engine.container_exists(&container).await;
                let running = exists && self.engine.is_container_running(&container).await;
                reconcile_status(&mut instance, exists, running);
                self.instances
                    .write()
                    .await
                    .insert(instance.id.clone(), instance);
                restored += 1;
            }
            tracing::info!(restored, dir = %store.dir().display(), "Restored instance records");
        }

        Ok(())
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            start_stop: true,
            logs: true,
            exec: true,
            live_update: true,
            networking: true,
            persistent_storage: self.store.is_some(),
        }
    }

    async fn create_instance(&self, config: InstanceConfig) -> Result<Instance> {
        ProviderBase::validate_instance_config(&config)?;

        let _reservation = self.reserve_name(&config.name)?;
        if self.name_in_use(&config.name, None).await {
            return Err(ProviderError::DuplicateName(config.name.clone()));
        }

        let id = self.base.generate_instance_id();
        let start = std::time::Instant::now();
        tracing::info!(instance_id = %id, name = %config.name, image = %config.image, "Creating instance");

        let output = self.engine.execute(&self.run_args(&id, &config)).await;
        if !output.success() {
            tracing::error!(instance_id = %id, stderr = %output.stderr.trim(), "Instance creation failed");
            if output.is_spawn_failure() {
                return Err(ProviderError::EngineUnavailable(output.stderr));
            }
            return Err(ProviderError::BackendCommand {
                operation: "create",
                stderr: output.stderr.trim().to_string(),
            });
        }

        let container = output
            .stdout
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        let container = if container.is_empty() {
            id.to_string()
        } else {
            container
        };

        let name = config.name.clone();
        let ports = self.published_ports(&container, &config).await;
        let mut instance = self.base.build_base_instance(id, name, container, config);
        instance.network.ports = ports;
        self.refresh_network(&mut instance).await;

        if self
            .engine
            .is_container_running(&instance.provider_instance_id)
            .await
        {
            instance.transition(InstanceStatus::Running)?;
        } else {
            instance.transition(InstanceStatus::Error)?;
            instance
                .metadata
                .insert("lastError".into(), "container exited after start".into());
        }

        tracing::info!(
            instance_id = %instance.id,
            status = %instance.status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Instance created"
        );
        let container = instance.provider_instance_id.clone();
        match self.insert(instance).await {
            Ok(instance) => Ok(instance),
            Err(e) => {
                // An unrecorded container would be orphaned
                self.engine.execute(&["rm", "-f", container.as_str()]).await;
                Err(e)
            }
        }
    }

    async fn get_instance(&self, id: &InstanceId) -> Result<Option<Instance>> {
        Ok(self.instances.read().await.get(id).cloned())
    }

    async fn list_instances(&self, filter: Option<InstanceFilter>) -> Result<Vec<Instance>> {
        let filter = filter.unwrap_or_default();
        let mut instances: Vec<Instance> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(instances)
    }

    async fn start_instance(&self, id: &InstanceId) -> Result<Instance> {
        let (_guard, mut instance) = self.lock_instance(id).await?;
        if !instance.status.can_transition_to(InstanceStatus::Running) {
            return Err(ProviderError::InvalidTransition {
                from: instance.status,
                to: InstanceStatus::Running,
            });
        }

        tracing::info!(instance_id = %id, "Starting instance");
        let output = self
            .engine
            .execute(&["start", instance.provider_instance_id.as_str()])
            .await;
        if !output.success() {
            return Err(self.backend_failure(&instance, "start", output).await);
        }

        instance.transition(InstanceStatus::Running)?;
        self.refresh_network(&mut instance).await;
        self.commit(instance).await
    }

    async fn stop_instance(&self, id: &InstanceId, force: bool) -> Result<Instance> {
        let (_guard, mut instance) = self.lock_instance(id).await?;
        if !instance.status.can_transition_to(InstanceStatus::Stopped) {
            return Err(ProviderError::InvalidTransition {
                from: instance.status,
                to: InstanceStatus::Stopped,
            });
        }

        let verb = if force { "kill" } else { "stop" };
        tracing::info!(instance_id = %id, force, "Stopping instance");
        let output = self
            .engine
            .execute(&[verb, instance.provider_instance_id.as_str()])
            .await;
        if !output.success() {
            return Err(self.backend_failure(&instance, "stop", output).await);
        }

        instance.transition(InstanceStatus::Stopped)?;
        instance.network.internal_ip = None;
        self.commit(instance).await
    }

    async fn delete_instance(&self, id: &InstanceId) -> Result<bool> {
        let (_guard, mut instance) = match self.lock_instance(id).await {
            Ok(held) => held,
            Err(ProviderError::NotFound(_)) => {
                tracing::debug!(instance_id = %id, "Delete requested for unknown instance");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let previous = instance.status;
        instance.transition(InstanceStatus::Deleting)?;
        let mut instance = self.commit(instance).await?;

        tracing::info!(instance_id = %id, "Deleting instance");
        let output = self
            .engine
            .execute(&["rm", "-f", instance.provider_instance_id.as_str()])
            .await;
        if output.is_spawn_failure() {
            // The container was never touched
            self.amend(id, |instance| {
                instance.status = previous;
                instance.touch();
            })
            .await;
            return Err(ProviderError::EngineUnavailable(output.stderr));
        }
        if !output.success() && self.engine.container_exists(&instance.provider_instance_id).await {
            let stderr = output.stderr.trim().to_string();
            self.mark_error(id, &stderr).await;
            return Err(ProviderError::BackendCommand {
                operation: "delete",
                stderr,
            });
        }

        instance.transition(InstanceStatus::Deleted)?;
        self.instances.write().await.remove(id);
        self.release_lock(id);
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(id).await {
                tracing::warn!(instance_id = %id, error = %e, "Failed to remove instance record");
            }
        }
        tracing::info!(instance_id = %id, "Instance deleted");
        Ok(true)
    }

    async fn update_instance(&self, id: &InstanceId, update: InstanceUpdate) -> Result<Instance> {
        let (_guard, mut instance) = self.lock_instance(id).await?;
        if !instance.is_live() {
            return Err(ProviderError::InvalidTransition {
                from: instance.status,
                to: instance.status,
            });
        }

        let _reservation = match &update.name {
            Some(name) if name != &instance.name => {
                if name.trim().is_empty() {
                    return Err(ProviderError::missing("name"));
                }
                let reservation = self.reserve_name(name)?;
                if self.name_in_use(name, Some(id)).await {
                    return Err(ProviderError::DuplicateName(name.clone()));
                }
                Some(reservation)
            }
            _ => None,
        };

        if let Some(resources) = &update.resources {
            let mut args: Vec<String> = vec!["update".into()];
            if let Some(cores) = resources.cpu_cores {
                if !cores.is_finite() || cores <= 0.0 {
                    return Err(ProviderError::Validation {
                        field: "resources.cpu.cores",
                        message: format!("resources.cpu.cores must be a positive number, got {cores}"),
                    });
                }
                args.push("--cpus".into());
                args.push(format_cores(cores));
            }
            let memory_bytes = match &resources.memory_max {
                Some(memory) => {
                    let bytes = parse_memory_bytes(memory).ok_or_else(|| ProviderError::Validation {
                        field: "resources.memory.max",
                        message: format!("resources.memory.max is not a valid size: {memory}"),
                    })?;
                    args.push("--memory".into());
                    args.push(memory.clone());
                    args.push("--memory-swap".into());
                    args.push(memory.clone());
                    Some(bytes)
                }
                None => None,
            };

            if args.len() > 1 {
                args.push(instance.provider_instance_id.clone());
                tracing::info!(instance_id = %id, "Updating instance resources");
                let output = self.engine.execute(&args).await;
                if !output.success() {
                    return Err(self.backend_failure(&instance, "update", output).await);
                }
                if let Some(cores) = resources.cpu_cores {
                    instance.resources.cpu.limit = (cores * 1000.0).round() as u64;
                }
                if let Some(bytes) = memory_bytes {
                    instance.resources.memory.limit = bytes;
                }
            }
        }

        if let Some(name) = update.name {
            instance.name = name;
            instance.network.hostname = Some(hostname_for(&instance.name));
        }
        if let Some(metadata) = update.metadata {
            instance.metadata.extend(metadata);
        }
        instance.touch();
        self.commit(instance).await
    }

    async fn get_instance_logs(&self, id: &InstanceId, options: LogOptions) -> Result<String> {
        let instance = self.fetch(id).await?;
        let mut args: Vec<String> = vec!["logs".into()];
        if let Some(tail) = options.tail {
            args.push("--tail".into());
            args.push(tail.to_string());
        }
        if let Some(since) = options.since {
            args.push("--since".into());
            args.push(since);
        }
        if options.timestamps {
            args.push("--timestamps".into());
        }
        args.push(instance.provider_instance_id.clone());

        let output = self.engine.execute(&args).await;
        if !output.success() {
            return Err(self.backend_failure(&instance, "logs", output).await);
        }
        // The engine replays the container's stderr on its own stderr
        Ok(format!("{}{}", output.stdout, output.stderr))
    }

    async fn execute_command(&self, id: &InstanceId, command: &[String]) -> Result<ExecResult> {
        let instance = self.fetch(id).await?;
        if instance.status != InstanceStatus::Running {
            return Err(ProviderError::NotRunning {
                id: id.clone(),
                status: instance.status,
            });
        }
        if command.is_empty() {
            return Err(ProviderError::Validation {
                field: "command",
                message: "command is required".into(),
            });
        }

        tracing::debug!(instance_id = %id, ?command, "Executing command in instance");
        let mut args: Vec<String> = vec!["exec".into(), instance.provider_instance_id.clone()];
        args.extend(command.iter().cloned());

        let output = self.engine.execute(&args).await;
        if output.is_spawn_failure() {
            return Err(ProviderError::EngineUnavailable(output.stderr));
        }
        Ok(ExecResult {
            exit_code: output.exit_code.unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Bring a restored record in line with what the engine reports.
///
/// A missing container means `Error`; otherwise the running flag picks
/// `Running` or `Stopped`. Moves the state machine forbids are skipped.
pub(crate) fn reconcile_status(instance: &mut Instance, exists: bool, running: bool) {
    let target = match (exists, running) {
        (false, _) => InstanceStatus::Error,
        (true, true) => InstanceStatus::Running,
        (true, false) => InstanceStatus::Stopped,
    };
    if instance.status != target && instance.transition(target).is_err() {
        tracing::debug!(
            instance_id = %instance.id,
            status = %instance.status,
            engine_status = %target,
            "Keeping recorded status"
        );
    }
}

/// Format a core count for `--cpus` without trailing zeros.
fn format_cores(cores: f64) -> String {
    let s = format!("{cores:.3}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// DNS-safe hostname derived from an instance name.
fn hostname_for(name: &str) -> String {
    let mut host: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    host.truncate(63);
    let host = host.trim_matches('-').to_string();
    if host.is_empty() {
        "devbox".into()
    } else {
        host
    }
}

/// Parse one line of `port` output (`0.0.0.0:49153`, `[::]:49153`).
fn parse_published_port(line: &str) -> Option<u16> {
    line.trim().rsplit(':').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ContainerProvider {
        ContainerProvider::new(ProviderConfig::default())
    }

    #[test]
    fn test_format_cores() {
        assert_eq!(format_cores(2.0), "2");
        assert_eq!(format_cores(0.5), "0.5");
        assert_eq!(format_cores(1.25), "1.25");
    }

    #[test]
    fn test_hostname_for() {
        assert_eq!(hostname_for("My Project_1"), "my-project-1");
        assert_eq!(hostname_for("--"), "devbox");
    }

    #[test]
    fn test_parse_published_port() {
        assert_eq!(parse_published_port("0.0.0.0:49153"), Some(49153));
        assert_eq!(parse_published_port("[::]:49153\n"), Some(49153));
        assert_eq!(parse_published_port("garbage"), None);
    }

    #[test]
    fn test_run_args() {
        let provider = provider();
        let mut config = InstanceConfig::new("dev", "codercom/code-server", "/src", 2.0, "1g");
        config.environment.insert("PASSWORD".into(), "secret".into());
        config.extensions = vec!["rust-lang.rust-analyzer".into()];
        let id = InstanceId::new("devbox-abc-12345");

        let args = provider.run_args(&id, &config);
        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name devbox-abc-12345"));
        assert!(joined.contains("--network devbox-network"));
        assert!(joined.contains("--cpus 2"));
        assert!(joined.contains("--memory 1g"));
        assert!(joined.contains("-p 8080"));
        assert!(joined.contains("-v /src:/home/coder/project"));
        assert!(joined.contains("-e PASSWORD=secret"));
        assert!(joined.contains("-e DEVBOX_EXTENSIONS=rust-lang.rust-analyzer"));
        assert_eq!(args.last().map(String::as_str), Some("codercom/code-server"));
    }

    #[test]
    fn test_run_args_explicit_ports() {
        let provider = provider();
        let mut config = InstanceConfig::new("dev", "img", "/src", 1.0, "512m");
        config.ports = vec![PortMapping {
            host: 9000,
            container: 8080,
        }];
        let joined = provider.run_args(&InstanceId::new("x"), &config).join(" ");
        assert!(joined.contains("-p 9000:8080"));
        assert!(!joined.contains("-p 8080 "));
    }

    #[test]
    fn test_reconcile_status() {
        let base = ProviderBase::new(ProviderType::Docker, "t");
        let config = InstanceConfig::new("dev", "img", "/src", 1.0, "512m");
        let mut instance = base.build_base_instance("a".into(), "dev", "c", config);
        instance.status = InstanceStatus::Running;

        reconcile_status(&mut instance, true, false);
        assert_eq!(instance.status, InstanceStatus::Stopped);

        reconcile_status(&mut instance, true, true);
        assert_eq!(instance.status, InstanceStatus::Running);

        reconcile_status(&mut instance, false, false);
        assert_eq!(instance.status, InstanceStatus::Error);

        // Error never silently returns to Running
        reconcile_status(&mut instance, true, true);
        assert_eq!(instance.status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn test_name_reservation_released_on_drop() {
        let provider = provider();
        {
            let _held = provider.reserve_name("dev").unwrap();
            assert!(matches!(
                provider.reserve_name("dev"),
                Err(ProviderError::DuplicateName(_))
            ));
        }
        assert!(provider.reserve_name("dev").is_ok());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_config_before_engine() {
        // Engine binary does not exist: a validation failure must win
        let provider = ContainerProvider::with_engine(
            ProviderConfig::default(),
            ContainerEngine::new("devbox-test-missing-engine"),
        );
        let mut config = InstanceConfig::new("dev", "img", "/src", 1.0, "512m");
        config.image.clear();
        let err = provider.create_instance(config).await.unwrap_err();
        assert_eq!(err.field(), Some("image"));
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let provider = provider();
        let id = InstanceId::new("nope");
        assert!(provider.get_instance(&id).await.unwrap().is_none());
        assert!(!provider.delete_instance(&id).await.unwrap());
        assert!(matches!(
            provider.start_instance(&id).await,
            Err(ProviderError::NotFound(_))
        ));
    }
}
