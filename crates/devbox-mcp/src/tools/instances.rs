//! Instance lifecycle tools, routed through the provider.

use super::{parse_params, ToolOutput, ToolRegistry, ToolSpec};
use crate::config::ServerConfig;
use crate::error::ToolError;
use devbox_core::{
    Instance, InstanceConfig, InstanceFilter, InstanceId, InstanceStatus, InstanceUpdate,
    LogOptions, PortMapping, Provider, ProviderError, ResourceUpdate,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Values applied when a create request leaves them out.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDefaults {
    pub image: String,
    pub cpu_cores: f64,
    pub memory: String,
    pub container_port: u16,
}

impl Default for InstanceDefaults {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

impl InstanceDefaults {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            image: config.default_image.clone(),
            cpu_cores: 2.0,
            memory: "2g".into(),
            container_port: config.provider_config().container_port,
        }
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// Parameters for creating an instance.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateInstanceParams {
    /// Unique instance name.
    pub name: String,

    /// Host directory mounted as the workspace.
    pub workspace_path: String,

    /// Host port for the editor (default: engine-assigned).
    #[serde(default)]
    pub port: Option<u16>,

    /// Editor password, passed to the instance as `PASSWORD`.
    #[serde(default)]
    pub password: Option<String>,

    /// Editor extensions to install.
    #[serde(default)]
    pub extensions: Vec<String>,

    /// CPU cores (default: 2).
    #[serde(default)]
    pub cpu_limit: Option<f64>,

    /// Memory limit, e.g. `2g` or `512m` (default: 2g).
    #[serde(default)]
    pub memory_limit: Option<String>,

    /// Extra environment variables.
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Image override.
    #[serde(default)]
    pub image: Option<String>,
}

/// Parameters for listing instances.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ListInstancesParams {
    /// Only names containing this text.
    #[serde(default)]
    pub filter: Option<String>,

    /// Only instances in this status (running, stopped, error, ...).
    #[serde(default)]
    pub status: Option<String>,
}

/// Parameters naming one instance.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct InstanceRef {
    /// Instance name or id.
    pub name: String,
}

/// Parameters for stopping an instance.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct StopInstanceParams {
    /// Instance name or id.
    pub name: String,

    /// Kill instead of stopping gracefully.
    #[serde(default)]
    pub force: bool,
}

/// Parameters for changing a live instance.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateInstanceParams {
    /// Instance name or id.
    pub name: String,

    /// New instance name.
    #[serde(default)]
    pub new_name: Option<String>,

    /// New CPU core limit.
    #[serde(default)]
    pub cpu_limit: Option<f64>,

    /// New memory limit, e.g. `4g`.
    #[serde(default)]
    pub memory_limit: Option<String>,

    /// Metadata entries merged into the current ones.
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

impl UpdateInstanceParams {
    fn into_update(self) -> InstanceUpdate {
        let resources = (self.cpu_limit.is_some() || self.memory_limit.is_some()).then(|| {
            ResourceUpdate {
                cpu_cores: self.cpu_limit,
                memory_max: self.memory_limit,
            }
        });
        InstanceUpdate {
            name: self.new_name,
            resources,
            metadata: self.metadata,
        }
    }
}

/// Parameters for fetching logs.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct InstanceLogsParams {
    /// Instance name or id.
    pub name: String,

    /// Only the last N lines.
    #[serde(default)]
    pub tail: Option<u32>,
}

/// Parameters for running a command.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecInstanceParams {
    /// Instance name or id.
    pub name: String,

    /// Program and arguments.
    pub command: Vec<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Instance tools over one provider.
pub struct InstanceTools {
    provider: Arc<dyn Provider>,
    defaults: InstanceDefaults,
}

impl InstanceTools {
    pub fn new(provider: Arc<dyn Provider>, defaults: InstanceDefaults) -> Self {
        Self { provider, defaults }
    }

    /// Find an instance by id first, then by exact name.
    async fn resolve(&self, name_or_id: &str) -> Result<Instance, ToolError> {
        let id = InstanceId::new(name_or_id);
        if let Some(instance) = self.provider.get_instance(&id).await? {
            return Ok(instance);
        }
        self.provider
            .list_instances(None)
            .await?
            .into_iter()
            .find(|instance| instance.name == name_or_id)
            .ok_or_else(|| ProviderError::NotFound(id).into())
    }

    fn instance_config(&self, params: CreateInstanceParams) -> InstanceConfig {
        let image = params
            .image
            .filter(|image| !image.trim().is_empty())
            .unwrap_or_else(|| self.defaults.image.clone());
        let memory = params
            .memory_limit
            .unwrap_or_else(|| self.defaults.memory.clone());

        let mut config = InstanceConfig::new(
            params.name,
            image,
            params.workspace_path,
            params.cpu_limit.unwrap_or(self.defaults.cpu_cores),
            memory,
        );
        config.environment = params.environment;
        if let Some(password) = params.password {
            config.environment.insert("PASSWORD".into(), password);
        }
        config.extensions = params.extensions;
        if let Some(host) = params.port {
            config.ports.push(PortMapping {
                host,
                container: self.defaults.container_port,
            });
        }
        config
    }

    pub async fn create(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let params: CreateInstanceParams = parse_params("create_instance", params)?;
        let config = self.instance_config(params);
        let instance = self.provider.create_instance(config).await?;
        tracing::info!(instance_id = %instance.id, name = %instance.name, "Instance created via tool");
        ToolOutput::json(&instance)
    }

    pub async fn list(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let params: ListInstancesParams = parse_params("list_instances", params)?;
        let status = params
            .status
            .map(|s| s.parse::<InstanceStatus>())
            .transpose()
            .map_err(|e| ToolError::invalid("list_instances", e))?;
        let filter = InstanceFilter {
            status,
            name_contains: params.filter.filter(|f| !f.is_empty()),
        };
        let instances = self.provider.list_instances(Some(filter)).await?;
        Ok(ToolOutput::Json(json!({
            "count": instances.len(),
            "instances": instances,
        })))
    }

    pub async fn get(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let params: InstanceRef = parse_params("get_instance", params)?;
        let instance = self.resolve(&params.name).await?;
        ToolOutput::json(&instance)
    }

    pub async fn start(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let params: InstanceRef = parse_params("start_instance", params)?;
        let instance = self.resolve(&params.name).await?;
        let instance = self.provider.start_instance(&instance.id).await?;
        ToolOutput::json(&instance)
    }

    pub async fn stop(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let params: StopInstanceParams = parse_params("stop_instance", params)?;
        let instance = self.resolve(&params.name).await?;
        let instance = self.provider.stop_instance(&instance.id, params.force).await?;
        ToolOutput::json(&instance)
    }

    pub async fn update(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let params: UpdateInstanceParams = parse_params("update_instance", params)?;
        let instance = self.resolve(&params.name).await?;
        let update = params.into_update();
        if update == InstanceUpdate::default() {
            return Err(ToolError::invalid(
                "update_instance",
                "nothing to update: give new_name, cpu_limit, memory_limit or metadata",
            ));
        }
        let instance = self.provider.update_instance(&instance.id, update).await?;
        tracing::info!(instance_id = %instance.id, name = %instance.name, "Instance updated via tool");
        ToolOutput::json(&instance)
    }

    pub async fn delete(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let params: InstanceRef = parse_params("delete_instance", params)?;
        let instance = self.resolve(&params.name).await?;
        let deleted = self.provider.delete_instance(&instance.id).await?;
        Ok(ToolOutput::Json(json!({
            "success": deleted,
            "id": instance.id,
            "name": instance.name,
        })))
    }

    pub async fn logs(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let params: InstanceLogsParams = parse_params("instance_logs", params)?;
        let instance = self.resolve(&params.name).await?;
        let options = LogOptions {
            tail: params.tail,
            ..Default::default()
        };
        let logs = self.provider.get_instance_logs(&instance.id, options).await?;
        Ok(ToolOutput::text(logs))
    }

    pub async fn exec(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let params: ExecInstanceParams = parse_params("exec_instance", params)?;
        if params.command.is_empty() {
            return Err(ToolError::invalid("exec_instance", "command must not be empty"));
        }
        let instance = self.resolve(&params.name).await?;
        let result = self
            .provider
            .execute_command(&instance.id, &params.command)
            .await?;
        ToolOutput::json(&result)
    }
}

pub(crate) fn specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new::<CreateInstanceParams>(
            "create_instance",
            "Create a development instance with an editor, a mounted workspace and resource limits.",
        ),
        ToolSpec::new::<ListInstancesParams>(
            "list_instances",
            "List instances, optionally filtered by name or status.",
        ),
        ToolSpec::new::<InstanceRef>("get_instance", "Get one instance by name or id."),
        ToolSpec::new::<InstanceRef>("start_instance", "Start a stopped instance."),
        ToolSpec::new::<StopInstanceParams>("stop_instance", "Stop a running instance."),
        ToolSpec::new::<UpdateInstanceParams>(
            "update_instance",
            "Rename an instance, change its CPU or memory limits, or merge metadata.",
        ),
        ToolSpec::new::<InstanceRef>(
            "delete_instance",
            "Delete an instance and its backend resources.",
        ),
        ToolSpec::new::<InstanceLogsParams>("instance_logs", "Fetch an instance's logs."),
        ToolSpec::new::<ExecInstanceParams>(
            "exec_instance",
            "Run a command inside a running instance.",
        ),
    ]
}

pub(crate) fn register(registry: &mut ToolRegistry, tools: Arc<InstanceTools>) {
    for spec in specs() {
        let name = spec.name;
        let tools = Arc::clone(&tools);
        registry.register_fn(spec, move |params| {
            let tools = Arc::clone(&tools);
            async move {
                match name {
                    "create_instance" => tools.create(params).await,
                    "list_instances" => tools.list(params).await,
                    "get_instance" => tools.get(params).await,
                    "start_instance" => tools.start(params).await,
                    "stop_instance" => tools.stop(params).await,
                    "update_instance" => tools.update(params).await,
                    "delete_instance" => tools.delete(params).await,
                    "instance_logs" => tools.logs(params).await,
                    "exec_instance" => tools.exec(params).await,
                    other => Err(ToolError::UnknownTool(other.to_string())),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use devbox_core::{ExecResult, ProviderBase, ProviderCapabilities, ProviderType};
    use std::sync::Mutex;

    /// Provider that records the configs it was asked to create.
    struct RecordingProvider {
        base: ProviderBase,
        instances: Mutex<Vec<Instance>>,
        created: Mutex<Vec<InstanceConfig>>,
        updates: Mutex<Vec<InstanceUpdate>>,
    }

    impl RecordingProvider {
        fn new() -> Self {
            Self {
                base: ProviderBase::new(ProviderType::Docker, "devbox"),
                instances: Mutex::new(Vec::new()),
                created: Mutex::new(Vec::new()),
                updates: Mutex::new(Vec::new()),
            }
        }

        fn find(&self, id: &InstanceId) -> Option<Instance> {
            self.instances
                .lock()
                .unwrap()
                .iter()
                .find(|i| &i.id == id)
                .cloned()
        }

        fn set_status(&self, id: &InstanceId, status: InstanceStatus) -> devbox_core::Result<Instance> {
            let mut instances = self.instances.lock().unwrap();
            let instance = instances
                .iter_mut()
                .find(|i| &i.id == id)
                .ok_or_else(|| ProviderError::NotFound(id.clone()))?;
            instance.transition(status)?;
            Ok(instance.clone())
        }
    }

    #[async_trait]
    impl Provider for RecordingProvider {
        fn provider_type(&self) -> ProviderType {
            ProviderType::Docker
        }

        async fn initialize(&self) -> devbox_core::Result<()> {
            Ok(())
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::default()
        }

        async fn create_instance(&self, config: InstanceConfig) -> devbox_core::Result<Instance> {
            ProviderBase::validate_instance_config(&config)?;
            let id = self.base.generate_instance_id();
            let mut instance =
                self.base
                    .build_base_instance(id, config.name.clone(), "c1", config.clone());
            instance.transition(InstanceStatus::Running)?;
            self.created.lock().unwrap().push(config);
            self.instances.lock().unwrap().push(instance.clone());
            Ok(instance)
        }

        async fn get_instance(&self, id: &InstanceId) -> devbox_core::Result<Option<Instance>> {
            Ok(self.find(id))
        }

        async fn list_instances(
            &self,
            filter: Option<InstanceFilter>,
        ) -> devbox_core::Result<Vec<Instance>> {
            let filter = filter.unwrap_or_default();
            Ok(self
                .instances
                .lock()
                .unwrap()
                .iter()
                .filter(|i| filter.matches(i))
                .cloned()
                .collect())
        }

        async fn start_instance(&self, id: &InstanceId) -> devbox_core::Result<Instance> {
            self.set_status(id, InstanceStatus::Running)
        }

        async fn stop_instance(&self, id: &InstanceId, _force: bool) -> devbox_core::Result<Instance> {
            self.set_status(id, InstanceStatus::Stopped)
        }

        async fn delete_instance(&self, id: &InstanceId) -> devbox_core::Result<bool> {
            let mut instances = self.instances.lock().unwrap();
            let before = instances.len();
            instances.retain(|i| &i.id != id);
            Ok(instances.len() != before)
        }

        async fn update_instance(
            &self,
            id: &InstanceId,
            update: InstanceUpdate,
        ) -> devbox_core::Result<Instance> {
            self.updates.lock().unwrap().push(update.clone());
            let mut instances = self.instances.lock().unwrap();
            let instance = instances
                .iter_mut()
                .find(|i| &i.id == id)
                .ok_or_else(|| ProviderError::NotFound(id.clone()))?;
            if let Some(name) = update.name {
                instance.name = name;
            }
            if let Some(metadata) = update.metadata {
                instance.metadata.extend(metadata);
            }
            Ok(instance.clone())
        }

        async fn get_instance_logs(
            &self,
            id: &InstanceId,
            options: LogOptions,
        ) -> devbox_core::Result<String> {
            Ok(format!("logs for {id} tail={:?}", options.tail))
        }

        async fn execute_command(
            &self,
            _id: &InstanceId,
            command: &[String],
        ) -> devbox_core::Result<ExecResult> {
            Ok(ExecResult {
                exit_code: 0,
                stdout: command.join(" "),
                stderr: String::new(),
            })
        }
    }

    fn tools() -> (Arc<RecordingProvider>, InstanceTools) {
        let provider = Arc::new(RecordingProvider::new());
        let tools = InstanceTools::new(
            Arc::clone(&provider) as Arc<dyn Provider>,
            InstanceDefaults::default(),
        );
        (provider, tools)
    }

    #[tokio::test]
    async fn test_create_applies_defaults() {
        let (provider, tools) = tools();
        tools
            .create(json!({
                "name": "alpha",
                "workspace_path": "/work/alpha",
                "port": 9000,
                "password": "hunter2",
            }))
            .await
            .unwrap();

        let created = provider.created.lock().unwrap();
        let config = &created[0];
        assert_eq!(config.image, InstanceDefaults::default().image);
        assert_eq!(config.cpu_cores(), Some(2.0));
        assert_eq!(config.memory_ceiling(), Some("2g"));
        assert_eq!(config.environment.get("PASSWORD").map(String::as_str), Some("hunter2"));
        assert_eq!(
            config.ports,
            vec![PortMapping {
                host: 9000,
                container: 8080
            }]
        );
    }

    #[tokio::test]
    async fn test_create_rejects_missing_workspace() {
        let (provider, tools) = tools();
        let err = tools
            .create(json!({"name": "alpha", "workspace_path": ""}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToolError::Provider(ProviderError::Validation { field: "workspacePath", .. })
        ));
        assert!(provider.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_by_name_or_id() {
        let (_provider, tools) = tools();
        let ToolOutput::Json(created) = tools
            .create(json!({"name": "alpha", "workspace_path": "/w"}))
            .await
            .unwrap()
        else {
            panic!("expected json output");
        };
        let id = created["id"].as_str().unwrap().to_string();

        for key in ["alpha", id.as_str()] {
            let ToolOutput::Json(found) = tools.get(json!({"name": key})).await.unwrap() else {
                panic!("expected json output");
            };
            assert_eq!(found["id"], json!(id));
        }

        let err = tools.get(json!({"name": "missing"})).await.unwrap_err();
        assert!(matches!(err, ToolError::Provider(ProviderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let (_provider, tools) = tools();
        for name in ["alpha", "beta"] {
            tools
                .create(json!({"name": name, "workspace_path": "/w"}))
                .await
                .unwrap();
        }
        tools.stop(json!({"name": "beta"})).await.unwrap();

        let ToolOutput::Json(listed) = tools.list(json!({"status": "stopped"})).await.unwrap() else {
            panic!("expected json output");
        };
        assert_eq!(listed["count"], json!(1));
        assert_eq!(listed["instances"][0]["name"], json!("beta"));

        let err = tools.list(json!({"status": "sleeping"})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn test_exec_and_logs() {
        let (_provider, tools) = tools();
        tools
            .create(json!({"name": "alpha", "workspace_path": "/w"}))
            .await
            .unwrap();

        let ToolOutput::Json(result) = tools
            .exec(json!({"name": "alpha", "command": ["echo", "hi"]}))
            .await
            .unwrap()
        else {
            panic!("expected json output");
        };
        assert_eq!(result["exitCode"], json!(0));
        assert_eq!(result["stdout"], json!("echo hi"));

        let err = tools
            .exec(json!({"name": "alpha", "command": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));

        let logs = tools.logs(json!({"name": "alpha", "tail": 5})).await.unwrap();
        let ToolOutput::Content(blocks) = logs else {
            panic!("expected content output");
        };
        assert_eq!(blocks.len(), 1);
    }

    #[tokio::test]
    async fn test_update_maps_params() {
        let (provider, tools) = tools();
        tools
            .create(json!({"name": "alpha", "workspace_path": "/w"}))
            .await
            .unwrap();

        let ToolOutput::Json(updated) = tools
            .update(json!({
                "name": "alpha",
                "new_name": "alpha-2",
                "memory_limit": "4g",
                "metadata": {"owner": "ci"},
            }))
            .await
            .unwrap()
        else {
            panic!("expected json output");
        };
        assert_eq!(updated["name"], json!("alpha-2"));
        assert_eq!(updated["metadata"]["owner"], json!("ci"));

        let updates = provider.updates.lock().unwrap();
        assert_eq!(
            updates[0].resources,
            Some(ResourceUpdate {
                cpu_cores: None,
                memory_max: Some("4g".into()),
            })
        );
    }

    #[tokio::test]
    async fn test_update_requires_a_change() {
        let (provider, tools) = tools();
        tools
            .create(json!({"name": "alpha", "workspace_path": "/w"}))
            .await
            .unwrap();

        let err = tools.update(json!({"name": "alpha"})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
        assert!(provider.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registered_dispatch() {
        let (provider, tools) = tools();
        let mut registry = ToolRegistry::new();
        register(&mut registry, Arc::new(tools));
        assert_eq!(registry.len(), specs().len());

        registry
            .invoke("create_instance", json!({"name": "alpha", "workspace_path": "/w"}))
            .await
            .unwrap();
        let ToolOutput::Json(deleted) = registry
            .invoke("delete_instance", json!({"name": "alpha"}))
            .await
            .unwrap()
        else {
            panic!("expected json output");
        };
        assert_eq!(deleted["success"], json!(true));
        assert!(provider.instances.lock().unwrap().is_empty());
    }
}
