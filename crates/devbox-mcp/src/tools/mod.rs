//! Tool registry and dispatch.
//!
//! Every operation the server exposes is a named [`ToolHandler`] in a
//! [`ToolRegistry`]. Both transports call [`ToolRegistry::invoke`], which
//! logs the call and hands errors back to the caller untouched.

mod code;
mod fallback;
mod instances;
mod resources;

pub use code::CodeTools;
pub use fallback::{fallback_registry, FallbackHandler, ToolStrategy};
pub use instances::{InstanceDefaults, InstanceTools};
pub use resources::{Allocation, ResourceLedger, ResourceSpec};

use crate::config::ServerConfig;
use crate::error::ToolError;
use async_trait::async_trait;
use devbox_core::{ContainerProvider, Provider, ProviderRegistry, ProviderType};
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// JSON object used for tool input schemas.
pub type JsonObject = Map<String, Value>;

/// One block of tool output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Code {
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        code: String,
    },
}

/// What a tool returns.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// Human-oriented content blocks.
    Content(Vec<ContentBlock>),
    /// A structured result.
    Json(Value),
}

impl ToolOutput {
    /// Single text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Content(vec![ContentBlock::Text { text: text.into() }])
    }

    /// Serialize a value as a structured result.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, ToolError> {
        serde_json::to_value(value)
            .map(Self::Json)
            .map_err(|e| ToolError::Execution(format!("failed to serialize result: {e}")))
    }

    /// Wire form used by the networked transport.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Json(value) => value.clone(),
            Self::Content(blocks) => serde_json::json!({ "content": blocks }),
        }
    }
}

/// Handler behind a tool name.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, params: Value) -> Result<ToolOutput, ToolError>;
}

/// Adapts an async closure into a [`ToolHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
{
    async fn call(&self, params: Value) -> Result<ToolOutput, ToolError> {
        (self.0)(params).await
    }
}

/// Name, description and input schema of a tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Arc<JsonObject>,
}

impl ToolSpec {
    /// Spec whose schema is derived from a parameter type.
    pub fn new<P: JsonSchema>(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            input_schema: schema_for_params::<P>(),
        }
    }
}

/// A spec bound to its handler.
#[derive(Clone)]
pub struct RegisteredTool {
    pub spec: ToolSpec,
    handler: Arc<dyn ToolHandler>,
}

/// Name-indexed tool handlers, kept in registration order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<&'static str, usize>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A second registration under the same name
    /// replaces the first.
    pub fn register(&mut self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) {
        let tool = RegisteredTool { spec, handler };
        match self.index.get(tool.spec.name).copied() {
            Some(i) => self.tools[i] = tool,
            None => {
                self.index.insert(tool.spec.name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, spec: ToolSpec, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        self.register(spec, Arc::new(FnHandler(f)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool names in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.spec.name).collect()
    }

    /// Specs in registration order.
    pub fn specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter().map(|t| &t.spec)
    }

    /// Invoke a tool by name.
    ///
    /// Logs the call with its parameters at debug level, then either the
    /// completion (debug) or the error (error). The error is returned.
    pub async fn invoke(&self, name: &str, params: Value) -> Result<ToolOutput, ToolError> {
        let Some(&i) = self.index.get(name) else {
            tracing::error!(tool = %name, "Unknown tool");
            return Err(ToolError::UnknownTool(name.to_string()));
        };

        tracing::debug!(tool = %name, params = %params, "Invoking tool");
        let start = Instant::now();
        let result = self.tools[i].handler.call(params).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => tracing::debug!(tool = %name, elapsed_ms, "Tool completed"),
            Err(e) => tracing::error!(tool = %name, elapsed_ms, error = %e, "Tool failed"),
        }
        result
    }

    /// [`invoke`](Self::invoke) bounded by a timeout.
    pub async fn invoke_with_timeout(
        &self,
        name: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<ToolOutput, ToolError> {
        match tokio::time::timeout(timeout, self.invoke(name, params)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(tool = %name, timeout_ms = timeout.as_millis() as u64, "Tool timed out");
                Err(ToolError::Timeout {
                    tool: name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// JSON schema of a parameter type as an MCP input schema object.
pub fn schema_for_params<T: JsonSchema>() -> Arc<JsonObject> {
    let schema = schema_for!(T);
    match serde_json::to_value(&schema) {
        Ok(Value::Object(map)) => Arc::new(map),
        _ => empty_schema(),
    }
}

/// Schema for tools without parameters.
pub fn empty_schema() -> Arc<JsonObject> {
    let mut map = Map::new();
    map.insert("type".into(), serde_json::json!("object"));
    map.insert("properties".into(), serde_json::json!({}));
    Arc::new(map)
}

/// Deserialize tool parameters. `null` is read as an empty object.
pub fn parse_params<T: DeserializeOwned>(tool: &str, params: Value) -> Result<T, ToolError> {
    let params = match params {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| ToolError::invalid(tool, e.to_string()))
}

/// Every tool the server exposes, whichever registry backs it.
pub fn catalog() -> Vec<ToolSpec> {
    let mut specs = instances::specs();
    specs.extend(resources::specs());
    specs.extend(code::specs());
    specs
}

/// Registry with the real handlers.
pub fn full_registry(provider: Arc<dyn Provider>, defaults: InstanceDefaults) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    instances::register(&mut registry, Arc::new(InstanceTools::new(provider, defaults)));
    resources::register(&mut registry, Arc::new(ResourceLedger::new()));
    code::register(&mut registry, Arc::new(CodeTools));
    registry
}

/// Provider registry with the container backends.
pub fn provider_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(ProviderType::Docker, ContainerProvider::construct);
    registry.register(ProviderType::Podman, ContainerProvider::construct);
    registry
}

/// Build the tool registry for a configuration.
///
/// `Full` fails if the provider cannot be initialized; `Auto` falls back
/// to the stand-in registry instead. The choice is made once.
pub async fn build_registry(
    config: &ServerConfig,
) -> Result<(ToolRegistry, ToolStrategy), ToolError> {
    if config.tool_strategy == ToolStrategy::Fallback {
        tracing::warn!("Fallback tools selected; results are stand-ins");
        return Ok((fallback_registry(), ToolStrategy::Fallback));
    }

    let provider = provider_registry()
        .create_and_initialize(config.provider_type, &config.provider_config())
        .await;

    match (provider, config.tool_strategy) {
        (Ok(provider), _) => {
            let defaults = InstanceDefaults::from_config(config);
            Ok((full_registry(provider, defaults), ToolStrategy::Full))
        }
        (Err(e), ToolStrategy::Auto) => {
            tracing::warn!(error = %e, "Provider unavailable, serving fallback tools");
            Ok((fallback_registry(), ToolStrategy::Fallback))
        }
        (Err(e), _) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(serde::Deserialize, JsonSchema)]
    #[allow(dead_code)]
    struct EchoParams {
        /// Text to echo.
        text: String,
    }

    fn echo_registry(calls: Arc<AtomicUsize>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register_fn(
            ToolSpec::new::<EchoParams>("echo", "Echo text back."),
            move |params| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let params: EchoParams = parse_params("echo", params)?;
                    Ok(ToolOutput::text(params.text))
                }
            },
        );
        registry
    }

    #[tokio::test]
    async fn test_invoke_runs_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = echo_registry(Arc::clone(&calls));
        let output = registry
            .invoke("echo", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(output, ToolOutput::text("hi"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = echo_registry(Arc::clone(&calls));
        let err = registry.invoke("nope", Value::Null).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "nope"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let registry = echo_registry(Arc::new(AtomicUsize::new(0)));
        let err = registry
            .invoke("echo", serde_json::json!({"wrong": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { ref tool, .. } if tool == "echo"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_with_timeout() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(
            ToolSpec {
                name: "slow",
                description: "Never finishes in time.",
                input_schema: empty_schema(),
            },
            |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ToolOutput::text("late"))
            },
        );
        let err = registry
            .invoke_with_timeout("slow", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { timeout_ms: 1000, .. }));
    }

    #[test]
    fn test_register_replaces_in_place() {
        let mut registry = echo_registry(Arc::new(AtomicUsize::new(0)));
        registry.register(
            ToolSpec::new::<EchoParams>("other", "Other."),
            Arc::new(FallbackHandler::new("other")),
        );
        registry.register(
            ToolSpec::new::<EchoParams>("echo", "Replaced."),
            Arc::new(FallbackHandler::new("echo")),
        );
        assert_eq!(registry.names(), vec!["echo", "other"]);
        assert_eq!(registry.specs().next().map(|s| s.description), Some("Replaced."));
    }

    #[test]
    fn test_schema_for_params() {
        let schema = schema_for_params::<EchoParams>();
        assert_eq!(schema.get("type"), Some(&serde_json::json!("object")));
        assert!(schema["properties"].get("text").is_some());
    }

    #[test]
    fn test_catalog_names_unique() {
        let names: Vec<&str> = catalog().iter().map(|s| s.name).collect();
        let unique: std::collections::HashSet<&str> = names.iter().copied().collect();
        assert_eq!(names.len(), unique.len());
        for expected in [
            "create_instance",
            "list_instances",
            "exec_instance",
            "update_instance",
            "manage_resources",
            "analyze_code",
            "search_code",
            "modify_code",
        ] {
            assert!(names.contains(&expected), "{expected} missing");
        }
    }

    #[test]
    fn test_content_output_wire_form() {
        let output = ToolOutput::Content(vec![ContentBlock::Code {
            language: Some("rust".into()),
            code: "fn main() {}".into(),
        }]);
        assert_eq!(
            output.to_value(),
            serde_json::json!({"content": [{"type": "code", "language": "rust", "code": "fn main() {}"}]})
        );
    }
}
