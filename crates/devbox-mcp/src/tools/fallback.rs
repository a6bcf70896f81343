//! Stand-in tools used when no provider is available.

use super::{catalog, ToolHandler, ToolOutput, ToolRegistry};
use crate::error::ToolError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Which registry backs the tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolStrategy {
    /// Real handlers. Startup fails if the provider does.
    Full,
    /// Stand-in handlers only.
    Fallback,
    /// Real handlers if the provider initializes at startup, else stand-ins.
    #[default]
    Auto,
}

impl ToolStrategy {
    /// Parse from string (case-insensitive). Unknown values select `Auto`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "full" | "real" => Self::Full,
            "fallback" | "stub" => Self::Fallback,
            _ => Self::Auto,
        }
    }
}

/// Answers for one tool without doing any work.
#[derive(Debug, Clone, Copy)]
pub struct FallbackHandler {
    tool: &'static str,
}

impl FallbackHandler {
    pub fn new(tool: &'static str) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl ToolHandler for FallbackHandler {
    async fn call(&self, _params: Value) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::Json(json!({
            "success": true,
            "fallback": true,
            "tool": self.tool,
            "message": format!("[fallback] {} is not backed by a provider in this process", self.tool),
        })))
    }
}

/// Registry with the same names and schemas as the full one, backed by
/// [`FallbackHandler`]s.
pub fn fallback_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for spec in catalog() {
        let handler = Arc::new(FallbackHandler::new(spec.name));
        registry.register(spec, handler);
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(ToolStrategy::parse("full"), ToolStrategy::Full);
        assert_eq!(ToolStrategy::parse("Fallback"), ToolStrategy::Fallback);
        assert_eq!(ToolStrategy::parse("auto"), ToolStrategy::Auto);
        assert_eq!(ToolStrategy::parse("whatever"), ToolStrategy::Auto);
    }

    #[tokio::test]
    async fn test_fallback_marks_results() {
        let registry = fallback_registry();
        let output = registry
            .invoke("create_instance", json!({"name": "x", "workspace_path": "/w"}))
            .await
            .unwrap();
        let ToolOutput::Json(value) = output else {
            panic!("expected json output");
        };
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["fallback"], json!(true));
        assert_eq!(value["tool"], json!("create_instance"));
        assert!(value["message"].as_str().unwrap().starts_with("[fallback]"));
    }

    #[test]
    fn test_fallback_matches_catalog() {
        let registry = fallback_registry();
        let catalog = catalog();
        assert_eq!(registry.len(), catalog.len());
        for (registered, expected) in registry.specs().zip(&catalog) {
            assert_eq!(registered.name, expected.name);
            assert_eq!(registered.input_schema, expected.input_schema);
        }
    }
}
