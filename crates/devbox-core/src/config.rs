//! Provider configuration types.

use crate::instance::ProviderType;
use std::path::PathBuf;

/// Static configuration for a provider backend.
///
/// Common settings (name prefix, defaults) plus the fields the container
/// backends read (network, registry, engine binary).
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Backend this config is for.
    pub provider_type: ProviderType,
    /// Prefix for generated instance ids (default: `devbox`).
    pub instance_prefix: String,
    /// Image used when a request does not name one.
    pub default_image: String,
    /// Engine network instances are attached to.
    pub network_name: String,
    /// Registry prepended to unqualified image names.
    pub image_registry: Option<String>,
    /// Engine binary override (default: the provider type's CLI name).
    pub engine_binary: Option<String>,
    /// Arguments placed before every engine subcommand.
    pub engine_args: Vec<String>,
    /// Directory for persisted instance records. `None` keeps them in memory.
    pub storage_dir: Option<PathBuf>,
    /// Port the development server listens on inside the container.
    pub container_port: u16,
    /// Mount point of the workspace inside the container.
    pub workspace_mount: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::Docker,
            instance_prefix: "devbox".into(),
            default_image: "codercom/code-server:latest".into(),
            network_name: "devbox-network".into(),
            image_registry: None,
            engine_binary: None,
            engine_args: Vec::new(),
            storage_dir: None,
            container_port: 8080,
            workspace_mount: "/home/coder/project".into(),
        }
    }
}

impl ProviderConfig {
    /// Default configuration for a provider type.
    pub fn for_type(provider_type: ProviderType) -> Self {
        Self {
            provider_type,
            ..Default::default()
        }
    }

    /// Engine binary to invoke: the override, else the provider type's CLI.
    pub fn engine_binary(&self) -> String {
        match &self.engine_binary {
            Some(binary) => binary.clone(),
            None => match self.provider_type {
                ProviderType::Podman => "podman".into(),
                _ => "docker".into(),
            },
        }
    }

    /// Qualify an image reference with the configured registry.
    ///
    /// References that already name a registry host (`host.tld/...` or
    /// `host:port/...`) are left alone.
    pub fn qualify_image(&self, image: &str) -> String {
        let Some(registry) = self.image_registry.as_deref() else {
            return image.to_string();
        };
        let first = image.split('/').next().unwrap_or_default();
        let has_host = image.contains('/') && (first.contains('.') || first.contains(':'));
        if has_host {
            image.to_string()
        } else {
            format!("{}/{}", registry.trim_end_matches('/'), image)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.provider_type, ProviderType::Docker);
        assert_eq!(config.instance_prefix, "devbox");
        assert_eq!(config.network_name, "devbox-network");
        assert_eq!(config.container_port, 8080);
        assert!(config.storage_dir.is_none());
    }

    #[test]
    fn test_engine_binary_follows_type() {
        assert_eq!(ProviderConfig::for_type(ProviderType::Docker).engine_binary(), "docker");
        assert_eq!(ProviderConfig::for_type(ProviderType::Podman).engine_binary(), "podman");

        let config = ProviderConfig {
            engine_binary: Some("/opt/bin/nerdctl".into()),
            ..Default::default()
        };
        assert_eq!(config.engine_binary(), "/opt/bin/nerdctl");
    }

    #[test]
    fn test_qualify_image() {
        let mut config = ProviderConfig::default();
        assert_eq!(config.qualify_image("ubuntu:22.04"), "ubuntu:22.04");

        config.image_registry = Some("registry.example.com/".into());
        assert_eq!(
            config.qualify_image("devbox/base:1"),
            "registry.example.com/devbox/base:1"
        );
        assert_eq!(config.qualify_image("ghcr.io/org/img"), "ghcr.io/org/img");
        assert_eq!(config.qualify_image("localhost:5000/img"), "localhost:5000/img");
    }
}
