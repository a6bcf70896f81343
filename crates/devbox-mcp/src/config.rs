//! Configuration for the MCP server.
//!
//! Configuration is loaded from environment variables with sensible defaults.

pub use crate::error::ConfigError;
use crate::tools::ToolStrategy;
use devbox_core::{ProviderConfig, ProviderType};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum size of a single tool request over the networked transport (10 MB).
pub const MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

/// Default cap on tool calls running at once for one network connection.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Which transport serves the process. Decided once at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// MCP over stdin/stdout. No authentication.
    #[default]
    Pipe,
    /// WebSocket listener. Connections must present the auth token.
    Network,
}

impl TransportMode {
    /// Parse from string (case-insensitive). Unknown values select `Pipe`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "network" | "ws" | "websocket" | "socket" => Self::Network,
            _ => Self::Pipe,
        }
    }
}

/// Configuration for the Devbox MCP server.
#[derive(Clone)]
pub struct ServerConfig {
    /// Transport mode (default: pipe).
    pub transport_mode: TransportMode,

    /// Bind host for the networked transport.
    pub host: String,

    /// Bind port for the networked transport.
    pub port: u16,

    /// Verbose logging.
    pub debug: bool,

    /// Token supplied by the operator.
    pub auth_token: Option<String>,

    /// Ignore any persisted token and generate a new one.
    pub regenerate_token: bool,

    /// Token file override (default: `~/.devbox/auth/auth_token`).
    pub token_path: Option<PathBuf>,

    /// Upper bound on a single tool call.
    pub request_timeout: Duration,

    /// Idle time after which a connection is closed.
    pub connection_timeout: Duration,

    /// Interval between keep-alive pings.
    pub keepalive_interval: Duration,

    /// Tool calls one connection may have running at once.
    pub max_in_flight: usize,

    /// Directory for persisted instance records.
    pub instances_dir: Option<PathBuf>,

    /// Provider backend.
    pub provider_type: ProviderType,

    /// Engine binary override.
    pub engine_binary: Option<String>,

    /// Arguments placed before every engine subcommand (e.g. `--context remote`).
    pub engine_args: Vec<String>,

    /// Registry prepended to unqualified image names.
    pub image_registry: Option<String>,

    /// Engine network for instances.
    pub network_name: String,

    /// Image used when a create request names none.
    pub default_image: String,

    /// Tool registry selection.
    pub tool_strategy: ToolStrategy,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("transport_mode", &self.transport_mode)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("debug", &self.debug)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("regenerate_token", &self.regenerate_token)
            .field("token_path", &self.token_path)
            .field("request_timeout", &self.request_timeout)
            .field("connection_timeout", &self.connection_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("max_in_flight", &self.max_in_flight)
            .field("instances_dir", &self.instances_dir)
            .field("provider_type", &self.provider_type)
            .field("engine_binary", &self.engine_binary)
            .field("engine_args", &self.engine_args)
            .field("image_registry", &self.image_registry)
            .field("network_name", &self.network_name)
            .field("default_image", &self.default_image)
            .field("tool_strategy", &self.tool_strategy)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let provider = ProviderConfig::default();
        Self {
            transport_mode: TransportMode::Pipe,
            host: "127.0.0.1".into(),
            port: 7681,
            debug: false,
            auth_token: None,
            regenerate_token: false,
            token_path: None,
            request_timeout: Duration::from_millis(30_000),
            connection_timeout: Duration::from_millis(300_000),
            keepalive_interval: Duration::from_millis(30_000),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            instances_dir: None,
            provider_type: provider.provider_type,
            engine_binary: None,
            engine_args: provider.engine_args,
            image_registry: provider.image_registry,
            network_name: provider.network_name,
            default_image: provider.default_image,
            tool_strategy: ToolStrategy::Auto,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DEVBOX_MODE` | `pipe` (pipe, stdio, network, ws, websocket) |
    /// | `DEVBOX_HOST` | `127.0.0.1` |
    /// | `DEVBOX_PORT` | `7681` |
    /// | `DEVBOX_DEBUG` | `false` |
    /// | `DEVBOX_AUTH_TOKEN` | unset |
    /// | `DEVBOX_REGENERATE_TOKEN` | `false` |
    /// | `DEVBOX_TOKEN_PATH` | `~/.devbox/auth/auth_token` |
    /// | `DEVBOX_REQUEST_TIMEOUT_MS` | `30000` |
    /// | `DEVBOX_CONNECTION_TIMEOUT_MS` | `300000` |
    /// | `DEVBOX_KEEPALIVE_MS` | `30000` |
    /// | `DEVBOX_MAX_IN_FLIGHT` | `16` |
    /// | `DEVBOX_INSTANCES_DIR` | unset (in-memory) |
    /// | `DEVBOX_PROVIDER` | `docker` |
    /// | `DEVBOX_ENGINE` | provider's CLI |
    /// | `DEVBOX_ENGINE_ARGS` | none (whitespace-separated) |
    /// | `DEVBOX_REGISTRY` | unset |
    /// | `DEVBOX_NETWORK` | `devbox-network` |
    /// | `DEVBOX_IMAGE` | `codercom/code-server:latest` |
    /// | `DEVBOX_TOOLS` | `auto` (full, fallback, auto) |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// Unparsable values fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let millis = |key: &str, fallback: Duration| -> Duration {
            get(key)
                .and_then(|v| parse_or_warn::<u64>(key, &v))
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            transport_mode: get("DEVBOX_MODE")
                .map(|v| TransportMode::parse(&v))
                .unwrap_or(default.transport_mode),
            host: get("DEVBOX_HOST").unwrap_or(default.host),
            port: get("DEVBOX_PORT")
                .and_then(|v| parse_or_warn("DEVBOX_PORT", &v))
                .unwrap_or(default.port),
            debug: get("DEVBOX_DEBUG")
                .map(|v| parse_flag(&v))
                .unwrap_or(default.debug),
            auth_token: get("DEVBOX_AUTH_TOKEN").map(|v| v.trim().to_string()),
            regenerate_token: get("DEVBOX_REGENERATE_TOKEN")
                .map(|v| parse_flag(&v))
                .unwrap_or(default.regenerate_token),
            token_path: get("DEVBOX_TOKEN_PATH").map(PathBuf::from),
            request_timeout: millis("DEVBOX_REQUEST_TIMEOUT_MS", default.request_timeout),
            connection_timeout: millis("DEVBOX_CONNECTION_TIMEOUT_MS", default.connection_timeout),
            keepalive_interval: millis("DEVBOX_KEEPALIVE_MS", default.keepalive_interval),
            max_in_flight: get("DEVBOX_MAX_IN_FLIGHT")
                .and_then(|v| parse_or_warn("DEVBOX_MAX_IN_FLIGHT", &v))
                .unwrap_or(default.max_in_flight),
            instances_dir: get("DEVBOX_INSTANCES_DIR").map(PathBuf::from),
            provider_type: get("DEVBOX_PROVIDER")
                .and_then(|v| parse_or_warn("DEVBOX_PROVIDER", &v))
                .unwrap_or(default.provider_type),
            engine_binary: get("DEVBOX_ENGINE"),
            engine_args: get("DEVBOX_ENGINE_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or(default.engine_args),
            image_registry: get("DEVBOX_REGISTRY").or(default.image_registry),
            network_name: get("DEVBOX_NETWORK").unwrap_or(default.network_name),
            default_image: get("DEVBOX_IMAGE").unwrap_or(default.default_image),
            tool_strategy: get("DEVBOX_TOOLS")
                .map(|v| ToolStrategy::parse(&v))
                .unwrap_or(default.tool_strategy),
        }
    }

    /// Check values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport_mode == TransportMode::Network {
            if self.port == 0 {
                return Err(ConfigError::InvalidPort);
            }
            if self.host.trim().is_empty() {
                return Err(ConfigError::MissingHost);
            }
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("DEVBOX_REQUEST_TIMEOUT_MS"));
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("DEVBOX_CONNECTION_TIMEOUT_MS"));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::ZeroTimeout("DEVBOX_KEEPALIVE_MS"));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::ZeroLimit("DEVBOX_MAX_IN_FLIGHT"));
        }
        Ok(())
    }

    /// Provider configuration derived from the server settings.
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            provider_type: self.provider_type,
            default_image: self.default_image.clone(),
            network_name: self.network_name.clone(),
            engine_binary: self.engine_binary.clone(),
            engine_args: self.engine_args.clone(),
            image_registry: self.image_registry.clone(),
            storage_dir: self.instances_dir.clone(),
            ..Default::default()
        }
    }
}

/// Read a boolean flag: `1`, `true`, `yes` or `on` (case-insensitive).
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(variable = key, value, "Ignoring unparsable configuration value");
            None
        }
    }
}
