//! # devbox-mcp
//!
//! MCP (Model Context Protocol) server exposing Devbox instances to AI agents.
//!
//! One process serves one transport, chosen at boot:
//!
//! - **pipe** (default): MCP over stdin/stdout, for local clients.
//! - **network**: a WebSocket listener; clients connect with
//!   `ws://host:port?token=...`.
//!
//! ## Quick Start
//!
//! ```bash
//! cargo run -p devbox-mcp
//! ```
//!
//! Serve over the network instead:
//!
//! ```bash
//! export DEVBOX_MODE=network
//! export DEVBOX_PORT=7681
//! cargo run -p devbox-mcp
//! ```
//!
//! ## MCP Tools
//!
//! | Tool | Description |
//! |------|-------------|
//! | `create_instance` | Create an instance with an editor and mounted workspace |
//! | `list_instances` | List instances, filtered by name or status |
//! | `get_instance` | Get one instance by name or id |
//! | `start_instance` | Start a stopped instance |
//! | `stop_instance` | Stop a running instance |
//! | `update_instance` | Rename an instance or change its limits |
//! | `delete_instance` | Delete an instance |
//! | `instance_logs` | Fetch an instance's logs |
//! | `exec_instance` | Run a command inside an instance |
//! | `manage_resources` | Track job resource allocations |
//! | `analyze_code` | Count lines, comments and definitions |
//! | `search_code` | Search files for text or a regex |
//! | `modify_code` | Replace text in a file |
//!
//! When no container engine is reachable the same tools are served by
//! stand-in handlers whose results carry `"fallback": true`.

pub mod auth;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod server;
pub mod tools;
pub mod ws;

pub use auth::{resolve_token, ResolvedToken, TokenSource, TokenStore};
pub use config::{ServerConfig, TransportMode, MAX_REQUEST_BYTES};
pub use error::{AuthError, ConfigError, ToolError};
pub use lifecycle::{ExitStatus, Lifecycle, ServerState, ShutdownReason};
pub use server::DevboxServer;
pub use tools::{build_registry, ToolRegistry, ToolStrategy};
pub use ws::{ConnectionSettings, WsState};
