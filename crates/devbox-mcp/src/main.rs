//! Devbox MCP Server entry point.
//!
//! ## Transport Modes
//!
//! - **pipe** (default): MCP over stdin/stdout
//! - **network**: token-authenticated WebSocket listener
//!
//! Exit code is 0 after a signal or an orderly stop, 1 after a fatal error.

use anyhow::Context;
use devbox_mcp::auth::connection_url;
use devbox_mcp::config::parse_flag;
use devbox_mcp::server::serve_pipe;
use devbox_mcp::{
    build_registry, resolve_token, ws, ConnectionSettings, DevboxServer, Lifecycle, ServerConfig,
    ShutdownReason, TokenSource, TokenStore, ToolRegistry, TransportMode, WsState,
};
use rmcp::transport::stdio;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let debug = std::env::var("DEVBOX_DEBUG").is_ok_and(|v| parse_flag(&v));
    if let Err(e) = init_tracing(debug) {
        eprintln!("failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Devbox MCP Server");

    let lifecycle = Arc::new(Lifecycle::new());
    lifecycle.install_signal_handlers();

    if let Err(e) = run(&lifecycle).await {
        lifecycle.request_shutdown(ShutdownReason::Fatal(format!("{e:#}")));
    }

    lifecycle.finish().into()
}

/// Logs go to stderr (stdout is the pipe transport).
fn init_tracing(debug: bool) -> anyhow::Result<()> {
    let level = if debug { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env();
    for target in ["devbox_mcp", "devbox_core", "devbox_engine"] {
        filter = filter.add_directive(format!("{target}={level}").parse()?);
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

async fn run(lifecycle: &Arc<Lifecycle>) -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    tracing::info!(?config, "Configuration loaded");
    config.validate().context("invalid configuration")?;

    let (registry, strategy) = build_registry(&config)
        .await
        .context("failed to build tool registry")?;
    tracing::info!(?strategy, tools = registry.len(), "Tool registry ready");
    let registry = Arc::new(registry);

    match config.transport_mode {
        TransportMode::Pipe => run_pipe(registry, &config, lifecycle).await,
        TransportMode::Network => run_network(registry, &config, lifecycle).await,
    }
}

async fn run_pipe(
    registry: Arc<ToolRegistry>,
    config: &ServerConfig,
    lifecycle: &Arc<Lifecycle>,
) -> anyhow::Result<()> {
    let server = DevboxServer::new(registry, config.request_timeout);
    let (stdin, stdout) = stdio();
    serve_pipe(server, stdin, stdout, lifecycle)
        .await
        .context("stdio transport failed")
}

async fn run_network(
    registry: Arc<ToolRegistry>,
    config: &ServerConfig,
    lifecycle: &Arc<Lifecycle>,
) -> anyhow::Result<()> {
    let store = match &config.token_path {
        Some(path) => TokenStore::new(path),
        None => TokenStore::default_location()?,
    };
    let resolved = resolve_token(config.auth_token.as_deref(), config.regenerate_token, &store)?;

    if resolved.source == TokenSource::Generated {
        let url = connection_url(&config.host, config.port, &resolved.token);
        tracing::info!(url = %url, token_file = %store.path().display(), "New auth token generated");
    } else {
        tracing::info!(source = ?resolved.source, "Auth token loaded");
    }

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;

    let state = WsState::new(
        registry,
        resolved.token,
        ConnectionSettings::from_config(config),
        Arc::clone(lifecycle),
    );

    lifecycle.mark_ready();
    tracing::info!(host = %config.host, port = config.port, "Server ready (network)");

    let shutdown = {
        let lifecycle = Arc::clone(lifecycle);
        async move { lifecycle.wait_for_shutdown().await }
    };
    ws::serve(state, listener, shutdown)
        .await
        .context("WebSocket transport failed")?;
    Ok(())
}
