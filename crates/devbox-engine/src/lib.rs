//! # devbox-engine
//!
//! Container engine command layer for Devbox development environments.
//! Shells out to a `docker`-compatible binary and reports what happened
//! without ever failing the caller.
//!
//! ## Quick Start
//!
//! ```no_run
//! use devbox_engine::ContainerEngine;
//!
//! # async fn example() {
//! let engine = ContainerEngine::new("docker");
//!
//! if engine.is_engine_available().await {
//!     let output = engine.execute(&["ps", "-q"]).await;
//!     println!("running containers:\n{}", output.stdout);
//! }
//!
//! // Probes fold every failure into `false`
//! assert!(!engine.container_exists("no-such-container").await);
//! # }
//! ```
//!
//! ## Features
//!
//! - **Never-fail execution**: non-zero exits and spawn errors come back as
//!   a [`CommandOutput`], not an error
//! - **Probes**: engine availability, network and container existence,
//!   running state
//! - **Bounded output**: stdout and stderr are capped at 1 MiB each

mod engine;
mod output;

pub use engine::{ContainerEngine, DEFAULT_ENGINE};
pub use output::{CommandOutput, MAX_CAPTURE_BYTES};
