//! # devbox-core
//!
//! Provider layer for Devbox development environments.
//!
//! This crate defines the instance data model, the contract every backend
//! implements, the shared helpers backends compose, and a registry that
//! turns a provider type into a ready provider.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    devbox-core (host)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌──────────────────┐     ┌──────────────────────────┐   │
//! │  │ ProviderRegistry │────▶│  Vec<(ProviderType,      │   │
//! │  │   - register()   │     │        constructor)>     │   │
//! │  │   - create()     │     └──────────────────────────┘   │
//! │  └──────────────────┘                                    │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌──────────────────┐     ┌──────────────────────────┐   │
//! │  │ dyn Provider     │────▶│   ProviderBase           │   │
//! │  │ (ContainerProv.) │     │   ids, validation,       │   │
//! │  │  - create()      │     │   base instances         │   │
//! │  │  - start/stop()  │     └──────────────────────────┘   │
//! │  │  - exec()        │                                    │
//! │  └──────────────────┘     ┌──────────────────────────┐   │
//! │           │          ────▶│   InstanceStore (JSON)   │   │
//! │           ▼               └──────────────────────────┘   │
//! │  ┌──────────────────┐                                    │
//! │  │ ContainerEngine  │  (from devbox-engine)              │
//! │  └──────────────────┘                                    │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//!                 docker / podman daemon
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use devbox_core::{
//!     ContainerProvider, InstanceConfig, ProviderConfig, ProviderRegistry, ProviderType,
//! };
//!
//! # async fn example() -> devbox_core::Result<()> {
//! let mut registry = ProviderRegistry::new();
//! registry.register(ProviderType::Docker, ContainerProvider::construct);
//!
//! let provider = registry
//!     .create_and_initialize(ProviderType::Docker, &ProviderConfig::default())
//!     .await?;
//!
//! let config = InstanceConfig::new(
//!     "my-project",
//!     "codercom/code-server:latest",
//!     "/home/me/my-project",
//!     2.0,
//!     "2g",
//! );
//! let instance = provider.create_instance(config).await?;
//! println!("open {}", instance.network.urls.join(", "));
//!
//! provider.stop_instance(&instance.id, false).await?;
//! provider.delete_instance(&instance.id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Uniform instances**: every backend builds instances through
//!   [`ProviderBase`], so ids, limits and timestamps look the same
//! - **Enforced lifecycle**: status changes go through a state machine
//! - **Explicit registry**: no global state; tests build their own
//! - **Persistence**: optional JSON records, reconciled with the engine on
//!   startup

mod base;
mod config;
mod container;
mod error;
mod instance;
mod provider;
mod registry;
mod store;

pub use base::ProviderBase;
pub use config::ProviderConfig;
pub use container::ContainerProvider;
pub use error::{ProviderError, Result};
pub use instance::{
    parse_memory_bytes, CpuRequest, Instance, InstanceConfig, InstanceId, InstanceNetwork,
    InstanceResources, InstanceStatus, InstanceUpdate, MemoryRequest, PortMapping, ProviderType,
    ResourceRequest, ResourceUpdate, ResourceUsage, StorageRequest,
};
pub use provider::{ExecResult, InstanceFilter, LogOptions, Provider, ProviderCapabilities};
pub use registry::{ProviderConstructor, ProviderRegistry, PRIMARY_PROVIDER};
pub use store::InstanceStore;
