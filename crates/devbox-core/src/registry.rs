//! Provider registry - maps provider types to constructors.
//!
//! The registry is an ordinary value built at process start and passed to
//! whoever needs to create providers. There is no global registry; tests
//! build their own.

use crate::config::ProviderConfig;
use crate::error::{ProviderError, Result};
use crate::instance::ProviderType;
use crate::provider::Provider;
use std::fmt;
use std::sync::Arc;

/// Backend preferred by [`ProviderRegistry::create_default`].
pub const PRIMARY_PROVIDER: ProviderType = ProviderType::Docker;

/// Constructor for a provider backend.
pub type ProviderConstructor =
    Arc<dyn Fn(&ProviderConfig) -> Result<Arc<dyn Provider>> + Send + Sync>;

/// Registry of provider constructors, in registration order.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    entries: Vec<(ProviderType, ProviderConstructor)>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for a provider type.
    ///
    /// Registering a type again replaces its constructor but keeps its
    /// original position.
    pub fn register<F>(&mut self, provider_type: ProviderType, ctor: F)
    where
        F: Fn(&ProviderConfig) -> Result<Arc<dyn Provider>> + Send + Sync + 'static,
    {
        let ctor: ProviderConstructor = Arc::new(ctor);
        if let Some(entry) = self.entries.iter_mut().find(|(t, _)| *t == provider_type) {
            tracing::debug!(%provider_type, "Replacing provider constructor");
            entry.1 = ctor;
        } else {
            tracing::debug!(%provider_type, "Registering provider");
            self.entries.push((provider_type, ctor));
        }
    }

    /// Whether a constructor exists for this type.
    pub fn is_registered(&self, provider_type: ProviderType) -> bool {
        self.entries.iter().any(|(t, _)| *t == provider_type)
    }

    /// Registered types in registration order.
    pub fn registered_types(&self) -> Vec<ProviderType> {
        self.entries.iter().map(|(t, _)| *t).collect()
    }

    /// Construct a provider of the given type.
    ///
    /// Fails with [`ProviderError::NotRegistered`] if the type is unknown.
    /// Errors from the constructor itself are returned unchanged.
    pub fn create(
        &self,
        provider_type: ProviderType,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn Provider>> {
        let (_, ctor) = self
            .entries
            .iter()
            .find(|(t, _)| *t == provider_type)
            .ok_or(ProviderError::NotRegistered(provider_type))?;

        let mut config = config.clone();
        config.provider_type = provider_type;

        tracing::debug!(%provider_type, "Creating provider");
        ctor(&config)
    }

    /// Construct a provider and run its `initialize()`.
    ///
    /// Initialization failures are returned; the half-built provider is
    /// dropped.
    pub async fn create_and_initialize(
        &self,
        provider_type: ProviderType,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn Provider>> {
        let provider = self.create(provider_type, config)?;
        provider.initialize().await.map_err(|e| {
            tracing::error!(%provider_type, error = %e, "Provider initialization failed");
            e
        })?;
        tracing::info!(%provider_type, "Provider initialized");
        Ok(provider)
    }

    /// Construct the default provider: [`PRIMARY_PROVIDER`] if registered,
    /// else the first registered type.
    pub fn create_default(&self, config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
        self.create(self.default_type()?, config)
    }

    /// Type [`create_default`](Self::create_default) would pick.
    pub fn default_type(&self) -> Result<ProviderType> {
        if self.is_registered(PRIMARY_PROVIDER) {
            return Ok(PRIMARY_PROVIDER);
        }
        self.entries
            .first()
            .map(|(t, _)| *t)
            .ok_or(ProviderError::NoProvidersRegistered)
    }
}
