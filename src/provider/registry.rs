//! Name-to-factory mapping for API providers.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use super::coingecko::{CoingeckoProvider, PROVIDER_NAME as COINGECKO};
use super::{ApiProvider, ProviderContext};
use crate::error::{RatekeeperError, Result};

/// Future returned by a [`ProviderFactory`].
pub type ProviderFuture = BoxFuture<'static, Result<Arc<dyn ApiProvider>>>;

/// Builds a provider from a context.
pub type ProviderFactory = Arc<dyn Fn(ProviderContext) -> ProviderFuture + Send + Sync>;

/// Registry of provider factories, keyed by provider name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in provider.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            COINGECKO,
            Arc::new(|context: ProviderContext| {
                async move {
                    let provider = CoingeckoProvider::connect(context).await?;
                    Ok::<_, RatekeeperError>(Arc::new(provider) as Arc<dyn ApiProvider>)
                }
                .boxed()
            }),
        );
        registry
    }

    /// Add or replace a factory.
    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) {
        let name = name.into();
        debug!(provider = %name, "Registered API provider");
        self.factories.insert(name, factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the named provider.
    pub async fn create(&self, name: &str, context: ProviderContext) -> Result<Arc<dyn ApiProvider>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RatekeeperError::UnknownProvider(name.to_string()))?;
        factory(context).await
    }
}
