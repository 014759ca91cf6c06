use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::ports::ProviderAdapterArc;
use crate::domain::product::Product;
use crate::error::{EngineError, Result};

/// Configuration-time mapping of provider names to adapters, plus a
/// process-lifetime cache of resolved product descriptors.
pub struct ProviderRegistry {
    adapters: HashMap<String, ProviderAdapterArc>,
    products: RwLock<HashMap<(String, String), Product>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            products: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an adapter under its own name. Re-registering a name
    /// replaces the previous adapter.
    pub fn register(&mut self, adapter: ProviderAdapterArc) -> &mut Self {
        self.adapters.insert(adapter.name().to_string(), adapter);
        self
    }

    pub fn adapter(&self, provider: &str) -> Result<&ProviderAdapterArc> {
        self.adapters
            .get(provider)
            .ok_or_else(|| EngineError::UnknownProvider {
                provider: provider.to_string(),
            })
    }

    /// Resolves a product through the adapter, caching the descriptor for
    /// the lifetime of the registry. Descriptors are never mutated.
    pub async fn product(&self, provider: &str, product_id: &str) -> Result<Product> {
        let key = (provider.to_string(), product_id.to_string());
        {
            let cache = self.products.read().await;
            if let Some(product) = cache.get(&key) {
                return Ok(product.clone());
            }
        }

        let adapter = self.adapter(provider)?;
        let product = adapter.require_product(product_id).await?;
        self.products.write().await.insert(key, product.clone());
        Ok(product)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
