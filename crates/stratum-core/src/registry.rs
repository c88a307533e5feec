use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::dispatcher::{LayerDescriptor, LayerHandle};
use crate::error::LayerError;
use crate::statistic::StatisticsSnapshot;

type LayerKey = (String, String);

/// In-memory store of registered layer handles.
///
/// Handles are looked up by capability type plus implementation name or one
/// of the implementation's aliases. A handle that is not overwritable
/// rejects re-registration under the same key.
#[derive(Default)]
pub struct LayerRegistry {
    /// (type, implementation) → handle
    layers: RwLock<HashMap<LayerKey, Arc<LayerHandle>>>,
    /// (type, alias) → implementation
    aliases: RwLock<HashMap<LayerKey, String>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle, returning the one it replaced, if any.
    pub async fn register(
        &self,
        handle: Arc<LayerHandle>,
    ) -> Result<Option<Arc<LayerHandle>>, LayerError> {
        let key = (
            handle.type_name().to_string(),
            handle.implementation_name().to_string(),
        );

        let mut layers = self.layers.write().await;
        if let Some(existing) = layers.get(&key)
            && !existing.is_overwritable()
        {
            return Err(LayerError::NotOverwritable {
                layer_type: key.0,
                implementation: key.1,
            });
        }

        let previous = layers.insert(key.clone(), Arc::clone(&handle));

        let mut aliases = self.aliases.write().await;
        if let Some(previous) = &previous {
            for alias in previous.aliases() {
                aliases.remove(&(key.0.clone(), alias.clone()));
            }
        }
        for alias in handle.aliases() {
            aliases.insert((key.0.clone(), alias.clone()), key.1.clone());
        }

        tracing::info!(
            layer = %key.0,
            implementation = %key.1,
            plugin = handle.is_plugin(),
            replaced = previous.is_some(),
            "Layer registered"
        );
        Ok(previous)
    }

    pub async fn get(&self, layer_type: &str, implementation: &str) -> Option<Arc<LayerHandle>> {
        let key = (layer_type.to_string(), implementation.to_string());
        {
            let layers = self.layers.read().await;
            if let Some(handle) = layers.get(&key) {
                return Some(Arc::clone(handle));
            }
        }

        let resolved = self.aliases.read().await.get(&key).cloned()?;
        let layers = self.layers.read().await;
        layers
            .get(&(layer_type.to_string(), resolved))
            .map(Arc::clone)
    }

    pub async fn remove(&self, layer_type: &str, implementation: &str) -> Option<Arc<LayerHandle>> {
        let key = (layer_type.to_string(), implementation.to_string());
        let removed = self.layers.write().await.remove(&key)?;

        let mut aliases = self.aliases.write().await;
        for alias in removed.aliases() {
            aliases.remove(&(key.0.clone(), alias.clone()));
        }
        tracing::info!(layer = %key.0, implementation = %key.1, "Layer removed");
        Some(removed)
    }

    pub async fn descriptors(&self) -> Vec<LayerDescriptor> {
        let layers = self.layers.read().await;
        let mut descriptors: Vec<_> = layers.values().map(|h| h.descriptor().clone()).collect();
        descriptors.sort_by(|a, b| {
            (&a.type_name, &a.implementation_name).cmp(&(&b.type_name, &b.implementation_name))
        });
        descriptors
    }

    pub async fn statistics(&self) -> Vec<(LayerDescriptor, StatisticsSnapshot)> {
        let layers = self.layers.read().await;
        let mut stats: Vec<_> = layers
            .values()
            .map(|h| (h.descriptor().clone(), h.snapshot()))
            .collect();
        stats.sort_by(|(a, _), (b, _)| {
            (&a.type_name, &a.implementation_name).cmp(&(&b.type_name, &b.implementation_name))
        });
        stats
    }

    pub async fn len(&self) -> usize {
        self.layers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.layers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::layer::{BoxFuture, Layer, LayerTarget};
    use crate::runtime::CallContext;

    struct Rates;

    impl LayerTarget for Rates {
        fn call<'a>(
            &'a self,
            _cx: &'a CallContext,
            _operation: &'a str,
            _args: &'a [Value],
        ) -> BoxFuture<'a, Result<Value, LayerError>> {
            Box::pin(async move { Ok(Value::Null) })
        }
    }

    impl Layer for Rates {
        fn type_name(&self) -> &str {
            "fx::Rates"
        }
    }

    fn handle(name: &str) -> Arc<LayerHandle> {
        Arc::new(LayerHandle::builder(Rates).implementation(name).build())
    }

    #[tokio::test]
    async fn lookup_by_name_and_alias() {
        let registry = LayerRegistry::new();
        registry
            .register(Arc::new(
                LayerHandle::builder(Rates)
                    .implementation("ecb")
                    .alias("european")
                    .build(),
            ))
            .await
            .unwrap();

        assert!(registry.get("fx::Rates", "ecb").await.is_some());
        assert_eq!(
            registry
                .get("fx::Rates", "european")
                .await
                .unwrap()
                .implementation_name(),
            "ecb"
        );
        assert!(registry.get("fx::Rates", "fed").await.is_none());
        assert!(registry.get("fx::Other", "ecb").await.is_none());
    }

    #[tokio::test]
    async fn overwritable_layers_are_replaced() {
        let registry = LayerRegistry::new();
        registry.register(handle("ecb")).await.unwrap();

        let previous = registry.register(handle("ecb")).await.unwrap();
        assert!(previous.is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn non_overwritable_layers_are_kept() {
        let registry = LayerRegistry::new();
        registry
            .register(Arc::new(
                LayerHandle::builder(Rates)
                    .implementation("ecb")
                    .overwritable(false)
                    .build(),
            ))
            .await
            .unwrap();

        let err = registry.register(handle("ecb")).await.unwrap_err();
        assert!(matches!(err, LayerError::NotOverwritable { .. }));
    }

    #[tokio::test]
    async fn remove_drops_aliases() {
        let registry = LayerRegistry::new();
        registry
            .register(Arc::new(
                LayerHandle::builder(Rates)
                    .implementation("ecb")
                    .alias("european")
                    .build(),
            ))
            .await
            .unwrap();

        assert!(registry.remove("fx::Rates", "ecb").await.is_some());
        assert!(registry.get("fx::Rates", "european").await.is_none());
        assert!(registry.is_empty().await);
    }
}
