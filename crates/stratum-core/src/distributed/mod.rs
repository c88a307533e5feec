pub mod loopback;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::DistributedConfig;
use crate::error::{BridgeError, LayerError};
use crate::layer::{BoxFuture, Layer, LayerTarget};
use crate::runtime::CallContext;

pub use loopback::{LoopbackTransport, RemoteEndpoint};

/// A concrete way of reaching layer implementations hosted on other nodes.
///
/// `layer_type` + `implementation` identify the capability; `pattern` is an
/// opaque matching rule whose meaning belongs to the transport.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn is_published<'a>(
        &'a self,
        layer_type: &'a str,
        implementation: &'a str,
    ) -> BoxFuture<'a, bool>;

    fn resolve_pattern<'a>(
        &'a self,
        layer_type: &'a str,
        implementation: &'a str,
    ) -> BoxFuture<'a, Option<String>>;

    fn publish<'a>(
        &'a self,
        layer_type: &'a str,
        implementation: &'a str,
        pattern: &'a str,
    ) -> BoxFuture<'a, Result<(), BridgeError>>;

    fn invoke<'a>(
        &'a self,
        layer_type: &'a str,
        implementation: &'a str,
        operation: &'a str,
        args: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, LayerError>>;
}

type TransportFactory = Arc<dyn Fn() -> Result<Arc<dyn Transport>, BridgeError> + Send + Sync>;

/// Name → constructor table consulted when the bridge is built from
/// configuration.
#[derive(Clone, Default)]
pub struct TransportFactories {
    factories: HashMap<String, TransportFactory>,
}

impl TransportFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factories for the transports shipped with this crate.
    pub fn with_defaults() -> Self {
        let mut factories = Self::new();
        factories.register(loopback::TRANSPORT_NAME, || {
            Ok(Arc::new(LoopbackTransport::new()) as Arc<dyn Transport>)
        });
        factories
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn Transport>, BridgeError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn Transport>, BridgeError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| BridgeError::UnknownTransport(name.to_string()))?;
        factory()
    }
}

/// The process-wide access point to the configured transport.
///
/// Without a transport, discovery degrades quietly (`false` / `None`) while
/// `publish` and `invoke` fail with [`LayerError::TransportUnavailable`].
#[derive(Clone, Default)]
pub struct DistributedBridge {
    transport: Option<Arc<dyn Transport>>,
}

impl DistributedBridge {
    pub fn disconnected() -> Self {
        Self { transport: None }
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        tracing::info!(transport = transport.name(), "Distributed bridge connected");
        Self {
            transport: Some(transport),
        }
    }

    /// Build the bridge from configuration. A missing transport name, a
    /// disabled bridge, or a transport that fails to construct all leave the
    /// bridge disconnected.
    pub fn from_config(config: &DistributedConfig, factories: &TransportFactories) -> Self {
        if !config.enabled {
            tracing::debug!("Distributed layers disabled");
            return Self::disconnected();
        }

        let Some(name) = config.transport.as_deref() else {
            tracing::warn!("Distributed layers enabled but no transport configured");
            return Self::disconnected();
        };

        match factories.create(name) {
            Ok(transport) => Self::with_transport(transport),
            Err(e) => {
                tracing::error!(transport = name, error = %e, "Network transport implementation not found");
                Self::disconnected()
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn transport_name(&self) -> Option<&str> {
        self.transport.as_deref().map(|t| t.name())
    }

    pub async fn is_published(&self, layer_type: &str, implementation: &str) -> bool {
        match &self.transport {
            Some(transport) => transport.is_published(layer_type, implementation).await,
            None => false,
        }
    }

    pub async fn resolve_pattern(&self, layer_type: &str, implementation: &str) -> Option<String> {
        match &self.transport {
            Some(transport) => transport.resolve_pattern(layer_type, implementation).await,
            None => None,
        }
    }

    pub async fn publish(
        &self,
        layer_type: &str,
        implementation: &str,
        pattern: &str,
    ) -> Result<(), LayerError> {
        let transport = self.transport.as_ref().ok_or(LayerError::TransportUnavailable)?;
        transport.publish(layer_type, implementation, pattern).await?;
        tracing::info!(
            layer = layer_type,
            implementation,
            pattern,
            transport = transport.name(),
            "Layer published"
        );
        Ok(())
    }

    pub async fn invoke(
        &self,
        layer_type: &str,
        implementation: &str,
        operation: &str,
        args: &[Value],
    ) -> Result<Value, LayerError> {
        let transport = self.transport.as_ref().ok_or(LayerError::TransportUnavailable)?;
        tracing::debug!(
            layer = layer_type,
            implementation,
            operation,
            transport = transport.name(),
            "Remote layer invocation"
        );
        transport
            .invoke(layer_type, implementation, operation, args)
            .await
    }
}

/// Layer whose body forwards every call through the bridge. Used when a
/// capability has no local implementation but is published remotely.
pub struct DistributedLayer {
    bridge: DistributedBridge,
    layer_type: String,
    implementation: String,
}

impl DistributedLayer {
    pub fn new(
        bridge: DistributedBridge,
        layer_type: impl Into<String>,
        implementation: impl Into<String>,
    ) -> Self {
        Self {
            bridge,
            layer_type: layer_type.into(),
            implementation: implementation.into(),
        }
    }
}

impl LayerTarget for DistributedLayer {
    fn call<'a>(
        &'a self,
        _cx: &'a CallContext,
        operation: &'a str,
        args: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, LayerError>> {
        Box::pin(self.bridge.invoke(&self.layer_type, &self.implementation, operation, args))
    }
}

impl Layer for DistributedLayer {
    fn type_name(&self) -> &str {
        &self.layer_type
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn disconnected_bridge_degrades_discovery() {
        let bridge = DistributedBridge::disconnected();

        assert!(!bridge.is_connected());
        assert!(!bridge.is_published("billing::Invoices", "billing").await);
        assert!(bridge.resolve_pattern("billing::Invoices", "billing").await.is_none());
    }

    #[tokio::test]
    async fn disconnected_bridge_fails_active_operations() {
        let bridge = DistributedBridge::disconnected();

        let err = bridge
            .publish("billing::Invoices", "billing", "^billing$")
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::TransportUnavailable));

        let err = bridge
            .invoke("billing::Invoices", "billing", "total", &[json!(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::TransportUnavailable));
    }

    #[test]
    fn config_without_transport_is_disconnected() {
        let factories = TransportFactories::with_defaults();

        let disabled = DistributedConfig {
            enabled: false,
            transport: Some("loopback".into()),
            ..DistributedConfig::default()
        };
        assert!(!DistributedBridge::from_config(&disabled, &factories).is_connected());

        let unnamed = DistributedConfig {
            enabled: true,
            transport: None,
            ..DistributedConfig::default()
        };
        assert!(!DistributedBridge::from_config(&unnamed, &factories).is_connected());
    }

    #[test]
    fn unknown_or_failing_transport_degrades() {
        let mut factories = TransportFactories::with_defaults();
        factories.register("broken", || {
            Err(BridgeError::Construction("socket refused".into()))
        });

        let unknown = DistributedConfig {
            enabled: true,
            transport: Some("carrier-pigeon".into()),
            ..DistributedConfig::default()
        };
        assert!(!DistributedBridge::from_config(&unknown, &factories).is_connected());

        let broken = DistributedConfig {
            enabled: true,
            transport: Some("broken".into()),
            ..DistributedConfig::default()
        };
        assert!(!DistributedBridge::from_config(&broken, &factories).is_connected());
    }

    #[test]
    fn named_transport_is_constructed() {
        let config = DistributedConfig {
            enabled: true,
            transport: Some("loopback".into()),
            ..DistributedConfig::default()
        };
        let bridge = DistributedBridge::from_config(&config, &TransportFactories::with_defaults());
        assert_eq!(bridge.transport_name(), Some("loopback"));
    }
}
