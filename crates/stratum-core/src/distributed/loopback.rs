use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::distributed::Transport;
use crate::error::{BridgeError, LayerError};
use crate::layer::BoxFuture;

pub const TRANSPORT_NAME: &str = "loopback";

/// Something that can serve a remote invocation of one published layer.
pub trait RemoteEndpoint: Send + Sync {
    fn invoke<'a>(
        &'a self,
        operation: &'a str,
        args: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, LayerError>>;
}

struct Publication {
    layer_type: String,
    implementation: String,
    pattern: String,
    matcher: Regex,
    endpoint: Option<Arc<dyn RemoteEndpoint>>,
}

impl Publication {
    fn exact(&self, layer_type: &str, implementation: &str) -> bool {
        self.layer_type == layer_type && self.implementation == implementation
    }

    fn matches(&self, layer_type: &str, implementation: &str) -> bool {
        self.layer_type == layer_type
            && (self.implementation == implementation || self.matcher.is_match(implementation))
    }
}

/// In-process transport.
///
/// Several runtimes sharing one instance behave like nodes of a small
/// cluster: a publication advertises a layer under a regex over
/// implementation names, and a publication that carries an endpoint can
/// serve invocations.
#[derive(Default)]
pub struct LoopbackTransport {
    publications: RwLock<Vec<Publication>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a layer and attach the endpoint that serves it.
    pub async fn serve(
        &self,
        layer_type: &str,
        implementation: &str,
        pattern: &str,
        endpoint: Arc<dyn RemoteEndpoint>,
    ) -> Result<(), BridgeError> {
        self.upsert(layer_type, implementation, pattern, Some(endpoint))
            .await
    }

    /// Remove a publication. Returns whether one existed.
    pub async fn withdraw(&self, layer_type: &str, implementation: &str) -> bool {
        let mut publications = self.publications.write().await;
        let before = publications.len();
        publications.retain(|p| !p.exact(layer_type, implementation));
        before != publications.len()
    }

    pub async fn len(&self) -> usize {
        self.publications.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.publications.read().await.is_empty()
    }

    async fn upsert(
        &self,
        layer_type: &str,
        implementation: &str,
        pattern: &str,
        endpoint: Option<Arc<dyn RemoteEndpoint>>,
    ) -> Result<(), BridgeError> {
        let matcher = Regex::new(pattern).map_err(|e| BridgeError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        let mut publications = self.publications.write().await;
        match publications
            .iter_mut()
            .find(|p| p.exact(layer_type, implementation))
        {
            Some(existing) => {
                existing.pattern = pattern.to_string();
                existing.matcher = matcher;
                if endpoint.is_some() {
                    existing.endpoint = endpoint;
                }
            }
            None => publications.push(Publication {
                layer_type: layer_type.to_string(),
                implementation: implementation.to_string(),
                pattern: pattern.to_string(),
                matcher,
                endpoint,
            }),
        }
        Ok(())
    }

    /// Exact implementation match first, then the first matching pattern.
    fn find<'p>(
        publications: &'p [Publication],
        layer_type: &str,
        implementation: &str,
    ) -> Option<&'p Publication> {
        publications
            .iter()
            .find(|p| p.exact(layer_type, implementation))
            .or_else(|| {
                publications
                    .iter()
                    .find(|p| p.matches(layer_type, implementation))
            })
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn is_published<'a>(
        &'a self,
        layer_type: &'a str,
        implementation: &'a str,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let publications = self.publications.read().await;
            Self::find(&publications, layer_type, implementation).is_some()
        })
    }

    fn resolve_pattern<'a>(
        &'a self,
        layer_type: &'a str,
        implementation: &'a str,
    ) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let publications = self.publications.read().await;
            Self::find(&publications, layer_type, implementation).map(|p| p.pattern.clone())
        })
    }

    fn publish<'a>(
        &'a self,
        layer_type: &'a str,
        implementation: &'a str,
        pattern: &'a str,
    ) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(self.upsert(layer_type, implementation, pattern, None))
    }

    fn invoke<'a>(
        &'a self,
        layer_type: &'a str,
        implementation: &'a str,
        operation: &'a str,
        args: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, LayerError>> {
        Box::pin(async move {
            let endpoint = {
                let publications = self.publications.read().await;
                Self::find(&publications, layer_type, implementation)
                    .and_then(|p| p.endpoint.clone())
            };

            let endpoint = endpoint.ok_or_else(|| BridgeError::NotPublished {
                layer_type: layer_type.to_string(),
                implementation: implementation.to_string(),
            })?;
            endpoint.invoke(operation, args).await
        })
    }
}
