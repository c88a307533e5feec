use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::RuntimeConfig;
use crate::dispatcher::{LayerDescriptor, LayerHandle, LayerHandleBuilder};
use crate::distributed::{
    DistributedBridge, DistributedLayer, LoopbackTransport, RemoteEndpoint, Transport,
    TransportFactories,
};
use crate::error::{BridgeError, LayerError};
use crate::layer::BoxFuture;
use crate::permission::{PermissionAuthority, SessionPermissions};
use crate::registry::LayerRegistry;
use crate::session::{Session, StackFrame};
use crate::statistic::StatisticsSnapshot;
use crate::worker::{MonotonicProbe, ResourceProbe, WorkerContext, WorkerId, WorkerRegistry};

/// Everything an invocation needs, constructed once and shared by cheap
/// clones: configuration, the layer registry, worker contexts, the
/// distributed bridge and the permission authority.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    registry: LayerRegistry,
    remote: RwLock<RemoteHandles>,
    workers: WorkerRegistry,
    bridge: DistributedBridge,
    permissions: Arc<dyn PermissionAuthority>,
    system: Arc<Session>,
}

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    factories: TransportFactories,
    transport: Option<Arc<dyn Transport>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    permissions: Option<Arc<dyn PermissionAuthority>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport_factories(mut self, factories: TransportFactories) -> Self {
        self.factories = factories;
        self
    }

    /// Use this transport instance instead of constructing one from
    /// configuration.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionAuthority>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn build(self) -> Runtime {
        let guest = Arc::new(Session::new(self.config.service.guest_session_name.clone()));
        let system = Arc::new(Session::system(
            self.config.service.system_session_name.clone(),
        ));
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(MonotonicProbe::new()));
        let bridge = match self.transport {
            Some(transport) => DistributedBridge::with_transport(transport),
            None => DistributedBridge::from_config(&self.config.distributed, &self.factories),
        };

        tracing::info!(
            guest = %guest.name(),
            system = %system.name(),
            transport = bridge.transport_name().unwrap_or("none"),
            statistics_window = self.config.layers.statistics_window,
            "Runtime initialized"
        );

        Runtime {
            inner: Arc::new(RuntimeInner {
                registry: LayerRegistry::new(),
                remote: RwLock::new(RemoteHandles::new(
                    self.config.distributed.remote_handle_capacity,
                )),
                workers: WorkerRegistry::new(guest, probe),
                bridge,
                permissions: self
                    .permissions
                    .unwrap_or_else(|| Arc::new(SessionPermissions)),
                system,
                config: self.config,
            }),
        }
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            config: RuntimeConfig::default(),
            factories: TransportFactories::with_defaults(),
            transport: None,
            probe: None,
            permissions: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.inner.registry
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.inner.workers
    }

    pub fn bridge(&self) -> &DistributedBridge {
        &self.inner.bridge
    }

    pub fn permissions(&self) -> &dyn PermissionAuthority {
        self.inner.permissions.as_ref()
    }

    pub fn guest_session(&self) -> Arc<Session> {
        Arc::clone(self.inner.workers.guest_session())
    }

    pub fn system_session(&self) -> Arc<Session> {
        Arc::clone(&self.inner.system)
    }

    /// Build and register a layer handle. Statistics window and log tag come
    /// from configuration unless the builder set them.
    pub async fn register(
        &self,
        builder: LayerHandleBuilder,
    ) -> Result<Arc<LayerHandle>, LayerError> {
        let layers = &self.inner.config.layers;
        let handle = Arc::new(
            builder
                .defaults(layers.statistics_window, &layers.log_tag)
                .build(),
        );
        self.inner.registry.register(Arc::clone(&handle)).await?;
        Ok(handle)
    }

    /// Context for a worker identity, created and bound to the guest
    /// session on first use.
    pub async fn context(&self, worker: WorkerId) -> CallContext {
        CallContext::new(self.clone(), self.inner.workers.worker(worker).await)
    }

    /// Context for a freshly allocated worker.
    pub async fn spawn_context(&self) -> CallContext {
        CallContext::new(self.clone(), self.inner.workers.spawn_worker().await)
    }

    /// Bind `worker` to `session` and return its context.
    pub async fn bind_context(&self, worker: WorkerId, session: Arc<Session>) -> CallContext {
        CallContext::new(self.clone(), self.inner.workers.bind(worker, session).await)
    }

    /// Context for a fresh worker bound to the system session.
    pub async fn system_context(&self) -> CallContext {
        let worker = self.inner.workers.spawn_bound(self.system_session()).await;
        CallContext::new(self.clone(), worker)
    }

    /// Resolve a layer: the local registry first, then a published remote
    /// implementation reached through the bridge.
    pub async fn layer(
        &self,
        layer_type: &str,
        implementation: &str,
    ) -> Result<Arc<LayerHandle>, LayerError> {
        if let Some(handle) = self.inner.registry.get(layer_type, implementation).await {
            return Ok(handle);
        }

        if !self
            .inner
            .bridge
            .is_published(layer_type, implementation)
            .await
        {
            return Err(LayerError::NotFound {
                layer_type: layer_type.to_string(),
                implementation: implementation.to_string(),
            });
        }

        let key = (layer_type.to_string(), implementation.to_string());
        if let Some(handle) = self.inner.remote.read().await.get(&key) {
            return Ok(handle);
        }

        let layers = &self.inner.config.layers;
        let mut remote = self.inner.remote.write().await;
        if let Some(handle) = remote.get(&key) {
            return Ok(handle);
        }
        tracing::info!(
            layer = layer_type,
            implementation,
            "Using distributed layer implementation"
        );
        let handle = Arc::new(
            LayerHandle::builder(DistributedLayer::new(
                self.inner.bridge.clone(),
                layer_type,
                implementation,
            ))
            .implementation(implementation)
            .defaults(layers.statistics_window, &layers.log_tag)
            .build(),
        );
        remote.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    pub async fn invoke(
        &self,
        cx: &CallContext,
        layer_type: &str,
        implementation: &str,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<Value, LayerError> {
        let handle = self.layer(layer_type, implementation).await?;
        handle.invoke(cx, operation, args).await
    }

    /// Advertise a layer through the configured transport.
    pub async fn publish(
        &self,
        layer_type: &str,
        implementation: &str,
        pattern: &str,
    ) -> Result<(), LayerError> {
        self.inner
            .bridge
            .publish(layer_type, implementation, pattern)
            .await
    }

    /// Publish a local layer on a loopback transport so other runtimes
    /// sharing it can invoke it. Remote calls run through this runtime's
    /// pipeline on a worker bound to the system session.
    pub async fn export(
        &self,
        transport: &LoopbackTransport,
        layer_type: &str,
        implementation: &str,
        pattern: &str,
    ) -> Result<(), LayerError> {
        let handle = self
            .inner
            .registry
            .get(layer_type, implementation)
            .await
            .ok_or_else(|| LayerError::NotFound {
                layer_type: layer_type.to_string(),
                implementation: implementation.to_string(),
            })?;

        let endpoint = Arc::new(ExportedLayer {
            runtime: Arc::downgrade(&self.inner),
            handle,
        });
        transport
            .serve(layer_type, implementation, pattern, endpoint)
            .await?;
        tracing::info!(layer = layer_type, implementation, pattern, "Layer exported");
        Ok(())
    }

    pub async fn descriptors(&self) -> Vec<LayerDescriptor> {
        self.inner.registry.descriptors().await
    }

    pub async fn statistics(&self) -> Vec<(LayerDescriptor, StatisticsSnapshot)> {
        self.inner.registry.statistics().await
    }
}

type RemoteKey = (String, String);

/// Forwarding handles for remote layers, keyed by (type, implementation).
/// Holds at most `capacity` entries and evicts in insertion order.
struct RemoteHandles {
    capacity: usize,
    handles: HashMap<RemoteKey, Arc<LayerHandle>>,
    order: VecDeque<RemoteKey>,
}

impl RemoteHandles {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            handles: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &RemoteKey) -> Option<Arc<LayerHandle>> {
        self.handles.get(key).cloned()
    }

    fn insert(&mut self, key: RemoteKey, handle: Arc<LayerHandle>) {
        if self.handles.contains_key(&key) {
            return;
        }
        while self.handles.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.handles.remove(&oldest).is_some() {
                tracing::debug!(
                    layer = %oldest.0,
                    implementation = %oldest.1,
                    "Evicted distributed layer handle"
                );
            }
        }
        self.order.push_back(key.clone());
        self.handles.insert(key, handle);
    }

    fn len(&self) -> usize {
        self.handles.len()
    }
}

/// Serves remote invocations of one exported layer.
struct ExportedLayer {
    runtime: Weak<RuntimeInner>,
    handle: Arc<LayerHandle>,
}

impl RemoteEndpoint for ExportedLayer {
    fn invoke<'a>(
        &'a self,
        operation: &'a str,
        args: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, LayerError>> {
        Box::pin(async move {
            let inner = self
                .runtime
                .upgrade()
                .ok_or_else(|| BridgeError::Remote("exporting runtime has shut down".into()))?;
            let runtime = Runtime { inner };

            let cx = runtime.system_context().await;
            let result = self.handle.invoke(&cx, operation, args.to_vec()).await;
            runtime.workers().remove(cx.worker().id()).await;
            result
        })
    }
}

/// The handle threaded through every layer call: which runtime, and which
/// worker (and therefore which session) the call runs on.
#[derive(Clone)]
pub struct CallContext {
    runtime: Runtime,
    worker: Arc<WorkerContext>,
}

impl CallContext {
    pub fn new(runtime: Runtime, worker: Arc<WorkerContext>) -> Self {
        Self { runtime, worker }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn worker(&self) -> &Arc<WorkerContext> {
        &self.worker
    }

    /// The session the worker is driving; a worker with none is bound to
    /// the guest session.
    pub fn session(&self) -> Arc<Session> {
        self.worker.bind_if_unbound(self.runtime.guest_session())
    }

    /// Depth of this worker's layer stack in its current session.
    pub fn stack_depth(&self) -> usize {
        self.session().stack_depth(self.worker.id())
    }

    /// Innermost layer frame this worker is executing, if any.
    pub fn current_frame(&self) -> Option<StackFrame> {
        self.session().current_frame(self.worker.id())
    }

    pub fn stack(&self) -> Vec<StackFrame> {
        self.session().stack(self.worker.id())
    }

    /// Invoke another layer on the same worker.
    pub async fn invoke(
        &self,
        layer_type: &str,
        implementation: &str,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<Value, LayerError> {
        self.runtime
            .invoke(self, layer_type, implementation, operation, args)
            .await
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("worker", &self.worker)
            .finish()
    }
}
