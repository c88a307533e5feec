use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::AccessDecision;
use crate::error::LayerError;
use crate::layer::{ArgumentAdapter, Layer, LayerTarget, OperationDescriptor, is_base_operation};
use crate::proxy::{Interception, LayerProxy};
use crate::runtime::CallContext;
use crate::session::{Session, StackFrame};
use crate::statistic::{DEFAULT_WINDOW, LayerStatistics, RollingStatistic, StatisticsSnapshot};
use crate::worker::WorkerId;

pub const DEFAULT_LOG_TAG: &str = "LAYER";

/// Identity of a registered layer implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub type_name: String,
    pub implementation_name: String,
    pub stateful: bool,
    pub plugin: bool,
    pub aliases: BTreeSet<String>,
    pub overwritable: bool,
}

/// The interception point in front of one layer implementation.
///
/// Every call goes through [`LayerHandle::invoke`], which runs the fixed
/// pipeline: cancellation check, access check, stack push, permission
/// check, argument adaptation, proxy hooks around the target call, stack
/// pop, and statistics.
pub struct LayerHandle {
    descriptor: LayerDescriptor,
    shell: Arc<dyn Layer>,
    target: Arc<dyn LayerTarget>,
    operations: HashMap<String, OperationDescriptor>,
    proxy: Option<Arc<dyn LayerProxy>>,
    adapter: Option<Arc<dyn ArgumentAdapter>>,
    statistics: LayerStatistics,
    log_tag: String,
}

impl LayerHandle {
    /// Start building a handle for a layer that is its own target.
    pub fn builder<L>(layer: L) -> LayerHandleBuilder
    where
        L: Layer + 'static,
    {
        let layer = Arc::new(layer);
        let shell: Arc<dyn Layer> = layer.clone();
        let target: Arc<dyn LayerTarget> = layer;
        LayerHandleBuilder::new(shell, target, false)
    }

    /// Start building a handle whose target is supplied separately from the
    /// layer that declares type, operations and access rules.
    pub(crate) fn builder_with_target(
        shell: Arc<dyn Layer>,
        target: Arc<dyn LayerTarget>,
        plugin: bool,
    ) -> LayerHandleBuilder {
        LayerHandleBuilder::new(shell, target, plugin)
    }

    pub fn descriptor(&self) -> &LayerDescriptor {
        &self.descriptor
    }

    pub fn type_name(&self) -> &str {
        &self.descriptor.type_name
    }

    pub fn implementation_name(&self) -> &str {
        &self.descriptor.implementation_name
    }

    pub fn is_stateful(&self) -> bool {
        self.descriptor.stateful
    }

    pub fn is_plugin(&self) -> bool {
        self.descriptor.plugin
    }

    pub fn aliases(&self) -> &BTreeSet<String> {
        &self.descriptor.aliases
    }

    pub fn is_overwritable(&self) -> bool {
        self.descriptor.overwritable
    }

    pub fn operations(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.operations.values()
    }

    pub fn statistics(&self) -> &LayerStatistics {
        &self.statistics
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// Invoke `operation` on this layer.
    ///
    /// Every call, including refused ones, counts as one invocation and
    /// records one execution-time sample. The error statistic only moves
    /// when the body (adapter, hooks or target) fails.
    pub async fn invoke(
        &self,
        cx: &CallContext,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<Value, LayerError> {
        self.statistics.invocations.add(1.0);
        let _timer = ExecutionTimer::start(&self.statistics.execution_time_ms);

        tracing::debug!(
            tag = %self.log_tag,
            layer = %self.descriptor.type_name,
            implementation = %self.descriptor.implementation_name,
            operation,
            worker = %cx.worker().id(),
            "Layer invocation"
        );

        cx.worker().check_cancelled()?;

        if let Err(e) = AccessDecision::verdict(self.shell.check_access(cx)) {
            tracing::warn!(
                tag = %self.log_tag,
                layer = %self.descriptor.type_name,
                operation,
                error = %e,
                "Layer access denied"
            );
            return Err(e);
        }

        let session = cx.session();
        let _frame = StackGuard::push(Arc::clone(&session), cx.worker().id(), self.stack_frame());

        if is_base_operation(operation) {
            return Ok(self.base_operation(operation));
        }

        self.check_permissions(cx, &session, operation)?;

        let outcome = self.run_body(cx, operation, args).await;
        if let Err(e) = &outcome {
            self.statistics.errors.add(1.0);
            tracing::debug!(
                tag = %self.log_tag,
                layer = %self.descriptor.type_name,
                operation,
                error = %e,
                refused = e.is_rejection(),
                "Layer body failed"
            );
        }
        outcome
    }

    fn stack_frame(&self) -> StackFrame {
        StackFrame {
            type_name: self.descriptor.type_name.clone(),
            implementation_name: self.descriptor.implementation_name.clone(),
            is_plugin: self.descriptor.plugin,
            is_stateful: self.descriptor.stateful,
        }
    }

    fn base_operation(&self, operation: &str) -> Value {
        match operation {
            "implementation_name" => Value::from(self.descriptor.implementation_name.clone()),
            "is_stateful" => Value::from(self.descriptor.stateful),
            "is_plugin" => Value::from(self.descriptor.plugin),
            "aliases" => Value::from_iter(self.descriptor.aliases.iter().cloned()),
            "is_overwritable" => Value::from(self.descriptor.overwritable),
            _ => Value::Null,
        }
    }

    fn check_permissions(
        &self,
        cx: &CallContext,
        session: &Session,
        operation: &str,
    ) -> Result<(), LayerError> {
        if self.operations.is_empty() {
            return Ok(());
        }

        let descriptor = self
            .operations
            .get(operation)
            .ok_or_else(|| LayerError::UnknownOperation {
                layer_type: self.descriptor.type_name.clone(),
                operation: operation.to_string(),
            })?;

        let authority = cx.runtime().permissions();
        for permission in &descriptor.permissions {
            if !authority.check(session, &self.descriptor.type_name, permission) {
                tracing::warn!(
                    tag = %self.log_tag,
                    layer = %self.descriptor.type_name,
                    operation,
                    permission = %permission,
                    session = %session.name(),
                    "Permission denied"
                );
                return Err(LayerError::PermissionDenied {
                    layer_type: self.descriptor.type_name.clone(),
                    permission: permission.clone(),
                });
            }
        }
        Ok(())
    }

    async fn run_body(
        &self,
        cx: &CallContext,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<Value, LayerError> {
        let args = match &self.adapter {
            Some(adapter) => adapter.adapt(operation, args)?,
            None => args,
        };

        let interception = match &self.proxy {
            Some(proxy) => proxy.before_invoke(operation, &args).await,
            None => Interception::Proceed,
        };

        let result = match interception {
            Interception::Cached(result) => result,
            Interception::Proceed => self.target.call(cx, operation, &args).await?,
        };

        if let Some(proxy) = &self.proxy {
            proxy.after_invoke(operation, &result, &args).await;
        }
        Ok(result)
    }
}

impl std::fmt::Debug for LayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerHandle")
            .field("descriptor", &self.descriptor)
            .field("operations", &self.operations.len())
            .field("proxy", &self.proxy.is_some())
            .field("adapter", &self.adapter.is_some())
            .finish()
    }
}

/// Pops the pushed frame on every exit path, including a dropped future.
/// The pop targets the pushing worker's stack only.
struct StackGuard {
    session: Arc<Session>,
    worker: WorkerId,
}

impl StackGuard {
    fn push(session: Arc<Session>, worker: WorkerId, frame: StackFrame) -> Self {
        session.push_frame(worker, frame);
        Self { session, worker }
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        self.session.pop_frame(self.worker);
    }
}

/// Records elapsed wall time in milliseconds when dropped.
struct ExecutionTimer<'a> {
    statistic: &'a RollingStatistic,
    started: Instant,
}

impl<'a> ExecutionTimer<'a> {
    fn start(statistic: &'a RollingStatistic) -> Self {
        Self {
            statistic,
            started: Instant::now(),
        }
    }
}

impl Drop for ExecutionTimer<'_> {
    fn drop(&mut self) {
        self.statistic
            .add(self.started.elapsed().as_secs_f64() * 1000.0);
    }
}

pub struct LayerHandleBuilder {
    shell: Arc<dyn Layer>,
    target: Arc<dyn LayerTarget>,
    plugin: bool,
    implementation_name: String,
    stateful: bool,
    aliases: BTreeSet<String>,
    overwritable: bool,
    proxy: Option<Arc<dyn LayerProxy>>,
    adapter: Option<Arc<dyn ArgumentAdapter>>,
    window: Option<usize>,
    log_tag: Option<String>,
}

impl LayerHandleBuilder {
    fn new(shell: Arc<dyn Layer>, target: Arc<dyn LayerTarget>, plugin: bool) -> Self {
        Self {
            shell,
            target,
            plugin,
            implementation_name: String::new(),
            stateful: true,
            aliases: BTreeSet::new(),
            overwritable: true,
            proxy: None,
            adapter: None,
            window: None,
            log_tag: None,
        }
    }

    pub fn implementation(mut self, name: impl Into<String>) -> Self {
        self.implementation_name = name.into();
        self
    }

    pub fn stateful(mut self, stateful: bool) -> Self {
        self.stateful = stateful;
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.insert(alias.into());
        self
    }

    pub fn overwritable(mut self, overwritable: bool) -> Self {
        self.overwritable = overwritable;
        self
    }

    pub fn proxy(mut self, proxy: Arc<dyn LayerProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Declare the layer adaptable: `adapter` rewrites arguments before
    /// every target call.
    pub fn adapter(mut self, adapter: Arc<dyn ArgumentAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn statistics_window(mut self, window: usize) -> Self {
        self.window = Some(window);
        self
    }

    pub fn log_tag(mut self, tag: impl Into<String>) -> Self {
        self.log_tag = Some(tag.into());
        self
    }

    pub(crate) fn defaults(mut self, window: usize, log_tag: &str) -> Self {
        self.window.get_or_insert(window);
        self.log_tag.get_or_insert_with(|| log_tag.to_string());
        self
    }

    pub fn build(self) -> LayerHandle {
        let operations = self
            .shell
            .operations()
            .into_iter()
            .map(|op| (op.name.clone(), op))
            .collect();

        LayerHandle {
            descriptor: LayerDescriptor {
                type_name: self.shell.type_name().to_string(),
                implementation_name: self.implementation_name,
                stateful: self.stateful,
                plugin: self.plugin,
                aliases: self.aliases,
                overwritable: self.overwritable,
            },
            shell: self.shell,
            target: self.target,
            operations,
            proxy: self.proxy,
            adapter: self.adapter,
            statistics: LayerStatistics::new(self.window.unwrap_or(DEFAULT_WINDOW)),
            log_tag: self.log_tag.unwrap_or_else(|| DEFAULT_LOG_TAG.to_string()),
        }
    }
}
