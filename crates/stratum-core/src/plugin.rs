use std::sync::Arc;

use serde_json::Value;

use crate::access::AccessDecision;
use crate::dispatcher::{LayerHandle, LayerHandleBuilder};
use crate::error::LayerError;
use crate::layer::{BoxFuture, Layer, LayerTarget, OperationDescriptor};
use crate::runtime::CallContext;

type AccessRule = Arc<dyn Fn(&CallContext) -> Option<AccessDecision> + Send + Sync>;

/// Wraps an externally loaded implementation so it runs through the same
/// dispatcher pipeline as built-in layers.
///
/// The plugin object is the invocation target; this shell only declares the
/// capability type, the operation table and an optional access rule. Stack
/// frames pushed for plugin calls are flagged as plugin origin.
pub struct PluginLayer {
    type_name: String,
    operations: Vec<OperationDescriptor>,
    access: Option<AccessRule>,
    target: Arc<dyn LayerTarget>,
}

impl PluginLayer {
    pub fn new(type_name: impl Into<String>, target: Arc<dyn LayerTarget>) -> Self {
        Self {
            type_name: type_name.into(),
            operations: Vec::new(),
            access: None,
            target,
        }
    }

    pub fn with_operations(mut self, operations: Vec<OperationDescriptor>) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_access<F>(mut self, rule: F) -> Self
    where
        F: Fn(&CallContext) -> Option<AccessDecision> + Send + Sync + 'static,
    {
        self.access = Some(Arc::new(rule));
        self
    }

    pub fn target(&self) -> &Arc<dyn LayerTarget> {
        &self.target
    }
}

impl LayerTarget for PluginLayer {
    fn call<'a>(
        &'a self,
        cx: &'a CallContext,
        operation: &'a str,
        args: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, LayerError>> {
        self.target.call(cx, operation, args)
    }
}

impl Layer for PluginLayer {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn operations(&self) -> Vec<OperationDescriptor> {
        self.operations.clone()
    }

    fn check_access(&self, cx: &CallContext) -> Option<AccessDecision> {
        match &self.access {
            Some(rule) => rule(cx),
            None => Some(AccessDecision::GRANTED),
        }
    }
}

impl LayerHandle {
    /// Start building a handle around a plugin.
    pub fn plugin(plugin: PluginLayer) -> LayerHandleBuilder {
        let target = Arc::clone(&plugin.target);
        LayerHandle::builder_with_target(Arc::new(plugin), target, true)
    }
}
