use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::AccessDecision;
use crate::error::LayerError;
use crate::runtime::CallContext;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Operations every layer answers through its handle, without a permission
/// check and without reaching the target.
pub const BASE_OPERATIONS: &[&str] = &[
    "implementation_name",
    "is_stateful",
    "is_plugin",
    "aliases",
    "is_overwritable",
];

pub fn is_base_operation(operation: &str) -> bool {
    BASE_OPERATIONS.contains(&operation)
}

/// An operation a layer exposes, with the permission tags a caller's
/// session must hold to invoke it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl OperationDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            permissions: Vec::new(),
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }
}

/// The object an invocation finally runs against.
pub trait LayerTarget: Send + Sync {
    fn call<'a>(
        &'a self,
        cx: &'a CallContext,
        operation: &'a str,
        args: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, LayerError>>;
}

/// A capability implementation wrapped by a
/// [`LayerHandle`](crate::dispatcher::LayerHandle).
///
/// Built-in layers are their own invocation target. `check_access` is the
/// extension point for per-implementation authorization; returning `None`
/// is treated as "access null" and refused.
pub trait Layer: LayerTarget {
    /// Name of the capability interface this layer implements.
    fn type_name(&self) -> &str;

    /// Operation table. Empty means an open operation set: every call
    /// reaches the target and no permission tags apply.
    fn operations(&self) -> Vec<OperationDescriptor> {
        Vec::new()
    }

    fn check_access(&self, _cx: &CallContext) -> Option<AccessDecision> {
        Some(AccessDecision::GRANTED)
    }
}

/// Optional capability: rewrite arguments before the target sees them.
pub trait ArgumentAdapter: Send + Sync {
    fn adapt(&self, operation: &str, args: Vec<Value>) -> Result<Vec<Value>, LayerError>;
}
