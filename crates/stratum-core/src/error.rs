use std::sync::Arc;

use thiserror::Error;

/// Opaque error raised by a layer body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shareable error, used where the same cause may be reported more than once
/// (an [`AccessDecision`](crate::access::AccessDecision) is cloneable).
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("{message}")]
    AccessDenied {
        message: String,
        #[source]
        cause: Option<SharedError>,
    },

    #[error("permission '{permission}' denied for layer {layer_type}")]
    PermissionDenied {
        layer_type: String,
        permission: String,
    },

    #[error("Service worker interrupted")]
    Cancelled,

    #[error("Network transport implementation not found")]
    TransportUnavailable,

    #[error("operation '{operation}' is not declared by layer {layer_type}")]
    UnknownOperation {
        layer_type: String,
        operation: String,
    },

    #[error("layer not found: {layer_type} ({implementation})")]
    NotFound {
        layer_type: String,
        implementation: String,
    },

    #[error("layer {layer_type} ({implementation}) already registered and not overwritable")]
    NotOverwritable {
        layer_type: String,
        implementation: String,
    },

    #[error("invalid arguments for '{operation}': {reason}")]
    InvalidArguments { operation: String, reason: String },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Target(BoxError),
}

impl LayerError {
    /// Wrap an error raised by a layer body.
    pub fn target<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        LayerError::Target(Box::new(err))
    }

    /// The error raised by the layer body, if this is a target failure.
    pub fn target_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            LayerError::Target(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    /// True for the failures the dispatcher raises before the body runs.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LayerError::AccessDenied { .. }
                | LayerError::PermissionDenied { .. }
                | LayerError::Cancelled
                | LayerError::UnknownOperation { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("worker {0} has never been bound to a session")]
    NotBound(u64),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("transport construction failed: {0}")]
    Construction(String),

    #[error("no remote endpoint for {layer_type} ({implementation})")]
    NotPublished {
        layer_type: String,
        implementation: String,
    },

    #[error("invalid publish pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("remote invocation failed: {0}")]
    Remote(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
