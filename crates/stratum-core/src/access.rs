use std::fmt;

use crate::error::{LayerError, SharedError};

/// Outcome of a layer's access check.
///
/// A decision that is not granted may carry an explanatory message, the
/// error that caused the refusal, or both.
#[derive(Clone)]
pub struct AccessDecision {
    granted: bool,
    message: Option<String>,
    cause: Option<SharedError>,
}

impl AccessDecision {
    pub const GRANTED: AccessDecision = AccessDecision {
        granted: true,
        message: None,
        cause: None,
    };

    pub fn new(granted: bool, message: Option<String>, cause: Option<SharedError>) -> Self {
        Self {
            granted,
            message,
            cause,
        }
    }

    pub fn granted() -> Self {
        Self::GRANTED
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(false, Some(message.into()), None)
    }

    pub fn denied_with(message: impl Into<String>, cause: SharedError) -> Self {
        Self::new(false, Some(message.into()), Some(cause))
    }

    pub fn denied_by(cause: SharedError) -> Self {
        Self::new(false, None, Some(cause))
    }

    pub fn is_granted(&self) -> bool {
        self.granted
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn cause(&self) -> Option<&SharedError> {
        self.cause.as_ref()
    }

    /// Turn a (possibly absent) decision into the dispatcher's verdict.
    ///
    /// Refusals map to [`LayerError::AccessDenied`] in this order: message
    /// and cause, message only, cause only ("Empty message"), neither
    /// ("Access denied"). An absent decision is "Access null".
    pub fn verdict(decision: Option<AccessDecision>) -> Result<(), LayerError> {
        let Some(decision) = decision else {
            return Err(LayerError::AccessDenied {
                message: "Access null".into(),
                cause: None,
            });
        };

        if decision.granted {
            return Ok(());
        }

        let err = match (decision.message, decision.cause) {
            (Some(message), Some(cause)) => LayerError::AccessDenied {
                message,
                cause: Some(cause),
            },
            (Some(message), None) => LayerError::AccessDenied {
                message,
                cause: None,
            },
            (None, Some(cause)) => LayerError::AccessDenied {
                message: "Empty message".into(),
                cause: Some(cause),
            },
            (None, None) => LayerError::AccessDenied {
                message: "Access denied".into(),
                cause: None,
            },
        };
        Err(err)
    }
}

impl Default for AccessDecision {
    fn default() -> Self {
        Self::GRANTED
    }
}

impl fmt::Debug for AccessDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessDecision")
            .field("granted", &self.granted)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}
