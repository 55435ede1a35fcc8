//! Error types for promise rejections and the fallible utility APIs.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Reason a [`SyncPromise`](crate::SyncPromise) was rejected.
///
/// Cheap to clone: every reaction attached to a rejected promise receives its
/// own copy. User errors can be propagated with the `?` operator, which converts
/// any `Into<anyhow::Error>` type into [`PromiseError::UserError`].
#[derive(Debug, Clone)]
pub enum PromiseError {
    /// The computation is part of, or downstream of, a reference cycle.
    ///
    /// It was never evaluated.
    Cyclic {
        /// Identifiers involved in or downstream of the cycle.
        ids: Vec<String>,
    },

    /// A program names a tool that is not registered.
    UnknownTool {
        /// The tool name found in the program.
        name: String,
    },

    /// A computation referenced an identifier that has no binding.
    UnboundVar {
        /// The missing identifier.
        id: String,
    },

    /// The computation panicked and the panic was caught at a promise boundary.
    Panicked {
        /// The panic payload, if it was a string.
        message: String,
    },

    /// Every alternative passed to [`SyncPromise::any`](crate::SyncPromise::any)
    /// rejected.
    AllRejected {
        /// Rejection reasons, in input order.
        reasons: Vec<PromiseError>,
    },

    /// User-defined error.
    UserError(Arc<anyhow::Error>),
}

impl fmt::Display for PromiseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromiseError::Cyclic { ids } => {
                write!(f, "cyclic dependency among: {}", ids.join(", "))
            }
            PromiseError::UnknownTool { name } => write!(f, "unknown tool: {}", name),
            PromiseError::UnboundVar { id } => write!(f, "unbound variable: {}", id),
            PromiseError::Panicked { message } => write!(f, "computation panicked: {}", message),
            PromiseError::AllRejected { reasons } => {
                write!(f, "all {} alternatives rejected", reasons.len())
            }
            PromiseError::UserError(e) => write!(f, "user error: {}", e),
        }
    }
}

// User errors compare by identity; anyhow errors have no structural equality.
impl PartialEq for PromiseError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PromiseError::Cyclic { ids: a }, PromiseError::Cyclic { ids: b }) => a == b,
            (PromiseError::UnknownTool { name: a }, PromiseError::UnknownTool { name: b }) => a == b,
            (PromiseError::UnboundVar { id: a }, PromiseError::UnboundVar { id: b }) => a == b,
            (PromiseError::Panicked { message: a }, PromiseError::Panicked { message: b }) => {
                a == b
            }
            (PromiseError::AllRejected { reasons: a }, PromiseError::AllRejected { reasons: b }) => {
                a == b
            }
            (PromiseError::UserError(a), PromiseError::UserError(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for PromiseError {
    fn from(err: T) -> Self {
        PromiseError::UserError(Arc::new(err.into()))
    }
}

impl PromiseError {
    /// Build a `Panicked` error from a payload returned by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        PromiseError::Panicked { message }
    }

    /// Returns `true` for [`PromiseError::Cyclic`].
    pub fn is_cyclic(&self) -> bool {
        matches!(self, PromiseError::Cyclic { .. })
    }

    /// Returns a reference to the inner user error if this is a `UserError` variant.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            PromiseError::UserError(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }
}

/// Error returned by [`toposort`](crate::toposort::toposort).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToposortError {
    /// An edge mentions a node that was not listed.
    #[error("unknown node in edges: {node}")]
    UnknownNode {
        /// The offending node.
        node: String,
    },
}

/// Error returned when a program's configuration cannot be read.
#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    /// The configuration does not match the shape the tool expects.
    #[error("invalid program for tool `{tool}`: {source}")]
    Invalid {
        /// Tool name of the program.
        tool: String,
        /// Underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },
}
