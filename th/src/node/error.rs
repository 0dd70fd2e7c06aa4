//! Client call errors

use std::time::Duration;

use thiserror::Error;

use crate::hub::{CallFailure, FailureKind};

/// Why a routed call did not produce a value
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// No response within the client-side timeout
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The hub or the owner answered with a failure
    #[error("Call failed ({kind:?}): {message}")]
    Remote { kind: FailureKind, message: String },

    /// The hub went away before the call finished
    #[error("Hub channel closed")]
    HubClosed,

    /// The hub did not greet this context as expected
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

impl CallError {
    /// True for both client-side and hub-side timeouts
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CallError::Timeout(_)
                | CallError::Remote {
                    kind: FailureKind::Timeout,
                    ..
                }
        )
    }

    /// The failure kind, mapping local conditions onto the wire kinds
    pub fn kind(&self) -> FailureKind {
        match self {
            CallError::Timeout(_) => FailureKind::Timeout,
            CallError::Remote { kind, .. } => *kind,
            CallError::HubClosed => FailureKind::OwnerLost,
            CallError::Handshake(_) => FailureKind::Rejected,
        }
    }
}

impl From<CallFailure> for CallError {
    fn from(failure: CallFailure) -> Self {
        CallError::Remote {
            kind: failure.kind,
            message: failure.message,
        }
    }
}
