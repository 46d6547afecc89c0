// ── Core error types ──
//
// Errors surfaced to callers of the core. Probe failures have their own
// type and never leave the lifecycle manager: they are translated into
// state transitions and change events instead.

use thiserror::Error;

use crate::model::{GroupId, ServiceId};

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Lookup errors ────────────────────────────────────────────────
    #[error("Service not found: {id}")]
    ServiceNotFound { id: ServiceId },

    #[error("Group not found: {id}")]
    GroupNotFound { id: GroupId },

    // ── Registration errors ──────────────────────────────────────────
    #[error("Service already registered: {id}")]
    DuplicateService { id: ServiceId },

    #[error("Group already registered: {id}")]
    DuplicateGroup { id: GroupId },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Lifecycle manager has shut down")]
    ManagerShutDown,
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ServiceNotFound { .. } | Self::GroupNotFound { .. })
    }
}

/// Outcome of a failed availability probe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// Network unreachable, refused or timed out. Retried with backoff.
    #[error("probe failed: {reason}")]
    Transient { reason: String },

    /// The service is gone upstream. Forces the service to disconnect.
    #[error("service unavailable upstream: {reason}")]
    Fatal { reason: String },

    /// The probe observed its cancellation token.
    #[error("probe cancelled")]
    Cancelled,
}

impl ProbeError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }
}
