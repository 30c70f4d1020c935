//! Event system for UI decoupling.
//!
//! The session reports update progress through an observer so the CLI (or
//! any other front end) can render it without the protocol layer knowing
//! how.

use std::fmt;

/// Phases of a firmware update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    /// Retrieving and validating client capabilities.
    Discovery,
    /// Streaming image chunks.
    Transfer,
    /// Image state verification and transfer end.
    Finalize,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Discovery => write!(f, "Discovery"),
            UpdatePhase::Transfer => write!(f, "Transfer"),
            UpdatePhase::Finalize => write!(f, "Finalize"),
        }
    }
}

/// Events emitted during a session.
#[derive(Debug, Clone)]
pub enum MdfuEvent {
    /// The update entered a new phase.
    Phase { phase: UpdatePhase },
    /// Image bytes transferred so far.
    Progress { sent: u64 },
    /// The update finished successfully.
    Complete,
}

/// Observer trait for receiving session events.
pub trait MdfuObserver: Send + Sync {
    fn on_event(&self, event: &MdfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl MdfuObserver for NullObserver {
    fn on_event(&self, _event: &MdfuEvent) {}
}

/// Observer that logs events through tracing.
pub struct TracingObserver;

impl MdfuObserver for TracingObserver {
    fn on_event(&self, event: &MdfuEvent) {
        match event {
            MdfuEvent::Phase { phase } => tracing::info!(phase = %phase, "update phase"),
            MdfuEvent::Progress { sent } => tracing::debug!(sent, "image bytes transferred"),
            MdfuEvent::Complete => tracing::info!("update complete"),
        }
    }
}
