//! Screencast session state machine.
//!
//! ```text
//!  Idle ─► Creating ─► SourceSelecting ─► Starting ─► OpeningTransport ─► Ready
//!             │              │                │               │              │
//!             ├──────────────┴────────────────┴───────────────┴──────────────┤
//!             ▼                                                              ▼
//!          Failed (non-zero status / bad payload)               Closed (broker closed)
//! ```
//!
//! `Closed` and `Failed` are terminal.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::PortalError;

// ── HandshakeStep ────────────────────────────────────────────────

/// The four broker requests, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStep {
    CreateSession,
    SelectSources,
    Start,
    OpenPipeWireRemote,
}

impl std::fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateSession => write!(f, "CreateSession"),
            Self::SelectSources => write!(f, "SelectSources"),
            Self::Start => write!(f, "Start"),
            Self::OpenPipeWireRemote => write!(f, "OpenPipeWireRemote"),
        }
    }
}

// ── SessionPhase ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Creating,
    SourceSelecting,
    Starting,
    OpeningTransport,
    Ready,
    Closed,
    Failed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Creating => write!(f, "Creating"),
            Self::SourceSelecting => write!(f, "SourceSelecting"),
            Self::Starting => write!(f, "Starting"),
            Self::OpeningTransport => write!(f, "OpeningTransport"),
            Self::Ready => write!(f, "Ready"),
            Self::Closed => write!(f, "Closed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// The request whose response this phase is waiting for.
    pub fn awaiting(&self) -> Option<HandshakeStep> {
        match self {
            Self::Creating => Some(HandshakeStep::CreateSession),
            Self::SourceSelecting => Some(HandshakeStep::SelectSources),
            Self::Starting => Some(HandshakeStep::Start),
            Self::OpeningTransport => Some(HandshakeStep::OpenPipeWireRemote),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Move to the phase that follows a successful response.
    ///
    /// Valid from: `Idle` and the four waiting phases.
    pub fn advance(&mut self) -> Result<(), PortalError> {
        let next = match self {
            Self::Idle => Self::Creating,
            Self::Creating => Self::SourceSelecting,
            Self::SourceSelecting => Self::Starting,
            Self::Starting => Self::OpeningTransport,
            Self::OpeningTransport => Self::Ready,
            Self::Ready | Self::Closed | Self::Failed => {
                return Err(PortalError::InvalidTransition(
                    "cannot advance: handshake already finished",
                ));
            }
        };
        *self = next;
        Ok(())
    }

    /// Transition to `Closed`.
    ///
    /// Valid from any phase after `Idle` that is not terminal.
    pub fn close(&mut self) -> Result<(), PortalError> {
        match self {
            Self::Idle => Err(PortalError::InvalidTransition(
                "cannot close: no session was created",
            )),
            Self::Closed | Self::Failed => Err(PortalError::InvalidTransition(
                "cannot close: session already ended",
            )),
            _ => {
                *self = Self::Closed;
                Ok(())
            }
        }
    }

    /// Force the terminal `Failed` phase regardless of current state.
    pub fn fail(&mut self) {
        *self = Self::Failed;
    }
}

// ── SessionLiveness ──────────────────────────────────────────────

/// Shared "is the broker session still alive" flag.
#[derive(Debug, Clone, Default)]
pub struct SessionLiveness(Arc<AtomicBool>);

impl SessionLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self, active: bool) {
        self.0.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Session ──────────────────────────────────────────────────────

/// One broker screencast session.
#[derive(Debug, Default)]
pub struct Session {
    /// Object path of the session, known after `CreateSession`.
    pub handle: Option<String>,
    /// Token of the request currently awaiting a response.
    pub pending_token: Option<String>,
    /// Stream node chosen by the user.
    pub node_id: Option<u32>,
    /// Transport connection returned by `OpenPipeWireRemote`.
    pub remote: Option<OwnedFd>,
    pub liveness: SessionLiveness,
}

impl Session {
    pub fn new(liveness: SessionLiveness) -> Self {
        Self {
            liveness,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.liveness.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut phase = SessionPhase::default();
        assert_eq!(phase, SessionPhase::Idle);
        let expected = [
            SessionPhase::Creating,
            SessionPhase::SourceSelecting,
            SessionPhase::Starting,
            SessionPhase::OpeningTransport,
            SessionPhase::Ready,
        ];
        for next in expected {
            phase.advance().unwrap();
            assert_eq!(phase, next);
        }
        assert!(phase.advance().is_err());
    }

    #[test]
    fn awaiting_steps() {
        assert_eq!(SessionPhase::Idle.awaiting(), None);
        assert_eq!(SessionPhase::Creating.awaiting(), Some(HandshakeStep::CreateSession));
        assert_eq!(
            SessionPhase::OpeningTransport.awaiting(),
            Some(HandshakeStep::OpenPipeWireRemote)
        );
        assert_eq!(SessionPhase::Ready.awaiting(), None);
    }

    #[test]
    fn close_from_any_live_phase() {
        for start in [
            SessionPhase::Creating,
            SessionPhase::SourceSelecting,
            SessionPhase::Starting,
            SessionPhase::OpeningTransport,
            SessionPhase::Ready,
        ] {
            let mut phase = start;
            phase.close().unwrap();
            assert_eq!(phase, SessionPhase::Closed);
        }
    }

    #[test]
    fn terminal_phases_stay_terminal() {
        let mut phase = SessionPhase::Closed;
        assert!(phase.close().is_err());
        assert!(phase.advance().is_err());

        let mut phase = SessionPhase::Failed;
        assert!(phase.is_terminal());
        assert!(phase.close().is_err());

        let mut phase = SessionPhase::Idle;
        assert!(phase.close().is_err());
    }

    #[test]
    fn fail_from_any_state() {
        let mut phase = SessionPhase::Starting;
        phase.fail();
        assert_eq!(phase, SessionPhase::Failed);
    }

    #[test]
    fn liveness_is_shared() {
        let liveness = SessionLiveness::new();
        let session = Session::new(liveness.clone());
        assert!(!session.is_active());
        liveness.set_active(true);
        assert!(session.is_active());
    }

    #[test]
    fn display_format() {
        assert_eq!(SessionPhase::OpeningTransport.to_string(), "OpeningTransport");
        assert_eq!(HandshakeStep::Start.to_string(), "Start");
    }
}
