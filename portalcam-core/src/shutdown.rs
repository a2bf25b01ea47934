//! Cooperative shutdown signal.
//!
//! A `Shutdown` is a cancellation token plus the reason the first
//! requester gave. Signal handlers, the session monitor and the frame
//! pipeline all hold clones; loops poll it at iteration boundaries.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Why the process is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Interrupt or termination signal.
    Interrupted,
    /// The broker closed the screencast session.
    SessionClosed,
    /// The output device kept rejecting frames.
    SinkFailed,
    /// The portal handshake failed.
    HandshakeFailed,
    /// The stream transport failed irrecoverably.
    StreamFailed,
}

impl ShutdownReason {
    /// Whether this reason maps to a successful exit.
    pub const fn is_clean(self) -> bool {
        matches!(self, Self::Interrupted | Self::SessionClosed)
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupted => write!(f, "interrupted"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::SinkFailed => write!(f, "output device failed"),
            Self::HandshakeFailed => write!(f, "portal handshake failed"),
            Self::StreamFailed => write!(f, "stream failed"),
        }
    }
}

/// Cloneable shutdown handle. The first recorded reason wins.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Later reasons are ignored.
    pub fn request(&self, reason: ShutdownReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&self) {
        self.token.cancelled().await
    }
}
