//! # portal: screencast session negotiation
//!
//! The negotiator drives the four-step broker handshake
//! (`CreateSession` → `SelectSources` → `Start` → `OpenPipeWireRemote`)
//! over any [`PortalBus`]. The D-Bus implementation lives in `dbus`
//! behind feature `desktop`.

pub mod bus;
pub mod negotiator;
pub mod session;
pub mod token;

#[cfg(feature = "desktop")]
pub mod dbus;

// ── Re-exports ───────────────────────────────────────────────────

pub use bus::{
    CursorMode, PortalBus, PortalEvent, PortalRequest, PortalResponse, ResponseResults,
    SourceSelection, StreamProperties,
};
pub use negotiator::{LiveSession, Negotiator, monitor_session};
pub use session::{HandshakeStep, Session, SessionLiveness, SessionPhase};
pub use token::TokenGenerator;
