//! The desktop-RPC boundary of the negotiator.
//!
//! A [`PortalBus`] sends the four screencast requests and delivers
//! their asynchronous responses, plus the session-closed notification,
//! as [`PortalEvent`]s. Responses are tagged with the handle token of
//! the request they answer.

use std::os::fd::OwnedFd;

use async_trait::async_trait;

use crate::error::PortalError;
use crate::flags::SourceTypes;

// ── Source selection ─────────────────────────────────────────────

/// How the pointer appears in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorMode {
    Hidden = 1,
    #[default]
    Embedded = 2,
    Metadata = 4,
}

impl CursorMode {
    pub const fn bits(self) -> u32 {
        self as u32
    }
}

/// Options for the select-sources request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSelection {
    pub source_types: SourceTypes,
    pub multiple: bool,
    pub cursor_mode: CursorMode,
}

impl Default for SourceSelection {
    fn default() -> Self {
        Self {
            source_types: SourceTypes::MONITOR,
            multiple: false,
            cursor_mode: CursorMode::Embedded,
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────

/// A request to the screencast broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalRequest {
    CreateSession {
        handle_token: String,
        session_token: String,
    },
    SelectSources {
        session: String,
        handle_token: String,
        selection: SourceSelection,
    },
    Start {
        session: String,
        handle_token: String,
    },
    OpenPipeWireRemote {
        session: String,
        handle_token: String,
    },
}

impl PortalRequest {
    /// Token the response to this request will carry.
    pub fn handle_token(&self) -> &str {
        match self {
            Self::CreateSession { handle_token, .. }
            | Self::SelectSources { handle_token, .. }
            | Self::Start { handle_token, .. }
            | Self::OpenPipeWireRemote { handle_token, .. } => handle_token,
        }
    }
}

// ── Responses and events ─────────────────────────────────────────

/// One stream offered by a started session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamProperties {
    pub node_id: u32,
    pub size: Option<(i32, i32)>,
    pub position: Option<(i32, i32)>,
    pub source_type: Option<u32>,
}

impl StreamProperties {
    pub fn new(node_id: u32) -> Self {
        Self {
            node_id,
            size: None,
            position: None,
            source_type: None,
        }
    }
}

/// Result fields a response may carry; which ones are required depends
/// on the request.
#[derive(Debug, Default)]
pub struct ResponseResults {
    pub session_handle: Option<String>,
    pub streams: Option<Vec<StreamProperties>>,
    pub remote: Option<OwnedFd>,
}

/// A broker response. Status 0 is success, 1 user cancellation, 2 other
/// failure.
#[derive(Debug)]
pub struct PortalResponse {
    pub status: u32,
    pub results: ResponseResults,
}

impl PortalResponse {
    pub fn success(results: ResponseResults) -> Self {
        Self { status: 0, results }
    }

    pub fn failure(status: u32) -> Self {
        Self {
            status,
            results: ResponseResults::default(),
        }
    }
}

/// Something the broker told us.
#[derive(Debug)]
pub enum PortalEvent {
    Response {
        token: String,
        response: PortalResponse,
    },
    SessionClosed {
        session: String,
    },
}

// ── PortalBus ────────────────────────────────────────────────────

#[async_trait]
pub trait PortalBus: Send {
    /// Send `request`. Its response arrives later via [`Self::next_event`].
    async fn request(&mut self, request: PortalRequest) -> Result<(), PortalError>;

    /// Wait for the next response or notification.
    async fn next_event(&mut self) -> Result<PortalEvent, PortalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_selection_is_single_monitor_with_cursor() {
        let selection = SourceSelection::default();
        assert_eq!(selection.source_types, SourceTypes::MONITOR);
        assert!(!selection.multiple);
        assert_eq!(selection.cursor_mode.bits(), 2);
    }

    #[test]
    fn request_tokens() {
        let request = PortalRequest::Start {
            session: "/s".into(),
            handle_token: "t1".into(),
        };
        assert_eq!(request.handle_token(), "t1");
    }
}
