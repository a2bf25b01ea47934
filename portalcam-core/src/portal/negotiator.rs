//! Screencast handshake driver.
//!
//! [`Negotiator`] is a plain state-machine value: it emits the next
//! request and consumes broker events, without doing any I/O itself.
//! [`Negotiator::run`] drives it over a [`PortalBus`] until the session
//! is ready, fails, or shutdown is requested.
//!
//! ```text
//!  CreateSession ─► SelectSources ─► Start ─► OpenPipeWireRemote ─► LiveSession
//! ```
//!
//! Each request gets a fresh handle token. Responses carrying any other
//! token are ignored. A non-zero status fails the handshake; nothing is
//! retried.

use std::os::fd::OwnedFd;

use tracing::{debug, error, info, warn};

use crate::error::PortalError;
use crate::portal::bus::{
    PortalBus, PortalEvent, PortalRequest, PortalResponse, SourceSelection, StreamProperties,
};
use crate::portal::session::{HandshakeStep, Session, SessionLiveness, SessionPhase};
use crate::portal::token::TokenGenerator;
use crate::shutdown::{Shutdown, ShutdownReason};

/// A session that completed the handshake.
#[derive(Debug)]
pub struct LiveSession {
    pub session_handle: String,
    /// Node of the first offered stream.
    pub node_id: u32,
    pub streams: Vec<StreamProperties>,
    /// Connection to the stream transport.
    pub remote: OwnedFd,
    pub liveness: SessionLiveness,
}

/// What the caller should do after feeding an event.
#[derive(Debug)]
pub enum Step {
    /// Send this request next.
    Send(PortalRequest),
    /// The handshake is complete.
    Ready(LiveSession),
    /// The event did not concern us.
    Ignored,
}

#[derive(Debug)]
struct PendingRequest {
    token: String,
    step: HandshakeStep,
}

// ── Negotiator ───────────────────────────────────────────────────

#[derive(Debug)]
pub struct Negotiator {
    phase: SessionPhase,
    pending: Option<PendingRequest>,
    session: Session,
    selection: SourceSelection,
    tokens: TokenGenerator,
    streams: Vec<StreamProperties>,
}

impl Negotiator {
    pub fn new(selection: SourceSelection, liveness: SessionLiveness) -> Self {
        Self {
            phase: SessionPhase::Idle,
            pending: None,
            session: Session::new(liveness),
            selection,
            tokens: TokenGenerator,
            streams: Vec::new(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Start the handshake: `Idle` → `Creating`.
    pub fn begin(&mut self) -> Result<PortalRequest, PortalError> {
        if self.phase != SessionPhase::Idle {
            return Err(PortalError::InvalidTransition(
                "cannot begin: handshake already started",
            ));
        }
        self.phase.advance()?;
        let request = PortalRequest::CreateSession {
            handle_token: self.tokens.next(),
            session_token: self.tokens.next(),
        };
        Ok(self.track(request, HandshakeStep::CreateSession))
    }

    /// Feed one broker event.
    pub fn handle_event(&mut self, event: PortalEvent) -> Result<Step, PortalError> {
        match event {
            PortalEvent::SessionClosed { session } => self.on_closed(&session),
            PortalEvent::Response { token, response } => self.on_response(&token, response),
        }
    }

    fn on_closed(&mut self, session: &str) -> Result<Step, PortalError> {
        if self.session.handle.as_deref() != Some(session) || self.phase.is_terminal() {
            debug!(session, "ignoring close of unknown session");
            return Ok(Step::Ignored);
        }
        info!(phase = %self.phase, "session closed by the broker");
        self.phase.close()?;
        self.pending = None;
        self.session.pending_token = None;
        self.session.liveness.set_active(false);
        Err(PortalError::SessionClosed)
    }

    fn on_response(&mut self, token: &str, response: PortalResponse) -> Result<Step, PortalError> {
        let step = match &self.pending {
            Some(pending) if pending.token == token => pending.step,
            _ => {
                debug!(token, "ignoring response to an unknown request");
                return Ok(Step::Ignored);
            }
        };
        self.pending = None;
        self.session.pending_token = None;

        if response.status != 0 {
            warn!(%step, status = response.status, "portal request was denied");
            return Err(self.fail(PortalError::RequestFailed {
                step,
                status: response.status,
            }));
        }

        let mut results = response.results;
        match step {
            HandshakeStep::CreateSession => {
                let Some(handle) = results.session_handle.take() else {
                    return Err(self.missing(step, "session_handle"));
                };
                info!(session = %handle, "session created");
                self.session.handle = Some(handle.clone());
                self.phase.advance()?;
                let request = PortalRequest::SelectSources {
                    session: handle,
                    handle_token: self.tokens.next(),
                    selection: self.selection,
                };
                Ok(Step::Send(self.track(request, HandshakeStep::SelectSources)))
            }
            HandshakeStep::SelectSources => {
                debug!("sources selected");
                self.phase.advance()?;
                let request = PortalRequest::Start {
                    session: self.handle()?,
                    handle_token: self.tokens.next(),
                };
                Ok(Step::Send(self.track(request, HandshakeStep::Start)))
            }
            HandshakeStep::Start => {
                let streams = results.streams.take().unwrap_or_default();
                let Some(first) = streams.first() else {
                    return Err(self.missing(step, "streams"));
                };
                info!(node_id = first.node_id, size = ?first.size, count = streams.len(), "screencast started");
                self.session.node_id = Some(first.node_id);
                self.session.liveness.set_active(true);
                self.streams = streams;
                self.phase.advance()?;
                let request = PortalRequest::OpenPipeWireRemote {
                    session: self.handle()?,
                    handle_token: self.tokens.next(),
                };
                Ok(Step::Send(self.track(request, HandshakeStep::OpenPipeWireRemote)))
            }
            HandshakeStep::OpenPipeWireRemote => {
                let Some(remote) = results.remote.take() else {
                    return Err(self.missing(step, "remote"));
                };
                let (Some(node_id), Ok(session_handle)) = (self.session.node_id, self.handle()) else {
                    return Err(self.fail(PortalError::InvalidTransition(
                        "transport opened before a stream was started",
                    )));
                };
                self.phase.advance()?;
                info!(node_id, "screencast session ready");
                Ok(Step::Ready(LiveSession {
                    session_handle,
                    node_id,
                    streams: std::mem::take(&mut self.streams),
                    remote,
                    liveness: self.session.liveness.clone(),
                }))
            }
        }
    }

    /// Drive the handshake over `bus` until ready, failed or cancelled.
    ///
    /// Any failure other than cancellation also requests shutdown.
    pub async fn run<B: PortalBus + ?Sized>(
        &mut self,
        bus: &mut B,
        shutdown: &Shutdown,
    ) -> Result<LiveSession, PortalError> {
        let result = self.drive(bus, shutdown).await;
        match &result {
            Ok(_) => {}
            Err(PortalError::Cancelled) => {
                if !self.phase.is_terminal() {
                    self.phase.fail();
                }
            }
            Err(PortalError::SessionClosed) => shutdown.request(ShutdownReason::SessionClosed),
            Err(_) => {
                if !self.phase.is_terminal() {
                    self.phase.fail();
                }
                shutdown.request(ShutdownReason::HandshakeFailed);
            }
        }
        result
    }

    async fn drive<B: PortalBus + ?Sized>(
        &mut self,
        bus: &mut B,
        shutdown: &Shutdown,
    ) -> Result<LiveSession, PortalError> {
        let mut request = self.begin()?;
        loop {
            debug!(phase = %self.phase, token = request.handle_token(), "sending portal request");
            bus.request(request).await?;

            request = loop {
                let event = tokio::select! {
                    biased;
                    _ = shutdown.requested() => return Err(PortalError::Cancelled),
                    event = bus.next_event() => event?,
                };
                match self.handle_event(event)? {
                    Step::Send(next) => break next,
                    Step::Ready(live) => return Ok(live),
                    Step::Ignored => continue,
                }
            };
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    fn track(&mut self, request: PortalRequest, step: HandshakeStep) -> PortalRequest {
        let token = request.handle_token().to_string();
        self.session.pending_token = Some(token.clone());
        self.pending = Some(PendingRequest { token, step });
        request
    }

    fn handle(&self) -> Result<String, PortalError> {
        self.session
            .handle
            .clone()
            .ok_or(PortalError::InvalidTransition("no session handle"))
    }

    fn missing(&mut self, step: HandshakeStep, field: &'static str) -> PortalError {
        self.fail(PortalError::MissingField { step, field })
    }

    fn fail(&mut self, error: PortalError) -> PortalError {
        self.phase.fail();
        self.session.liveness.set_active(false);
        error
    }
}

// ── Session monitor ──────────────────────────────────────────────

/// Watch `bus` after the handshake and stop everything when the broker
/// closes `session`.
pub async fn monitor_session<B: PortalBus + ?Sized>(
    bus: &mut B,
    session: &str,
    liveness: SessionLiveness,
    shutdown: Shutdown,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.requested() => return,
            event = bus.next_event() => event,
        };
        match event {
            Ok(PortalEvent::SessionClosed { session: closed }) if closed == session => {
                info!(session, "screencast session closed");
                liveness.set_active(false);
                shutdown.request(ShutdownReason::SessionClosed);
                return;
            }
            Ok(other) => debug!(?other, "ignoring portal event"),
            Err(e) => {
                // No close notification can arrive after this.
                error!("lost the portal bus, session close detection is off: {e}");
                liveness.set_active(false);
                return;
            }
        }
    }
}
