//! xdg-desktop-portal adapter over the D-Bus session bus.
//!
//! Each request subscribes to `org.freedesktop.portal.Request.Response`
//! on the object path derived from its handle token *before* the method
//! call, so a fast reply cannot be missed. `OpenPipeWireRemote` answers
//! synchronously; its reply is queued as a response event so the
//! negotiator sees a uniform stream.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;
use zbus::zvariant::{self, OwnedValue, Value};
use zbus::{Connection, Proxy};

use crate::error::PortalError;
use crate::portal::bus::{
    PortalBus, PortalEvent, PortalRequest, PortalResponse, ResponseResults, StreamProperties,
};
use crate::portal::token::{request_path, session_path};

const PORTAL_BUS_NAME: &str = "org.freedesktop.portal.Desktop";
const PORTAL_OBJECT_PATH: &str = "/org/freedesktop/portal/desktop";
const SCREENCAST_INTERFACE: &str = "org.freedesktop.portal.ScreenCast";
const REQUEST_INTERFACE: &str = "org.freedesktop.portal.Request";
const SESSION_INTERFACE: &str = "org.freedesktop.portal.Session";

type Options<'a> = HashMap<&'a str, Value<'a>>;

struct PendingResponse {
    token: String,
    stream: zbus::proxy::SignalStream<'static>,
}

/// A [`PortalBus`] backed by the user's session bus.
pub struct DbusPortal {
    connection: Connection,
    screencast: Proxy<'static>,
    sender: String,
    pending: Option<PendingResponse>,
    closed: Option<(String, zbus::proxy::SignalStream<'static>)>,
    ready: VecDeque<PortalEvent>,
}

impl DbusPortal {
    /// Connect to the session bus and bind the screencast interface.
    pub async fn connect() -> Result<Self, PortalError> {
        let connection = Connection::session().await.map_err(bus_error)?;
        let screencast = Proxy::new(
            &connection,
            PORTAL_BUS_NAME,
            PORTAL_OBJECT_PATH,
            SCREENCAST_INTERFACE,
        )
        .await
        .map_err(bus_error)?;
        let sender = connection
            .unique_name()
            .map(|name| name.to_string())
            .ok_or_else(|| PortalError::Bus("connection has no unique name".into()))?;
        debug!(%sender, "connected to session bus");
        Ok(Self {
            connection,
            screencast,
            sender,
            pending: None,
            closed: None,
            ready: VecDeque::new(),
        })
    }

    async fn subscribe_response(&mut self, token: &str) -> Result<(), PortalError> {
        let path = request_path(&self.sender, token);
        let proxy = Proxy::new_owned(
            self.connection.clone(),
            PORTAL_BUS_NAME.to_string(),
            path,
            REQUEST_INTERFACE.to_string(),
        )
        .await
        .map_err(bus_error)?;
        let stream = proxy.receive_signal("Response").await.map_err(bus_error)?;
        self.pending = Some(PendingResponse {
            token: token.to_string(),
            stream,
        });
        Ok(())
    }

    async fn subscribe_closed(&mut self, session: &str) -> Result<(), PortalError> {
        if self.closed.as_ref().is_some_and(|(path, _)| path == session) {
            return Ok(());
        }
        let proxy = Proxy::new_owned(
            self.connection.clone(),
            PORTAL_BUS_NAME.to_string(),
            session.to_string(),
            SESSION_INTERFACE.to_string(),
        )
        .await
        .map_err(bus_error)?;
        let stream = proxy.receive_signal("Closed").await.map_err(bus_error)?;
        self.closed = Some((session.to_string(), stream));
        Ok(())
    }
}

#[async_trait]
impl PortalBus for DbusPortal {
    async fn request(&mut self, request: PortalRequest) -> Result<(), PortalError> {
        let token = request.handle_token().to_string();
        match request {
            PortalRequest::CreateSession {
                handle_token,
                session_token,
            } => {
                self.subscribe_response(&handle_token).await?;
                let mut options = Options::new();
                options.insert("handle_token", Value::from(handle_token.as_str()));
                options.insert("session_handle_token", Value::from(session_token.as_str()));
                debug!(
                    expected_session = %session_path(&self.sender, &session_token),
                    "CreateSession"
                );
                self.screencast
                    .call_method("CreateSession", &(options,))
                    .await
                    .map_err(bus_error)?;
            }
            PortalRequest::SelectSources {
                session,
                handle_token,
                selection,
            } => {
                self.subscribe_closed(&session).await?;
                self.subscribe_response(&handle_token).await?;
                let path = object_path(&session)?;
                let mut options = Options::new();
                options.insert("handle_token", Value::from(handle_token.as_str()));
                options.insert("types", Value::U32(selection.source_types.bits()));
                options.insert("multiple", Value::Bool(selection.multiple));
                options.insert("cursor_mode", Value::U32(selection.cursor_mode.bits()));
                self.screencast
                    .call_method("SelectSources", &(path, options))
                    .await
                    .map_err(bus_error)?;
            }
            PortalRequest::Start {
                session,
                handle_token,
            } => {
                self.subscribe_response(&handle_token).await?;
                let path = object_path(&session)?;
                let mut options = Options::new();
                options.insert("handle_token", Value::from(handle_token.as_str()));
                self.screencast
                    .call_method("Start", &(path, "", options))
                    .await
                    .map_err(bus_error)?;
            }
            PortalRequest::OpenPipeWireRemote { session, .. } => {
                let path = object_path(&session)?;
                let options = Options::new();
                let reply = self
                    .screencast
                    .call_method("OpenPipeWireRemote", &(path, options))
                    .await
                    .map_err(bus_error)?;
                let fd: zvariant::OwnedFd = reply.body().deserialize().map_err(bus_error)?;
                let results = ResponseResults {
                    remote: Some(fd.into()),
                    ..Default::default()
                };
                self.ready.push_back(PortalEvent::Response {
                    token,
                    response: PortalResponse::success(results),
                });
            }
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<PortalEvent, PortalError> {
        if let Some(event) = self.ready.pop_front() {
            return Ok(event);
        }

        let closed = async {
            match self.closed.as_mut() {
                Some((session, stream)) => stream.next().await.map(|_| session.clone()),
                None => std::future::pending().await,
            }
        };
        let response = async {
            match self.pending.as_mut() {
                Some(pending) => pending
                    .stream
                    .next()
                    .await
                    .map(|message| (pending.token.clone(), message)),
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            session = closed => match session {
                Some(session) => Ok(PortalEvent::SessionClosed { session }),
                None => Err(PortalError::Bus("session signal stream ended".into())),
            },
            response = response => match response {
                Some((token, message)) => {
                    let (status, results): (u32, HashMap<String, OwnedValue>) =
                        message.body().deserialize().map_err(bus_error)?;
                    Ok(PortalEvent::Response {
                        token,
                        response: PortalResponse {
                            status,
                            results: parse_results(&results),
                        },
                    })
                }
                None => Err(PortalError::Bus("response signal stream ended".into())),
            },
        }
    }
}

// ── Result parsing ───────────────────────────────────────────────

fn parse_results(results: &HashMap<String, OwnedValue>) -> ResponseResults {
    let session_handle = results.get("session_handle").and_then(|v| match peel(v) {
        Value::Str(s) => Some(s.to_string()),
        Value::ObjectPath(p) => Some(p.to_string()),
        _ => None,
    });
    let streams = results.get("streams").and_then(|v| match peel(v) {
        Value::Array(array) => Some(array.iter().filter_map(parse_stream).collect()),
        _ => None,
    });
    ResponseResults {
        session_handle,
        streams,
        remote: None,
    }
}

/// One `(u a{sv})` stream entry.
fn parse_stream(value: &Value<'_>) -> Option<StreamProperties> {
    let Value::Structure(entry) = peel(value) else {
        return None;
    };
    let fields = entry.fields();
    let Some(Value::U32(node_id)) = fields.first().map(peel) else {
        return None;
    };
    let mut stream = StreamProperties::new(*node_id);
    if let Some(Value::Dict(props)) = fields.get(1).map(peel) {
        for (key, value) in props.iter() {
            let Value::Str(key) = peel(key) else {
                continue;
            };
            match key.as_str() {
                "size" => stream.size = pair(value),
                "position" => stream.position = pair(value),
                "source_type" => {
                    if let Value::U32(kind) = peel(value) {
                        stream.source_type = Some(*kind);
                    }
                }
                _ => {}
            }
        }
    }
    Some(stream)
}

fn pair(value: &Value<'_>) -> Option<(i32, i32)> {
    let Value::Structure(s) = peel(value) else {
        return None;
    };
    match s.fields() {
        [a, b] => match (peel(a), peel(b)) {
            (Value::I32(a), Value::I32(b)) => Some((*a, *b)),
            _ => None,
        },
        _ => None,
    }
}

/// Strip `v` variant wrappers.
fn peel<'v, 'a>(mut value: &'v Value<'a>) -> &'v Value<'a> {
    while let Value::Value(inner) = value {
        value = inner;
    }
    value
}

fn object_path(path: &str) -> Result<zvariant::ObjectPath<'_>, PortalError> {
    zvariant::ObjectPath::try_from(path).map_err(bus_error)
}

fn bus_error(e: impl std::fmt::Display) -> PortalError {
    PortalError::Bus(e.to_string())
}
