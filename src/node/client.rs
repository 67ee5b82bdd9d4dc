use crate::connection::{client_handshake, Connection, FrameHandler};
use crate::engine::Engine;
use crate::error::Error;
use crate::events::{ConnectionInfo, EventHub, NodeEvent, Subscription};
use crate::frame::MessageFrame;
use crate::role::NodeRole;
use crate::transport::{Endpoint, IntoEndpoint, Transport};

use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1);

/// Connect plumbing shared by every connecting node.
///
/// `S` is the per-connection session state; a fresh one is supplied on every
/// connect so nothing from a dead connection leaks into the next.
pub(crate) struct Client<S: FrameHandler + 'static> {
    engine: Engine,
    role: NodeRole,
    current: Mutex<Option<Session<S>>>,
    events: Arc<EventHub<NodeEvent>>,
}

pub(crate) struct Session<S> {
    pub(crate) connection: Arc<Connection>,
    pub(crate) handler: Arc<S>,
}

impl<S> Clone for Session<S> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            handler: self.handler.clone(),
        }
    }
}

// Emits `Disconnected` after the session has cleaned up.
struct ClientHandler<S> {
    session: Arc<S>,
    events: Weak<EventHub<NodeEvent>>,
}

impl<S: FrameHandler> FrameHandler for ClientHandler<S> {
    fn on_connected(&self, connection: &Arc<Connection>) {
        self.session.on_connected(connection);
    }

    fn on_frame(&self, connection: &Arc<Connection>, frame: MessageFrame) {
        self.session.on_frame(connection, frame);
    }

    fn on_disconnected(&self, connection: &Arc<Connection>) {
        self.session.on_disconnected(connection);
        if let Some(events) = self.events.upgrade() {
            events.emit(NodeEvent::Disconnected(connection.info().clone()));
        }
    }
}

impl<S: FrameHandler + 'static> Client<S> {
    pub(crate) fn new(engine: &Engine, role: NodeRole) -> Self {
        Self {
            engine: engine.clone(),
            role,
            current: Mutex::new(None),
            events: Arc::new(EventHub::notifier()),
        }
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Connects and handshakes, waiting at most `timeout` overall.
    ///
    /// Fails with [`Error::AlreadyConnected`] while a live connection exists.
    #[instrument(skip(self, endpoint, session))]
    pub(crate) fn connect(
        &self,
        endpoint: impl IntoEndpoint,
        timeout: Option<Duration>,
        session: Arc<S>,
    ) -> Result<(), Error> {
        let endpoint = endpoint.into_endpoint()?;
        self.ensure_idle()?;

        let started = Instant::now();
        let transport = Transport::for_endpoint(&endpoint, self.engine.settings());
        let mut channel = transport.connect(&endpoint, timeout)?;

        let handshake_timeout = timeout
            .map(|t| t.saturating_sub(started.elapsed()).max(MIN_HANDSHAKE_TIMEOUT))
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT);
        let remote_role = match client_handshake(&mut channel, self.role, Some(handshake_timeout)) {
            Ok(role) => role,
            Err(err) => {
                channel.sink.close();
                return Err(handshake_error(err, &endpoint));
            }
        };

        let handler = Arc::new(ClientHandler {
            session: session.clone(),
            events: Arc::downgrade(&self.events),
        });
        let connection = Connection::start(
            channel,
            self.role,
            remote_role,
            endpoint.clone(),
            self.engine.dispatcher(),
            handler,
        )?;

        let mut current = self.lock_current();
        if current
            .as_ref()
            .is_some_and(|s| !s.connection.is_disconnected())
        {
            // Lost a race with a concurrent connect.
            drop(current);
            connection.disconnect();
            return Err(Error::AlreadyConnected(endpoint.to_string()));
        }
        info!(%endpoint, role = %self.role, "Connected");
        *current = Some(Session {
            connection,
            handler: session,
        });
        Ok(())
    }

    /// Tears down the current connection, if any. Idempotent.
    #[instrument(skip(self))]
    pub(crate) fn disconnect(&self) {
        let session = self.lock_current().take();
        if let Some(session) = session {
            debug!(id = session.connection.id(), "Disconnecting");
            session.connection.disconnect();
        }
    }

    /// True when there is no live connection.
    pub(crate) fn is_disconnected(&self) -> bool {
        self.lock_current()
            .as_ref()
            .map_or(true, |s| s.connection.is_disconnected())
    }

    /// The live session, if any.
    pub(crate) fn session(&self) -> Option<Session<S>> {
        self.lock_current()
            .as_ref()
            .filter(|s| !s.connection.is_disconnected())
            .cloned()
    }

    pub(crate) fn on_disconnected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.events.subscribe(move |event| {
            if let NodeEvent::Disconnected(info) = event {
                listener(info);
            }
        })
    }

    fn ensure_idle(&self) -> Result<(), Error> {
        match self.lock_current().as_ref() {
            Some(s) if !s.connection.is_disconnected() => {
                Err(Error::AlreadyConnected(s.connection.info().endpoint.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Session<S>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: FrameHandler + 'static> Drop for Client<S> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// A handshake that never answers shows up as a read timeout.
fn handshake_error(err: Error, endpoint: &Endpoint) -> Error {
    match err {
        Error::Io(io) if matches!(io.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
            Error::ConnectTimeout {
                endpoint: endpoint.to_string(),
            }
        }
        other => other,
    }
}
