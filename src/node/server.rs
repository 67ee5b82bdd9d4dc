use crate::connection::{server_handshake, Connection, FrameHandler};
use crate::engine::Engine;
use crate::error::Error;
use crate::events::{ConnectionInfo, EventHub, NodeEvent, Subscription};
use crate::frame::MessageFrame;
use crate::role::NodeRole;
use crate::transport::{Channel, Endpoint, IntoEndpoint, Listener, ListenerCloser, Transport};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

// Applies when no connect timeout is configured, so a silent peer cannot
// park a handshake thread forever.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Role-specific behavior of a listening node.
pub(crate) trait ServerBehavior: Send + Sync + 'static {
    /// Runs before the connection's read loop starts.
    fn on_client_connected(&self, _connection: &Arc<Connection>) {}

    /// Runs on the connection's read loop.
    fn on_frame(&self, connection: &Arc<Connection>, frame: MessageFrame);

    fn on_client_disconnected(&self, _connection: &Arc<Connection>) {}
}

/// Bind/accept plumbing shared by every listening node.
pub(crate) struct Server<B: ServerBehavior> {
    inner: Arc<ServerInner<B>>,
}

struct ServerInner<B> {
    engine: Engine,
    role: NodeRole,
    behavior: B,
    listeners: Mutex<Vec<BoundListener>>,
    clients: Mutex<HashMap<u64, Arc<Connection>>>,
    events: EventHub<NodeEvent>,
}

struct BoundListener {
    requested: Endpoint,
    bound: Endpoint,
    closer: Arc<dyn ListenerCloser>,
    // Cleared on unbind; connections still handshaking on this listener
    // are dropped once they see it.
    active: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl<B: ServerBehavior> Server<B> {
    pub(crate) fn new(engine: &Engine, role: NodeRole, behavior: B) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                engine: engine.clone(),
                role,
                behavior,
                listeners: Mutex::new(Vec::new()),
                clients: Mutex::new(HashMap::new()),
                events: EventHub::notifier(),
            }),
        }
    }

    pub(crate) fn behavior(&self) -> &B {
        &self.inner.behavior
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Starts listening on `endpoint` and returns the endpoint actually bound.
    ///
    /// Binding an endpoint this node already listens on returns the existing
    /// binding.
    #[instrument(skip(self, endpoint))]
    pub(crate) fn bind(&self, endpoint: impl IntoEndpoint) -> Result<Endpoint, Error> {
        let endpoint = endpoint.into_endpoint()?;
        let mut listeners = self.inner.lock_listeners();
        if let Some(existing) = listeners
            .iter()
            .find(|l| l.requested == endpoint || l.bound == endpoint)
        {
            debug!(%endpoint, "Already bound");
            return Ok(existing.bound.clone());
        }

        let transport = Transport::for_endpoint(&endpoint, self.inner.engine.settings());
        let listener = transport.bind(&endpoint)?;
        let bound = listener.endpoint().clone();
        let closer = listener.closer();
        let active = Arc::new(AtomicBool::new(true));

        let weak = Arc::downgrade(&self.inner);
        let thread_active = active.clone();
        let spawned = thread::Builder::new()
            .name(format!("relaymq-accept-{bound}"))
            .spawn(move || accept_loop(weak, listener, thread_active));
        let accept_thread = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                closer.close();
                return Err(err.into());
            }
        };

        info!(endpoint = %bound, "Listening");
        listeners.push(BoundListener {
            requested: endpoint,
            bound: bound.clone(),
            closer,
            active,
            accept_thread: Some(accept_thread),
        });
        Ok(bound)
    }

    /// Stops listening on `endpoint`. Established connections stay open.
    ///
    /// Returns `false` if the node was not bound there.
    #[instrument(skip(self, endpoint))]
    pub(crate) fn unbind(&self, endpoint: impl IntoEndpoint) -> Result<bool, Error> {
        let endpoint = endpoint.into_endpoint()?;
        let removed = {
            let mut listeners = self.inner.lock_listeners();
            listeners
                .iter()
                .position(|l| l.requested == endpoint || l.bound == endpoint)
                .map(|index| listeners.remove(index))
        };
        match removed {
            Some(listener) => {
                stop_listener(listener);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Endpoints currently bound.
    pub(crate) fn endpoints(&self) -> Vec<Endpoint> {
        self.inner
            .lock_listeners()
            .iter()
            .map(|l| l.bound.clone())
            .collect()
    }

    /// Snapshot of the live client connections.
    pub(crate) fn clients(&self) -> Vec<Arc<Connection>> {
        self.inner.lock_clients().values().cloned().collect()
    }

    pub(crate) fn client_count(&self) -> usize {
        self.inner.lock_clients().len()
    }

    /// Stops every listener and disconnects every client. Idempotent.
    #[instrument(skip(self))]
    pub(crate) fn close(&self) {
        let listeners: Vec<_> = self.inner.lock_listeners().drain(..).collect();
        for listener in listeners {
            stop_listener(listener);
        }

        let clients: Vec<_> = self.inner.lock_clients().drain().map(|(_, c)| c).collect();
        if !clients.is_empty() {
            debug!(count = clients.len(), "Disconnecting clients");
        }
        for client in clients {
            client.disconnect();
        }
    }

    pub(crate) fn on_client_connected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(move |event| {
            if let NodeEvent::ClientConnected(info) = event {
                listener(info);
            }
        })
    }

    pub(crate) fn on_client_disconnected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(move |event| {
            if let NodeEvent::ClientDisconnected(info) = event {
                listener(info);
            }
        })
    }
}

impl<B: ServerBehavior> Drop for Server<B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B> ServerInner<B> {
    fn lock_listeners(&self) -> MutexGuard<'_, Vec<BoundListener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<u64, Arc<Connection>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: ServerBehavior> ServerInner<B> {
    // Runs on a per-channel thread so a slow handshake never stalls accepting.
    fn accept_client(self: Arc<Self>, mut channel: Channel, endpoint: Endpoint, active: &AtomicBool) {
        let timeout = self
            .engine
            .settings()
            .connect_timeout
            .or(Some(DEFAULT_HANDSHAKE_TIMEOUT));

        let remote_role = match server_handshake(&mut channel, self.role, timeout) {
            Ok(role) => role,
            Err(err) => {
                warn!(peer = %channel.peer, %err, "Rejected client");
                channel.sink.close();
                return;
            }
        };

        let handler: Arc<dyn FrameHandler> = self.clone();
        let connection = match Connection::start(
            channel,
            self.role,
            remote_role,
            endpoint,
            self.engine.dispatcher(),
            handler,
        ) {
            Ok(connection) => connection,
            Err(err) => {
                warn!(%err, "Failed to start connection");
                return;
            }
        };

        if !active.load(Ordering::SeqCst) {
            debug!(id = connection.id(), "Listener closed during handshake");
            connection.disconnect();
        }
    }
}

impl<B: ServerBehavior> FrameHandler for ServerInner<B> {
    fn on_connected(&self, connection: &Arc<Connection>) {
        self.lock_clients().insert(connection.id(), connection.clone());
        self.behavior.on_client_connected(connection);
        self.events
            .emit(NodeEvent::ClientConnected(connection.info().clone()));
    }

    fn on_frame(&self, connection: &Arc<Connection>, frame: MessageFrame) {
        self.behavior.on_frame(connection, frame);
    }

    fn on_disconnected(&self, connection: &Arc<Connection>) {
        self.lock_clients().remove(&connection.id());
        self.behavior.on_client_disconnected(connection);
        self.events
            .emit(NodeEvent::ClientDisconnected(connection.info().clone()));
    }
}

fn accept_loop<B: ServerBehavior>(
    inner: Weak<ServerInner<B>>,
    mut listener: Listener,
    active: Arc<AtomicBool>,
) {
    let endpoint = listener.endpoint().clone();
    for accepted in listener.incoming() {
        let channel = match accepted {
            Ok(channel) => channel,
            Err(err) => {
                warn!(%endpoint, %err, "Listener failed");
                break;
            }
        };
        let Some(inner) = inner.upgrade() else {
            channel.sink.close();
            break;
        };

        let endpoint = endpoint.clone();
        let active = active.clone();
        let spawned = thread::Builder::new()
            .name("relaymq-handshake".to_string())
            .spawn(move || inner.accept_client(channel, endpoint, &active));
        if let Err(err) = spawned {
            warn!(%err, "Failed to spawn handshake thread");
        }
    }
    debug!(%endpoint, "Accept loop stopped");
}

fn stop_listener(mut listener: BoundListener) {
    listener.active.store(false, Ordering::SeqCst);
    listener.closer.close();
    if let Some(handle) = listener.accept_thread.take() {
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
    info!(endpoint = %listener.bound, "Stopped listening");
}
