//! Work distribution: writers push messages into a service queue, which
//! hands each one to exactly one of its connected readers.

use crate::connection::{Connection, FrameHandler};
use crate::engine::Engine;
use crate::error::Error;
use crate::events::{ConnectionInfo, EventHub, Subscription};
use crate::frame::MessageFrame;
use crate::message::{serialize_message, Message};
use crate::node::{Client, Server, ServerBehavior};
use crate::pubsub::{subscribe_messages, MessageListeners, MessageSession};
use crate::role::NodeRole;
use crate::transport::{Endpoint, IntoEndpoint};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, instrument, trace};

// ============================================================================
// Service Queue
// ============================================================================

/// Listening node that accepts writers and readers.
///
/// Each message from a writer goes to one reader, rotating through readers
/// in connection order. While no reader is connected, messages wait in an
/// unbounded backlog that is flushed to the next reader to connect.
pub struct ServiceQueue {
    server: Server<ServiceQueueBehavior>,
}

#[derive(Default)]
struct Distribution {
    readers: VecDeque<Arc<Connection>>,
    backlog: VecDeque<MessageFrame>,
}

#[derive(Default)]
struct ServiceQueueBehavior {
    state: Mutex<Distribution>,
}

impl ServiceQueueBehavior {
    fn lock_state(&self) -> MutexGuard<'_, Distribution> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServerBehavior for ServiceQueueBehavior {
    fn on_client_connected(&self, connection: &Arc<Connection>) {
        if connection.remote_role() != NodeRole::ServiceQueueReader {
            return;
        }
        let mut state = self.lock_state();
        if !state.backlog.is_empty() {
            let backlog: Vec<_> = state.backlog.drain(..).collect();
            debug!(id = connection.id(), count = backlog.len(), "Flushing backlog to reader");
            connection.send_many(backlog);
        }
        state.readers.push_back(connection.clone());
    }

    fn on_frame(&self, connection: &Arc<Connection>, frame: MessageFrame) {
        if connection.remote_role() != NodeRole::ServiceQueueWriter {
            trace!(id = connection.id(), "Ignoring frame from reader");
            return;
        }

        let mut state = self.lock_state();
        while let Some(reader) = state.readers.pop_front() {
            if reader.send(frame.clone()) {
                state.readers.push_back(reader);
                return;
            }
            // Disconnected but not yet removed; drop it from the rotation.
        }
        trace!(type_id = frame.type_id(), "No reader connected, holding frame");
        state.backlog.push_back(frame);
    }

    fn on_client_disconnected(&self, connection: &Arc<Connection>) {
        self.lock_state()
            .readers
            .retain(|reader| reader.id() != connection.id());
    }
}

impl ServiceQueue {
    pub fn new(engine: &Engine) -> Self {
        Self {
            server: Server::new(engine, NodeRole::ServiceQueue, ServiceQueueBehavior::default()),
        }
    }

    /// Starts listening; returns the endpoint actually bound.
    pub fn bind(&self, endpoint: impl IntoEndpoint) -> Result<Endpoint, Error> {
        self.server.bind(endpoint)
    }

    pub fn unbind(&self, endpoint: impl IntoEndpoint) -> Result<bool, Error> {
        self.server.unbind(endpoint)
    }

    /// Stops all listeners and disconnects all writers and readers. The
    /// backlog is kept.
    pub fn close(&self) {
        self.server.close();
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.server.endpoints()
    }

    /// Number of connected readers.
    pub fn reader_count(&self) -> usize {
        self.server.behavior().lock_state().readers.len()
    }

    /// Number of messages waiting for a reader.
    pub fn backlog_len(&self) -> usize {
        self.server.behavior().lock_state().backlog.len()
    }

    pub fn on_client_connected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.server.on_client_connected(listener)
    }

    pub fn on_client_disconnected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.server.on_client_disconnected(listener)
    }
}

impl std::fmt::Debug for ServiceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceQueue")
            .field("endpoints", &self.endpoints())
            .field("readers", &self.reader_count())
            .field("backlog", &self.backlog_len())
            .finish()
    }
}

// ============================================================================
// Writer
// ============================================================================

// Writers never receive anything.
struct WriterSession;

impl FrameHandler for WriterSession {
    fn on_frame(&self, connection: &Arc<Connection>, frame: MessageFrame) {
        trace!(id = connection.id(), type_id = frame.type_id(), "Ignoring frame sent to writer");
    }
}

/// Connecting node that feeds messages into a service queue.
pub struct ServiceQueueWriter {
    client: Client<WriterSession>,
}

impl ServiceQueueWriter {
    pub fn new(engine: &Engine) -> Self {
        Self {
            client: Client::new(engine, NodeRole::ServiceQueueWriter),
        }
    }

    pub fn connect(&self, endpoint: impl IntoEndpoint) -> Result<(), Error> {
        self.connect_timeout(endpoint, self.client.engine().settings().connect_timeout)
    }

    pub fn connect_timeout(&self, endpoint: impl IntoEndpoint, timeout: Option<Duration>) -> Result<(), Error> {
        self.client.connect(endpoint, timeout, Arc::new(WriterSession))
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    pub fn is_disconnected(&self) -> bool {
        self.client.is_disconnected()
    }

    /// Queues `message` for the service queue. Never blocks on the network.
    #[instrument(skip(self, message), fields(type_id = message.message_type_id()))]
    pub fn send(&self, message: &dyn Message) -> Result<(), Error> {
        let session = self.client.session().ok_or(Error::NotConnected)?;
        let frame = serialize_message(message, self.client.engine().registry())?;
        if session.connection.send(frame) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    pub fn on_disconnected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.client.on_disconnected(listener)
    }
}

impl std::fmt::Debug for ServiceQueueWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceQueueWriter")
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Connecting node that receives its share of a service queue's messages.
pub struct ServiceQueueReader {
    client: Client<MessageSession>,
    listeners: Arc<MessageListeners>,
}

impl ServiceQueueReader {
    pub fn new(engine: &Engine) -> Self {
        Self {
            client: Client::new(engine, NodeRole::ServiceQueueReader),
            listeners: Arc::new(EventHub::inline()),
        }
    }

    pub fn connect(&self, endpoint: impl IntoEndpoint) -> Result<(), Error> {
        self.connect_timeout(endpoint, self.client.engine().settings().connect_timeout)
    }

    pub fn connect_timeout(&self, endpoint: impl IntoEndpoint, timeout: Option<Duration>) -> Result<(), Error> {
        let session = Arc::new(MessageSession::new(self.client.engine().registry(), &self.listeners));
        self.client.connect(endpoint, timeout, session)
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    pub fn is_disconnected(&self) -> bool {
        self.client.is_disconnected()
    }

    /// Registers a listener for received messages, run on the read loop.
    pub fn on_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&dyn Message) + Send + Sync + 'static,
    {
        subscribe_messages(&self.listeners, listener)
    }

    pub fn on_disconnected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.client.on_disconnected(listener)
    }
}

impl std::fmt::Debug for ServiceQueueReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceQueueReader")
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}
