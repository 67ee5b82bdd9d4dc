//! Publish/subscribe: one publisher fans every message out to all
//! currently connected subscribers.
//!
//! There is no durability or replay. A subscriber sees only what is
//! published while it is connected, in publish order.

use crate::connection::{Connection, FrameHandler};
use crate::engine::Engine;
use crate::error::Error;
use crate::events::{ConnectionInfo, EventHub, Subscription};
use crate::frame::MessageFrame;
use crate::message::{deserialize_message, serialize_message, Message, MessageRegistry};
use crate::node::{Client, Server, ServerBehavior};
use crate::role::NodeRole;
use crate::transport::{Endpoint, IntoEndpoint};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

// ============================================================================
// Publisher
// ============================================================================

/// Listening node that broadcasts messages to its subscribers.
///
/// # Example
///
/// ```no_run
/// # use relaymq::{Engine, MessageRegistry, Publisher};
/// # #[derive(Debug)] struct Tick;
/// # relaymq::impl_message!(Tick, 1);
/// # let engine = Engine::new(&config::Config::default(), &MessageRegistry::new())?;
/// let publisher = Publisher::new(&engine);
/// publisher.bind("tcp://0.0.0.0:5555")?;
/// publisher.publish(&Tick)?;
/// # Ok::<(), relaymq::Error>(())
/// ```
pub struct Publisher {
    server: Server<PublisherBehavior>,
}

struct PublisherBehavior;

impl ServerBehavior for PublisherBehavior {
    fn on_frame(&self, connection: &Arc<Connection>, frame: MessageFrame) {
        trace!(id = connection.id(), type_id = frame.type_id(), "Ignoring frame from subscriber");
    }
}

impl Publisher {
    pub fn new(engine: &Engine) -> Self {
        Self {
            server: Server::new(engine, NodeRole::Publisher, PublisherBehavior),
        }
    }

    /// Starts listening; returns the endpoint actually bound.
    pub fn bind(&self, endpoint: impl IntoEndpoint) -> Result<Endpoint, Error> {
        self.server.bind(endpoint)
    }

    /// Stops listening on `endpoint`; existing subscribers stay connected.
    pub fn unbind(&self, endpoint: impl IntoEndpoint) -> Result<bool, Error> {
        self.server.unbind(endpoint)
    }

    /// Stops all listeners and disconnects all subscribers.
    pub fn close(&self) {
        self.server.close();
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.server.endpoints()
    }

    pub fn subscriber_count(&self) -> usize {
        self.server.client_count()
    }

    /// Sends `message` to every subscriber connected right now.
    ///
    /// Serializes once and shares the encoded frame across all subscriber
    /// queues. Never blocks on the network; with no subscribers the message
    /// is dropped.
    #[instrument(skip(self, message), fields(type_id = message.message_type_id()))]
    pub fn publish(&self, message: &dyn Message) -> Result<(), Error> {
        let frame = serialize_message(message, self.server.engine().registry())?;
        let subscribers = self.server.clients();
        trace!(subscribers = subscribers.len(), "Publishing");
        for subscriber in subscribers {
            subscriber.send(frame.clone());
        }
        Ok(())
    }

    /// Sends `messages` to every subscriber, each subscriber receiving them as
    /// one contiguous run.
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    pub fn publish_many(&self, messages: &[&dyn Message]) -> Result<(), Error> {
        let registry = self.server.engine().registry();
        let frames = messages
            .iter()
            .map(|message| serialize_message(*message, registry))
            .collect::<Result<Vec<_>, _>>()?;
        for subscriber in self.server.clients() {
            subscriber.send_many(frames.clone());
        }
        Ok(())
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

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("endpoints", &self.endpoints())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Message delivery shared by subscribers and service queue readers
// ============================================================================

pub(crate) type MessageListeners = EventHub<Box<dyn Message>>;

/// Decodes every incoming frame and hands it to the message listeners,
/// inline on the read loop.
pub(crate) struct MessageSession {
    registry: MessageRegistry,
    listeners: Arc<MessageListeners>,
}

impl MessageSession {
    pub(crate) fn new(registry: &MessageRegistry, listeners: &Arc<MessageListeners>) -> Self {
        Self {
            registry: registry.clone(),
            listeners: listeners.clone(),
        }
    }
}

impl FrameHandler for MessageSession {
    fn on_frame(&self, connection: &Arc<Connection>, frame: MessageFrame) {
        match deserialize_message(&frame, &self.registry) {
            Ok(message) => self.listeners.emit(message),
            // The frame boundary is intact, so only this message is lost.
            Err(err) => warn!(id = connection.id(), %err, "Dropping undecodable message"),
        }
    }
}

pub(crate) fn subscribe_messages<F>(listeners: &MessageListeners, listener: F) -> Subscription
where
    F: Fn(&dyn Message) + Send + Sync + 'static,
{
    listeners.subscribe(move |message: &Box<dyn Message>| listener(message.as_ref()))
}

// ============================================================================
// Subscriber
// ============================================================================

/// Connecting node that receives everything its publisher broadcasts.
pub struct Subscriber {
    client: Client<MessageSession>,
    listeners: Arc<MessageListeners>,
}

impl Subscriber {
    pub fn new(engine: &Engine) -> Self {
        Self {
            client: Client::new(engine, NodeRole::Subscriber),
            listeners: Arc::new(EventHub::inline()),
        }
    }

    /// Connects using the configured connect timeout.
    pub fn connect(&self, endpoint: impl IntoEndpoint) -> Result<(), Error> {
        self.connect_timeout(endpoint, self.client.engine().settings().connect_timeout)
    }

    /// Connects, waiting at most `timeout` (`None` waits forever).
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

    /// Registers a listener for received messages.
    ///
    /// Listeners run on the connection's read loop, one message at a time in
    /// publish order; a slow listener delays later messages.
    pub fn on_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&dyn Message) + Send + Sync + 'static,
    {
        debug!("Registering message listener");
        subscribe_messages(&self.listeners, listener)
    }

    pub fn on_disconnected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.client.on_disconnected(listener)
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}
