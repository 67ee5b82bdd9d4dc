//! relaymq - lightweight publish/subscribe and request/response messaging
//!
//! Nodes exchange typed messages over in-process channels (`inproc://name`)
//! or TCP (`tcp://host:port`) without touching byte streams. Every connection
//! gets its own outbound [`MessageQueue`]; a shared [`QueueDispatcher`] with a
//! fixed number of worker threads drains all of them fairly, so sending never
//! blocks the caller on the network.
//!
//! | Listening node | Connecting node | Pattern |
//! |---|---|---|
//! | [`Publisher`] | [`Subscriber`] | every message to every subscriber |
//! | [`Responder`] | [`Requester`] | one response per request, in order |
//! | [`ServiceQueue`] | [`ServiceQueueWriter`] / [`ServiceQueueReader`] | each message to one reader |
//!
//! All nodes are created from an [`Engine`], which owns the dispatcher, the
//! [`MessageRegistry`] and the [`Settings`].

// Internal-only modules
pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod dispatch;
pub(crate) mod engine;
pub(crate) mod error;
pub(crate) mod events;
pub(crate) mod frame;
pub(crate) mod message;
pub(crate) mod node;
pub(crate) mod pubsub;
pub(crate) mod reqrep;
pub(crate) mod role;
pub(crate) mod service_queue;
pub(crate) mod transport;

// These are the intended public API
pub use crate::config::Settings;
pub use dispatch::{MessageQueue, QueueDispatcher, QueueId};
pub use engine::Engine;
pub use error::{Error, RequestError};
pub use events::{ConnectionInfo, NodeEvent, Subscription};
pub use frame::{decode_frame, encode_frame, encode_frame_into, read_frame, MessageFrame, HANDSHAKE_TYPE_ID, HEADER_SIZE};
pub use message::{Message, MessageDeserializer, MessageRegistry, MessageSerializer, TypedMessage};
pub use pubsub::{Publisher, Subscriber};
pub use reqrep::{downcast_response, CancellationToken, RequestHandler, Requester, Responder, ResponseFuture};
pub use role::NodeRole;
pub use service_queue::{ServiceQueue, ServiceQueueReader, ServiceQueueWriter};
pub use transport::{Endpoint, IntoEndpoint, TransportKind};

// Bincode support (optional feature, enabled by default)
#[cfg(feature = "bincode")]
pub use message::bincode;

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::engine::Engine;
    pub use crate::error::{Error, RequestError};
    pub use crate::events::{ConnectionInfo, Subscription};
    pub use crate::impl_message;
    pub use crate::message::{Message, MessageRegistry, TypedMessage};
    pub use crate::pubsub::{Publisher, Subscriber};
    pub use crate::reqrep::{CancellationToken, Requester, Responder};
    pub use crate::service_queue::{ServiceQueue, ServiceQueueReader, ServiceQueueWriter};
    pub use crate::transport::Endpoint;

    // Bincode support (optional feature, enabled by default)
    #[cfg(feature = "bincode")]
    pub use crate::register_bincode_message;
}

// Re-export functions that are only needed for testing
// Hidden from documentation to discourage use in production code
#[doc(hidden)]
pub use message::{deserialize_message, serialize_message};
