//! Typed messages and the pluggable serializer contract.
//!
//! The engine never looks inside a payload. A [`MessageRegistry`] maps each
//! 16-bit message type id to the functions that turn a [`Message`] into bytes
//! and back; everything above the frame codec only sees boxed messages.

#[cfg(feature = "bincode")]
pub mod bincode;
mod registry;

pub use registry::{MessageDeserializer, MessageRegistry, MessageSerializer};

use crate::error::Error;
use crate::frame::MessageFrame;
use downcast_rs::{impl_downcast, Downcast};
use std::fmt::Debug;
use tracing::{trace, warn};

const INITIAL_PAYLOAD_CAPACITY: usize = 64;

// ============================================================================
// Message Trait
// ============================================================================

/// Trait for message types that can be sent over a connection.
///
/// All messages must be Send + Debug + Downcast so they can cross threads and
/// be downcast back to their concrete type by the receiver.
pub trait Message: Send + Debug + Downcast {
    /// Returns the registry id of this message's type.
    fn message_type_id(&self) -> u16;
}

impl_downcast!(Message);

/// A [`Message`] whose type id is known at compile time.
///
/// Implemented by [`impl_message!`]; used by the registration macros.
pub trait TypedMessage: Message {
    /// The registry id shared by every value of this type.
    const MESSAGE_TYPE_ID: u16;
}

// ============================================================================
// impl_message! Macro
// ============================================================================

/// Implements [`Message`] and [`TypedMessage`] for a message type.
///
/// The id must be unique within a registry and stable for the lifetime of the
/// process. Id `0xFFFF` is reserved for the connection handshake.
///
/// # Example
///
/// ```no_run
/// use relaymq::impl_message;
///
/// #[derive(Debug)]
/// struct Quote { symbol: String, price: f64 }
/// impl_message!(Quote, 7);
/// ```
#[macro_export]
macro_rules! impl_message {
    ($type:ty, $id:expr) => {
        impl $crate::Message for $type {
            fn message_type_id(&self) -> u16 {
                $id
            }
        }

        impl $crate::TypedMessage for $type {
            const MESSAGE_TYPE_ID: u16 = $id;
        }
    };
}

// ============================================================================
// Message Serialization and Deserialization
// ============================================================================

/// Serializes a message into a frame using the registered serializer.
pub fn serialize_message(msg: &dyn Message, registry: &MessageRegistry) -> Result<MessageFrame, Error> {
    let type_id = msg.message_type_id();
    trace!(type_id, "Serializing message");

    let codec_pair = registry.get(type_id).ok_or_else(|| {
        warn!(type_id, "Serializing unregistered message type");
        Error::UnknownMessageType(type_id)
    })?;

    let mut payload = Vec::with_capacity(INITIAL_PAYLOAD_CAPACITY);
    (codec_pair.serializer)(msg, &mut payload)?;

    Ok(MessageFrame::new(type_id, payload))
}

/// Turns a frame back into a message using the registered deserializer.
pub fn deserialize_message(
    frame: &MessageFrame,
    registry: &MessageRegistry,
) -> Result<Box<dyn Message>, Error> {
    let type_id = frame.type_id();
    let codec_pair = registry.get(type_id).ok_or_else(|| {
        warn!(type_id, "Unknown message type id");
        Error::UnknownMessageType(type_id)
    })?;

    trace!(type_id, len = frame.payload().len(), "Deserializing message");

    (codec_pair.deserializer)(frame.payload()).map_err(|e| {
        warn!(type_id, error = %e, "Failed to deserialize message");
        e
    })
}
