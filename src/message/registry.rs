use super::Message;
use crate::error::Error;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Type alias for message serialization functions.
///
/// A `MessageSerializer` takes a message reference and appends its encoded
/// form to the buffer.
///
/// # Function Signature
///
/// ```text
/// fn(&dyn Message, &mut Vec<u8>) -> Result<(), Error>
/// ```
pub type MessageSerializer = fn(&dyn Message, &mut Vec<u8>) -> Result<(), Error>;

/// Type alias for message deserialization functions.
///
/// A `MessageDeserializer` takes a complete payload (the frame codec
/// guarantees it is never partial) and rebuilds the message as a boxed trait
/// object.
///
/// # Function Signature
///
/// ```ignore
/// fn(&[u8]) -> Result<Box<dyn Message>, Error>
/// ```
pub type MessageDeserializer = fn(&[u8]) -> Result<Box<dyn Message>, Error>;

/// Codec pair containing serializer and deserializer functions.
#[derive(Clone, Copy)]
pub(crate) struct CodecPair {
    pub(crate) serializer: MessageSerializer,
    pub(crate) deserializer: MessageDeserializer,
}

/// Message registry mapping 16-bit type ids to serializer functions.
///
/// The registry is agnostic about the payload format - bincode, JSON,
/// protobuf or hand-written layouts all plug in the same way. Both ends of a
/// connection need the same ids registered.
///
/// # Usage
///
/// ```no_run
/// use relaymq::{impl_message, Error, Message, MessageRegistry};
///
/// #[derive(Debug)]
/// struct Ping { seq: u32 }
/// impl_message!(Ping, 1);
///
/// fn serialize(msg: &dyn Message, buf: &mut Vec<u8>) -> Result<(), Error> {
///     let ping = msg.downcast_ref::<Ping>().ok_or_else(|| {
///         Error::MalformedData("not a Ping".to_string())
///     })?;
///     buf.extend_from_slice(&ping.seq.to_le_bytes());
///     Ok(())
/// }
///
/// fn deserialize(data: &[u8]) -> Result<Box<dyn Message>, Error> {
///     let bytes: [u8; 4] = data
///         .try_into()
///         .map_err(|_| Error::MalformedData("Ping needs 4 bytes".to_string()))?;
///     Ok(Box::new(Ping { seq: u32::from_le_bytes(bytes) }))
/// }
///
/// let mut registry = MessageRegistry::new();
/// registry.register(1, serialize, deserialize);
/// ```
#[derive(Clone, Default)]
pub struct MessageRegistry {
    codecs: HashMap<u16, CodecPair>,
}

impl MessageRegistry {
    /// Creates a new empty message registry.
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registers a serializer/deserializer pair for the given type id.
    ///
    /// Registering the same id twice replaces the earlier pair.
    pub fn register(
        &mut self,
        type_id: u16,
        serializer: MessageSerializer,
        deserializer: MessageDeserializer,
    ) -> &mut Self {
        if type_id == crate::frame::HANDSHAKE_TYPE_ID {
            warn!(type_id, "Registering the reserved handshake type id");
        }
        debug!(type_id, "Registering message codec pair");
        let previous = self.codecs.insert(
            type_id,
            CodecPair {
                serializer,
                deserializer,
            },
        );
        if previous.is_some() {
            warn!(type_id, "Replaced existing codec pair");
        }
        self
    }

    /// Returns true if a codec pair is registered for `type_id`.
    pub fn contains(&self, type_id: u16) -> bool {
        self.codecs.contains_key(&type_id)
    }

    // Gets the codec pair for a type id, if registered.
    pub(crate) fn get(&self, type_id: u16) -> Option<&CodecPair> {
        self.codecs.get(&type_id)
    }
}
