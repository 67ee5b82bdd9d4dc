//! Optional bincode serialization helpers.
//!
//! The engine is serialization-agnostic; this module wires [bincode
//! 2.0](https://docs.rs/bincode) into a [`MessageRegistry`](crate::MessageRegistry)
//! for applications that don't need anything else. Available when the
//! `bincode` feature is enabled (enabled by default).

use crate::error::Error;
use crate::Message;

// ============================================================================
// Macros
// ============================================================================

/// Registers a message type with a registry using bincode serialization.
///
/// The type must implement [`TypedMessage`](crate::TypedMessage), which
/// [`impl_message!`](crate::impl_message) provides.
///
/// # Example
///
/// ```no_run
/// use relaymq::{impl_message, register_bincode_message, MessageRegistry};
/// use bincode::{Decode, Encode};
///
/// #[derive(Encode, Decode, Debug)]
/// struct Greeting { text: String }
/// impl_message!(Greeting, 1);
///
/// let mut registry = MessageRegistry::new();
/// register_bincode_message!(registry, Greeting);
/// ```
#[macro_export]
macro_rules! register_bincode_message {
    ($registry:expr, $type:ty) => {
        $registry.register(
            <$type as $crate::TypedMessage>::MESSAGE_TYPE_ID,
            $crate::bincode::serialize_message::<$type>,
            $crate::bincode::deserialize_message::<$type>,
        )
    };
}

// ============================================================================
// Serialization
// ============================================================================

/// Serializes a [`Message`] into the buffer using bincode.
///
/// Used with [`MessageRegistry`](crate::MessageRegistry) via the
/// [`register_bincode_message!`] macro.
pub fn serialize_message<T>(msg: &dyn Message, buf: &mut Vec<u8>) -> Result<(), Error>
where
    T: Message + bincode::Encode + 'static,
{
    let concrete = msg.downcast_ref::<T>().ok_or_else(|| {
        Error::MalformedData(format!(
            "message type mismatch, expected {}",
            std::any::type_name::<T>()
        ))
    })?;
    bincode::encode_into_std_write(concrete, buf, bincode::config::standard())
        .map(|_len| ())
        .map_err(|e| Error::MalformedData(format!("bincode: {}", e)))
}

// ============================================================================
// Deserialization
// ============================================================================

/// Deserializes a bincode payload and returns it as a boxed [`Message`].
pub fn deserialize_message<T>(data: &[u8]) -> Result<Box<dyn Message>, Error>
where
    T: bincode::Decode<()> + Message + 'static,
{
    bincode::decode_from_slice::<T, _>(data, bincode::config::standard())
        .map(|(msg, _len)| Box::new(msg) as Box<dyn Message>)
        .map_err(|e| Error::MalformedData(format!("bincode: {}", e)))
}
