pub use bincode::{Decode, Encode};
use relaymq::prelude::*;

// ============================================================================
// TextMessage - Struct with a String
// ============================================================================

#[derive(Encode, Decode, Debug, Clone, PartialEq)]
pub struct TextMessage {
    pub text: String,
}
impl_message!(TextMessage, 1);

impl TextMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

// ============================================================================
// ByteVector - Basic vector of bytes
// ============================================================================

#[derive(Encode, Decode, Debug, Clone, PartialEq)]
pub struct ByteVector {
    pub data: Vec<u8>,
}
impl_message!(ByteVector, 2);

// ============================================================================
// SimpleMessage - Simple struct with primitives
// ============================================================================

#[derive(Encode, Decode, Debug, Clone, PartialEq)]
pub struct SimpleMessage {
    pub id: u32,
    pub value: i32,
    pub flag: bool,
}
impl_message!(SimpleMessage, 3);

// ============================================================================
// UnregisteredMessage - Never added to the test registry
// ============================================================================

#[derive(Encode, Decode, Debug, Clone, PartialEq)]
pub struct UnregisteredMessage {
    pub id: u32,
}
impl_message!(UnregisteredMessage, 99);
