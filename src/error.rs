use crate::role::NodeRole;
use thiserror::Error;

/// The error type for relaymq operations.
///
/// Covers binding, connecting, framing and serialization failures. Errors on
/// an established connection are not returned to callers; they tear down the
/// connection and surface as a disconnect notification instead.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The endpoint string could not be parsed.
    ///
    /// Endpoints look like `tcp://127.0.0.1:5555` or `inproc://name`.
    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// No peer could be reached at the endpoint.
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// The connect timeout elapsed before a peer accepted the connection.
    #[error("Timed out connecting to {endpoint}")]
    ConnectTimeout { endpoint: String },

    /// Another listener already owns this in-process endpoint name.
    #[error("Endpoint {0} is already in use")]
    EndpointInUse(String),

    /// The client node already holds a live connection.
    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    /// The operation needs a live connection and there is none.
    #[error("Not connected")]
    NotConnected,

    // ============================================================================
    // Framing and Handshake Errors
    // ============================================================================

    /// The stream ended in the middle of a frame or carried garbage.
    #[error("Framing error: {0}")]
    Framing(String),

    /// A frame announced a payload larger than `max_frame_size`.
    #[error("Frame of {len} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// The peer did not speak the relaymq handshake.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer declared a role that may not pair with ours.
    #[error("Role mismatch: {local} cannot pair with {remote}")]
    RoleMismatch { local: NodeRole, remote: NodeRole },

    // ============================================================================
    // Message Serialization Errors
    // ============================================================================

    /// Received a frame whose type id hasn't been registered.
    ///
    /// Make sure all message types are registered in the
    /// [`MessageRegistry`](crate::MessageRegistry) on both ends.
    #[error("Unknown message type id {0}")]
    UnknownMessageType(u16),

    /// Message payload could not be decoded by the registered deserializer.
    #[error("Malformed message data: {0}")]
    MalformedData(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

// ============================================================================
// Request-Response Errors
// ============================================================================

/// Errors scoped to a single request.
///
/// `Timeout` and `Cancelled` leave the connection usable; only the request
/// that produced them is affected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The blocking request did not get its response within the deadline.
    #[error("Request timed out")]
    Timeout,

    /// The caller cancelled the request before its response arrived.
    #[error("Request cancelled")]
    Cancelled,

    /// The connection died while the request was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The requester has no connection to send on.
    #[error("Not connected")]
    NotConnected,

    /// The request message could not be serialized.
    #[error("Failed to serialize request: {0}")]
    Serialize(String),

    /// The response frame could not be turned back into a message.
    #[error("Failed to deserialize response: {0}")]
    Deserialize(String),

    /// Received a response of the wrong type.
    #[error("Expected response type {expected}, but received a different type")]
    WrongResponseType {
        /// The expected response type name.
        expected: &'static str,
    },
}
