//! Transport layer: bindable listeners and connectable frame channels.
//!
//! A [`Transport`] is selected by the endpoint's scheme. Everything above
//! this module works with [`Channel`]s, which move whole [`MessageFrame`]s;
//! only the TCP transport ever touches bytes.

mod endpoint;
mod inproc;
mod tcp;

pub use endpoint::{Endpoint, IntoEndpoint, TransportKind};

use crate::config::Settings;
use crate::error::Error;
use crate::frame::MessageFrame;
use inproc::InProcTransport;
use std::sync::Arc;
use std::time::Duration;
use tcp::TcpTransport;

// ============================================================================
// Channel Halves
// ============================================================================

/// Receiving half of a channel. Owned by exactly one read loop.
pub(crate) trait FrameSource: Send {
    /// Blocks until the next frame arrives.
    ///
    /// Returns `Ok(None)` once the channel has been closed by either side.
    fn recv(&mut self) -> Result<Option<MessageFrame>, Error>;

    /// Bounds how long [`FrameSource::recv`] may block. `None` blocks forever.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), Error>;
}

/// Outcome of a [`FrameSink::send`] that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendProgress {
    /// Everything handed to the sink so far has been written.
    Complete,
    /// The peer is not keeping up. The sink holds the unwritten rest and
    /// fires its writable hook once it can make progress again.
    Blocked,
}

/// Callback a sink fires when a blocked send can make progress.
pub(crate) type WritableHook = Arc<dyn Fn() + Send + Sync>;

/// Sending half of a channel. Shared by the connection and its queue.
pub(crate) trait FrameSink: Send + Sync {
    /// Writes the frames in order after anything left over from a blocked
    /// send. Never waits for the peer. Callers guarantee a single writer at
    /// a time.
    fn send(&self, frames: &[MessageFrame]) -> Result<SendProgress, Error>;

    /// Installs the callback fired after a [`SendProgress::Blocked`] send
    /// once the sink is writable again. Sinks that never block ignore it.
    fn set_writable_hook(&self, _hook: WritableHook) {}

    /// Closes both directions. Unblocks the local and the remote read loop.
    fn close(&self);
}

/// One established duplex channel, not yet wrapped in a connection.
pub(crate) struct Channel {
    pub(crate) source: Box<dyn FrameSource>,
    pub(crate) sink: Arc<dyn FrameSink>,
    pub(crate) peer: String,
}

// ============================================================================
// Listener
// ============================================================================

// Blocking half of a listener, driven by the accept loop.
pub(crate) trait Acceptor: Send {
    // Returns `Ok(None)` once the listener has been closed.
    fn accept(&mut self) -> Result<Option<Channel>, Error>;
}

// Closes a listener from any thread, waking a blocked `accept`.
pub(crate) trait ListenerCloser: Send + Sync {
    fn close(&self);
}

/// A bound listener producing incoming channels until it is closed.
pub(crate) struct Listener {
    endpoint: Endpoint,
    acceptor: Box<dyn Acceptor>,
    closer: Arc<dyn ListenerCloser>,
}

impl Listener {
    /// The endpoint actually bound (TCP port 0 resolved to the real port).
    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn closer(&self) -> Arc<dyn ListenerCloser> {
        self.closer.clone()
    }

    /// Lazy sequence of accepted channels, ending when the listener closes.
    pub(crate) fn incoming(&mut self) -> Incoming<'_> {
        Incoming { listener: self }
    }
}

pub(crate) struct Incoming<'a> {
    listener: &'a mut Listener,
}

impl Iterator for Incoming<'_> {
    type Item = Result<Channel, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.listener.acceptor.accept().transpose()
    }
}

// ============================================================================
// Transport
// ============================================================================

// Internal transport trait, one implementation per endpoint scheme.
trait TransportImpl: Send + Sync {
    fn bind_impl(&self, endpoint: &Endpoint) -> Result<Listener, Error>;
    fn connect_impl(&self, endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Channel, Error>;
}

/// Dynamic transport wrapping the in-process or TCP implementation.
pub(crate) struct Transport {
    inner: Box<dyn TransportImpl>,
}

impl Transport {
    /// Creates the transport that serves `endpoint`'s scheme.
    pub(crate) fn for_endpoint(endpoint: &Endpoint, settings: &Settings) -> Self {
        let inner: Box<dyn TransportImpl> = match endpoint.kind() {
            TransportKind::InProc => Box::new(InProcTransport),
            TransportKind::Tcp => Box::new(TcpTransport::new(settings.max_frame_size)),
        };
        Self { inner }
    }

    /// Binds a listener. Fails with [`Error::EndpointInUse`] or an I/O error.
    pub(crate) fn bind(&self, endpoint: &Endpoint) -> Result<Listener, Error> {
        self.inner.bind_impl(endpoint)
    }

    /// Connects to a listener, waiting at most `timeout` (`None` = no limit).
    pub(crate) fn connect(&self, endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Channel, Error> {
        self.inner.connect_impl(endpoint, timeout)
    }
}
