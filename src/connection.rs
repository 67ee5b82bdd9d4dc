//! One established channel: handshake, read loop, outbound queue, teardown.

use crate::dispatch::{MessageQueue, QueueDispatcher};
use crate::error::Error;
use crate::events::ConnectionInfo;
use crate::frame::{handshake_frame, parse_handshake, MessageFrame};
use crate::role::NodeRole;
use crate::transport::{Channel, Endpoint, FrameSink, FrameSource, SendProgress};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Role-specific delivery for frames arriving on a connection.
pub(crate) trait FrameHandler: Send + Sync {
    /// Runs once, before the read loop starts.
    fn on_connected(&self, _connection: &Arc<Connection>) {}

    /// Runs on the read loop for every frame, in arrival order. A panic
    /// here tears the connection down.
    fn on_frame(&self, connection: &Arc<Connection>, frame: MessageFrame);

    /// Runs once, on whichever thread tears the connection down.
    fn on_disconnected(&self, _connection: &Arc<Connection>) {}
}

// ============================================================================
// Handshake
// ============================================================================

/// Connecting side: announce `local_role`, then check the peer's answer.
#[instrument(skip(channel, timeout), fields(peer = %channel.peer))]
pub(crate) fn client_handshake(
    channel: &mut Channel,
    local_role: NodeRole,
    timeout: Option<Duration>,
) -> Result<NodeRole, Error> {
    send_handshake(channel, local_role)?;
    let remote_role = read_handshake(channel, timeout)?;
    if !local_role.accepts(remote_role) {
        return Err(Error::RoleMismatch {
            local: local_role,
            remote: remote_role,
        });
    }
    debug!(%local_role, %remote_role, "Handshake complete");
    Ok(remote_role)
}

/// Accepting side: read the peer's role, answer with ours, then check.
///
/// We always answer before checking so the connecting side can report the
/// mismatch itself instead of seeing a bare close.
#[instrument(skip(channel, timeout), fields(peer = %channel.peer))]
pub(crate) fn server_handshake(
    channel: &mut Channel,
    local_role: NodeRole,
    timeout: Option<Duration>,
) -> Result<NodeRole, Error> {
    let remote_role = read_handshake(channel, timeout)?;
    send_handshake(channel, local_role)?;
    if !local_role.accepts(remote_role) {
        return Err(Error::RoleMismatch {
            local: local_role,
            remote: remote_role,
        });
    }
    debug!(%local_role, %remote_role, "Handshake complete");
    Ok(remote_role)
}

fn send_handshake(channel: &Channel, local_role: NodeRole) -> Result<(), Error> {
    match channel.sink.send(&[handshake_frame(local_role)])? {
        SendProgress::Complete => Ok(()),
        SendProgress::Blocked => Err(Error::HandshakeFailed("peer is not reading".to_string())),
    }
}

fn read_handshake(channel: &mut Channel, timeout: Option<Duration>) -> Result<NodeRole, Error> {
    channel.source.set_read_timeout(timeout)?;
    let frame = channel
        .source
        .recv()?
        .ok_or_else(|| Error::HandshakeFailed("peer closed during handshake".to_string()))?;
    channel.source.set_read_timeout(None)?;
    parse_handshake(&frame)
}

// ============================================================================
// Connection
// ============================================================================

/// One live duplex channel with a declared role on each end.
///
/// Liveness flips to disconnected exactly once, on I/O failure, peer close or
/// an explicit [`Connection::disconnect`]; a disconnected connection is never
/// reused.
pub(crate) struct Connection {
    info: ConnectionInfo,
    disconnected: AtomicBool,
    queue: Arc<MessageQueue>,
    sink: Arc<dyn FrameSink>,
    handler: Arc<dyn FrameHandler>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wraps a handshaken channel, registers its queue and starts the read loop.
    pub(crate) fn start(
        channel: Channel,
        local_role: NodeRole,
        remote_role: NodeRole,
        endpoint: Endpoint,
        dispatcher: &QueueDispatcher,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Arc<Self>, Error> {
        let Channel { source, sink, peer } = channel;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let queue = dispatcher.create_queue(sink.clone());

        let connection = Arc::new(Self {
            info: ConnectionInfo {
                id,
                local_role,
                remote_role,
                endpoint,
                peer,
            },
            disconnected: AtomicBool::new(false),
            queue,
            sink,
            handler,
            reader: Mutex::new(None),
        });

        let weak = Arc::downgrade(&connection);
        connection.queue.set_failure_hook(move |err| {
            if let Some(connection) = weak.upgrade() {
                debug!(id = connection.id(), %err, "Write failure, tearing down");
                connection.teardown();
            }
        });

        connection.handler.on_connected(&connection);
        info!(
            id,
            local_role = %connection.info.local_role,
            remote_role = %connection.info.remote_role,
            peer = %connection.info.peer,
            "Connection established"
        );

        let reader = connection.clone();
        let spawned = thread::Builder::new()
            .name(format!("relaymq-read-{id}"))
            .spawn(move || reader.read_loop(source));
        match spawned {
            Ok(handle) => {
                *connection.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(connection)
            }
            Err(err) => {
                connection.teardown();
                Err(err.into())
            }
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.info.id
    }

    pub(crate) fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub(crate) fn remote_role(&self) -> NodeRole {
        self.info.remote_role
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Enqueues one frame for sending. Returns `false` once disconnected.
    pub(crate) fn send(&self, frame: MessageFrame) -> bool {
        !self.is_disconnected() && self.queue.add(frame)
    }

    /// Enqueues frames as one contiguous run. Returns `false` once disconnected.
    pub(crate) fn send_many(&self, frames: Vec<MessageFrame>) -> bool {
        !self.is_disconnected() && self.queue.add_range(frames)
    }

    /// Tears the connection down and waits for the read loop to finish.
    ///
    /// Frames still queued are dropped. Idempotent; safe to call from the
    /// read loop itself.
    pub(crate) fn disconnect(self: &Arc<Self>) {
        self.teardown();

        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn read_loop(self: Arc<Self>, mut source: Box<dyn FrameSource>) {
        let id = self.info.id;
        loop {
            match source.recv() {
                Ok(Some(frame)) if frame.is_handshake() => {
                    warn!(id, "Unexpected handshake frame after connection setup");
                    break;
                }
                Ok(Some(frame)) => {
                    trace!(id, type_id = frame.type_id(), len = frame.payload().len(), "Received frame");
                    let delivered = panic::catch_unwind(AssertUnwindSafe(|| self.handler.on_frame(&self, frame)));
                    if delivered.is_err() {
                        error!(id, "Frame handler panicked, closing connection");
                        break;
                    }
                }
                Ok(None) => {
                    debug!(id, "Channel closed");
                    break;
                }
                Err(err) => {
                    if !self.is_disconnected() {
                        warn!(id, %err, "Read failed");
                    }
                    break;
                }
            }
        }
        self.teardown();
    }

    fn teardown(self: &Arc<Self>) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sink.close();
        self.queue.dispose();
        info!(id = self.info.id, peer = %self.info.peer, "Connection closed");
        self.handler.on_disconnected(self);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}
