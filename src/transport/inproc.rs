//! In-process transport.
//!
//! Endpoint names live in a process-wide table. A bind claims a name; a
//! connect on the same name hands the listener one half of a fresh channel
//! pair. Frames travel as values through FIFO channels, so ordering matches
//! the networked case without any encoding.

use super::{
    Acceptor, Channel, Endpoint, FrameSink, FrameSource, Listener, ListenerCloser, SendProgress, TransportImpl,
};
use crate::error::Error;
use crate::frame::MessageFrame;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

// Internal data type for the endpoint table
struct BoundName {
    listener_id: u64,
    incoming: Sender<Channel>,
}

#[derive(Default)]
struct Registry {
    names: Mutex<HashMap<String, BoundName>>,
    bound: Condvar,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::default)
}

fn lock_names(registry: &Registry) -> MutexGuard<'_, HashMap<String, BoundName>> {
    registry.names.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(super) struct InProcTransport;

impl TransportImpl for InProcTransport {
    #[instrument(skip(self), fields(endpoint = %endpoint))]
    fn bind_impl(&self, endpoint: &Endpoint) -> Result<Listener, Error> {
        let registry = registry();
        let name = endpoint.address().to_string();
        let listener_id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (incoming, accepted) = channel();

        {
            let mut names = lock_names(registry);
            if names.contains_key(&name) {
                return Err(Error::EndpointInUse(endpoint.to_string()));
            }
            names.insert(
                name.clone(),
                BoundName {
                    listener_id,
                    incoming,
                },
            );
        }
        registry.bound.notify_all();
        info!("Listening for in-process connections");

        Ok(Listener {
            endpoint: endpoint.clone(),
            acceptor: Box::new(InProcAcceptor { accepted }),
            closer: Arc::new(InProcListenerCloser { name, listener_id }),
        })
    }

    #[instrument(skip(self), fields(endpoint = %endpoint))]
    fn connect_impl(&self, endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Channel, Error> {
        let registry = registry();
        let name = endpoint.address();
        let deadline = timeout.map(|t| Instant::now() + t);

        // Without a timeout an unbound name fails at once, like a refused TCP
        // connect. With one, wait for a listener to appear.
        let incoming = {
            let mut names = lock_names(registry);
            loop {
                if let Some(bound) = names.get(name) {
                    break bound.incoming.clone();
                }
                let Some(deadline) = deadline else {
                    return Err(Error::Connection {
                        endpoint: endpoint.to_string(),
                        reason: "no listener bound".to_string(),
                    });
                };
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::ConnectTimeout {
                        endpoint: endpoint.to_string(),
                    });
                }
                names = registry
                    .bound
                    .wait_timeout(names, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        };

        let (client, server) = channel_pair(endpoint);
        incoming.send(server).map_err(|_| Error::Connection {
            endpoint: endpoint.to_string(),
            reason: "listener closed".to_string(),
        })?;
        debug!("Handed channel to listener");
        Ok(client)
    }
}

// Builds two connected channel halves: (client, server).
fn channel_pair(endpoint: &Endpoint) -> (Channel, Channel) {
    let (to_server, server_rx) = channel();
    let (to_client, client_rx) = channel();

    let client = Channel {
        source: Box::new(InProcSource::new(client_rx)),
        sink: Arc::new(InProcSink::new(to_server.clone(), to_client.clone())),
        peer: endpoint.to_string(),
    };
    let server = Channel {
        source: Box::new(InProcSource::new(server_rx)),
        sink: Arc::new(InProcSink::new(to_client, to_server)),
        peer: format!("{endpoint}#{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)),
    };
    (client, server)
}

// ============================================================================
// Listener
// ============================================================================

struct InProcAcceptor {
    accepted: Receiver<Channel>,
}

impl Acceptor for InProcAcceptor {
    fn accept(&mut self) -> Result<Option<Channel>, Error> {
        // All senders live in the registry entry; removing it ends the loop.
        Ok(self.accepted.recv().ok())
    }
}

struct InProcListenerCloser {
    name: String,
    listener_id: u64,
}

impl ListenerCloser for InProcListenerCloser {
    fn close(&self) {
        let mut names = lock_names(registry());
        if names
            .get(&self.name)
            .is_some_and(|bound| bound.listener_id == self.listener_id)
        {
            names.remove(&self.name);
            info!(name = %self.name, "Closed in-process listener");
        }
    }
}

// ============================================================================
// Channel
// ============================================================================

enum Packet {
    Frame(MessageFrame),
    Close,
}

struct InProcSource {
    rx: Receiver<Packet>,
    timeout: Option<Duration>,
}

impl InProcSource {
    fn new(rx: Receiver<Packet>) -> Self {
        Self { rx, timeout: None }
    }
}

impl FrameSource for InProcSource {
    fn recv(&mut self) -> Result<Option<MessageFrame>, Error> {
        let packet = match self.timeout {
            None => self.rx.recv().ok(),
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(packet) => Some(packet),
                Err(RecvTimeoutError::Timeout) => return Err(Error::Io(ErrorKind::TimedOut.into())),
                Err(RecvTimeoutError::Disconnected) => None,
            },
        };
        match packet {
            Some(Packet::Frame(frame)) => Ok(Some(frame)),
            Some(Packet::Close) | None => Ok(None),
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        self.timeout = timeout;
        Ok(())
    }
}

struct InProcSink {
    // Feeds the peer's source.
    peer: Mutex<Option<Sender<Packet>>>,
    // Feeds our own source, so a local close ends our read loop too.
    local: Mutex<Option<Sender<Packet>>>,
}

impl InProcSink {
    fn new(peer: Sender<Packet>, local: Sender<Packet>) -> Self {
        Self {
            peer: Mutex::new(Some(peer)),
            local: Mutex::new(Some(local)),
        }
    }
}

impl FrameSink for InProcSink {
    fn send(&self, frames: &[MessageFrame]) -> Result<SendProgress, Error> {
        let peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(peer) = peer.as_ref() else {
            return Err(Error::Io(ErrorKind::BrokenPipe.into()));
        };
        for frame in frames {
            peer.send(Packet::Frame(frame.clone()))
                .map_err(|_| Error::Io(ErrorKind::BrokenPipe.into()))?;
        }
        Ok(SendProgress::Complete)
    }

    fn close(&self) {
        let peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner).take();
        let local = self.local.lock().unwrap_or_else(PoisonError::into_inner).take();
        for sender in peer.into_iter().chain(local) {
            // The other side may already be gone.
            let _ = sender.send(Packet::Close);
        }
    }
}
