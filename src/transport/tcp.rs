//! TCP transport implementation.
//!
//! Accepting is event-driven: the listening socket is registered with a mio
//! poll next to a waker, so closing the listener from another thread ends a
//! blocked accept immediately. Accepted and connected streams are
//! non-blocking. Each read loop waits on its own poll, and all sinks share
//! one write poller that wakes a sink's queue once a stalled peer starts
//! reading again, so a dispatcher worker never waits on a socket.

use super::{
    Acceptor, Channel, Endpoint, FrameSink, FrameSource, Listener, ListenerCloser, SendProgress, TransportImpl,
    WritableHook,
};
use crate::error::Error;
use crate::frame::{decode_frame, encode_frame_into, MessageFrame};

use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

// Internal constants for the accept and read polls
const LISTENER_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);
const READ_TOKEN: Token = Token(0);
const POLL_CAPACITY: usize = 16;
const READ_CHUNK_SIZE: usize = 64 * 1024;

// Pause between refused connect attempts while the deadline allows retrying.
const CONNECT_RETRY_MIN: Duration = Duration::from_millis(10);
const CONNECT_RETRY_MAX: Duration = Duration::from_millis(200);

pub(super) struct TcpTransport {
    max_frame_size: usize,
}

impl TcpTransport {
    pub(super) fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    fn channel(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<Channel, Error> {
        stream.set_nodelay(true)?;
        // Applies to every handle cloned below.
        stream.set_nonblocking(true)?;

        let mut reader = mio::net::TcpStream::from_std(stream.try_clone()?);
        let poll = Poll::new()?;
        poll.registry().register(&mut reader, READ_TOKEN, Interest::READABLE)?;

        let poller = WritePoller::global()?;
        let writer = mio::net::TcpStream::from_std(stream.try_clone()?);

        Ok(Channel {
            source: Box::new(TcpSource {
                stream: reader,
                poll,
                events: Events::with_capacity(POLL_CAPACITY),
                buf: Vec::new(),
                chunk: vec![0; READ_CHUNK_SIZE],
                timeout: None,
                max_frame_size: self.max_frame_size,
            }),
            sink: Arc::new(TcpSink {
                state: Mutex::new(SinkState {
                    stream: writer,
                    pending: Vec::new(),
                    armed: false,
                }),
                control: stream,
                closed: AtomicBool::new(false),
                poller,
                token: poller.next_token(),
            }),
            peer: peer_addr.to_string(),
        })
    }

    // One pass over the resolved addresses, bounded by `deadline`.
    fn try_connect(addrs: &[SocketAddr], deadline: Option<Instant>) -> io::Result<(TcpStream, SocketAddr)> {
        let mut last_err = None;
        for &addr in addrs {
            let attempt = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ErrorKind::TimedOut.into());
                    }
                    TcpStream::connect_timeout(&addr, remaining)
                }
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => return Ok((stream, addr)),
                Err(err) => {
                    debug!(%addr, ?err, "Connect attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ErrorKind::AddrNotAvailable.into()))
    }
}

impl TransportImpl for TcpTransport {
    #[instrument(skip(self), fields(endpoint = %endpoint))]
    fn bind_impl(&self, endpoint: &Endpoint) -> Result<Listener, Error> {
        let requested_addr = resolve(endpoint)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidEndpoint(endpoint.to_string()))?;

        let listener = TcpListener::bind(requested_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        // The poll watches a duplicate of the socket; accepting happens on the
        // std handle so accepted streams come out as std streams.
        let mut watched = mio::net::TcpListener::from_std(listener.try_clone()?);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut watched, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let closed = Arc::new(AtomicBool::new(false));

        info!(%local_addr, "Listening for connections");

        Ok(Listener {
            endpoint: Endpoint::tcp(local_addr.to_string()),
            acceptor: Box::new(TcpAcceptor {
                transport: TcpTransport::new(self.max_frame_size),
                listener,
                _watched: watched,
                poll,
                closed: closed.clone(),
            }),
            closer: Arc::new(TcpListenerCloser { waker, closed }),
        })
    }

    #[instrument(skip(self), fields(endpoint = %endpoint))]
    fn connect_impl(&self, endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Channel, Error> {
        let addrs = resolve(endpoint)?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut backoff = CONNECT_RETRY_MIN;

        loop {
            let err = match Self::try_connect(&addrs, deadline) {
                Ok((stream, addr)) => {
                    let local_addr = stream.local_addr()?;
                    info!(%local_addr, peer_addr = %addr, "Connected");
                    return self.channel(stream, addr);
                }
                Err(err) => err,
            };

            let timed_out = matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock);
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            match remaining {
                _ if timed_out => {}
                Some(remaining) if remaining.is_zero() => {}
                // Nobody is listening yet. Keep trying until the deadline.
                Some(remaining) if err.kind() == ErrorKind::ConnectionRefused => {
                    trace!(?backoff, "Connection refused, retrying");
                    thread::sleep(backoff.min(remaining));
                    backoff = (backoff * 2).min(CONNECT_RETRY_MAX);
                    continue;
                }
                _ => {
                    return Err(Error::Connection {
                        endpoint: endpoint.to_string(),
                        reason: err.to_string(),
                    })
                }
            }
            return Err(Error::ConnectTimeout {
                endpoint: endpoint.to_string(),
            });
        }
    }
}

fn resolve(endpoint: &Endpoint) -> Result<Vec<SocketAddr>, Error> {
    let addrs: Vec<SocketAddr> = endpoint
        .address()
        .to_socket_addrs()
        .map_err(|_| Error::InvalidEndpoint(endpoint.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(addrs)
}

// ============================================================================
// Listener
// ============================================================================

struct TcpAcceptor {
    transport: TcpTransport,
    listener: TcpListener,
    _watched: mio::net::TcpListener,
    poll: Poll,
    closed: Arc<AtomicBool>,
}

impl Acceptor for TcpAcceptor {
    fn accept(&mut self) -> Result<Option<Channel>, Error> {
        let mut events = Events::with_capacity(POLL_CAPACITY);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }

            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    info!(%peer_addr, "Accepted connection");
                    return self.transport.channel(stream, peer_addr).map(Some);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Per-connection failures (peer reset before accept) must
                    // not take the listener down.
                    warn!(?err, "Accept failed");
                    continue;
                }
            }

            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    trace!("Accept poll woken");
                }
            }
        }
    }
}

struct TcpListenerCloser {
    waker: Arc<Waker>,
    closed: Arc<AtomicBool>,
}

impl ListenerCloser for TcpListenerCloser {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.waker.wake() {
                warn!(?err, "Failed to wake accept poll");
            }
        }
    }
}

// ============================================================================
// Channel
// ============================================================================

struct TcpSource {
    stream: mio::net::TcpStream,
    poll: Poll,
    events: Events,
    // Received bytes not yet decoded into a frame.
    buf: Vec<u8>,
    chunk: Vec<u8>,
    timeout: Option<Duration>,
    max_frame_size: usize,
}

impl TcpSource {
    fn wait_readable(&mut self) -> Result<(), Error> {
        loop {
            match self.poll.poll(&mut self.events, self.timeout) {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        if self.events.is_empty() && self.timeout.is_some() {
            return Err(Error::Io(ErrorKind::TimedOut.into()));
        }
        Ok(())
    }
}

impl FrameSource for TcpSource {
    fn recv(&mut self) -> Result<Option<MessageFrame>, Error> {
        loop {
            if let Some((frame, consumed)) = decode_frame(&self.buf, self.max_frame_size)? {
                self.buf.drain(..consumed);
                return Ok(Some(frame));
            }
            match self.stream.read(&mut self.chunk) {
                Ok(0) if self.buf.is_empty() => return Ok(None),
                Ok(0) => {
                    return Err(Error::Framing(format!(
                        "stream closed inside a frame, {} bytes buffered",
                        self.buf.len()
                    )))
                }
                Ok(n) => self.buf.extend_from_slice(&self.chunk[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => self.wait_readable()?,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        self.timeout = timeout;
        Ok(())
    }
}

struct TcpSink {
    state: Mutex<SinkState>,
    // Separate handle so close never waits on the state lock.
    control: TcpStream,
    closed: AtomicBool,
    poller: &'static WritePoller,
    token: Token,
}

struct SinkState {
    stream: mio::net::TcpStream,
    // Encoded bytes the peer has not taken yet.
    pending: Vec<u8>,
    // Registered with the write poller.
    armed: bool,
}

impl SinkState {
    // Writes as much of `pending` as the socket takes. Returns true once
    // nothing is left.
    fn flush(&mut self) -> io::Result<bool> {
        let mut written = 0;
        let result = loop {
            if written == self.pending.len() {
                break Ok(true);
            }
            match self.stream.write(&self.pending[written..]) {
                Ok(0) => break Err(ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                // Socket buffer is full, come back when the poller says so.
                Err(err) if err.kind() == ErrorKind::WouldBlock => break Ok(false),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => break Err(err),
            }
        };
        self.pending.drain(..written);
        result
    }
}

impl TcpSink {
    fn arm(&self, state: &mut SinkState) -> Result<(), Error> {
        let registry = &self.poller.registry;
        if state.armed {
            registry.reregister(&mut state.stream, self.token, Interest::WRITABLE)?;
        } else {
            registry.register(&mut state.stream, self.token, Interest::WRITABLE)?;
            state.armed = true;
        }
        Ok(())
    }
}

impl FrameSink for TcpSink {
    fn send(&self, frames: &[MessageFrame]) -> Result<SendProgress, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Io(ErrorKind::BrokenPipe.into()));
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for frame in frames {
            encode_frame_into(frame, &mut state.pending)?;
        }
        if state.flush()? {
            return Ok(SendProgress::Complete);
        }
        self.arm(&mut state)?;
        trace!(token = self.token.0, pending = state.pending.len(), "Send blocked");
        Ok(SendProgress::Blocked)
    }

    fn set_writable_hook(&self, hook: WritableHook) {
        self.poller.set_hook(self.token, hook);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.control.shutdown(Shutdown::Both) {
            Ok(()) => debug!("Shut down stream"),
            // Already gone on the peer side.
            Err(err) if err.kind() == ErrorKind::NotConnected => {}
            Err(err) => warn!(?err, "Error shutting down stream"),
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.armed {
            if let Err(err) = self.poller.registry.deregister(&mut state.stream) {
                debug!(?err, "Failed to deregister stream from write poller");
            }
            state.armed = false;
        }
        let dropped = state.pending.len();
        state.pending.clear();
        drop(state);
        if dropped > 0 {
            debug!(dropped, "Dropped unwritten bytes on close");
        }
        self.poller.remove_hook(self.token);
    }
}

impl Drop for TcpSink {
    fn drop(&mut self) {
        self.poller.remove_hook(self.token);
    }
}

// ============================================================================
// Write Poller
// ============================================================================

type HookMap = Mutex<HashMap<Token, WritableHook>>;

// Process-wide writability watch shared by every TCP sink. The poll thread
// only runs hooks; the writing itself happens back on a dispatcher worker.
struct WritePoller {
    registry: Registry,
    hooks: Arc<HookMap>,
    next_token: AtomicUsize,
}

static WRITE_POLLER: OnceLock<WritePoller> = OnceLock::new();
static WRITE_POLLER_INIT: Mutex<()> = Mutex::new(());

impl WritePoller {
    fn global() -> Result<&'static Self, Error> {
        if let Some(poller) = WRITE_POLLER.get() {
            return Ok(poller);
        }
        let _init = WRITE_POLLER_INIT.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(poller) = WRITE_POLLER.get() {
            return Ok(poller);
        }
        let poller = Self::start()?;
        Ok(WRITE_POLLER.get_or_init(|| poller))
    }

    fn start() -> Result<Self, Error> {
        let mut poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let hooks: Arc<HookMap> = Arc::default();
        let watched = hooks.clone();
        thread::Builder::new()
            .name("relaymq-tcp-writable".to_string())
            .spawn(move || run_write_poll(&mut poll, &watched))?;
        debug!("Started TCP write poller");
        Ok(Self {
            registry,
            hooks,
            next_token: AtomicUsize::new(0),
        })
    }

    fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn set_hook(&self, token: Token, hook: WritableHook) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, hook);
    }

    fn remove_hook(&self, token: Token) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token);
    }
}

fn run_write_poll(poll: &mut Poll, hooks: &HookMap) {
    let mut events = Events::with_capacity(POLL_CAPACITY);
    loop {
        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                error!(?err, "TCP write poll failed, blocked sends will not resume");
                return;
            }
        }
        for event in events.iter() {
            // Errors and hang-ups wake the writer too; its next send fails.
            let hook = hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&event.token())
                .cloned();
            if let Some(hook) = hook {
                trace!(token = event.token().0, "Sink writable");
                hook();
            }
        }
    }
}
