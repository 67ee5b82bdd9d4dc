//! Request/response over a single connection.
//!
//! Frames carry no correlation id. Each requester connection keeps a FIFO
//! of pending requests; a responder answers requests on a connection in the
//! order they arrived, and every response completes the oldest pending
//! request. Cancelling or timing out a request does not remove its slot:
//! the response still arrives and is discarded when it reaches the front,
//! which keeps later requests paired with their own responses.

use crate::connection::{Connection, FrameHandler};
use crate::engine::Engine;
use crate::error::{Error, RequestError};
use crate::events::{ConnectionInfo, Subscription};
use crate::frame::MessageFrame;
use crate::message::{deserialize_message, serialize_message, Message, MessageRegistry};
use crate::node::{Client, Server, ServerBehavior};
use crate::role::NodeRole;
use crate::transport::{Endpoint, IntoEndpoint};

use futures::channel::oneshot;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

type Response = Result<Box<dyn Message>, RequestError>;

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation signal for asynchronous requests.
///
/// Clones share the same state. Once cancelled, a token stays cancelled.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    // One slot per watching future, removed when that future completes.
    wakers: Mutex<HashMap<u64, Waker>>,
    next_slot: AtomicU64,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token and wakes every future watching it.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let wakers = std::mem::take(&mut *self.lock_wakers());
        for waker in wakers.into_values() {
            waker.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancels the token once `delay` has passed.
    pub fn cancel_after(&self, delay: Duration) {
        let token = self.clone();
        let spawned = thread::Builder::new()
            .name("relaymq-cancel-timer".to_string())
            .spawn(move || {
                thread::sleep(delay);
                token.cancel();
            });
        if let Err(err) = spawned {
            warn!(%err, "Failed to start cancel timer, cancelling now");
            self.cancel();
        }
    }

    // Stores `waker` in `slot`, allocating the slot on first use. Returns
    // true if already cancelled.
    fn register(&self, slot: &mut Option<u64>, waker: &Waker) -> bool {
        let mut wakers = self.lock_wakers();
        if self.is_cancelled() {
            return true;
        }
        let id = *slot.get_or_insert_with(|| self.inner.next_slot.fetch_add(1, Ordering::Relaxed));
        let stored = wakers.entry(id).or_insert_with(|| waker.clone());
        if !stored.will_wake(waker) {
            *stored = waker.clone();
        }
        false
    }

    fn unregister(&self, slot: u64) {
        self.lock_wakers().remove(&slot);
    }

    #[cfg(test)]
    fn watcher_count(&self) -> usize {
        self.lock_wakers().len()
    }

    fn lock_wakers(&self) -> MutexGuard<'_, HashMap<u64, Waker>> {
        self.inner.wakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// Pending Requests
// ============================================================================

// Where a response goes once it reaches the front of the FIFO. A dropped
// receiving side means the caller gave up; the response is discarded.
enum Completion {
    Async(oneshot::Sender<Response>),
    Blocking(SyncSender<Response>),
}

impl Completion {
    fn complete(self, response: Response) {
        let delivered = match self {
            Completion::Async(sender) => sender.send(response).is_ok(),
            Completion::Blocking(sender) => sender.try_send(response).is_ok(),
        };
        if !delivered {
            debug!("Discarding response for abandoned request");
        }
    }
}

#[derive(Default)]
struct PendingState {
    entries: VecDeque<Completion>,
    closed: bool,
}

/// Per-connection FIFO of outstanding requests.
pub(crate) struct PendingRequests {
    registry: MessageRegistry,
    state: Mutex<PendingState>,
}

impl PendingRequests {
    fn new(registry: &MessageRegistry) -> Self {
        Self {
            registry: registry.clone(),
            state: Mutex::new(PendingState::default()),
        }
    }

    // Appends the completion and enqueues the frame under one lock, so slot
    // order always equals wire order even with concurrent callers.
    fn submit(
        &self,
        connection: &Connection,
        frame: MessageFrame,
        completion: Completion,
    ) -> Result<(), RequestError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(RequestError::ConnectionClosed);
        }
        state.entries.push_back(completion);
        if !connection.send(frame) {
            state.entries.pop_back();
            return Err(RequestError::ConnectionClosed);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameHandler for PendingRequests {
    fn on_frame(&self, connection: &Arc<Connection>, frame: MessageFrame) {
        let Some(completion) = self.lock_state().entries.pop_front() else {
            warn!(id = connection.id(), type_id = frame.type_id(), "Response with no pending request");
            return;
        };
        let response = deserialize_message(&frame, &self.registry)
            .map_err(|err| RequestError::Deserialize(err.to_string()));
        completion.complete(response);
    }

    fn on_disconnected(&self, connection: &Arc<Connection>) {
        let abandoned = {
            let mut state = self.lock_state();
            state.closed = true;
            std::mem::take(&mut state.entries)
        };
        if !abandoned.is_empty() {
            debug!(id = connection.id(), count = abandoned.len(), "Failing pending requests");
        }
        for completion in abandoned {
            completion.complete(Err(RequestError::ConnectionClosed));
        }
    }
}

// ============================================================================
// Response Future
// ============================================================================

// A future's registration with its token, released when the future
// completes or is dropped.
struct CancelWatch {
    token: CancellationToken,
    slot: Option<u64>,
}

impl CancelWatch {
    fn new(token: CancellationToken) -> Self {
        Self { token, slot: None }
    }

    fn poll_cancelled(&mut self, waker: &Waker) -> bool {
        self.token.register(&mut self.slot, waker)
    }
}

impl Drop for CancelWatch {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.token.unregister(slot);
        }
    }
}

/// Future resolving to the response of an asynchronous request.
///
/// Resolves to [`RequestError::Cancelled`] as soon as its cancellation token
/// fires, unless the response has already arrived.
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture {
    state: FutureState,
    cancel: Option<CancelWatch>,
}

enum FutureState {
    Failed(RequestError),
    Waiting(oneshot::Receiver<Response>),
    Done,
}

impl ResponseFuture {
    fn waiting(receiver: oneshot::Receiver<Response>, cancel: Option<CancellationToken>) -> Self {
        Self {
            state: FutureState::Waiting(receiver),
            cancel: cancel.map(CancelWatch::new),
        }
    }

    fn failed(err: RequestError) -> Self {
        Self {
            state: FutureState::Failed(err),
            cancel: None,
        }
    }

    /// Blocks the current thread until the future resolves.
    pub fn wait(self) -> Response {
        futures::executor::block_on(self)
    }
}

impl Future for ResponseFuture {
    type Output = Response;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let response = match std::mem::replace(&mut this.state, FutureState::Done) {
            FutureState::Failed(err) => Err(err),
            FutureState::Done => Err(RequestError::ConnectionClosed),
            FutureState::Waiting(mut receiver) => match Pin::new(&mut receiver).poll(cx) {
                Poll::Ready(Ok(response)) => response,
                Poll::Ready(Err(oneshot::Canceled)) => Err(RequestError::ConnectionClosed),
                Poll::Pending => {
                    let cancelled = this
                        .cancel
                        .as_mut()
                        .is_some_and(|watch| watch.poll_cancelled(cx.waker()));
                    if !cancelled {
                        this.state = FutureState::Waiting(receiver);
                        return Poll::Pending;
                    }
                    trace!("Request cancelled");
                    Err(RequestError::Cancelled)
                }
            },
        };
        this.cancel = None;
        Poll::Ready(response)
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            FutureState::Failed(_) => "failed",
            FutureState::Waiting(_) => "waiting",
            FutureState::Done => "done",
        };
        f.debug_struct("ResponseFuture").field("state", &state).finish()
    }
}

/// Downcasts a response to its concrete type.
pub fn downcast_response<T: Message>(response: Box<dyn Message>) -> Result<T, RequestError> {
    response
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| RequestError::WrongResponseType {
            expected: std::any::type_name::<T>(),
        })
}

// ============================================================================
// Requester
// ============================================================================

/// Connecting node that sends requests and waits for their responses.
///
/// Any number of requests may be outstanding at once, from any threads.
/// Responses are matched to requests purely by order.
///
/// # Example
///
/// ```no_run
/// # use relaymq::{Engine, MessageRegistry, Requester};
/// # #[derive(Debug)] struct Ping;
/// # relaymq::impl_message!(Ping, 1);
/// # let engine = Engine::new(&config::Config::default(), &MessageRegistry::new())?;
/// let requester = Requester::new(&engine);
/// requester.connect("tcp://127.0.0.1:5556")?;
/// let response = requester.request(&Ping);
/// # Ok::<(), relaymq::Error>(())
/// ```
pub struct Requester {
    client: Client<PendingRequests>,
}

impl Requester {
    pub fn new(engine: &Engine) -> Self {
        Self {
            client: Client::new(engine, NodeRole::Requester),
        }
    }

    /// Connects using the configured connect timeout.
    pub fn connect(&self, endpoint: impl IntoEndpoint) -> Result<(), Error> {
        self.connect_timeout(endpoint, self.client.engine().settings().connect_timeout)
    }

    /// Connects, waiting at most `timeout` (`None` waits forever).
    pub fn connect_timeout(&self, endpoint: impl IntoEndpoint, timeout: Option<Duration>) -> Result<(), Error> {
        let pending = Arc::new(PendingRequests::new(self.client.engine().registry()));
        self.client.connect(endpoint, timeout, pending)
    }

    /// Disconnects; every pending request fails with
    /// [`RequestError::ConnectionClosed`].
    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    pub fn is_disconnected(&self) -> bool {
        self.client.is_disconnected()
    }

    /// Number of requests still waiting for a response, including abandoned
    /// ones whose response has not arrived yet.
    pub fn pending_count(&self) -> usize {
        self.client.session().map_or(0, |s| s.handler.len())
    }

    /// Sends `request` and blocks for the response, up to the configured
    /// request timeout.
    pub fn request(&self, request: &dyn Message) -> Response {
        self.request_timeout(request, self.client.engine().settings().request_timeout)
    }

    /// Sends `request` and blocks for the response, up to `timeout`
    /// (`None` waits forever).
    ///
    /// On timeout the connection stays up; the late response is discarded.
    #[instrument(skip(self, request), fields(type_id = request.message_type_id()))]
    pub fn request_timeout(&self, request: &dyn Message, timeout: Option<Duration>) -> Response {
        let (sender, receiver) = mpsc::sync_channel(1);
        self.submit(request, Completion::Blocking(sender))?;

        match timeout {
            Some(timeout) => receiver.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => {
                    debug!(?timeout, "Request timed out");
                    RequestError::Timeout
                }
                RecvTimeoutError::Disconnected => RequestError::ConnectionClosed,
            })?,
            None => receiver.recv().map_err(|_| RequestError::ConnectionClosed)?,
        }
    }

    /// Like [`Requester::request`], downcasting the response to `T`.
    pub fn request_as<T: Message>(&self, request: &dyn Message) -> Result<T, RequestError> {
        downcast_response(self.request(request)?)
    }

    /// Sends `request` and returns a future for the response.
    ///
    /// The request is on the wire's queue when this returns. Cancelling
    /// through `cancel` resolves the future with
    /// [`RequestError::Cancelled`]; the connection stays usable.
    #[instrument(skip(self, request, cancel), fields(type_id = request.message_type_id()))]
    pub fn request_async(&self, request: &dyn Message, cancel: Option<CancellationToken>) -> ResponseFuture {
        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return ResponseFuture::failed(RequestError::Cancelled);
        }
        let (sender, receiver) = oneshot::channel();
        match self.submit(request, Completion::Async(sender)) {
            Ok(()) => ResponseFuture::waiting(receiver, cancel),
            Err(err) => ResponseFuture::failed(err),
        }
    }

    pub fn on_disconnected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.client.on_disconnected(listener)
    }

    fn submit(&self, request: &dyn Message, completion: Completion) -> Result<(), RequestError> {
        let session = self.client.session().ok_or(RequestError::NotConnected)?;
        let frame = serialize_message(request, self.client.engine().registry())
            .map_err(|err| RequestError::Serialize(err.to_string()))?;
        session.handler.submit(&session.connection, frame, completion)
    }
}

impl std::fmt::Debug for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requester")
            .field("disconnected", &self.is_disconnected())
            .field("pending", &self.pending_count())
            .finish()
    }
}

// ============================================================================
// Responder
// ============================================================================

/// Produces the response for one request.
///
/// Called on the requesting connection's read loop: requests from one
/// requester are handled one at a time, in arrival order, while different
/// requesters are served concurrently.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Box<dyn Message>) -> Box<dyn Message>;
}

impl<F> RequestHandler for F
where
    F: Fn(Box<dyn Message>) -> Box<dyn Message> + Send + Sync + 'static,
{
    fn handle(&self, request: Box<dyn Message>) -> Box<dyn Message> {
        self(request)
    }
}

/// Listening node that answers every request with exactly one response.
pub struct Responder {
    server: Server<ResponderBehavior>,
}

struct ResponderBehavior {
    registry: MessageRegistry,
    handler: Box<dyn RequestHandler>,
}

impl ServerBehavior for ResponderBehavior {
    fn on_frame(&self, connection: &Arc<Connection>, frame: MessageFrame) {
        // Without a response the requester's FIFO would shift by one, so a
        // request we cannot answer ends the connection.
        let request = match deserialize_message(&frame, &self.registry) {
            Ok(request) => request,
            Err(err) => {
                warn!(id = connection.id(), %err, "Undecodable request, disconnecting");
                connection.disconnect();
                return;
            }
        };

        let response = self.handler.handle(request);
        match serialize_message(response.as_ref(), &self.registry) {
            Ok(frame) => {
                if !connection.send(frame) {
                    trace!(id = connection.id(), "Requester gone, response dropped");
                }
            }
            Err(err) => {
                warn!(id = connection.id(), %err, "Unserializable response, disconnecting");
                connection.disconnect();
            }
        }
    }
}

impl Responder {
    pub fn new(engine: &Engine, handler: impl RequestHandler) -> Self {
        let behavior = ResponderBehavior {
            registry: engine.registry().clone(),
            handler: Box::new(handler),
        };
        Self {
            server: Server::new(engine, NodeRole::Responder, behavior),
        }
    }

    /// Starts listening; returns the endpoint actually bound.
    pub fn bind(&self, endpoint: impl IntoEndpoint) -> Result<Endpoint, Error> {
        self.server.bind(endpoint)
    }

    /// Stops listening on `endpoint`; existing requesters stay connected.
    pub fn unbind(&self, endpoint: impl IntoEndpoint) -> Result<bool, Error> {
        self.server.unbind(endpoint)
    }

    /// Stops all listeners and disconnects all requesters.
    pub fn close(&self) {
        self.server.close();
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.server.endpoints()
    }

    pub fn client_count(&self) -> usize {
        self.server.client_count()
    }

    pub fn on_client_connected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.server.on_client_connected(listener)
    }

    pub fn on_client_disconnected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.server.on_client_disconnected(listener)
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("endpoints", &self.endpoints())
            .field("clients", &self.client_count())
            .finish()
    }
}
