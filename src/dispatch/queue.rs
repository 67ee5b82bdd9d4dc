use super::Shared;
use crate::error::Error;
use crate::frame::MessageFrame;
use crate::transport::{FrameSink, SendProgress};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use tracing::{debug, trace, warn};

/// Identity of a queue within its dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub(super) u64);

type FailureHook = Box<dyn Fn(&Error) + Send + Sync>;

// Internal state guarded by one lock so that "frames pending" and "scheduled
// with the dispatcher" can never disagree.
#[derive(Default)]
struct QueueState {
    frames: VecDeque<MessageFrame>,
    scheduled: bool,
    // Scheduled but off the ready list until the sink is writable again.
    parked: bool,
    // The sink reported writable while the queue was not parked.
    writable: bool,
    disposed: bool,
}

/// Per-connection outbound queue.
///
/// Producers on any thread call [`MessageQueue::add`]; the call only pushes
/// onto an in-memory deque and, when the queue was idle, hands its id to the
/// dispatcher. The dispatcher's workers do all writing, one worker per queue
/// at a time.
pub struct MessageQueue {
    id: QueueId,
    sink: Arc<dyn FrameSink>,
    state: Mutex<QueueState>,
    dispatcher: Weak<Shared>,
    on_failure: OnceLock<FailureHook>,
}

impl MessageQueue {
    pub(super) fn new(id: QueueId, sink: Arc<dyn FrameSink>, dispatcher: Weak<Shared>) -> Self {
        Self {
            id,
            sink,
            state: Mutex::new(QueueState::default()),
            dispatcher,
            on_failure: OnceLock::new(),
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Appends one frame. Never blocks on I/O.
    ///
    /// Returns `false` if the queue was already disposed; the frame is dropped.
    pub fn add(&self, frame: MessageFrame) -> bool {
        self.add_range(std::iter::once(frame))
    }

    /// Appends frames in order as a single unit.
    ///
    /// Returns `false` if the queue was already disposed.
    pub fn add_range<I>(&self, frames: I) -> bool
    where
        I: IntoIterator<Item = MessageFrame>,
    {
        let wake = {
            let mut state = self.lock_state();
            if state.disposed {
                trace!(queue = self.id.0, "Dropping frames for disposed queue");
                return false;
            }
            let before = state.frames.len();
            state.frames.extend(frames);
            if state.frames.len() == before || state.scheduled {
                false
            } else {
                state.scheduled = true;
                true
            }
        };

        if wake {
            self.frames_added();
        }
        true
    }

    /// Number of frames waiting to be written.
    pub fn len(&self) -> usize {
        self.lock_state().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.lock_state().disposed
    }

    /// Drops pending frames and unregisters from the dispatcher. Idempotent.
    pub fn dispose(&self) {
        let dropped = {
            let mut state = self.lock_state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let dropped = state.frames.len();
            state.frames.clear();
            dropped
        };
        if dropped > 0 {
            debug!(queue = self.id.0, dropped, "Dropped pending frames on dispose");
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unregister(self.id);
        }
    }

    /// Installs the callback run when a write on this queue's sink fails.
    pub(crate) fn set_failure_hook(&self, hook: impl Fn(&Error) + Send + Sync + 'static) {
        if self.on_failure.set(Box::new(hook)).is_err() {
            warn!(queue = self.id.0, "Failure hook already installed");
        }
    }

    // ============================================================================
    // Dispatcher Side
    // ============================================================================

    // "Added" notification: the queue went from idle to pending, or from
    // parked to writable.
    fn frames_added(&self) {
        match self.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.schedule(self.id),
            None => warn!(queue = self.id.0, "Dispatcher gone, frames will not be sent"),
        }
    }

    pub(super) fn take_batch(&self, max: usize) -> Vec<MessageFrame> {
        let mut state = self.lock_state();
        let n = state.frames.len().min(max);
        state.frames.drain(..n).collect()
    }

    // Ends a worker's visit. Returns true if the queue must go back on the
    // ready list because frames arrived meanwhile.
    pub(super) fn finish_batch(&self) -> bool {
        let mut state = self.lock_state();
        if state.disposed || state.frames.is_empty() {
            state.scheduled = false;
            false
        } else {
            true
        }
    }

    // Ends a visit whose write blocked. Returns true if the sink already
    // became writable again and the queue must go straight back on the
    // ready list.
    pub(super) fn park(&self) -> bool {
        let mut state = self.lock_state();
        if state.disposed {
            state.scheduled = false;
            return false;
        }
        if std::mem::take(&mut state.writable) {
            return true;
        }
        state.parked = true;
        trace!(queue = self.id.0, pending = state.frames.len(), "Parked on blocked sink");
        false
    }

    // Writable hook target: puts a parked queue back on the ready list.
    pub(super) fn resume(&self) {
        let wake = {
            let mut state = self.lock_state();
            if state.disposed {
                return;
            }
            if state.parked {
                state.parked = false;
                true
            } else {
                state.writable = true;
                false
            }
        };
        if wake {
            self.frames_added();
        }
    }

    pub(super) fn write(&self, frames: &[MessageFrame]) -> Result<SendProgress, Error> {
        self.sink.send(frames)
    }

    pub(super) fn fail(&self, err: &Error) {
        warn!(queue = self.id.0, %err, "Write failed, disposing queue");
        self.dispose();
        if let Some(hook) = self.on_failure.get() {
            hook(err);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}
