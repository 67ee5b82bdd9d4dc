//! Outbound queueing and the shared dispatcher that drains it.
//!
//! Every connection owns one [`MessageQueue`]. A [`QueueDispatcher`] runs a
//! fixed number of worker threads, independent of how many connections
//! exist. Queues with pending frames sit on a FIFO ready list; a worker takes
//! the queue at the front, writes at most `max_batch_size` frames, and puts
//! the queue at the back if more are pending. Each pending queue is therefore
//! revisited after at most one visit to every other pending queue, and a queue
//! is never on the ready list twice, so only one worker writes it at a time.
//!
//! Sinks never wait on a slow peer. A write that cannot finish leaves the
//! queue parked off the ready list until the sink reports it writable, and
//! the worker moves on to the next queue.

mod queue;

pub use queue::{MessageQueue, QueueId};

use crate::error::Error;
use crate::transport::{FrameSink, SendProgress};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace};

// Internal state shared with the workers and, weakly, with every queue.
pub(crate) struct Shared {
    // Registration set. Separate lock from the ready list so connection
    // setup and teardown never stall a drain.
    queues: Mutex<HashMap<QueueId, Arc<MessageQueue>>>,
    ready: Mutex<ReadyList>,
    wake: Condvar,
    next_id: AtomicU64,
    max_batch_size: usize,
}

#[derive(Default)]
struct ReadyList {
    ids: VecDeque<QueueId>,
    shutdown: bool,
}

impl Shared {
    fn lock_queues(&self) -> MutexGuard<'_, HashMap<QueueId, Arc<MessageQueue>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_ready(&self) -> MutexGuard<'_, ReadyList> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn schedule(&self, id: QueueId) {
        let mut ready = self.lock_ready();
        if ready.shutdown {
            return;
        }
        ready.ids.push_back(id);
        drop(ready);
        self.wake.notify_one();
    }

    pub(crate) fn unregister(&self, id: QueueId) {
        if self.lock_queues().remove(&id).is_some() {
            debug!(queue = id.0, "Unregistered queue");
        }
    }

    fn next_ready(&self) -> Option<QueueId> {
        let mut ready = self.lock_ready();
        loop {
            if ready.shutdown {
                return None;
            }
            if let Some(id) = ready.ids.pop_front() {
                return Some(id);
            }
            ready = self.wake.wait(ready).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Shared pool of writer threads draining all registered message queues.
///
/// Owned by whatever creates the nodes (see [`Engine`](crate::Engine)) and
/// shut down when dropped.
pub struct QueueDispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueDispatcher {
    /// Starts `workers` writer threads (at least one).
    pub fn new(workers: usize, max_batch_size: usize) -> Result<Self, Error> {
        let shared = Arc::new(Shared {
            queues: Mutex::new(HashMap::new()),
            ready: Mutex::new(ReadyList::default()),
            wake: Condvar::new(),
            next_id: AtomicU64::new(1),
            max_batch_size: max_batch_size.max(1),
        });

        let count = workers.max(1);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("relaymq-dispatch-{index}"))
                .spawn(move || worker_loop(&shared, index))?;
            handles.push(handle);
        }
        info!(workers = count, max_batch_size, "Started queue dispatcher");

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
        })
    }

    /// Creates a queue writing to `sink` and registers it.
    pub(crate) fn create_queue(&self, sink: Arc<dyn FrameSink>) -> Arc<MessageQueue> {
        let id = QueueId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(MessageQueue::new(id, sink.clone(), Arc::downgrade(&self.shared)));
        let parked = Arc::downgrade(&queue);
        sink.set_writable_hook(Arc::new(move || {
            if let Some(queue) = parked.upgrade() {
                queue.resume();
            }
        }));
        self.register(queue.clone());
        queue
    }

    /// Adds a queue to the registration set. Re-registering is harmless.
    pub fn register(&self, queue: Arc<MessageQueue>) {
        let id = queue.id();
        let pending = !queue.is_empty();
        self.shared.lock_queues().insert(id, queue);
        debug!(queue = id.0, "Registered queue");
        if pending {
            self.shared.schedule(id);
        }
    }

    /// Removes a queue from the registration set. Its frames stay unsent.
    pub fn unregister(&self, id: QueueId) {
        self.shared.unregister(id);
    }

    /// Number of registered queues.
    pub fn queue_count(&self) -> usize {
        self.shared.lock_queues().len()
    }

    /// Stops the workers and waits for them. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut ready = self.shared.lock_ready();
            if ready.shutdown {
                return;
            }
            ready.shutdown = true;
            ready.ids.clear();
        }
        self.shared.wake.notify_all();

        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = thread::current().id();
        for handle in handles {
            // A worker can end up dropping the last owner; it must not join itself.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        info!("Queue dispatcher stopped");
    }
}

impl Drop for QueueDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for QueueDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDispatcher")
            .field("queues", &self.queue_count())
            .finish()
    }
}

fn worker_loop(shared: &Shared, index: usize) {
    trace!(worker = index, "Dispatcher worker started");
    while let Some(id) = shared.next_ready() {
        let Some(queue) = shared.lock_queues().get(&id).cloned() else {
            // Unregistered while waiting on the ready list.
            continue;
        };

        // An empty batch still flushes what a blocked write left behind.
        let batch = queue.take_batch(shared.max_batch_size);
        match queue.write(&batch) {
            Ok(SendProgress::Complete) => {
                trace!(worker = index, queue = id.0, frames = batch.len(), "Wrote batch");
            }
            Ok(SendProgress::Blocked) => {
                if queue.park() {
                    shared.schedule(id);
                }
                continue;
            }
            Err(err) => {
                queue.fail(&err);
                continue;
            }
        }

        if queue.finish_batch() {
            shared.schedule(id);
        }
    }
    trace!(worker = index, "Dispatcher worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MessageFrame;
    use crate::transport::WritableHook;
    use std::sync::mpsc::{channel, Sender};
    use std::time::{Duration, Instant};

    // Records which sink wrote which frame, optionally stalling on a gate.
    struct RecordingSink {
        name: &'static str,
        log: Sender<(&'static str, u16)>,
        gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
    }

    impl FrameSink for RecordingSink {
        fn send(&self, frames: &[MessageFrame]) -> Result<SendProgress, Error> {
            if let Some(gate) = self.gate.lock().unwrap().as_ref() {
                let _ = gate.recv();
            }
            for frame in frames {
                let _ = self.log.send((self.name, frame.type_id()));
            }
            Ok(SendProgress::Complete)
        }

        fn close(&self) {}
    }

    struct FailingSink;

    impl FrameSink for FailingSink {
        fn send(&self, _frames: &[MessageFrame]) -> Result<SendProgress, Error> {
            Err(Error::Io(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn close(&self) {}
    }

    // Holds frames back and reports Blocked until released, like a socket
    // whose peer stopped reading.
    struct StallingSink {
        log: Sender<(&'static str, u16)>,
        attempts: Sender<()>,
        held: Mutex<(bool, Vec<u16>)>,
        hook: Mutex<Option<WritableHook>>,
    }

    impl StallingSink {
        fn release(&self) {
            self.held.lock().unwrap().0 = false;
            let hook = self.hook.lock().unwrap().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    impl FrameSink for StallingSink {
        fn send(&self, frames: &[MessageFrame]) -> Result<SendProgress, Error> {
            let mut held = self.held.lock().unwrap();
            held.1.extend(frames.iter().map(MessageFrame::type_id));
            let _ = self.attempts.send(());
            if held.0 {
                return Ok(SendProgress::Blocked);
            }
            for type_id in held.1.drain(..) {
                let _ = self.log.send(("stalled", type_id));
            }
            Ok(SendProgress::Complete)
        }

        fn set_writable_hook(&self, hook: WritableHook) {
            *self.hook.lock().unwrap() = Some(hook);
        }

        fn close(&self) {}
    }

    fn sink(name: &'static str, log: &Sender<(&'static str, u16)>) -> Arc<dyn FrameSink> {
        Arc::new(RecordingSink {
            name,
            log: log.clone(),
            gate: Mutex::new(None),
        })
    }

    #[test]
    fn frames_are_written_in_order() {
        let dispatcher = QueueDispatcher::new(2, 4).unwrap();
        let (log, written) = channel();
        let queue = dispatcher.create_queue(sink("a", &log));

        for type_id in 0..100 {
            assert!(queue.add(MessageFrame::new(type_id, Vec::new())));
        }

        let order: Vec<u16> = (0..100)
            .map(|_| written.recv_timeout(Duration::from_secs(5)).unwrap().1)
            .collect();
        assert_eq!(order, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn busy_queue_does_not_starve_quiet_queue() {
        // One worker, small batches. The worker is parked on a stalled queue
        // while the backlog builds, so the ready list order is deterministic.
        let dispatcher = QueueDispatcher::new(1, 2).unwrap();
        let (log, written) = channel();
        let (release, gate) = channel();
        let blocker = dispatcher.create_queue(Arc::new(RecordingSink {
            name: "blocker",
            log: log.clone(),
            gate: Mutex::new(Some(gate)),
        }));
        let busy = dispatcher.create_queue(sink("busy", &log));
        let quiet = dispatcher.create_queue(sink("quiet", &log));

        blocker.add(MessageFrame::new(0, Vec::new()));
        busy.add_range((0..1000).map(|i| MessageFrame::new(i, Vec::new())));
        quiet.add(MessageFrame::new(0, Vec::new()));
        release.send(()).unwrap();

        let mut busy_before_quiet = 0;
        loop {
            let (name, _) = written.recv_timeout(Duration::from_secs(5)).unwrap();
            match name {
                "quiet" => break,
                "busy" => busy_before_quiet += 1,
                _ => {}
            }
        }
        assert!(busy_before_quiet <= 2, "quiet queue waited behind {busy_before_quiet} frames");
    }

    #[test]
    fn add_does_not_wait_for_a_stalled_writer() {
        let dispatcher = QueueDispatcher::new(1, 1).unwrap();
        let (log, _written) = channel();
        let (release, gate) = channel();
        let queue = dispatcher.create_queue(Arc::new(RecordingSink {
            name: "stalled",
            log,
            gate: Mutex::new(Some(gate)),
        }));

        let started = Instant::now();
        for i in 0..10_000 {
            queue.add(MessageFrame::new(i as u16, vec![0u8; 16]));
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(queue.len() >= 9_999);

        drop(release);
    }

    #[test]
    fn add_after_dispose_is_a_no_op() {
        let dispatcher = QueueDispatcher::new(1, 8).unwrap();
        let (log, _written) = channel();
        let queue = dispatcher.create_queue(sink("a", &log));
        assert_eq!(dispatcher.queue_count(), 1);

        queue.dispose();
        assert_eq!(dispatcher.queue_count(), 0);
        assert!(!queue.add(MessageFrame::new(1, Vec::new())));
        assert!(queue.is_empty());
    }

    #[test]
    fn write_failure_runs_hook_and_unregisters() {
        let dispatcher = QueueDispatcher::new(1, 8).unwrap();
        let queue = dispatcher.create_queue(Arc::new(FailingSink));
        let (failed, failures) = channel();
        queue.set_failure_hook(move |err| {
            let _ = failed.send(err.to_string());
        });

        queue.add(MessageFrame::new(1, Vec::new()));
        failures.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(queue.is_disposed());
        assert_eq!(dispatcher.queue_count(), 0);
    }

    #[test]
    fn blocked_sink_parks_queue_and_frees_the_worker() {
        let dispatcher = QueueDispatcher::new(1, 4).unwrap();
        let (log, written) = channel();
        let (attempted, attempts) = channel();
        let stalled = Arc::new(StallingSink {
            log: log.clone(),
            attempts: attempted,
            held: Mutex::new((true, Vec::new())),
            hook: Mutex::new(None),
        });
        let slow = dispatcher.create_queue(stalled.clone());
        let other = dispatcher.create_queue(sink("other", &log));

        slow.add(MessageFrame::new(1, Vec::new()));
        attempts.recv_timeout(Duration::from_secs(5)).unwrap();

        // The only worker is free while the slow peer is stuck.
        other.add(MessageFrame::new(7, Vec::new()));
        assert_eq!(written.recv_timeout(Duration::from_secs(5)).unwrap(), ("other", 7));

        // Parked queues are not revisited until the sink is writable.
        slow.add(MessageFrame::new(2, Vec::new()));
        slow.add(MessageFrame::new(3, Vec::new()));
        assert!(attempts.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(slow.len(), 2);

        stalled.release();
        let order: Vec<_> = (0..3)
            .map(|_| written.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec![("stalled", 1), ("stalled", 2), ("stalled", 3)]);
    }
}
