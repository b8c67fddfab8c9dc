//! Observer lists and the deferred task queue.
//!
//! Every container that can change (a document table, a cursor feeding derived
//! cursors) owns a [`Dependents`] list of weak subscribers. A write notifies
//! its dependents synchronously, and they recompute immediately. Anything that
//! calls user code is instead pushed onto the collection's [`TaskQueue`] and
//! runs when the queue is flushed. Inside a Tokio runtime a flush drains the
//! queue on a spawned task, so every write made before that task runs is
//! delivered in one round. Outside a runtime the queue drains at the end of
//! each write. Either way a delivery never runs from inside another one.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::trace;

/// Something that recomputes when a container it depends on changes.
pub trait Subscriber: Send + Sync {
    fn invalidate(&self);
}

/// Weak subscriber list. Dead subscribers are pruned on every notification.
#[derive(Default)]
pub struct Dependents {
    subscribers: Mutex<Vec<Weak<dyn Subscriber>>>,
}

impl Dependents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Weak<dyn Subscriber>) {
        self.subscribers.lock().push(subscriber);
    }

    /// Invalidates every live subscriber, in subscription order.
    pub fn notify(&self) {
        let live = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|subscriber| subscriber.strong_count() > 0);
            subscribers
                .iter()
                .filter_map(Weak::upgrade)
                .collect::<Vec<Arc<dyn Subscriber>>>()
        };

        for subscriber in live {
            subscriber.invalidate();
        }
    }

    /// Number of subscribers that are still alive.
    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|subscriber| subscriber.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Dependents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependents").field("len", &self.len()).finish()
    }
}

type Task = Box<dyn FnOnce() + Send>;

/// FIFO queue of deferred callbacks.
///
/// Draining is not re-entrant: a drain requested while another drain is in
/// progress returns immediately and its tasks run in the outer drain.
#[derive(Default)]
pub struct TaskQueue {
    pending: Mutex<VecDeque<Task>>,
    draining: AtomicBool,
    scheduled: AtomicBool,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&self, task: impl FnOnce() + Send + 'static) {
        self.pending.lock().push_back(Box::new(task));
    }

    /// Runs queued tasks, including tasks queued while draining.
    pub fn drain(&self) {
        loop {
            if self.draining.swap(true, Ordering::AcqRel) {
                return;
            }

            {
                let _guard = DrainGuard(&self.draining);
                let mut ran = 0usize;

                while let Some(task) = self.pop() {
                    task();
                    ran += 1;
                }

                if ran > 0 {
                    trace!(tasks = ran, "drained deferred tasks");
                }
            }

            // A task queued between the last pop and the guard reset would be stranded.
            if self.pending.lock().is_empty() {
                return;
            }
        }
    }

    /// Schedules a drain on the current Tokio runtime, or drains right away
    /// when there is none. At most one scheduled drain is outstanding.
    pub fn flush(self: &Arc<Self>) {
        if self.is_empty() {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            self.drain();
            return;
        };

        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let queue = Arc::clone(self);
        handle.spawn(async move {
            queue.scheduled.store(false, Ordering::Release);
            queue.drain();
        });
    }

    fn pop(&self) -> Option<Task> {
        self.pending.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.len())
            .field("draining", &self.draining.load(Ordering::Acquire))
            .field("scheduled", &self.scheduled.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter(AtomicUsize);

    impl Subscriber for Counter {
        fn invalidate(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dependents_prune_dropped_subscribers() {
        let dependents = Dependents::new();
        let kept = Arc::new(Counter(AtomicUsize::new(0)));
        let dropped = Arc::new(Counter(AtomicUsize::new(0)));

        dependents.subscribe(Arc::downgrade(&kept) as Weak<dyn Subscriber>);
        dependents.subscribe(Arc::downgrade(&dropped) as Weak<dyn Subscriber>);
        drop(dropped);

        dependents.notify();
        assert_eq!(kept.0.load(Ordering::SeqCst), 1);
        assert_eq!(dependents.len(), 1);
    }

    #[test]
    fn tasks_queued_while_draining_run_in_the_same_drain() {
        let queue = Arc::new(TaskQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_queue = Arc::clone(&queue);
        let inner_log = Arc::clone(&log);
        queue.defer(move || {
            inner_log.lock().push(1);
            let nested_log = Arc::clone(&inner_log);
            inner_queue.defer(move || nested_log.lock().push(3));
            // Nested drain is a no-op; the outer drain picks the task up.
            inner_queue.drain();
            inner_log.lock().push(2);
        });

        queue.drain();
        assert_eq!(*log.lock(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_without_a_runtime_drains_immediately() {
        let queue = Arc::new(TaskQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let task_log = Arc::clone(&log);
        queue.defer(move || task_log.lock().push(1));
        queue.flush();

        assert_eq!(*log.lock(), vec![1]);
    }

    #[tokio::test]
    async fn flush_inside_a_runtime_waits_for_the_next_tick() {
        let queue = Arc::new(TaskQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        for n in 1..=3 {
            let task_log = Arc::clone(&log);
            queue.defer(move || task_log.lock().push(n));
            queue.flush();
        }
        assert!(log.lock().is_empty());

        tokio::task::yield_now().await;
        assert_eq!(*log.lock(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }
}
