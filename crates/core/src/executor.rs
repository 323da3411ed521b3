//! Executor and strand contract used by the state machines.
//!
//! An [`Executor`] is a cheap handle to one tokio runtime. State machines
//! never hold threads: every step is a short task submitted through the
//! machine's [`Strand`], and every async wait (socket readiness, timer) is
//! a helper future spawned on the executor whose completion posts the next
//! step back to the strand.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slab::Slab;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::slot::ErasedSlotCell;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Registry of live handler slots created against one executor.
///
/// The mutex here is taken only when a slot is created or dropped and at
/// shutdown, never on the store/post paths.
pub(crate) struct SlotRegistry {
    slots: Mutex<Slab<Weak<dyn ErasedSlotCell>>>,
    shut_down: AtomicBool,
}

/// Handle to a tokio runtime plus the handler-slot registry scoped to it.
///
/// Cloning is cheap; all clones refer to the same runtime and registry.
#[derive(Clone)]
pub struct Executor {
    handle: Handle,
    registry: Arc<SlotRegistry>,
}

impl Executor {
    /// Wrap a runtime handle.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            registry: Arc::new(SlotRegistry {
                slots: Mutex::new(Slab::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Executor for the runtime the caller is already inside of.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime context.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Run `f` later on one of the runtime's worker threads.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move { f() });
    }

    /// Spawn a helper future (socket readiness wait, timer wait).
    pub fn spawn<F>(&self, future: F)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future);
    }

    /// Create a new serialiser bound to this executor.
    pub fn strand(&self) -> Strand {
        Strand::new(self)
    }

    /// Detach and destroy every callable still parked in a handler slot
    /// created against this executor.
    ///
    /// Called when the owning runtime is being torn down; afterwards any
    /// `store` into an existing or new slot destroys the handler instead of
    /// retaining it. Handlers are dropped outside the registry lock so their
    /// destructors may touch other slots.
    pub fn release_stored_handlers(&self) {
        self.registry.shut_down.store(true, Ordering::SeqCst);
        let cells: Vec<Arc<dyn ErasedSlotCell>> = self
            .registry
            .slots
            .lock()
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        let mut released = Vec::with_capacity(cells.len());
        for cell in cells {
            if let Some(entry) = cell.take_for_shutdown() {
                released.push(entry);
            }
        }
        if !released.is_empty() {
            tracing::debug!(count = released.len(), "releasing parked handlers");
        }
        drop(released);
    }

    pub(crate) fn slots_shut_down(&self) -> bool {
        self.registry.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn register_slot(&self, cell: Weak<dyn ErasedSlotCell>) -> usize {
        self.registry.slots.lock().insert(cell)
    }

    pub(crate) fn unregister_slot(&self, key: usize) {
        let mut slots = self.registry.slots.lock();
        if slots.contains(key) {
            slots.remove(key);
        }
    }
}

/// FIFO serialiser for state-machine steps.
///
/// Tasks posted to one strand run in submission order and never
/// concurrently with each other. Internally this is an unbounded queue
/// drained by a single task on the owning executor; once the runtime is
/// gone, posted tasks are silently dropped.
#[derive(Clone)]
pub struct Strand {
    queue: mpsc::UnboundedSender<Task>,
}

impl Strand {
    pub fn new(executor: &Executor) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Task>();
        executor.spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
        });
        Self { queue }
    }

    /// Enqueue `f` to run after every previously posted task.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.queue.send(Box::new(f));
    }

    /// Turn a completion handler into one delivered through this strand.
    pub fn wrap<A, H>(&self, handler: H) -> impl FnOnce(A) + Send + 'static
    where
        A: Send + 'static,
        H: FnOnce(A) + Send + 'static,
    {
        let strand = self.clone();
        move |arg| strand.post(move || handler(arg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn post_runs_on_a_worker() {
        let executor = Executor::current();
        let (tx, rx) = oneshot::channel();
        executor.post(move || {
            let _ = tx.send(7usize);
        });
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn strand_preserves_fifo_order_without_overlap() {
        let executor = Executor::current();
        let strand = executor.strand();

        let order = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = oneshot::channel();
        let mut done_tx = Some(done_tx);

        for i in 0..200usize {
            let order = Arc::clone(&order);
            let running = Arc::clone(&running);
            let done = if i == 199 { done_tx.take() } else { None };
            strand.post(move || {
                assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0, "strand tasks overlapped");
                order.lock().push(i);
                running.fetch_sub(1, Ordering::SeqCst);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            });
        }

        done_rx.await.unwrap();
        let order = order.lock();
        assert_eq!(*order, (0..200).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wrap_delivers_through_the_strand() {
        let executor = Executor::current();
        let strand = executor.strand();
        let (tx, rx) = oneshot::channel();
        let wrapped = strand.wrap(move |value: u32| {
            let _ = tx.send(value);
        });
        // Invoked from an arbitrary worker; observed inside the strand.
        executor.post(move || wrapped(99));
        assert_eq!(rx.await.unwrap(), 99);
    }
}
