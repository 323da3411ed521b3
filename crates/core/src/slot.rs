//! Single-occupancy storage for parked completion callbacks.
//!
//! A state machine accepts an external `wait` or `stop` callback long
//! before the condition it reports on fires. The slot keeps exactly one
//! such callable alive outside the machine's stack until `post` moves it
//! out and schedules it on the executor, or until the executor is torn
//! down and releases it.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ServerError;
use crate::executor::Executor;

/// A one-shot callable that can be stored type-erased in a slot.
///
/// Implemented for every `FnOnce(A)` closure; implement it directly only
/// when the callable needs a custom drop.
pub trait SlotHandler<A>: Send {
    fn invoke(self: Box<Self>, arg: A);
}

impl<A, F> SlotHandler<A> for F
where
    F: FnOnce(A) + Send,
{
    fn invoke(self: Box<Self>, arg: A) {
        (*self)(arg)
    }
}

struct SlotEntry<A, T: ?Sized> {
    handler: Box<dyn SlotHandler<A>>,
    target: Option<Arc<T>>,
}

struct CellState<A, T: ?Sized> {
    entry: Option<SlotEntry<A, T>>,
    /// Set once the owning executor released its slots; a dead cell
    /// destroys anything stored into it.
    dead: bool,
}

struct SlotCell<A, T: ?Sized> {
    state: Mutex<CellState<A, T>>,
}

/// Registry view of a slot cell with the payload type erased.
pub(crate) trait ErasedSlotCell: Send + Sync {
    /// Mark the cell dead and hand back whatever it stored.
    fn take_for_shutdown(&self) -> Option<Box<dyn Any + Send>>;
}

impl<A, T> ErasedSlotCell for SlotCell<A, T>
where
    A: Send + 'static,
    T: ?Sized + Send + Sync + 'static,
{
    fn take_for_shutdown(&self) -> Option<Box<dyn Any + Send>> {
        let mut state = self.state.lock();
        state.dead = true;
        state
            .entry
            .take()
            .map(|entry| Box::new(entry) as Box<dyn Any + Send>)
    }
}

/// Typed single-slot storage for one parked callback.
///
/// `A` is the argument the callback will eventually be invoked with. `T`
/// is an optional capability the stored callback exposes to the slot's
/// owner (`store_with_target`), letting the owner reach the object a
/// handler is bound to without downcasting the handler itself.
pub struct HandlerSlot<A, T = ()>
where
    A: Send + 'static,
    T: ?Sized + Send + Sync + 'static,
{
    cell: Arc<SlotCell<A, T>>,
    executor: Executor,
    registry_key: usize,
}

impl<A, T> HandlerSlot<A, T>
where
    A: Send + 'static,
    T: ?Sized + Send + Sync + 'static,
{
    pub fn new(executor: &Executor) -> Self {
        let cell = Arc::new(SlotCell {
            state: Mutex::new(CellState {
                entry: None,
                dead: executor.slots_shut_down(),
            }),
        });
        let erased: Arc<dyn ErasedSlotCell> = cell.clone();
        let registry_key = executor.register_slot(Arc::downgrade(&erased));
        Self {
            cell,
            executor: executor.clone(),
            registry_key,
        }
    }

    /// Park `handler`, destroying any previous occupant.
    ///
    /// The new occupant is installed before the old one is dropped, so a
    /// destructor that re-enters `store` observes the slot already
    /// occupied. After the executor released its slots this destroys
    /// `handler` without retaining it.
    pub fn store<H>(&self, handler: H)
    where
        H: SlotHandler<A> + 'static,
    {
        self.store_entry(SlotEntry {
            handler: Box::new(handler),
            target: None,
        });
    }

    /// Park `handler` together with the object it is bound to.
    pub fn store_with_target<H>(&self, handler: H, target: Arc<T>)
    where
        H: SlotHandler<A> + 'static,
    {
        self.store_entry(SlotEntry {
            handler: Box::new(handler),
            target: Some(target),
        });
    }

    fn store_entry(&self, entry: SlotEntry<A, T>) {
        let mut state = self.cell.state.lock();
        let displaced = if state.dead {
            Some(entry)
        } else {
            state.entry.replace(entry)
        };
        drop(state);
        drop(displaced);
    }

    /// Move the stored callable out and schedule its invocation with `arg`
    /// on the executor, leaving the slot empty.
    ///
    /// The callable and its target are moved into the scheduled task before
    /// this returns, so the slot itself may be dropped while the task is in
    /// flight.
    pub fn post(&self, arg: A) -> Result<(), ServerError> {
        let entry = self.cell.state.lock().entry.take();
        match entry {
            None => Err(ServerError::BadHandlerCall),
            Some(SlotEntry { handler, target }) => {
                self.executor.post(move || {
                    let _target = target;
                    handler.invoke(arg);
                });
                Ok(())
            }
        }
    }

    /// Destroy the stored callable, if any.
    pub fn clear(&self) {
        let displaced = self.cell.state.lock().entry.take();
        drop(displaced);
    }

    /// Whether a callable is currently stored.
    pub fn has_target(&self) -> bool {
        self.cell.state.lock().entry.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_target()
    }

    /// The object the stored callable was bound to, if one was supplied.
    pub fn target(&self) -> Option<Arc<T>> {
        self.cell
            .state
            .lock()
            .entry
            .as_ref()
            .and_then(|entry| entry.target.clone())
    }
}

impl<A, T> Drop for HandlerSlot<A, T>
where
    A: Send + 'static,
    T: ?Sized + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.executor.unregister_slot(self.registry_key);
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    /// Sets a flag when dropped without having been invoked.
    struct DropProbe {
        dropped: Arc<AtomicBool>,
        invoked: bool,
    }

    impl DropProbe {
        fn new(dropped: Arc<AtomicBool>) -> Self {
            Self { dropped, invoked: false }
        }
    }

    impl SlotHandler<u32> for DropProbe {
        fn invoke(mut self: Box<Self>, _arg: u32) {
            self.invoked = true;
        }
    }

    impl Drop for DropProbe {
        fn drop(&mut self) {
            if !self.invoked {
                self.dropped.store(true, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn post_invokes_with_argument_and_empties_the_slot() {
        let executor = Executor::current();
        let slot: HandlerSlot<u32> = HandlerSlot::new(&executor);
        let (tx, rx) = oneshot::channel();

        slot.store(move |arg: u32| {
            let _ = tx.send(arg);
        });
        assert!(slot.has_target());

        slot.post(5).unwrap();
        assert!(slot.is_empty());
        assert_eq!(rx.await.unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn post_on_empty_slot_reports_bad_handler_call() {
        let executor = Executor::current();
        let slot: HandlerSlot<u32> = HandlerSlot::new(&executor);
        assert_eq!(slot.post(1), Err(ServerError::BadHandlerCall));
        // State unchanged: still empty, a later store still works.
        assert!(slot.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_replaces_and_destroys_the_previous_occupant() {
        let executor = Executor::current();
        let slot: HandlerSlot<u32> = HandlerSlot::new(&executor);

        let first_dropped = Arc::new(AtomicBool::new(false));
        slot.store(DropProbe::new(Arc::clone(&first_dropped)));
        assert!(!first_dropped.load(Ordering::SeqCst));

        slot.store(|_arg: u32| {});
        assert!(first_dropped.load(Ordering::SeqCst));
        assert!(slot.has_target());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clear_destroys_without_invoking() {
        let executor = Executor::current();
        let slot: HandlerSlot<u32> = HandlerSlot::new(&executor);
        let dropped = Arc::new(AtomicBool::new(false));
        slot.store(DropProbe::new(Arc::clone(&dropped)));
        slot.clear();
        assert!(dropped.load(Ordering::SeqCst));
        assert!(slot.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn target_reaches_the_bound_object() {
        let executor = Executor::current();
        let slot: HandlerSlot<u32, AtomicUsize> = HandlerSlot::new(&executor);
        assert!(slot.target().is_none());

        let bound = Arc::new(AtomicUsize::new(3));
        slot.store_with_target(|_arg: u32| {}, Arc::clone(&bound));
        let seen = slot.target().expect("stored with target");
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        slot.clear();
        assert!(slot.target().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn release_destroys_stored_handlers_and_deadens_slots() {
        let executor = Executor::current();
        let slot: HandlerSlot<u32> = HandlerSlot::new(&executor);
        let dropped = Arc::new(AtomicBool::new(false));
        slot.store(DropProbe::new(Arc::clone(&dropped)));

        executor.release_stored_handlers();
        assert!(dropped.load(Ordering::SeqCst));
        assert!(slot.is_empty());

        // A store after shutdown destroys the handler instead of keeping it.
        let late = Arc::new(AtomicBool::new(false));
        slot.store(DropProbe::new(Arc::clone(&late)));
        assert!(late.load(Ordering::SeqCst));
        assert!(slot.is_empty());

        // New slots on the released executor are dead on arrival too.
        let fresh: HandlerSlot<u32> = HandlerSlot::new(&executor);
        let fresh_dropped = Arc::new(AtomicBool::new(false));
        fresh.store(DropProbe::new(Arc::clone(&fresh_dropped)));
        assert!(fresh_dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn destructor_may_reenter_store_on_the_same_slot() {
        struct Reentrant {
            slot: Arc<HandlerSlot<u32>>,
            observed_occupied: Arc<AtomicBool>,
        }

        impl SlotHandler<u32> for Reentrant {
            fn invoke(self: Box<Self>, _arg: u32) {}
        }

        impl Drop for Reentrant {
            fn drop(&mut self) {
                // The replacement must already be installed.
                self.observed_occupied
                    .store(self.slot.has_target(), Ordering::SeqCst);
            }
        }

        let executor = Executor::current();
        let slot = Arc::new(HandlerSlot::<u32>::new(&executor));
        let observed = Arc::new(AtomicBool::new(false));
        slot.store(Reentrant {
            slot: Arc::clone(&slot),
            observed_occupied: Arc::clone(&observed),
        });

        slot.store(|_arg: u32| {});
        assert!(observed.load(Ordering::SeqCst));
    }
}
