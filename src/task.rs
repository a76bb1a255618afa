//! The resettable task primitive.

use std::error::Error;
use std::fmt;
use std::mem;
use std::panic::panic_any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use log::warn;

use crate::{Awaitable, Cancelled};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type Listener = Box<dyn FnOnce() + Send>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending = 0,
    Resolved = 1,
    Cancelled = 2,
}

impl Status {
    fn from_raw(raw: u8) -> Status {
        match raw {
            0 => Status::Pending,
            1 => Status::Resolved,
            _ => Status::Cancelled,
        }
    }
}

struct State<T> {
    value: Option<T>,
    error: Option<Arc<dyn Error + Send + Sync>>,
    panic_on_cancel: bool,
    /// How many periods have completed on this instance.
    completions: u64,
    /// Consumers currently blocked in a wait. Waiters pin the period:
    /// a reset refuses to re-arm until they have drained.
    waiters: usize,
    done_listeners: Vec<Listener>,
    cancel_listeners: Vec<Listener>,
}

struct Inner<T> {
    id: u64,
    /// Mirror of the period status, written only while `state` is held.
    status: AtomicU8,
    /// Cleared while the instance is parked in a pool.
    enabled: AtomicBool,
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> Inner<T> {
    fn status(&self) -> Status {
        Status::from_raw(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// A resettable slot for one result, shared by cloning.
///
/// Producers settle the current period with [`resolve`](Task::resolve),
/// [`cancel`](Task::cancel) or [`fail`](Task::fail); the first one wins and
/// the rest report `false`. Consumers block on [`wait`](Awaitable::wait) and
/// every one of them observes the same outcome. Once settled, the outcome
/// stays readable until [`reset`](Task::reset) opens the next period.
///
/// Clones share the same slot, so a task can be handed to any number of
/// threads.
///
/// # Examples
///
/// ```
/// use retask::{Awaitable, Task};
/// use std::thread;
///
/// let ticket: Task<String> = Task::new();
/// let desk = ticket.clone();
/// thread::spawn(move || {
///     desk.resolve("order 7 is up".to_string());
/// });
/// assert_eq!(ticket.wait().as_deref(), Some("order 7 is up"));
/// ```
pub struct Task<T> {
    inner: Arc<Inner<T>>,
}

/// A task that carries no value, used as a pure signal.
pub type UnitTask = Task<()>;

impl<T> Clone for Task<T> {
    fn clone(&self) -> Task<T> {
        Task {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Task<T> {
    fn default() -> Task<T> {
        Task::new()
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status())
            .field("enabled", &self.inner.enabled())
            .finish()
    }
}

impl<T> Task<T> {
    /// Creates a fresh, pending task.
    pub fn new() -> Task<T> {
        Task {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                status: AtomicU8::new(Status::Pending as u8),
                enabled: AtomicBool::new(true),
                state: Mutex::new(State {
                    value: None,
                    error: None,
                    panic_on_cancel: false,
                    completions: 0,
                    waiters: 0,
                    done_listeners: Vec::new(),
                    cancel_listeners: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// An identifier unique to this instance, stable across resets and
    /// shared by all clones.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Resolves the current period with `value` and wakes every waiter.
    ///
    /// Returns `false`, dropping `value`, if the period was already settled
    /// or the instance is parked in a pool.
    ///
    /// # Examples
    ///
    /// ```
    /// use retask::{Awaitable, Task};
    ///
    /// let task = Task::new();
    /// assert!(task.resolve(7));
    /// assert!(!task.resolve(8)); // the slot is taken until the next reset
    /// assert_eq!(task.wait(), Some(7));
    /// ```
    pub fn resolve(&self, value: T) -> bool {
        let mut state = match self.admit("resolve") {
            Some(state) => state,
            None => return false,
        };
        state.value = Some(value);
        self.finish(state, Status::Resolved);
        true
    }

    /// Cancels the current period and wakes every waiter with `None`.
    ///
    /// Returns `false` if the period was already settled or the instance is
    /// parked in a pool.
    ///
    /// # Examples
    ///
    /// ```
    /// use retask::{Awaitable, Task};
    ///
    /// let task: Task<i32> = Task::new();
    /// assert!(task.cancel());
    /// assert!(!task.resolve(1)); // too late
    /// assert_eq!(task.wait(), None);
    /// ```
    pub fn cancel(&self) -> bool {
        let state = match self.admit("cancel") {
            Some(state) => state,
            None => return false,
        };
        self.finish(state, Status::Cancelled);
        true
    }

    /// Cancels the current period and records `err` as the reason.
    ///
    /// Waiters observe a plain cancellation; the reason is read separately
    /// through [`error`](Task::error).
    ///
    /// # Examples
    ///
    /// ```
    /// use retask::Task;
    ///
    /// let task: Task<u32> = Task::new();
    /// task.fail("upstream went away");
    /// assert!(task.is_cancelled());
    /// assert_eq!(task.error().unwrap().to_string(), "upstream went away");
    /// ```
    pub fn fail<E>(&self, err: E) -> bool
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let mut state = match self.admit("fail") {
            Some(state) => state,
            None => return false,
        };
        state.error = Some(Arc::from(err.into()));
        self.finish(state, Status::Cancelled);
        true
    }

    /// The failure reason recorded by [`fail`](Task::fail) for the current
    /// period, if any.
    pub fn error(&self) -> Option<Arc<dyn Error + Send + Sync>> {
        self.inner.state.lock().unwrap().error.clone()
    }

    /// Whether the current period has settled, either way.
    pub fn is_done(&self) -> bool {
        self.inner.status() != Status::Pending
    }

    /// Whether the current period was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.status() == Status::Cancelled
    }

    /// Re-arms a settled task for another round.
    ///
    /// Clears the stored value, error, listeners and the panic flag. Returns
    /// `false` without touching anything while the period is still pending,
    /// while woken waiters are still draining, or if the instance is parked
    /// in a pool.
    ///
    /// # Examples
    ///
    /// ```
    /// use retask::{Awaitable, Task};
    ///
    /// let task = Task::new();
    /// task.resolve(1000);
    /// assert!(!task.resolve(3000)); // no effect
    /// assert!(task.reset());
    /// task.resolve(3000); // a fresh period accepts it
    /// assert_eq!(task.wait(), Some(3000));
    /// ```
    pub fn reset(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        self.reset_locked(&mut state)
    }

    /// Runs `listener` on its own thread once the current period settles.
    ///
    /// If the period has already settled the listener runs right away.
    /// Pending listeners fire once and are discarded; a reset drops any that
    /// never fired.
    ///
    /// # Examples
    ///
    /// ```
    /// use retask::Task;
    /// use std::sync::mpsc;
    ///
    /// let task = Task::new();
    /// let (tx, rx) = mpsc::channel();
    /// task.on_done(move || tx.send("rang").unwrap());
    /// task.resolve(1);
    /// assert_eq!(rx.recv(), Ok("rang"));
    /// ```
    pub fn on_done<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        if !self.inner.enabled() {
            warn!("task {}: listener ignored while pooled", self.inner.id);
            return;
        }
        if self.inner.status() == Status::Pending {
            state.done_listeners.push(Box::new(listener));
        } else {
            drop(state);
            thread::spawn(listener);
        }
    }

    /// Like [`on_done`](Task::on_done), but only fires when the period is
    /// cancelled. A resolved period leaves the listener queued until the
    /// next reset discards it.
    pub fn on_cancel<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        if !self.inner.enabled() {
            warn!("task {}: listener ignored while pooled", self.inner.id);
            return;
        }
        match self.inner.status() {
            Status::Cancelled => {
                drop(state);
                thread::spawn(listener);
            }
            _ => state.cancel_listeners.push(Box::new(listener)),
        }
    }

    /// Makes [`wait`](Awaitable::wait) panic with [`Cancelled`] if the
    /// current period is cancelled. The flag is cleared by the next reset.
    ///
    /// [`anticipate`](Task::anticipate) ignores the flag and keeps
    /// reporting a cancellation as a plain `None`.
    pub fn set_panic_on_cancel(&self, panic: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if !self.inner.enabled() {
            warn!("task {}: panic flag ignored while pooled", self.inner.id);
            return;
        }
        state.panic_on_cancel = panic;
    }

    /// Wakes the instance up after a pool lease.
    pub(crate) fn enable(&self) {
        let _state = self.inner.state.lock().unwrap();
        self.inner.enabled.store(true, Ordering::Release);
    }

    /// Parks the instance; every mutation is ignored until `enable`.
    pub(crate) fn disable(&self) {
        let _state = self.inner.state.lock().unwrap();
        self.inner.enabled.store(false, Ordering::Release);
    }

    /// Admission check for producers. Settled or pooled instances turn them
    /// away, ideally without taking the lock.
    fn admit(&self, op: &str) -> Option<MutexGuard<'_, State<T>>> {
        if !self.inner.enabled() {
            warn!("task {}: {} ignored while pooled", self.inner.id, op);
            return None;
        }
        if self.inner.status() != Status::Pending {
            return None;
        }
        let state = self.inner.state.lock().unwrap();
        if !self.inner.enabled() {
            warn!("task {}: {} ignored while pooled", self.inner.id, op);
            return None;
        }
        if self.inner.status() != Status::Pending {
            return None;
        }
        Some(state)
    }

    /// Settles the period and hands the outcome to waiters and listeners.
    fn finish(&self, mut state: MutexGuard<'_, State<T>>, status: Status) {
        self.inner.set_status(status);
        state.completions += 1;
        self.inner.cond.notify_all();
        let done = mem::take(&mut state.done_listeners);
        let cancelled = match status {
            Status::Cancelled => mem::take(&mut state.cancel_listeners),
            _ => Vec::new(),
        };
        drop(state);
        // Listeners run outside the lock, each on its own thread.
        fire(done);
        fire(cancelled);
    }

    fn reset_locked(&self, state: &mut MutexGuard<'_, State<T>>) -> bool {
        if !self.inner.enabled() {
            warn!("task {}: reset ignored while pooled", self.inner.id);
            return false;
        }
        if self.inner.status() == Status::Pending || state.waiters > 0 {
            return false;
        }
        self.inner.set_status(Status::Pending);
        state.value = None;
        state.error = None;
        state.panic_on_cancel = false;
        state.done_listeners.clear();
        state.cancel_listeners.clear();
        true
    }
}

impl<T: Clone> Task<T> {
    /// Blocks until the current period settles, without ever panicking.
    ///
    /// The panic flag set by [`set_panic_on_cancel`](Task::set_panic_on_cancel)
    /// only applies to [`wait`](Awaitable::wait); this is the quiet variant.
    ///
    /// # Examples
    ///
    /// ```
    /// use retask::Task;
    ///
    /// let task: Task<u8> = Task::new();
    /// task.set_panic_on_cancel(true);
    /// task.cancel();
    /// assert_eq!(task.anticipate(), None);
    /// ```
    pub fn anticipate(&self) -> Option<T> {
        let state = self.inner.state.lock().unwrap();
        if !self.inner.enabled() {
            return None;
        }
        let state = self.settle(state);
        self.outcome(&state).0
    }

    /// Blocks like [`wait`](Awaitable::wait), then re-arms the task in the
    /// same breath.
    ///
    /// Consumers looping on one shared instance use this to take exactly one
    /// outcome per period. The re-arm silently fails when other waiters are
    /// still draining, and is skipped entirely when the wait unwinds.
    ///
    /// # Examples
    ///
    /// ```
    /// use retask::Task;
    ///
    /// let task = Task::new();
    /// task.resolve(5);
    /// assert_eq!(task.wait_and_reset(), Some(5));
    /// assert!(!task.is_done()); // pending again
    /// ```
    pub fn wait_and_reset(&self) -> Option<T> {
        let state = self.inner.state.lock().unwrap();
        if !self.inner.enabled() {
            return None;
        }
        let mut state = self.settle(state);
        let (value, raise) = self.outcome(&state);
        if !raise {
            self.reset_locked(&mut state);
        }
        drop(state);
        if raise {
            panic_any(Cancelled);
        }
        value
    }

    /// Blocks until the period the caller entered under has completed.
    fn settle<'a>(&'a self, mut state: MutexGuard<'a, State<T>>) -> MutexGuard<'a, State<T>> {
        if self.inner.status() == Status::Pending {
            let target = state.completions + 1;
            state.waiters += 1;
            while state.completions < target {
                state = self.inner.cond.wait(state).unwrap();
            }
            state.waiters -= 1;
        }
        state
    }

    /// The settled outcome: a value clone plus whether to unwind instead.
    fn outcome(&self, state: &State<T>) -> (Option<T>, bool) {
        match self.inner.status() {
            Status::Resolved => (state.value.clone(), false),
            _ => (None, state.panic_on_cancel),
        }
    }
}

impl<T: Clone> Awaitable for Task<T> {
    type Output = T;

    /// Blocks until the current period settles and returns a clone of the
    /// value, or `None` on cancellation.
    ///
    /// Settled outcomes are repeatable: every call before the next reset
    /// returns the same answer. On an instance parked in a pool this
    /// returns `None` immediately.
    ///
    /// # Panics
    ///
    /// Panics with [`Cancelled`] if the period is cancelled while
    /// [`set_panic_on_cancel`](Task::set_panic_on_cancel) is switched on.
    fn wait(&self) -> Option<T> {
        let state = self.inner.state.lock().unwrap();
        if !self.inner.enabled() {
            return None;
        }
        let state = self.settle(state);
        let (value, raise) = self.outcome(&state);
        // Unwind only after the guard is gone.
        drop(state);
        if raise {
            panic_any(Cancelled);
        }
        value
    }
}

fn fire(listeners: Vec<Listener>) {
    for listener in listeners {
        thread::spawn(listener);
    }
}

#[cfg(test)]
mod tests {
    use std::panic;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn resolve_wakes_all_waiters() {
        let task: Task<String> = Task::new();
        let mut consumers = Vec::new();
        for _ in 0..8 {
            let task = task.clone();
            consumers.push(thread::spawn(move || task.wait()));
        }
        thread::sleep(Duration::from_millis(2));
        assert!(task.resolve("ready".to_string()));
        for consumer in consumers {
            assert_eq!(consumer.join().unwrap().as_deref(), Some("ready"));
        }
        // The outcome stays readable afterwards.
        assert_eq!(task.wait().as_deref(), Some("ready"));
    }

    #[test]
    fn cancel_beats_later_resolve() {
        let task = Task::new();
        assert!(task.cancel());
        assert!(!task.resolve(1));
        assert_eq!(task.wait(), None);
        assert!(task.is_done());
        assert!(task.is_cancelled());
    }

    #[test]
    fn exactly_one_producer_wins() {
        let task: Task<usize> = Task::new();
        let wins = Arc::new(AtomicUsize::new(0));
        let mut producers = Vec::new();
        for i in 0..16 {
            let task = task.clone();
            let wins = wins.clone();
            producers.push(thread::spawn(move || {
                let won = if i % 4 == 0 { task.cancel() } else { task.resolve(i) };
                if won {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        let first = task.wait();
        for _ in 0..4 {
            assert_eq!(task.wait(), first);
        }
    }

    #[test]
    fn fail_records_the_error() {
        let task: Task<i32> = Task::new();
        assert!(task.error().is_none());
        assert!(task.fail("backend unreachable"));
        assert!(!task.fail("second failure is ignored"));
        assert_eq!(task.wait(), None);
        assert!(task.is_cancelled());
        assert_eq!(task.error().unwrap().to_string(), "backend unreachable");
        assert!(task.reset());
        assert!(task.error().is_none());
    }

    #[test]
    fn reset_rearms_the_gate() {
        let task = Task::new();
        assert!(!task.reset()); // nothing to reset while pending
        task.resolve(1);
        assert_eq!(task.wait(), Some(1));
        assert!(task.reset());
        assert!(!task.is_done());

        let consumer = {
            let task = task.clone();
            thread::spawn(move || task.wait())
        };
        thread::sleep(Duration::from_millis(5));
        // The old value is gone, so the consumer is parked again.
        assert!(!consumer.is_finished());
        task.resolve(2);
        assert_eq!(consumer.join().unwrap(), Some(2));
    }

    #[test]
    fn wait_and_reset_returns_then_rearms() {
        let task = Task::new();
        task.resolve(5);
        assert_eq!(task.wait_and_reset(), Some(5));
        assert!(!task.is_done());
        task.resolve(6);
        assert_eq!(task.wait(), Some(6));
    }

    #[test]
    fn resolve_reset_churn() {
        let task: Task<usize> = Task::new();
        for round in 0..100 {
            let producer = task.clone();
            let handle = thread::spawn(move || producer.resolve(round));
            assert_eq!(task.wait(), Some(round));
            handle.join().unwrap();
            assert!(task.reset());
        }
    }

    #[test]
    fn panic_on_cancel_raises_from_wait() {
        let task: Task<i32> = Task::new();
        task.set_panic_on_cancel(true);
        task.cancel();
        let caught = panic::catch_unwind(|| task.wait()).unwrap_err();
        assert!(caught.downcast_ref::<Cancelled>().is_some());
        // The quiet variant never raises, and the task is still usable.
        assert_eq!(task.anticipate(), None);
        assert!(task.reset());
        task.resolve(9);
        assert_eq!(task.wait(), Some(9));
    }

    #[test]
    fn reset_clears_the_panic_flag() {
        let task: Task<i32> = Task::new();
        task.set_panic_on_cancel(true);
        task.cancel();
        assert!(task.reset());
        task.cancel();
        assert_eq!(task.wait(), None);
    }

    #[test]
    fn listeners_fire_once_each() {
        let task = Task::new();
        let (done_tx, done_rx) = mpsc::channel();
        let (cancel_tx, cancel_rx) = mpsc::channel();
        task.on_done(move || done_tx.send("done").unwrap());
        task.on_cancel(move || cancel_tx.send("cancelled").unwrap());
        task.cancel();
        assert_eq!(done_rx.recv().unwrap(), "done");
        assert_eq!(cancel_rx.recv().unwrap(), "cancelled");

        // Fired listeners are discarded; the next period starts clean.
        assert!(task.reset());
        task.resolve(1);
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn cancel_listener_skipped_on_resolve() {
        let task = Task::new();
        let (tx, rx) = mpsc::channel();
        task.on_cancel(move || tx.send(()).unwrap());
        task.resolve(1);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn late_listener_fires_immediately() {
        let task = Task::new();
        task.resolve(3);
        let (tx, rx) = mpsc::channel();
        task.on_done(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn resolve_returns_before_listeners_finish() {
        let task = Task::new();
        let (tx, rx) = mpsc::channel();
        task.on_done(move || {
            thread::sleep(Duration::from_millis(400));
            tx.send(()).unwrap();
        });
        let begun = Instant::now();
        task.resolve(1);
        assert!(begun.elapsed() < Duration::from_millis(300));
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn ids_are_stable_and_unique() {
        let a: Task<()> = Task::new();
        let b: Task<()> = Task::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
        let before = a.id();
        a.cancel();
        a.reset();
        assert_eq!(a.id(), before);
    }
}
