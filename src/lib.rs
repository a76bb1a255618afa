//! Resettable single-assignment tasks for coordinating threads.
//!
//! A [`Task`] is a slot that is written once per period: producers race to
//! [`resolve`](Task::resolve), [`cancel`](Task::cancel) or
//! [`fail`](Task::fail) it, consumers block on [`wait`](Awaitable::wait)
//! until the period completes, and [`reset`](Task::reset) re-arms the slot
//! so the same instance can carry the next round. Everything works on plain
//! OS threads, no executor required.
//!
//! # Examples
//!
//! ```
//! use retask::{Awaitable, Task};
//!
//! let task = Task::new();
//! let producer = task.clone();
//! std::thread::spawn(move || {
//!     producer.resolve(41 + 1);
//! });
//! assert_eq!(task.wait(), Some(42));
//! // The outcome stays readable until someone resets the task.
//! assert_eq!(task.wait(), Some(42));
//! ```

use std::thread;

use thiserror::Error;

pub mod join;
pub mod pool;
pub mod task;

pub use join::{wait_all, wait_pair, wait_quad, wait_quint, wait_some, wait_triple};
pub use pool::TaskPool;
pub use task::{Task, UnitTask};

/// A source of one result that a thread can block on.
///
/// [`Task`] is the canonical implementor. [`WaitFn`] adapts plain closures
/// so ad-hoc sources can join the combinators in [`join`].
pub trait Awaitable {
    /// What a successful completion yields.
    type Output;

    /// Blocks the calling thread until the source completes, then returns
    /// its value, or `None` if it was cancelled instead.
    fn wait(&self) -> Option<Self::Output>;
}

/// Adapts a closure into an [`Awaitable`].
///
/// The closure is invoked once per [`wait`](Awaitable::wait) call and may
/// itself block.
///
/// # Examples
///
/// ```
/// use retask::{Awaitable, WaitFn};
///
/// let source = WaitFn(|| Some("ready"));
/// assert_eq!(source.wait(), Some("ready"));
/// ```
#[derive(Clone)]
pub struct WaitFn<F>(pub F);

impl<T, F> Awaitable for WaitFn<F>
where
    F: Fn() -> Option<T>,
{
    type Output = T;

    fn wait(&self) -> Option<T> {
        (self.0)()
    }
}

/// Panic payload raised by [`wait`](Awaitable::wait) when a task configured
/// with [`Task::set_panic_on_cancel`] is cancelled.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("task was cancelled")]
pub struct Cancelled;

/// Runs `f` on a new thread and returns a [`Task`] that resolves with its
/// result.
///
/// # Examples
///
/// ```
/// use retask::{spawn, Awaitable};
///
/// let task = spawn(|| (0..=100).sum::<i32>());
/// assert_eq!(task.wait(), Some(5050));
/// ```
pub fn spawn<T, F>(f: F) -> Task<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let task = Task::new();
    let producer = task.clone();
    thread::spawn(move || {
        producer.resolve(f());
    });
    task
}
