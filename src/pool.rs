//! Object reuse for tasks.
//!
//! A [`TaskPool`] keeps settled instances on a free list so hot paths can
//! lease and return them instead of allocating. Parked instances are
//! disabled: mutations through a stale handle are warned about and ignored
//! rather than corrupting the next lease.

use std::sync::Mutex;

use lazy_static::lazy_static;
use log::trace;

use crate::Task;

lazy_static! {
    /// Shared pool of unit signals backing [`wait_some`](crate::wait_some).
    pub(crate) static ref SIGNAL_POOL: TaskPool<()> = TaskPool::with_capacity(100);
}

/// A free list of reusable [`Task`] instances, one result type per pool.
///
/// Worth reaching for only when allocation pressure is measurable; a plain
/// [`Task::new`] is otherwise just as good.
///
/// # Examples
///
/// ```
/// use retask::pool::TaskPool;
///
/// let pool: TaskPool<u32> = TaskPool::new();
/// let task = pool.alloc();
/// let stale = task.clone();
/// task.resolve(9);
/// pool.free(task);
/// // The parked instance ignores handles that outlived the lease.
/// assert!(!stale.resolve(10));
/// ```
pub struct TaskPool<T> {
    idle: Mutex<Vec<Task<T>>>,
}

impl<T> TaskPool<T> {
    /// Creates an empty pool.
    pub fn new() -> TaskPool<T> {
        TaskPool {
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Creates a pool pre-seeded with `size` parked instances.
    pub fn with_capacity(size: usize) -> TaskPool<T> {
        let pool = TaskPool::new();
        for _ in 0..size {
            pool.free(Task::new());
        }
        pool
    }

    /// Leases a pending, enabled instance, constructing a fresh one when
    /// the free list is empty.
    pub fn alloc(&self) -> Task<T> {
        loop {
            let candidate = self.idle.lock().unwrap().pop();
            match candidate {
                Some(task) => {
                    task.enable();
                    if task.reset() || !task.is_done() {
                        trace!("task {}: leased from pool", task.id());
                        return task;
                    }
                    // Consumers woken by the final cancellation are still
                    // draining; let this instance go and try the next.
                }
                None => return Task::new(),
            }
        }
    }

    /// Cancels anything in flight, parks the instance and returns it to
    /// the free list.
    ///
    /// Handles retained past this point see every mutation ignored with a
    /// diagnostic warning.
    pub fn free(&self, task: Task<T>) {
        task.cancel();
        task.disable();
        trace!("task {}: parked in pool", task.id());
        self.idle.lock().unwrap().push(task);
    }
}

impl<T> Default for TaskPool<T> {
    fn default() -> TaskPool<T> {
        TaskPool::new()
    }
}
