//! Joint waits over several awaitable sources.
//!
//! The pair through quint forms accept sources with different result types
//! and report one optional outcome per input. [`wait_all`] and [`wait_some`]
//! operate over any number of same-typed sources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use log::warn;

use crate::pool::SIGNAL_POOL;
use crate::Awaitable;

/// Blocks until both sources settle and reports their outcomes, `None` for
/// a cancelled input.
///
/// The waiting is sequential in argument order; the producers behind each
/// source still run concurrently, so the total wait is bounded by the
/// slowest source, not the sum.
///
/// # Examples
///
/// ```
/// use retask::{wait_pair, Task};
///
/// let number = Task::new();
/// let label: Task<&str> = Task::new();
/// number.resolve(7);
/// label.cancel();
/// assert_eq!(wait_pair(&number, &label), (Some(7), None));
/// ```
pub fn wait_pair<A, B>(a: &A, b: &B) -> (Option<A::Output>, Option<B::Output>)
where
    A: Awaitable + ?Sized,
    B: Awaitable + ?Sized,
{
    (a.wait(), b.wait())
}

/// Same behaviour as [`wait_pair`], over three sources.
pub fn wait_triple<A, B, C>(
    a: &A,
    b: &B,
    c: &C,
) -> (Option<A::Output>, Option<B::Output>, Option<C::Output>)
where
    A: Awaitable + ?Sized,
    B: Awaitable + ?Sized,
    C: Awaitable + ?Sized,
{
    (a.wait(), b.wait(), c.wait())
}

/// Same behaviour as [`wait_pair`], over four sources.
pub fn wait_quad<A, B, C, D>(
    a: &A,
    b: &B,
    c: &C,
    d: &D,
) -> (
    Option<A::Output>,
    Option<B::Output>,
    Option<C::Output>,
    Option<D::Output>,
)
where
    A: Awaitable + ?Sized,
    B: Awaitable + ?Sized,
    C: Awaitable + ?Sized,
    D: Awaitable + ?Sized,
{
    (a.wait(), b.wait(), c.wait(), d.wait())
}

/// Same behaviour as [`wait_pair`], over five sources.
pub fn wait_quint<A, B, C, D, E>(
    a: &A,
    b: &B,
    c: &C,
    d: &D,
    e: &E,
) -> (
    Option<A::Output>,
    Option<B::Output>,
    Option<C::Output>,
    Option<D::Output>,
    Option<E::Output>,
)
where
    A: Awaitable + ?Sized,
    B: Awaitable + ?Sized,
    C: Awaitable + ?Sized,
    D: Awaitable + ?Sized,
    E: Awaitable + ?Sized,
{
    (a.wait(), b.wait(), c.wait(), d.wait(), e.wait())
}

/// Blocks until every source has settled, resolved or cancelled alike.
///
/// Outcomes are not reported; read them afterwards from the sources
/// themselves.
///
/// # Examples
///
/// ```
/// use retask::{wait_all, Awaitable, Task};
///
/// let first = Task::new();
/// let second = Task::new();
/// first.resolve(1);
/// second.cancel();
/// wait_all::<i32>(&[&first, &second]);
/// assert!(first.is_done() && second.is_done());
/// ```
pub fn wait_all<T>(sources: &[&dyn Awaitable<Output = T>]) {
    for source in sources {
        source.wait();
    }
}

/// Blocks until at least one source settles, resolved or cancelled alike.
///
/// One watcher thread per source waits on a clone of it and resolves a
/// shared signal task; the first one through wins and the caller wakes.
/// Watchers that finish later have no further effect. The signal task is
/// leased from a shared pool and returned once the last watcher is done
/// with it.
///
/// Calling this with no sources would never wake, so it warns and returns
/// immediately instead.
///
/// # Examples
///
/// ```
/// use retask::{wait_some, Task};
///
/// let slow: Task<u8> = Task::new();
/// let quick: Task<u8> = Task::new();
/// quick.resolve(1);
/// wait_some(&[slow.clone(), quick.clone()]);
/// assert!(quick.is_done());
/// assert!(!slow.is_done());
/// slow.cancel(); // let the leftover watcher finish
/// ```
pub fn wait_some<A>(sources: &[A])
where
    A: Awaitable + Clone + Send + 'static,
{
    if sources.is_empty() {
        warn!("wait_some called with no sources");
        return;
    }
    let signal = SIGNAL_POOL.alloc();
    // One share per potential watcher plus one for this caller; whoever
    // drops the last share hands the signal back to the pool.
    let live = Arc::new(AtomicUsize::new(sources.len() + 1));
    let mut started = 0;
    for source in sources {
        if signal.is_done() {
            break;
        }
        started += 1;
        let source = source.clone();
        let signal = signal.clone();
        let live = live.clone();
        thread::spawn(move || {
            source.wait();
            signal.resolve(());
            if live.fetch_sub(1, Ordering::AcqRel) == 1 {
                SIGNAL_POOL.free(signal);
            }
        });
    }
    signal.wait();
    let idle_shares = sources.len() - started + 1;
    if live.fetch_sub(idle_shares, Ordering::AcqRel) == idle_shares {
        SIGNAL_POOL.free(signal);
    }
}
