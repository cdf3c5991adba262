//! Dispatcher propagation for the tasks and threads the library spawns.
//!
//! A session built with logging disabled runs its control task under
//! `NoSubscriber`; everything spawned from there inherits that dispatcher, so
//! the library stays silent without touching the host's global subscriber.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Dispatch;
use tracing::instrument::WithSubscriber;
use tracing::subscriber::NoSubscriber;

/// Spawn a task that logs through the caller's current dispatcher.
pub(crate) fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fut.with_current_subscriber())
}

/// Spawn a task, silenced when `enabled` is false.
pub(crate) fn spawn_with<F>(enabled: bool, fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    if enabled {
        tokio::spawn(fut.with_current_subscriber())
    } else {
        tokio::spawn(fut.with_subscriber(NoSubscriber::default()))
    }
}

/// Run blocking work on the tokio blocking pool under the current dispatcher.
pub(crate) fn spawn_blocking<F, R>(f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let dispatch = current();
    tokio::task::spawn_blocking(move || tracing::dispatcher::with_default(&dispatch, f))
}

/// The dispatcher active on this thread, for handing to a new thread.
pub(crate) fn current() -> Dispatch {
    tracing::dispatcher::get_default(Dispatch::clone)
}

/// Run `f` on the calling thread, silenced when `enabled` is false.
pub(crate) fn scoped<R>(enabled: bool, f: impl FnOnce() -> R) -> R {
    if enabled {
        f()
    } else {
        tracing::subscriber::with_default(NoSubscriber::default(), f)
    }
}
