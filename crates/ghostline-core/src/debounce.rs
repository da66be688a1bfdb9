//! Coalesces bursts of async calls into one invocation per quiet window.
//!
//! Every call restarts the window. When a window elapses without being
//! superseded, the wrapped operation runs once with the arguments of the most
//! recent call, and its result is delivered to *every* caller that joined the
//! window. A superseded timer is aborted before the operation starts; an
//! operation that has started always runs to completion.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

type Operation<A, T> = Arc<dyn Fn(A) -> BoxFuture<'static, T> + Send + Sync>;

/// The debouncer was dropped before the caller's window fired.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("debounced call was cancelled")]
pub struct DebounceCancelled;

struct Window<A, T> {
    generation: u64,
    args: Option<A>,
    waiters: Vec<oneshot::Sender<T>>,
    timer: Option<JoinHandle<()>>,
}

struct Inner<A, T> {
    delay: Duration,
    operation: Operation<A, T>,
    window: Mutex<Window<A, T>>,
}

impl<A, T> Inner<A, T> {
    fn window(&self) -> MutexGuard<'_, Window<A, T>> {
        self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct Debouncer<A, T> {
    inner: Arc<Inner<A, T>>,
}

impl<A, T> Debouncer<A, T>
where
    A: Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new<F, Fut>(delay: Duration, operation: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let operation: Operation<A, T> = Arc::new(move |args| operation(args).boxed());
        Self {
            inner: Arc::new(Inner {
                delay,
                operation,
                window: Mutex::new(Window {
                    generation: 0,
                    args: None,
                    waiters: Vec::new(),
                    timer: None,
                }),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    /// Joins the current window with `args`, restarting its timer.
    ///
    /// The returned future does not borrow the debouncer and can be moved into
    /// a spawned task.
    pub fn call(&self, args: A) -> impl Future<Output = Result<T, DebounceCancelled>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        {
            let mut window = self.inner.window();
            window.generation += 1;
            window.args = Some(args);
            window.waiters.push(tx);
            if let Some(timer) = window.timer.take() {
                timer.abort();
            }

            let generation = window.generation;
            let inner = Arc::clone(&self.inner);
            window.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(inner.delay).await;
                fire(inner, generation).await;
            }));
            trace!(generation, waiters = window.waiters.len(), "debounce window restarted");
        }

        async move { rx.await.map_err(|_| DebounceCancelled) }
    }
}

async fn fire<A, T: Clone>(inner: Arc<Inner<A, T>>, generation: u64) {
    let (args, waiters) = {
        let mut window = inner.window();
        if window.generation != generation {
            return;
        }
        // Detach ourselves so later calls cannot abort a started operation.
        window.timer = None;
        let Some(args) = window.args.take() else {
            return;
        };
        (args, std::mem::take(&mut window.waiters))
    };

    trace!(generation, waiters = waiters.len(), "debounce window fired");
    let result = (inner.operation)(args).await;
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

impl<A, T> Drop for Debouncer<A, T> {
    fn drop(&mut self) {
        let mut window = self.inner.window();
        if let Some(timer) = window.timer.take() {
            timer.abort();
        }
        window.waiters.clear();
        window.args = None;
    }
}
