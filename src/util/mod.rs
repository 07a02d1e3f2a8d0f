//! Small concurrency utilities shared across the supervisor task tree.

pub mod retry;

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Boxed future returned by object-safe capability traits.
pub type PinFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A collection of spawned child tasks that can be awaited or aborted as a
/// unit. Children may register further children while the group is being
/// drained; `wait_idle` keeps draining until none remain.
#[derive(Clone, Default)]
pub struct TaskGroup {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        TaskGroup::default()
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handles = self.handles.lock();
        handles.retain(|handle| !handle.is_finished());
        handles.push(tokio::spawn(future));
    }

    /// Awaits every registered task, including tasks registered while
    /// waiting. Aborted children are treated as finished.
    pub async fn wait_idle(&self) {
        loop {
            let next = self.handles.lock().pop();
            match next {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }

    pub fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

/// A re-armable readiness gate. Waiters block until `open` is called;
/// `close` re-arms the gate for the next generation.
#[derive(Clone)]
pub struct Gate {
    state: Arc<watch::Sender<bool>>,
}

impl Default for Gate {
    fn default() -> Self {
        Gate::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Gate { state: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.state.send_replace(true);
    }

    pub fn close(&self) {
        self.state.send_replace(false);
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
