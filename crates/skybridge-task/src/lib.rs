//! Lifecycle primitives for the bridge's long-running workers (HTTP
//! listener, firehose reader, reply poller).
//!
//! The service owns a [`StopHandle`]; every worker gets a [`StopSignal`]
//! clone and is expected to wind down at its next suspension point once a
//! stop was requested. Workers run under a [`TaskHandle`] so an abandoned
//! handle cannot leak a running task.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

/// Requests and tracks the shutdown of all workers.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn new() -> (StopHandle, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (StopHandle { tx }, StopSignal { rx })
    }

    /// Flips the stop flag. Idempotent.
    pub fn request_stop(&self) {
        self.tx.send_replace(true);
    }

    /// Resolves once every [`StopSignal`] clone has been dropped, i.e. once
    /// the last worker holding one is gone.
    pub async fn drained(&self) {
        self.tx.closed().await;
    }
}

/// A worker's view of the stop flag.
#[derive(Clone, Debug)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Resolves once a stop has been requested. Safe to await repeatedly,
    /// including after the request already fired.
    pub async fn requested(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                // The handle is gone; treat that as a stop request.
                return;
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Owner of a spawned task.
///
/// Dropping the handle aborts the task; `join` and `detach` are the two
/// deliberate ways out.
#[must_use]
pub struct TaskHandle<T> {
    inner: Option<JoinHandle<T>>,
}

impl<T> TaskHandle<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        TaskHandle {
            inner: Some(tokio::task::spawn(future)),
        }
    }

    /// Waits for the task; the handle no longer aborts afterwards.
    pub async fn join(mut self) -> Result<T, JoinError> {
        let handle = self.inner.take().expect("join consumes the only handle");
        handle.await
    }

    /// Lets the task keep running without an owner.
    pub fn detach(mut self) {
        self.inner.take();
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if let Some(handle) = &self.inner {
            handle.abort();
        }
    }
}

/// A long-lived worker owned by the service.
#[async_trait]
pub trait Task {
    type Output: Send;

    /// Short name used in log lines about this worker.
    fn name(&self) -> &'static str;

    async fn run(self, stop: StopSignal) -> Self::Output;
}

pub fn spawn_task<T>(task: T, stop: StopSignal) -> TaskHandle<T::Output>
where
    T: Task + Send + 'static,
{
    TaskHandle::spawn(task.run(stop))
}
