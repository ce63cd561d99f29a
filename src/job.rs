//! Running long operations off the caller's thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Shared flag asking a batch to stop before its next invocation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A job running on a worker thread. The result arrives over a channel.
pub struct Job<T> {
    rx: Receiver<T>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

pub enum Poll<T> {
    Ready(T),
    Pending,
    /// The worker died without sending a result.
    Lost,
}

/// Run `work` on a new thread. `work` receives the job's cancel token.
pub fn spawn_job<T, F>(work: F) -> Job<T>
where
    T: Send + 'static,
    F: FnOnce(CancelToken) -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let handle = std::thread::spawn(move || {
        let _ = tx.send(work(token));
    });
    Job {
        rx,
        cancel,
        handle: Some(handle),
    }
}

impl<T> Job<T> {
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait at most `timeout` for the result.
    pub fn poll(&self, timeout: Duration) -> Poll<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Poll::Ready(value),
            Err(RecvTimeoutError::Timeout) => Poll::Pending,
            Err(RecvTimeoutError::Disconnected) => Poll::Lost,
        }
    }

    /// Block until the worker finishes. `None` if it panicked.
    pub fn wait(mut self) -> Option<T> {
        let value = self.rx.recv().ok();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        value
    }
}
