//! Completion futures for producer and consumer operations.
//!
//! A `Promise` / `Future` pair is a one-shot crossbeam channel. The engine
//! keeps the promise and completes it from whichever thread finishes the
//! work; the caller blocks in `Future::wait`. Dropping a promise without
//! completing it resolves the future with `FluxError::Cancellation`.
//! Dropping a future has no effect on the engine.

use std::fmt;

use crossbeam::channel::{Receiver, Sender, TryRecvError, bounded};

use crate::error::{FluxError, Result};

type Hook = Box<dyn FnOnce() + Send + 'static>;
type Deferred<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

/// Completing side of a [`Future`].
pub struct Promise<T> {
    tx: Sender<Result<T>>,
}

impl<T> Promise<T> {
    pub fn set_value(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn set_error(self, error: FluxError) {
        self.complete(Err(error));
    }

    pub fn complete(self, result: Result<T>) {
        // The future may already be gone; that is not an error.
        let _ = self.tx.send(result);
    }

    /// Completes the promise, handing `result` back if its future has been
    /// dropped.
    pub fn try_complete(self, result: Result<T>) -> std::result::Result<(), Result<T>> {
        self.tx.send(result).map_err(|e| e.into_inner())
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

enum State<T> {
    Pending(Receiver<Result<T>>),
    Ready(Result<T>),
    /// Work performed on the waiting thread.
    Deferred(Deferred<T>),
}

/// Result of an asynchronous engine operation.
pub struct Future<T> {
    state: State<T>,
    on_wait: Option<Hook>,
}

/// Creates a linked promise/future pair.
pub fn promise<T>() -> (Promise<T>, Future<T>) {
    let (tx, rx) = bounded(1);
    (
        Promise { tx },
        Future {
            state: State::Pending(rx),
            on_wait: None,
        },
    )
}

impl<T> Future<T> {
    /// An already completed future.
    pub fn ready(result: Result<T>) -> Self {
        Future {
            state: State::Ready(result),
            on_wait: None,
        }
    }

    /// A future whose value is computed by `f` on the thread calling `wait`.
    pub fn deferred<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Future {
            state: State::Deferred(Box::new(f)),
            on_wait: None,
        }
    }

    /// Registers a hook run once before blocking in `wait`, unless the
    /// future is already complete by then.
    pub fn on_wait<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_wait = Some(Box::new(hook));
        self
    }

    /// Whether a value is available without blocking.
    ///
    /// Deferred futures only complete inside `wait` and always report
    /// `false` here.
    pub fn completed(&mut self) -> bool {
        match &self.state {
            State::Ready(_) => true,
            State::Deferred(_) => false,
            State::Pending(rx) => match rx.try_recv() {
                Ok(result) => {
                    self.state = State::Ready(result);
                    true
                }
                Err(TryRecvError::Empty) => false,
                Err(TryRecvError::Disconnected) => {
                    self.state = State::Ready(Err(FluxError::Cancellation));
                    true
                }
            },
        }
    }

    /// Blocks until the operation completes.
    pub fn wait(mut self) -> Result<T> {
        if !self.completed() {
            if let Some(hook) = self.on_wait.take() {
                hook();
            }
        }
        match self.state {
            State::Ready(result) => result,
            State::Deferred(f) => f(),
            State::Pending(rx) => rx.recv().unwrap_or(Err(FluxError::Cancellation)),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Pending(_) => "pending",
            State::Ready(Ok(_)) => "ready",
            State::Ready(Err(_)) => "failed",
            State::Deferred(_) => "deferred",
        };
        f.debug_struct("Future").field("state", &state).finish()
    }
}
