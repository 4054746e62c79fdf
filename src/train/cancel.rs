use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::error::{Error, Result};

/// Shared flag asking a running optimization to stop.
///
/// Workers check it before every datum and the orchestrator checks it
/// between rounds. Once set, `optimize` returns the last weights it fully
/// applied. The flag stays set until [`reset`](Self::reset).
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag so the owning optimizer can run again
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Completion<T> {
    result: Mutex<Option<Result<T>>>,
    done: Condvar,
}

/// An optimization running on its own orchestrator thread.
#[derive(Debug)]
pub struct TrainingHandle<T> {
    token: CancellationToken,
    completion: Arc<Completion<T>>,
    thread: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> TrainingHandle<T> {
    pub(crate) fn spawn<F>(token: CancellationToken, job: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let completion = Arc::new(Completion {
            result: Mutex::new(None),
            done: Condvar::new(),
        });
        let shared = Arc::clone(&completion);
        let thread = thread::Builder::new()
            .name("loglinear-orchestrator".to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| {
                    warn!("optimization thread panicked");
                    Err(Error::WorkerPanicked)
                });
                let mut slot = shared
                    .result
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                *slot = Some(result);
                shared.done.notify_all();
            })?;
        Ok(Self {
            token,
            completion,
            thread: Some(thread),
        })
    }
}

impl<T> TrainingHandle<T> {
    /// Ask the optimization to stop after the datum each worker is on
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.completion
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Block until the orchestrator signals completion and return its result
    pub fn wait(mut self) -> Result<T> {
        let result = {
            let mut slot = self
                .completion
                .result
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(result) = slot.take() {
                    break result;
                }
                slot = self
                    .completion
                    .done
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        if let Some(thread) = self.thread.take() {
            // The job already ran to completion; the thread only has to exit
            let _ = thread.join();
        }
        result
    }
}
