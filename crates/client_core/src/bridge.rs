//! Runs remote calls on worker tasks and reports each outcome exactly once.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use shared::error::ApiError;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

use crate::error::CallError;

pub type CallResult<T> = Result<T, CallError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Returned by [`CallBridge::invoke`]. `worker` is `None` when the call was
/// rejected before a worker was started.
#[derive(Debug)]
pub struct CallHandle {
    pub id: CallId,
    pub worker: Option<JoinHandle<()>>,
}

pub struct CallBridge {
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    max_queued: usize,
    next_id: AtomicU64,
}

impl CallBridge {
    pub fn new(max_concurrent: usize, max_queued: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            waiting: Arc::new(AtomicUsize::new(0)),
            max_queued,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Starts `call` off the caller's task. `deliver` receives the outcome
    /// exactly once: from the worker, or synchronously with
    /// [`CallError::Saturated`] when every slot and every wait position is
    /// taken.
    pub fn invoke<T, F, Fut, D>(&self, call: F, deliver: D) -> CallHandle
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
        D: FnOnce(CallId, CallResult<T>) + Send + 'static,
    {
        let id = CallId(self.next_id.fetch_add(1, Ordering::Relaxed));

        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            let worker = tokio::spawn(async move {
                let outcome = run_call(id, call, permit).await;
                deliver(id, outcome);
            });
            return CallHandle {
                id,
                worker: Some(worker),
            };
        }

        let max_queued = self.max_queued;
        let reserved = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_queued).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            warn!(%id, max_queued, "call bridge saturated, rejecting call");
            deliver(id, Err(CallError::Saturated));
            return CallHandle { id, worker: None };
        }

        debug!(%id, "call waiting for a bridge slot");
        let permits = Arc::clone(&self.permits);
        let waiting = Arc::clone(&self.waiting);
        let worker = tokio::spawn(async move {
            let permit = permits.acquire_owned().await;
            waiting.fetch_sub(1, Ordering::AcqRel);
            let outcome = match permit {
                Ok(permit) => run_call(id, call, permit).await,
                Err(err) => Err(CallError::Aborted(err.to_string())),
            };
            deliver(id, outcome);
        });
        CallHandle {
            id,
            worker: Some(worker),
        }
    }
}

async fn run_call<T, F, Fut>(id: CallId, call: F, permit: OwnedSemaphorePermit) -> CallResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
{
    // The call gets its own task so a panic surfaces as a JoinError.
    let joined = tokio::spawn(async move { call().await }).await;
    drop(permit);

    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            let err = CallError::from_api(err);
            error!(%id, "call failed: {err}");
            Err(err)
        }
        Err(join_err) => {
            error!(%id, "call worker aborted: {join_err}");
            Err(CallError::Aborted(join_err.to_string()))
        }
    }
}

#[cfg(test)]
#[path = "tests/bridge_tests.rs"]
mod tests;
