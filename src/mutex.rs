//! Keyed single-flight mutual exclusion.
//!
//! [`NamedMutex::run`] admits one operation per key. Callers that arrive
//! while that operation is in flight are queued and handed its outcome
//! instead of running their own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{trace, warn};

type Waiter<T, E> = oneshot::Sender<Result<T, E>>;

/// Raised to waiters when the admitted operation panicked or was torn down
/// before producing a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationAborted(pub String);

impl std::fmt::Display for OperationAborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<OperationAborted> for crate::error::PluginError {
    fn from(e: OperationAborted) -> Self {
        crate::error::PluginError::Aborted(e.0)
    }
}

/// Pending waiters per key. Owned by whoever owns the mutex, never global.
pub struct NamedMutex<T, E> {
    pending: Arc<Mutex<HashMap<String, Vec<Waiter<T, E>>>>>,
}

impl<T, E> NamedMutex<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<OperationAborted> + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of keys with an operation currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Run `operation` for `key`, or join the one already running.
    ///
    /// The operation, including the closure that builds it, executes on its
    /// own task so that dropping the first caller or a panic does not strand
    /// the callers queued behind it.
    pub async fn run<F, Fut>(&self, key: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let admitted = {
            let Ok(mut pending) = self.pending.lock() else {
                return Err(OperationAborted("named mutex poisoned".to_string()).into());
            };
            match pending.get_mut(key) {
                Some(waiters) => {
                    trace!(key = %key, queued = waiters.len() + 1, "Joining in-flight operation");
                    waiters.push(tx);
                    false
                }
                None => {
                    pending.insert(key.to_string(), vec![tx]);
                    true
                }
            }
        };

        if admitted {
            let pending = Arc::clone(&self.pending);
            let key = key.to_string();
            tokio::spawn(async move {
                let result = match tokio::spawn(async move { operation().await }).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(key = %key, "Named mutex operation aborted: {}", e);
                        Err(OperationAborted(format!("operation for {key} aborted: {e}")).into())
                    }
                };

                // Remove the entry before fanning out so a caller arriving
                // after this point starts a fresh operation.
                let waiters = match pending.lock() {
                    Ok(mut pending) => pending.remove(&key).unwrap_or_default(),
                    Err(_) => Vec::new(),
                };
                trace!(key = %key, waiters = waiters.len(), "Dispatching named mutex result");
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        }

        rx.await
            .unwrap_or_else(|_| Err(OperationAborted(format!("result for {key} was dropped")).into()))
    }
}

impl<T, E> Default for NamedMutex<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<OperationAborted> + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
