//! Single-resolution future with lazy evaluation and subscriber callbacks.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use wfcore::ExecutionError;

/// Outcome a promise settles on
pub type Settled<T> = Result<T, ExecutionError>;

type Subscriber<T> = Box<dyn FnOnce(&Settled<T>) + Send>;

/// A value that becomes available exactly once.
///
/// A promise is either lazy (its evaluation starts on the first [`Promise::wait`])
/// or pending (settled from outside through [`Promise::fulfill`]). Once settled it
/// never changes; every later `wait` returns a clone of the memoized outcome.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    settled: Notify,
}

struct State<T> {
    outcome: Option<Settled<T>>,
    evaluation: Option<BoxFuture<'static, Settled<T>>>,
    subscribers: Vec<Subscriber<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("resolved", &self.shared.state.lock().outcome.is_some())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    fn from_state(state: State<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                settled: Notify::new(),
            }),
        }
    }

    /// Promise whose value is computed by `evaluation` on first `wait`
    pub fn lazy<F>(evaluation: F) -> Self
    where
        F: Future<Output = Settled<T>> + Send + 'static,
    {
        Self::from_state(State {
            outcome: None,
            evaluation: Some(Box::pin(evaluation)),
            subscribers: Vec::new(),
        })
    }

    /// Promise settled later through [`Promise::fulfill`]
    pub fn pending() -> Self {
        Self::from_state(State {
            outcome: None,
            evaluation: None,
            subscribers: Vec::new(),
        })
    }

    pub fn resolved(value: T) -> Self {
        Self::settled(Ok(value))
    }

    pub fn rejected(error: impl Into<ExecutionError>) -> Self {
        Self::settled(Err(error.into()))
    }

    fn settled(outcome: Settled<T>) -> Self {
        Self::from_state(State {
            outcome: Some(outcome),
            evaluation: None,
            subscribers: Vec::new(),
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// Settle the promise. Returns false, leaving the promise untouched, if it already settled.
    pub fn fulfill(&self, outcome: Settled<T>) -> bool {
        let subscribers = {
            let mut state = self.shared.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            state.evaluation = None;
            std::mem::take(&mut state.subscribers)
        };

        for subscriber in subscribers {
            subscriber(&outcome);
        }
        self.shared.settled.notify_waiters();
        true
    }

    /// Run `callback` with the outcome.
    ///
    /// Callbacks registered before settlement run once, in registration order,
    /// when the promise settles. After settlement they run immediately.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: FnOnce(&Settled<T>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.shared.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.subscribers.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }

    /// Wait for the outcome, starting a lazy evaluation if nobody has yet.
    ///
    /// The evaluation runs on its own task, so a waiter dropped mid-evaluation
    /// leaves it running for everyone else.
    pub async fn wait(&self) -> Settled<T> {
        loop {
            let notified = self.shared.settled.notified();
            let evaluation = {
                let mut state = self.shared.state.lock();
                if let Some(outcome) = &state.outcome {
                    return outcome.clone();
                }
                state.evaluation.take()
            };

            if let Some(evaluation) = evaluation {
                let promise = self.clone();
                tokio::spawn(async move {
                    let outcome = evaluation.await;
                    promise.fulfill(outcome);
                });
            }
            notified.await;
        }
    }

    /// Chain a computation on the value; errors pass through untouched
    pub fn then<U, F, Fut>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Settled<U>> + Send + 'static,
    {
        let upstream = self.clone();
        Promise::lazy(async move {
            let value = upstream.wait().await?;
            f(value).await
        })
    }
}
