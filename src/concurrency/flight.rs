use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

use super::lock;

/// Cloneable handle on a computation that may have several awaiters.
pub type Flight<T> = Shared<BoxFuture<'static, T>>;

/// Collapses concurrent calls with the same key onto one in-flight future.
///
/// The slot for a key is cleared in the same poll that produces the result,
/// so a call made after settlement starts a fresh computation.
pub struct SingleFlight<K, T> {
    inflight: Arc<Mutex<HashMap<K, Flight<T>>>>,
}

impl<K, T> Clone for SingleFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T> fmt::Debug for SingleFlight<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("inflight", &lock(&self.inflight).len())
            .finish()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Hash + Eq + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight computation for `key`, or start one with `call`.
    ///
    /// `call` runs on first poll of the returned future, outside the lock.
    pub fn run_once<F, Fut>(&self, key: K, call: F) -> Flight<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut inflight = lock(&self.inflight);
        if let Some(existing) = inflight.get(&key) {
            return existing.clone();
        }

        let slots = Arc::clone(&self.inflight);
        let slot = key.clone();
        let flight = async move {
            let output = call().await;
            lock(&slots).remove(&slot);
            output
        }
        .boxed()
        .shared();
        inflight.insert(key, flight.clone());
        flight
    }

    pub fn is_running(&self, key: &K) -> bool {
        lock(&self.inflight).contains_key(key)
    }
}

/// A single async function guarded by [`SingleFlight`]: overlapping calls
/// share one execution, later calls run it again.
pub struct CallableOnce<T> {
    call: Arc<dyn Fn() -> BoxFuture<'static, T> + Send + Sync>,
    flight: SingleFlight<(), T>,
}

impl<T> Clone for CallableOnce<T> {
    fn clone(&self) -> Self {
        Self {
            call: Arc::clone(&self.call),
            flight: self.flight.clone(),
        }
    }
}

impl<T> fmt::Debug for CallableOnce<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableOnce")
            .field("flight", &self.flight)
            .finish_non_exhaustive()
    }
}

impl<T> CallableOnce<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(call: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            call: Arc::new(move || call().boxed()),
            flight: SingleFlight::new(),
        }
    }

    pub fn call(&self) -> Flight<T> {
        let call = Arc::clone(&self.call);
        self.flight.run_once((), move || call())
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_running(&())
    }
}
