//! Single-flight request coordination.
//!
//! Concurrent `resolve` calls for the same key share one underlying
//! resolution. The first caller starts it on a task owned by the coordinator;
//! every caller, the first included, queues as a waiter and receives the same
//! outcome, in arrival order, when it completes. A caller giving up early
//! (its own deadline, or its future being dropped) leaves the flight running
//! for the others.

use crate::config::ResolverConfig;
use crate::metrics::MetricEvent;
use crate::model::ResolutionKey;
use crate::resolver::{LayeredResolver, Resolution, ResolveOptions};
use crate::{Error, Result};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Waiter = oneshot::Sender<Result<Resolution>>;
type PendingMap = HashMap<ResolutionKey, Vec<Waiter>>;

/// Wraps a [`LayeredResolver`] with per-key deduplication and a hard deadline.
pub struct RequestCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    resolver: LayeredResolver,
    pending: Mutex<PendingMap>,
    deadline: Duration,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timed_out(&self, key: &ResolutionKey, started: Instant) -> Error {
        let after_ms = started.elapsed().as_millis() as u64;
        self.resolver.metrics().emit(&MetricEvent::TimedOut {
            key: key.clone(),
            after_ms,
        });
        Error::Timeout {
            key: key.clone(),
            after_ms,
        }
    }

    /// Run one resolution and hand its outcome to every queued waiter.
    async fn fly(self: Arc<Self>, key: ResolutionKey, opts: ResolveOptions) {
        let flight = Flight {
            inner: &*self,
            key: &key,
            done: false,
        };
        let cancel = self.resolver.cancellation();
        let deadline = opts.deadline.unwrap_or(self.deadline);
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.resolver.metrics().emit(&MetricEvent::Cancelled { key: key.clone() });
                Err(Error::Cancelled)
            }
            outcome = tokio::time::timeout(deadline, self.resolver.resolve(&key, &opts)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Resolution for {} hit the {}ms deadline", key, deadline.as_millis());
                        Err(self.timed_out(&key, started))
                    }
                }
            }
        };

        flight.finish(&result);
    }
}

impl RequestCoordinator {
    pub fn new(resolver: LayeredResolver, config: &ResolverConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                pending: Mutex::new(HashMap::new()),
                deadline: config.request_deadline(),
            }),
        }
    }

    pub fn resolver(&self) -> &LayeredResolver {
        &self.inner.resolver
    }

    /// Abort every in-flight and queued resolution with [`Error::Cancelled`].
    pub fn cancel_all(&self) {
        self.inner.resolver.cancellation().cancel();
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.inner.resolver.cancellation()
    }

    /// Number of keys with a resolution in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.pending().len()
    }

    /// Resolve `key`, joining an in-flight resolution for the same key if one
    /// exists.
    ///
    /// The call's own deadline (`opts.deadline`, else the configured request
    /// deadline) bounds the wait even when another caller leads the flight.
    pub async fn resolve(&self, key: &ResolutionKey, opts: ResolveOptions) -> Result<Resolution> {
        let cancel = self.inner.resolver.cancellation();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let deadline = opts.deadline.unwrap_or(self.inner.deadline);
        let started = Instant::now();
        let (rx, leads) = self.enqueue(key, opts);

        // The flight answers cancellation itself and enforces the leader's
        // deadline. A dropped sender means the runtime is shutting down.
        if leads {
            return rx.await.unwrap_or(Err(Error::Cancelled));
        }

        debug!("Joining in-flight resolution for {}", key);
        match tokio::time::timeout(deadline, rx).await {
            Ok(result) => result.unwrap_or(Err(Error::Cancelled)),
            Err(_) => {
                debug!("Gave up waiting on {} after {}ms", key, deadline.as_millis());
                Err(self.inner.timed_out(key, started))
            }
        }
    }

    /// Atomically queue as a waiter, starting the flight if none is running.
    fn enqueue(&self, key: &ResolutionKey, opts: ResolveOptions) -> (oneshot::Receiver<Result<Resolution>>, bool) {
        let (tx, rx) = oneshot::channel();
        let leads = match self.inner.pending().entry(key.clone()) {
            Entry::Occupied(mut waiting) => {
                waiting.get_mut().push(tx);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![tx]);
                true
            }
        };
        if leads {
            tokio::spawn(Arc::clone(&self.inner).fly(key.clone(), opts));
        }
        (rx, leads)
    }
}

/// A flight's claim on a key. Releasing it removes the pending entry; if the
/// flight is torn down before finishing, waiters get [`Error::Cancelled`].
struct Flight<'a> {
    inner: &'a Inner,
    key: &'a ResolutionKey,
    done: bool,
}

impl Flight<'_> {
    fn take_waiters(&self) -> Vec<Waiter> {
        self.inner.pending().remove(self.key).unwrap_or_default()
    }

    fn finish(mut self, result: &Result<Resolution>) {
        self.done = true;
        let waiters = self.take_waiters();
        if waiters.len() > 1 {
            debug!("Releasing {} waiters for {}", waiters.len(), self.key);
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        for waiter in self.take_waiters() {
            let _ = waiter.send(Err(Error::Cancelled));
        }
    }
}
