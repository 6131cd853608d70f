//! Coalescing of identical in-flight requests.
//!
//! The first caller registers a shared future under the request fingerprint;
//! identical callers arriving while it runs await the same future instead of
//! dispatching again. Inside a Tokio runtime the future is also driven by a
//! detached task, so it settles and removes its registration whatever the
//! outcome, even when every caller has been cancelled.

use crate::fingerprint;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use http::Method;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A registered in-flight request. Clones observe the same outcome.
pub type PendingRequest<T> = Shared<BoxFuture<'static, T>>;

struct Slot<T: Clone> {
    id: u64,
    future: PendingRequest<T>,
}

type PendingMap<T> = DashMap<String, Slot<T>>;

/// Removes its registration when dropped. Lives inside the registered future,
/// so it drops on completion, on panic unwind, and if the future is discarded.
struct Deregister<T: Clone> {
    pending: Weak<PendingMap<T>>,
    key: String,
    id: u64,
}

impl<T: Clone> Drop for Deregister<T> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.upgrade() {
            // A newer registration under the same key is left alone.
            let removed = pending.remove_if(&self.key, |_, slot| slot.id == self.id);
            drop(removed);
        }
    }
}

/// Registry of in-flight requests keyed by fingerprint.
pub struct RequestDeduplication<T: Clone> {
    pending: Arc<PendingMap<T>>,
    next_id: AtomicU64,
}

impl<T> RequestDeduplication<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Derives the coalescing key from method, URL and payload.
    pub fn generate_key(method: &Method, url: &str, payload: Option<&Value>) -> String {
        fingerprint::dedup_key(method, url, payload)
    }

    pub fn has_pending_request(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Returns a handle on the in-flight request registered under `key`.
    pub fn get_pending_request(&self, key: &str) -> Option<PendingRequest<T>> {
        self.pending.get(key).map(|slot| slot.future.clone())
    }

    /// Registers `future` under `key`, replacing any previous registration,
    /// and returns the shared handle to await.
    pub fn add_pending_request<F>(&self, key: impl Into<String>, future: F) -> PendingRequest<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let key = key.into();
        let slot = self.wrap(key.clone(), future);
        let shared = slot.future.clone();
        let replaced = self.pending.insert(key, slot);
        drop(replaced);
        shared
    }

    /// Joins the request in flight under `key`, or registers the one built by
    /// `make` if there is none.
    ///
    /// Lookup and registration happen under a single map lock, so of two
    /// concurrent identical callers exactly one registers. The boolean is
    /// `true` for the caller that registered.
    pub fn get_or_register<F, Fut>(&self, key: impl Into<String>, make: F) -> (PendingRequest<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let key = key.into();
        match self.pending.entry(key) {
            Entry::Occupied(occupied) => (occupied.get().future.clone(), false),
            Entry::Vacant(vacant) => {
                let slot = self.wrap(vacant.key().clone(), make());
                let shared = slot.future.clone();
                vacant.insert(slot);
                (shared, true)
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Forgets every registration. Requests already running still complete
    /// for the callers awaiting them.
    pub fn clear(&self) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let removed = self.pending.remove(&key);
            drop(removed);
        }
    }

    fn wrap<F>(&self, key: String, future: F) -> Slot<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = Deregister {
            pending: Arc::downgrade(&self.pending),
            key,
            id,
        };
        let future = async move {
            let _guard = guard;
            future.await
        }
        .boxed()
        .shared();
        // Drives the request to completion even if every caller gives up, so
        // the registration is always released.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            drop(runtime.spawn(future.clone()));
        }
        Slot { id, future }
    }
}

impl<T> Default for RequestDeduplication<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
