use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, trace};

use super::{CacheStats, CachedObject, ObjectCache};
use crate::error::Result;

type FetchResult = Result<CachedObject>;

/// Shared result of one upstream fetch. `None` marks a fetch whose leader went away.
struct InFlightState {
    result: OnceCell<Option<FetchResult>>,
    notify: Notify,
}

impl InFlightState {
    fn new() -> Self {
        Self {
            result: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    fn set_result(&self, result: Option<FetchResult>) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> Option<FetchResult> {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}

type InFlightRequest = Arc<InFlightState>;

/// Collapses concurrent fetches of the same key into one.
///
/// The first caller for a key becomes the leader and runs the producer. Everyone arriving while it
/// runs waits for the same result. The leader stores successes in the [`ObjectCache`] before the
/// pending entry is removed, so a caller arriving afterwards hits the cache instead of refetching.
#[derive(Clone)]
pub struct Coalescer {
    cache: ObjectCache,
    in_flight: Arc<DashMap<String, InFlightRequest>>,
}

impl Coalescer {
    pub fn new(cache: ObjectCache) -> Self {
        Self {
            cache,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            in_flight: self.in_flight_count(),
            ..self.cache.stats()
        }
    }

    /// Returns `(request, is_leader)`.
    fn get_or_create_in_flight(&self, key: &str) -> (InFlightRequest, bool) {
        if let Some(existing) = self.in_flight.get(key) {
            return (existing.clone(), false);
        }

        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let request = Arc::new(InFlightState::new());
                entry.insert(request.clone());
                (request, true)
            }
        }
    }

    /// Run `produce` for `key` unless a fetch for it is already running, in which case its result
    /// is awaited instead. Successful results land in the cache.
    ///
    /// A waiter whose leader is dropped before finishing starts over, either leading a new fetch
    /// or joining whichever caller got there first.
    pub async fn with_coalescing<F, Fut>(&self, key: &str, produce: F) -> Result<CachedObject>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedObject>>,
    {
        loop {
            let (request, is_leader) = self.get_or_create_in_flight(key);

            if is_leader {
                return self.lead(key, request, produce).await;
            }

            trace!(key, "Joining in-flight fetch");
            match request.wait().await {
                Some(result) => return result,
                None => debug!(key, "In-flight fetch abandoned, taking over"),
            }
        }
    }

    async fn lead<F, Fut>(
        &self,
        key: &str,
        request: InFlightRequest,
        produce: F,
    ) -> Result<CachedObject>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedObject>>,
    {
        let mut guard = LeaderGuard {
            coalescer: self,
            key,
            request,
            settled: false,
        };

        let result = produce().await;
        if let Ok(object) = &result {
            self.cache.set(key, object.clone());
        }
        guard.settle(Some(result.clone()));

        result
    }
}

/// Settles the pending entry when the leader finishes or is dropped mid-fetch.
struct LeaderGuard<'a> {
    coalescer: &'a Coalescer,
    key: &'a str,
    request: InFlightRequest,
    settled: bool,
}

impl LeaderGuard<'_> {
    fn settle(&mut self, result: Option<FetchResult>) {
        self.settled = true;
        self.coalescer
            .in_flight
            .remove_if(self.key, |_, current| Arc::ptr_eq(current, &self.request));
        self.request.set_result(result);
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(key = self.key, "Leader dropped before its fetch settled");
            self.settle(None);
        }
    }
}
