//! Short-TTL inventory cache.
//!
//! Snapshots live in a copy-on-write map behind an `ArcSwap`, so hits never
//! take a lock. A miss registers a shared future for its reference; every
//! caller that misses on the same reference while it runs awaits that one
//! future instead of issuing its own fetch.

use crate::error::{EsxiError, EsxiResult};
use crate::types::{InventoryObject, ObjectKind, ObjectRef, PropertyMap};

use arc_swap::ArcSwap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What to do when a refresh fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Propagate the refresh error.
    #[default]
    Fresh,
    /// Fall back to the expired snapshot, unless it is older than `max_age`.
    StaleAllowed { max_age: Option<Duration> },
}

/// Result of a cache read.
#[derive(Debug, Clone)]
pub struct CacheRead {
    pub object: Arc<InventoryObject>,
    /// Served from an expired snapshot after a failed refresh
    pub stale: bool,
}

impl CacheRead {
    fn fresh(object: Arc<InventoryObject>) -> Self {
        Self { object, stale: false }
    }
}

type FetchFuture = Shared<BoxFuture<'static, EsxiResult<Arc<InventoryObject>>>>;

struct InFlight {
    id: u64,
    future: FetchFuture,
}

struct Inner {
    ttl: Duration,
    entries: ArcSwap<HashMap<ObjectRef, Arc<InventoryObject>>>,
    in_flight: Mutex<HashMap<ObjectRef, InFlight>>,
    next_id: AtomicU64,
}

impl Inner {
    /// Store a finished fetch, unless its in-flight marker was cleared by an
    /// invalidation in the meantime.
    fn complete(
        &self,
        id: u64,
        reference: ObjectRef,
        result: EsxiResult<PropertyMap>,
    ) -> EsxiResult<Arc<InventoryObject>> {
        let mut in_flight = self.in_flight.lock();
        let still_current = in_flight.get(&reference).map(|f| f.id) == Some(id);
        if still_current {
            in_flight.remove(&reference);
        }

        let object = Arc::new(InventoryObject::new(reference, result?));
        if still_current {
            self.entries.rcu(|map| {
                let mut next = (**map).clone();
                next.insert(object.reference.clone(), object.clone());
                next
            });
        } else {
            log::debug!("Discarding fetch of {} invalidated mid-flight", object.reference);
        }
        Ok(object)
    }
}

/// Reference → latest snapshot, shared by clones.
#[derive(Clone)]
pub struct InventoryCache {
    inner: Arc<Inner>,
}

impl InventoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                ttl,
                entries: ArcSwap::from_pointee(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Return a fresh snapshot of `reference` holding `attributes`, calling
    /// `fetch` on a miss. `fetch` is not called when another caller's fetch
    /// for the same reference is already running.
    pub async fn get<F, Fut>(
        &self,
        reference: &ObjectRef,
        attributes: &[String],
        policy: CachePolicy,
        fetch: F,
    ) -> EsxiResult<CacheRead>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EsxiResult<PropertyMap>> + Send + 'static,
    {
        let own = loop {
            if let Some(hit) = self.fresh_hit(reference, attributes) {
                return Ok(CacheRead::fresh(hit));
            }

            let joined = {
                let mut in_flight = self.inner.in_flight.lock();
                match in_flight.entry(reference.clone()) {
                    Entry::Occupied(running) => running.get().future.clone(),
                    Entry::Vacant(slot) => {
                        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                        let inner = self.inner.clone();
                        let key = reference.clone();
                        let pending = fetch();
                        let future = async move { inner.complete(id, key, pending.await) }
                            .boxed()
                            .shared();
                        slot.insert(InFlight { id, future: future.clone() });
                        break future;
                    }
                }
            };

            match joined.await {
                Ok(object) if object.has_attributes(attributes) => {
                    return Ok(CacheRead::fresh(object))
                }
                // Someone else's fetch asked for fewer attributes; go again.
                Ok(_) => continue,
                Err(e) => return self.fallback(reference, attributes, policy, e),
            }
        };

        match own.await {
            Ok(object) => Ok(CacheRead::fresh(object)),
            Err(e) => self.fallback(reference, attributes, policy, e),
        }
    }

    fn fresh_hit(&self, reference: &ObjectRef, attributes: &[String]) -> Option<Arc<InventoryObject>> {
        self.inner
            .entries
            .load()
            .get(reference)
            .filter(|o| o.age() < self.inner.ttl && o.has_attributes(attributes))
            .cloned()
    }

    fn fallback(
        &self,
        reference: &ObjectRef,
        attributes: &[String],
        policy: CachePolicy,
        err: EsxiError,
    ) -> EsxiResult<CacheRead> {
        let CachePolicy::StaleAllowed { max_age } = policy else {
            return Err(err);
        };
        let Some(old) = self.peek(reference).filter(|o| o.has_attributes(attributes)) else {
            return Err(err);
        };
        if let Some(max) = max_age {
            if old.age() > max {
                return Err(EsxiError::stale(format!(
                    "{} snapshot is {}s old (limit {}s) and refresh failed: {}",
                    reference,
                    old.age().as_secs(),
                    max.as_secs(),
                    err
                )));
            }
        }
        log::warn!("Serving stale snapshot of {} after failed refresh: {}", reference, err);
        Ok(CacheRead { object: old, stale: true })
    }

    /// Latest snapshot regardless of age.
    pub fn peek(&self, reference: &ObjectRef) -> Option<Arc<InventoryObject>> {
        self.inner.entries.load().get(reference).cloned()
    }

    /// Drop the snapshot of `reference`; a fetch already running for it
    /// will not be stored.
    pub fn invalidate(&self, reference: &ObjectRef) {
        let mut in_flight = self.inner.in_flight.lock();
        in_flight.remove(reference);
        self.inner.entries.rcu(|map| {
            let mut next = (**map).clone();
            next.remove(reference);
            next
        });
    }

    pub fn invalidate_all(&self) {
        let mut in_flight = self.inner.in_flight.lock();
        in_flight.clear();
        self.inner.entries.store(Arc::new(HashMap::new()));
    }

    pub fn len(&self) -> usize {
        self.inner.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All cached snapshots of one kind, fresh or not.
    pub fn objects_of_kind(&self, kind: &ObjectKind) -> Vec<Arc<InventoryObject>> {
        self.inner
            .entries
            .load()
            .values()
            .filter(|o| o.kind() == kind)
            .cloned()
            .collect()
    }
}
