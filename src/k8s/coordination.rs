//! Coordination of concurrent moves through an in-memory lease map.
//!
//! Moves of pods which share a parent controller must not mutate that controller's scheduler at
//! the same time. Before touching a controller, a move acquires a lease on the controller's key.
//! A lease is identified by a version which is unique across the lifetime of the map, and every
//! renewal or release must present that version. A caller presenting any other version is no
//! longer the lease holder, and its request is refused.
//!
//! A lease which is not renewed within its TTL is expired by the reaper task. The reaper invokes
//! the lease's expiry callback and only then frees the key, so that a new holder can never race
//! the callback. This is the safety net which restores a controller's scheduler when a move
//! fails to reach its own cleanup. The safety net only lives as long as this process does: if
//! the process exits mid-move, the controller stays invalidated.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::prelude::*;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A callback invoked with a lease's payload when the lease expires.
pub type ExpiryCallback<P> = Box<dyn FnOnce(P) -> BoxFuture<'static, ()> + Send>;

/// A live lease.
struct Lease<P> {
    /// The version issued to the holder of this lease.
    version: u64,
    /// The instant after which this lease is expired.
    deadline: Instant,
    /// The payload & expiry callback of this lease, taken by the reaper once expired.
    expiry: Option<(P, ExpiryCallback<P>)>,
}

/// The state shared by all handles to a lease map.
struct LeaseTable<P> {
    leases: HashMap<String, Lease<P>>,
    /// The last version issued for any key.
    last_version: u64,
}

/// A concurrency-safe map of keys to expiring, versioned leases.
pub struct LeaseMap<P> {
    table: Arc<Mutex<LeaseTable<P>>>,
    ttl: Duration,
}

impl<P> Clone for LeaseMap<P> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            ttl: self.ttl,
        }
    }
}

impl<P: Send + 'static> LeaseMap<P> {
    /// Create a new instance where leases live for `ttl` past their last acquisition or renewal.
    pub fn new(ttl: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(LeaseTable {
                leases: HashMap::new(),
                last_version: 0,
            })),
            ttl,
        }
    }

    /// Attempt to acquire the lease of `key`, returning the issued version on success.
    ///
    /// Acquisition fails while any lease of `key` is present, including a lease which has
    /// expired but whose expiry callback has not yet completed.
    pub fn acquire<F, Fut>(&self, key: &str, payload: P, on_expire: F) -> Option<u64>
    where
        F: FnOnce(P) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut table = self.table();
        if table.leases.contains_key(key) {
            return None;
        }
        table.last_version += 1;
        let version = table.last_version;
        let callback: ExpiryCallback<P> = Box::new(move |payload| on_expire(payload).boxed());
        table.leases.insert(
            key.into(),
            Lease {
                version,
                deadline: Instant::now() + self.ttl,
                expiry: Some((payload, callback)),
            },
        );
        tracing::debug!(key, version, "lease acquired");
        Some(version)
    }

    /// Attempt to acquire the lease of `key`, returning a guard over the lease on success.
    pub fn acquire_guard<F, Fut>(&self, key: &str, payload: P, on_expire: F) -> Option<LeaseGuard<P>>
    where
        F: FnOnce(P) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.acquire(key, payload, on_expire).map(|version| LeaseGuard {
            map: self.clone(),
            key: key.into(),
            version,
            released: false,
        })
    }

    /// Extend the lease of `key` by the TTL, if `version` is the live lease of `key`.
    pub fn renew(&self, key: &str, version: u64) -> bool {
        let mut table = self.table();
        let now = Instant::now();
        match table.leases.get_mut(key) {
            Some(lease) if lease.version == version && lease.expiry.is_some() && lease.deadline > now => {
                lease.deadline = now + self.ttl;
                true
            }
            _ => {
                tracing::debug!(key, version, "refusing to renew stale lease");
                false
            }
        }
    }

    /// Release the lease of `key`, if `version` is the current lease of `key`.
    ///
    /// This is a no-op once the reaper has begun expiring the lease.
    pub fn release(&self, key: &str, version: u64) {
        let mut table = self.table();
        let is_current = table
            .leases
            .get(key)
            .map(|lease| lease.version == version && lease.expiry.is_some())
            .unwrap_or(false);
        if is_current {
            table.leases.remove(key);
            tracing::debug!(key, version, "lease released");
        }
    }

    /// Check if any lease of `key` is present.
    pub fn is_held(&self, key: &str) -> bool {
        self.table().leases.contains_key(key)
    }

    /// The number of leases present, including expired leases not yet reaped.
    pub fn len(&self) -> usize {
        self.table().leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().leases.is_empty()
    }

    /// Expire all leases past their deadline, returning the number of callbacks invoked.
    ///
    /// Each expired lease's callback is invoked exactly once, after which the lease is removed.
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut table = self.table();
            table
                .leases
                .iter_mut()
                .filter(|(_, lease)| lease.deadline <= now)
                .filter_map(|(key, lease)| lease.expiry.take().map(|(payload, callback)| (key.clone(), lease.version, payload, callback)))
                .collect()
        };
        if expired.is_empty() {
            return 0;
        }

        let reaped = join_all(expired.into_iter().map(|(key, version, payload, callback)| async move {
            tracing::info!(%key, version, "lease expired, invoking expiry callback");
            callback(payload).await;
            (key, version)
        }))
        .await;

        let mut table = self.table();
        for (key, version) in reaped.iter() {
            if table.leases.get(key).map(|lease| lease.version == *version).unwrap_or(false) {
                table.leases.remove(key);
            }
        }
        reaped.len()
    }

    /// Spawn the reaper task, which expires leases on the given interval until shutdown.
    pub fn spawn_reaper(&self, interval: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let map = self.clone();
        tokio::spawn(async move {
            tracing::debug!(?interval, "lease reaper started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        map.reap_expired().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
            tracing::debug!("lease reaper stopped");
        })
    }

    fn table(&self) -> MutexGuard<'_, LeaseTable<P>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A held lease, released explicitly by its holder.
///
/// A guard dropped without being released leaves its lease in place, so that the reaper will
/// expire it and invoke its expiry callback.
pub struct LeaseGuard<P: Send + 'static> {
    map: LeaseMap<P>,
    key: String,
    version: u64,
    released: bool,
}

impl<P: Send + 'static> LeaseGuard<P> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Extend this lease, returning `false` if it is no longer held.
    pub fn renew(&self) -> bool {
        self.map.renew(&self.key, self.version)
    }

    /// Release this lease.
    pub fn release(mut self) {
        self.map.release(&self.key, self.version);
        self.released = true;
    }
}

impl<P: Send + 'static> Drop for LeaseGuard<P> {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(key = %self.key, version = self.version, "lease dropped without release, leaving it to expire");
        }
    }
}
