use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{AcquireCancelled, ConfigError};
use crate::guard::{
    Acquisition, Guard, OwnedPoolGuard, OwnedTimeoutPoolGuard, PoolGuard, TimeoutGuard,
    TimeoutPoolGuard,
};
use crate::options::PoolOptions;
use crate::releaser::Releaser;

/// An honest retry of the get-or-create step happens when the looked-up slot
/// was concurrently retired, which requires another task to have completed a
/// release in the meantime. Hitting this many retries in a row means the
/// retry loop itself is broken, not that the pool is busy.
const MAX_RETIRE_RACE_RETRIES: u32 = 1024;

/// A pool of awaitable locks where individual locks can be acquired and
/// released by key. It initially considers all keys as "unlocked", but they
/// can be locked and if a second task tries to acquire a lock for the same
/// key, it will have to wait.
///
/// Unrelated keys never contend with each other; tasks locking the same key
/// are admitted at most [PoolOptions::concurrency] at a time (1 by default,
/// which makes each key an exclusive lock). Waiting suspends the task, it
/// never blocks the thread.
///
/// ```
/// use semapool::SemaphorePool;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let pool = SemaphorePool::new();
/// let guard1 = pool.lock_async(4).await;
/// let guard2 = pool.lock_async(5).await;
///
/// // This next line would deadlock because `4` is already locked on this task
/// // let guard3 = pool.lock_async(4).await;
///
/// // After dropping the corresponding guard, we can lock it again
/// std::mem::drop(guard1);
/// let guard3 = pool.lock_async(4).await;
/// # });
/// ```
///
/// You can use an arbitrary type to index locks by, as long as that type implements [PartialEq] + [Eq] + [Hash] + [Clone] + [Debug].
///
/// Under the hood, a [SemaphorePool] is a [HashMap] of reference-counted
/// [Semaphore](tokio::sync::Semaphore)s, with some logic making sure there
/// aren't any race conditions when accessing the hash map. Slots whose last
/// holder released them are kept in an internal object pool and rebound to
/// new keys, so steady-state locking does not allocate (see
/// [PoolOptions::pooling]).
pub struct SemaphorePool<K>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
{
    shared: Mutex<Shared<K>>,
    options: PoolOptions,
}

/// The map and the free list are mutated together (an entry retiring out of
/// the map may move onto the free list in the same step), so they live under
/// one mutex.
struct Shared<K> {
    bound: HashMap<K, Arc<Releaser<K>>>,
    free_list: Vec<Arc<Releaser<K>>>,
}

impl<K> Debug for SemaphorePool<K>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphorePool")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<K> Default for SemaphorePool<K>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
{
    #[inline]
    fn default() -> Self {
        Self {
            shared: Mutex::new(Shared {
                bound: HashMap::new(),
                free_list: Vec::new(),
            }),
            options: PoolOptions::default(),
        }
    }
}

impl<K> SemaphorePool<K>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
{
    /// Create a new pool with the default [PoolOptions], where no lock is
    /// locked.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new pool with the given options.
    ///
    /// Errors
    /// -----
    /// Validation is eager and fails fast, see [ConfigError] for the invalid
    /// configurations.
    pub fn with_options(options: PoolOptions) -> Result<Self, ConfigError> {
        let options = options.validate()?;
        Ok(Self {
            shared: Mutex::new(Shared {
                bound: HashMap::new(),
                free_list: Vec::new(),
            }),
            options,
        })
    }

    /// Return the number of keys that currently have holders or waiters
    /// attached.
    #[inline]
    pub fn num_active_keys(&self) -> usize {
        self._shared().bound.len()
    }

    /// Return the number of retired lock slots currently kept for reuse under
    /// future keys. Always 0 when pooling is disabled.
    #[inline]
    pub fn num_pooled(&self) -> usize {
        self._shared().free_list.len()
    }

    /// Lock a lock by key.
    ///
    /// If the lock with this key is currently held by a different task, then
    /// the current task suspends until it becomes available. Upon returning, a
    /// RAII guard is returned to allow scoped release of the lock. When the
    /// guard goes out of scope, the lock will be released.
    ///
    /// The exact behavior on locking a lock in a task which already holds the
    /// lock is left unspecified. However, this function will not return on the
    /// second call (with the default concurrency of 1 it will deadlock).
    ///
    /// Cancelling the returned future (for example by racing it in a
    /// `select!`) is safe and leaves the pool as if the call had never been
    /// made.
    ///
    /// Examples
    /// -----
    /// ```
    /// use semapool::SemaphorePool;
    ///
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let pool = SemaphorePool::new();
    /// let guard1 = pool.lock_async(4).await;
    /// let guard2 = pool.lock_async(5).await;
    ///
    /// // After dropping the corresponding guard, we can lock it again
    /// std::mem::drop(guard1);
    /// let guard3 = pool.lock_async(4).await;
    /// # });
    /// ```
    pub async fn lock_async(&self, key: K) -> PoolGuard<'_, K> {
        Self::_lock_async(self, key).await
    }

    /// Lock a lock by key.
    ///
    /// This is similar to [SemaphorePool::lock_async], but it works on an
    /// `Arc<SemaphorePool>` and returns a guard with the `'static` lifetime
    /// that clones the [Arc] instead of borrowing the pool. Such a guard can
    /// be moved into spawned tasks or stored more easily.
    pub async fn lock_owned_async(self: &Arc<Self>, key: K) -> OwnedPoolGuard<K> {
        Self::_lock_async(Arc::clone(self), key).await
    }

    /// Lock a lock by key, aborting the wait when `cancellation` is
    /// cancelled.
    ///
    /// Cancellation is the only error this can return; it is raised to the
    /// caller rather than resolved internally because only the caller knows
    /// whether giving up is acceptable. A cancelled call has not consumed a
    /// permit and leaves no trace in the pool.
    pub async fn lock_cancellable_async<'a>(
        &'a self,
        key: K,
        cancellation: &CancellationToken,
    ) -> Result<PoolGuard<'a, K>, AcquireCancelled<K>> {
        Self::_lock_cancellable_async(self, key, cancellation).await
    }

    /// Like [SemaphorePool::lock_cancellable_async] but returning a `'static`
    /// guard, see [SemaphorePool::lock_owned_async].
    pub async fn lock_owned_cancellable_async(
        self: &Arc<Self>,
        key: K,
        cancellation: &CancellationToken,
    ) -> Result<OwnedPoolGuard<K>, AcquireCancelled<K>> {
        Self::_lock_cancellable_async(Arc::clone(self), key, cancellation).await
    }

    /// Attempt to lock a lock by key, waiting at most `timeout`.
    ///
    /// The timeout elapsing is a normal outcome, not an error: the returned
    /// guard reports through [TimeoutGuard::acquired] whether the lock was
    /// actually obtained, and its disposal does the right thing either way. A
    /// timed-out attempt has not consumed a permit, so dropping its guard
    /// will not let an extra holder through.
    ///
    /// A `timeout` of zero is an immediate attempt: it succeeds if and only
    /// if a permit for `key` is free right now.
    ///
    /// Examples
    /// -----
    /// ```
    /// use semapool::SemaphorePool;
    /// use std::time::Duration;
    ///
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let pool = SemaphorePool::new();
    /// let held = pool.lock_async("busy").await;
    ///
    /// let attempt = pool.try_lock_async("busy", Duration::from_millis(10)).await;
    /// assert!(!attempt.acquired());
    ///
    /// std::mem::drop(held);
    /// let attempt = pool.try_lock_async("busy", Duration::from_millis(10)).await;
    /// assert!(attempt.acquired());
    /// # });
    /// ```
    pub async fn try_lock_async(&self, key: K, timeout: Duration) -> TimeoutPoolGuard<'_, K> {
        Self::_try_lock_async(self, key, timeout).await
    }

    /// Like [SemaphorePool::try_lock_async] but returning a `'static` guard,
    /// see [SemaphorePool::lock_owned_async].
    pub async fn try_lock_owned_async(
        self: &Arc<Self>,
        key: K,
        timeout: Duration,
    ) -> OwnedTimeoutPoolGuard<K> {
        Self::_try_lock_async(Arc::clone(self), key, timeout).await
    }

    /// Attempt to lock a lock by key, waiting at most `timeout` and aborting
    /// early when `cancellation` is cancelled.
    ///
    /// The timeout is reported as a status on the guard, cancellation as an
    /// error, see [SemaphorePool::try_lock_async] and
    /// [SemaphorePool::lock_cancellable_async].
    pub async fn try_lock_cancellable_async<'a>(
        &'a self,
        key: K,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> Result<TimeoutPoolGuard<'a, K>, AcquireCancelled<K>> {
        Self::_try_lock_cancellable_async(self, key, timeout, cancellation).await
    }

    /// Like [SemaphorePool::try_lock_cancellable_async] but returning a
    /// `'static` guard, see [SemaphorePool::lock_owned_async].
    pub async fn try_lock_owned_cancellable_async(
        self: &Arc<Self>,
        key: K,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> Result<OwnedTimeoutPoolGuard<K>, AcquireCancelled<K>> {
        Self::_try_lock_cancellable_async(Arc::clone(self), key, timeout, cancellation).await
    }

    fn _shared(&self) -> MutexGuard<'_, Shared<K>> {
        self.shared
            .lock()
            .expect("The mutex protecting the pool's key map is poisoned. This shouldn't happen since there shouldn't be any user code running while this lock is held so no thread should ever panic with it")
    }

    /// Find the slot bound to `key` and register on it, or bind a slot to
    /// `key` if there is none.
    ///
    /// A map hit is only optimistic: between our lookup and our increment, the
    /// slot's last holder may drive its reference count to zero and retire it.
    /// The increment re-validates under the slot's own state lock and fails in
    /// that case, and we retry the lookup from scratch. We have to drop the
    /// map lock for the retry because the releasing task needs it to remove
    /// the stale entry.
    fn _get_or_create(&self, key: &K) -> Arc<Releaser<K>> {
        let mut retries: u32 = 0;
        loop {
            let mut shared = self._shared();
            if let Some(releaser) = shared.bound.get(key) {
                let releaser = Arc::clone(releaser);
                let incremented = if self.options.pooling {
                    releaser.try_increment(key)
                } else {
                    releaser.try_increment_no_pooling()
                };
                if incremented {
                    return releaser;
                }
                std::mem::drop(shared);
                retries += 1;
                debug_assert!(
                    retries < MAX_RETIRE_RACE_RETRIES,
                    "lost the retirement race {} times in a row for the same key, the retry loop must be broken",
                    retries
                );
                // Give the releasing thread a chance to grab the map lock and
                // remove the stale entry before we look again.
                std::thread::yield_now();
                continue;
            }

            let releaser = match shared.free_list.pop() {
                Some(pooled) => {
                    // Rebinding happens while we still hold the map lock, so
                    // the slot is never visible under its new key in a
                    // half-initialized state.
                    pooled.rebind(key.clone());
                    #[cfg(feature = "tracing")]
                    tracing::trace!(key = ?key, "rebound a pooled lock slot");
                    pooled
                }
                None => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(key = ?key, "allocated a new lock slot");
                    Arc::new(Releaser::new(key.clone(), self.options.concurrency))
                }
            };
            let previous = shared.bound.insert(key.clone(), Arc::clone(&releaser));
            assert!(
                previous.is_none(),
                "We just checked that the entry doesn't exist, why does it exist now?"
            );
            return releaser;
        }
    }

    /// One holder or waiter of `releaser` is done with it; `entered` says
    /// whether it actually consumed a semaphore permit. Called from guard
    /// disposal on every exit path.
    ///
    /// If this was the last reference, the slot has retired itself and we
    /// unmap it here. Any task that looked it up in the meantime will fail
    /// its increment against the retired slot and retry, so removing the
    /// entry (and possibly recycling the slot for a different key) is safe.
    pub(crate) fn release(&self, releaser: &Arc<Releaser<K>>, entered: bool) {
        let key = match releaser.finish_one(entered) {
            Some(key) => key,
            None => return,
        };

        let mut shared = self._shared();
        let removed = shared
            .bound
            .remove(&key)
            .expect("This entry must exist or the releaser that just retired it couldn't exist");
        debug_assert!(
            Arc::ptr_eq(&removed, releaser),
            "the slot mapped under a key must be the one that retired it"
        );
        if self.options.pooling && shared.free_list.len() < self.options.max_pool_size {
            #[cfg(feature = "tracing")]
            tracing::trace!(key = ?key, "recycled a retired lock slot");
            shared.free_list.push(Arc::clone(releaser));
        } else {
            #[cfg(feature = "tracing")]
            tracing::trace!(key = ?key, "dropped a retired lock slot");
        }
    }

    async fn _lock_async<S: Deref<Target = Self>>(this: S, key: K) -> Guard<K, S> {
        let releaser = this._get_or_create(&key);
        let acquisition = Acquisition::new(this, key, Arc::clone(&releaser));
        // The registration is done and the map lock is already released, so
        // other tasks can access the hash map. The following suspends until a
        // permit for this key is acquired.
        let permit = releaser
            .semaphore()
            .acquire()
            .await
            .expect("The per-key semaphore is never closed, so acquiring a permit cannot fail");
        permit.forget();
        acquisition.into_guard(true)
    }

    async fn _lock_cancellable_async<S: Deref<Target = Self>>(
        this: S,
        key: K,
        cancellation: &CancellationToken,
    ) -> Result<Guard<K, S>, AcquireCancelled<K>> {
        let releaser = this._get_or_create(&key);
        let acquisition = Acquisition::new(this, key, Arc::clone(&releaser));
        tokio::select! {
            // Biased so that a token that is already cancelled when we get
            // here deterministically wins over an available permit.
            biased;
            () = cancellation.cancelled() => Err(AcquireCancelled {
                key: acquisition.abandon(),
            }),
            permit = releaser.semaphore().acquire() => {
                permit
                    .expect("The per-key semaphore is never closed, so acquiring a permit cannot fail")
                    .forget();
                Ok(acquisition.into_guard(true))
            }
        }
    }

    async fn _try_lock_async<S: Deref<Target = Self>>(
        this: S,
        key: K,
        timeout: Duration,
    ) -> TimeoutGuard<K, S> {
        let releaser = this._get_or_create(&key);
        let acquisition = Acquisition::new(this, key, Arc::clone(&releaser));
        let result = tokio::time::timeout(timeout, releaser.semaphore().acquire()).await;
        match result {
            Ok(permit) => {
                permit
                    .expect("The per-key semaphore is never closed, so acquiring a permit cannot fail")
                    .forget();
                TimeoutGuard::new(acquisition.into_guard(true))
            }
            // The wait gave up without consuming a permit. The guard still
            // carries the registration so that disposal accounting is uniform
            // for the caller, but it knows not to release a permit.
            Err(_elapsed) => TimeoutGuard::new(acquisition.into_guard(false)),
        }
    }

    async fn _try_lock_cancellable_async<S: Deref<Target = Self>>(
        this: S,
        key: K,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> Result<TimeoutGuard<K, S>, AcquireCancelled<K>> {
        let releaser = this._get_or_create(&key);
        let acquisition = Acquisition::new(this, key, Arc::clone(&releaser));
        tokio::select! {
            biased;
            () = cancellation.cancelled() => Err(AcquireCancelled {
                key: acquisition.abandon(),
            }),
            outcome = tokio::time::timeout(timeout, releaser.semaphore().acquire()) => {
                match outcome {
                    Ok(permit) => {
                        permit
                            .expect("The per-key semaphore is never closed, so acquiring a permit cannot fail")
                            .forget();
                        Ok(TimeoutGuard::new(acquisition.into_guard(true)))
                    }
                    Err(_elapsed) => Ok(TimeoutGuard::new(acquisition.into_guard(false))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
