use std::fmt::{self, Debug};
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;

use crate::pool::SemaphorePool;
use crate::releaser::Releaser;

/// A RAII implementation of a scoped lock for keys from a [SemaphorePool].
/// When this instance is dropped (falls out of scope), the lock will be
/// released.
///
/// The guard can be held across `await` points. Dropping it is the only way
/// to release the lock, which makes the release run on every exit path,
/// including early returns and panics, and makes a double release
/// inexpressible.
#[must_use = "if unused the keyed lock will immediately unlock"]
pub struct Guard<K, P>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
    P: Deref<Target = SemaphorePool<K>>,
{
    pool: P,
    key: K,
    releaser: Option<Arc<Releaser<K>>>,
    entered: bool,
}

/// A [Guard] that borrows its [SemaphorePool]. Returned by
/// [SemaphorePool::lock_async].
pub type PoolGuard<'a, K> = Guard<K, &'a SemaphorePool<K>>;

/// A [Guard] holding its [SemaphorePool] through an [Arc], so it has the
/// `'static` lifetime and can be moved across tasks. Returned by
/// [SemaphorePool::lock_owned_async].
pub type OwnedPoolGuard<K> = Guard<K, Arc<SemaphorePool<K>>>;

impl<K, P> Guard<K, P>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
    P: Deref<Target = SemaphorePool<K>>,
{
    pub(crate) fn new(pool: P, key: K, releaser: Arc<Releaser<K>>, entered: bool) -> Self {
        Self {
            pool,
            key,
            releaser: Some(releaser),
            entered,
        }
    }

    /// The key this guard is holding locked.
    pub fn key(&self) -> &K {
        &self.key
    }

    fn entered(&self) -> bool {
        self.entered
    }
}

impl<K, P> Drop for Guard<K, P>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
    P: Deref<Target = SemaphorePool<K>>,
{
    fn drop(&mut self) {
        if let Some(releaser) = self.releaser.take() {
            self.pool.release(&releaser, self.entered);
        }
    }
}

impl<K, P> Debug for Guard<K, P>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
    P: Deref<Target = SemaphorePool<K>>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guard({:?})", self.key)
    }
}

/// The result of a bounded-wait lock attempt, see
/// [SemaphorePool::try_lock_async].
///
/// Elapsing the timeout is an expected outcome, not an error, so it is
/// reported through [TimeoutGuard::acquired] instead of a `Result`. Dropping
/// the guard is safe either way: a guard that never entered the semaphore
/// unwinds its bookkeeping without releasing a permit it doesn't hold.
#[must_use = "if unused an acquired keyed lock will immediately unlock"]
pub struct TimeoutGuard<K, P>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
    P: Deref<Target = SemaphorePool<K>>,
{
    inner: Guard<K, P>,
}

/// A [TimeoutGuard] that borrows its [SemaphorePool]. Returned by
/// [SemaphorePool::try_lock_async].
pub type TimeoutPoolGuard<'a, K> = TimeoutGuard<K, &'a SemaphorePool<K>>;

/// A [TimeoutGuard] holding its [SemaphorePool] through an [Arc]. Returned by
/// [SemaphorePool::try_lock_owned_async].
pub type OwnedTimeoutPoolGuard<K> = TimeoutGuard<K, Arc<SemaphorePool<K>>>;

impl<K, P> TimeoutGuard<K, P>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
    P: Deref<Target = SemaphorePool<K>>,
{
    pub(crate) fn new(inner: Guard<K, P>) -> Self {
        Self { inner }
    }

    /// Whether the lock was actually acquired before the timeout elapsed.
    /// Callers must check this before touching whatever the lock protects.
    pub fn acquired(&self) -> bool {
        self.inner.entered()
    }

    /// The key this lock attempt concerned.
    pub fn key(&self) -> &K {
        self.inner.key()
    }
}

impl<K, P> Debug for TimeoutGuard<K, P>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
    P: Deref<Target = SemaphorePool<K>>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TimeoutGuard({:?}, acquired: {})",
            self.inner.key, self.inner.entered
        )
    }
}

/// Bookkeeping for a caller that is registered on a lock slot but hasn't
/// entered its semaphore yet.
///
/// Between the reference-count increment in the pool's get-or-create step and
/// the completion of the semaphore wait, the waiting future can be dropped at
/// any time (timeout, `select!`, task abort). This type's [Drop] undoes the
/// registration without releasing a permit in that case, so an abandoned wait
/// leaves the pool exactly as if the call had never been made. All release
/// accounting funnels through [SemaphorePool::release] either way.
pub(crate) struct Acquisition<K, P>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
    P: Deref<Target = SemaphorePool<K>>,
{
    pool: Option<P>,
    key: Option<K>,
    releaser: Option<Arc<Releaser<K>>>,
}

impl<K, P> Acquisition<K, P>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
    P: Deref<Target = SemaphorePool<K>>,
{
    pub(crate) fn new(pool: P, key: K, releaser: Arc<Releaser<K>>) -> Self {
        Self {
            pool: Some(pool),
            key: Some(key),
            releaser: Some(releaser),
        }
    }

    /// Convert into the caller's guard. With `entered == true` the guard owns
    /// one forgotten semaphore permit and will hand it back on drop; with
    /// `entered == false` it only owns the reference-count registration.
    pub(crate) fn into_guard(mut self, entered: bool) -> Guard<K, P> {
        let pool = self
            .pool
            .take()
            .expect("An Acquisition is only consumed once");
        let key = self.key.take().expect("An Acquisition is only consumed once");
        let releaser = self
            .releaser
            .take()
            .expect("An Acquisition is only consumed once");
        Guard::new(pool, key, releaser, entered)
    }

    /// Give up before entering the semaphore: unwind the registration now and
    /// hand the key back for error reporting.
    pub(crate) fn abandon(mut self) -> K {
        let pool = self
            .pool
            .take()
            .expect("An Acquisition is only consumed once");
        let releaser = self
            .releaser
            .take()
            .expect("An Acquisition is only consumed once");
        pool.release(&releaser, false);
        self.key.take().expect("An Acquisition is only consumed once")
    }
}

impl<K, P> Drop for Acquisition<K, P>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
    P: Deref<Target = SemaphorePool<K>>,
{
    fn drop(&mut self) {
        if let (Some(pool), Some(releaser)) = (self.pool.take(), self.releaser.take()) {
            pool.release(&releaser, false);
        }
    }
}
