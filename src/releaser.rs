use std::sync::{Mutex, MutexGuard, TryLockError};

use tokio::sync::Semaphore;

/// One key's lock slot: a fixed-capacity semaphore plus the bookkeeping that
/// ties it to its current key.
///
/// The semaphore is created once per slot and never resized. When pooling is
/// enabled the same slot (and therefore the same semaphore allocation) gets
/// rebound to new keys over its lifetime.
///
/// Permit accounting is manual: a task that entered the semaphore `forget`s
/// its permit, and the release path hands the permit back with
/// `add_permits(1)` only if entry actually happened. This is what lets a
/// timed-out or cancelled waiter unwind its bookkeeping without releasing a
/// permit it never held.
pub(crate) struct Releaser<K> {
    semaphore: Semaphore,
    state: Mutex<State<K>>,
}

struct State<K> {
    /// The key this slot is currently bound to. `None` while the slot sits in
    /// the object pool between two keys.
    key: Option<K>,
    /// Number of holders and waiters logically attached to the current key.
    ref_count: usize,
    /// Set in the same critical section that drives `ref_count` to zero, so a
    /// stale map lookup can never resurrect a slot that is on its way out.
    retired: bool,
}

impl<K> Releaser<K>
where
    K: Eq + PartialEq,
{
    /// Create a slot bound to `key`, with the caller counted as its first
    /// holder. There is no separate initial increment.
    pub(crate) fn new(key: K, capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(capacity),
            state: Mutex::new(State {
                key: Some(key),
                ref_count: 1,
                retired: false,
            }),
        }
    }

    pub(crate) fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }

    /// Attempt to register one more holder, but only if the slot is still
    /// bound to `expected_key` and not retired.
    ///
    /// This runs inside the pool's structural critical section, so it must
    /// never block: the state mutex is try-acquired, and any failure (lock
    /// contention, retirement, key mismatch) reports `false` to make the
    /// caller retry its lookup. A `false` here means this slot lost the race
    /// against its own retirement; by the time the caller retries, the map
    /// entry will have been removed or replaced.
    pub(crate) fn try_increment(&self, expected_key: &K) -> bool {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => return false,
            Err(TryLockError::Poisoned(_)) => poisoned_state(),
        };
        if state.retired || state.key.as_ref() != Some(expected_key) {
            return false;
        }
        state.ref_count += 1;
        true
    }

    /// Like [Releaser::try_increment] but without the key check. Only valid
    /// when pooling is disabled: slots are never rebound then, so an entry
    /// found in the map under a key can only ever be bound to that key.
    pub(crate) fn try_increment_no_pooling(&self) -> bool {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => return false,
            Err(TryLockError::Poisoned(_)) => poisoned_state(),
        };
        if state.retired {
            return false;
        }
        state.ref_count += 1;
        true
    }

    /// The decrement half of the protocol: one holder or waiter is done with
    /// this slot. Releases a semaphore permit only if the caller actually
    /// entered the semaphore.
    ///
    /// If this was the last reference, the slot retires itself and its key is
    /// taken out and returned so the pool can remove the map entry. The
    /// retire flag and the decrement to zero happen in one critical section.
    ///
    /// This is never called while the pool's structural mutex is held, so
    /// blocking on the state mutex here is fine.
    pub(crate) fn finish_one(&self, entered: bool) -> Option<K> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|_| poisoned_state());
        debug_assert!(
            state.ref_count > 0,
            "released a lock slot that has no registered holders"
        );
        state.ref_count -= 1;
        if entered {
            self.semaphore.add_permits(1);
        }
        if state.ref_count == 0 {
            state.retired = true;
            let key = state.key.take();
            debug_assert!(key.is_some(), "a slot with holders must have been bound to a key");
            key
        } else {
            None
        }
    }

    /// Rebind a pooled slot to a new key and count the caller as its first
    /// holder, in the same critical section that makes it visible to lookups.
    ///
    /// Runs inside the pool's structural critical section. A pooled slot has
    /// no other referents (its last holder finished retiring it before it was
    /// pushed), so the try-acquired state mutex cannot actually be contended.
    pub(crate) fn rebind(&self, key: K) {
        let mut state = self.structural_state();
        debug_assert!(
            state.retired && state.ref_count == 0 && state.key.is_none(),
            "only an unbound, retired slot can be rebound to a new key"
        );
        state.key = Some(key);
        state.ref_count = 1;
        state.retired = false;
    }

    fn structural_state(&self) -> MutexGuard<'_, State<K>> {
        match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => panic!(
                "The state of a pooled lock slot is contended. This shouldn't happen since a \
                 slot in the object pool is unreachable from the key map and has no holders left"
            ),
            Err(TryLockError::Poisoned(_)) => poisoned_state(),
        }
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> usize {
        self.state.lock().unwrap().ref_count
    }

    #[cfg(test)]
    pub(crate) fn is_retired(&self) -> bool {
        self.state.lock().unwrap().retired
    }
}

fn poisoned_state() -> ! {
    panic!(
        "The mutex protecting a lock slot's state is poisoned. This shouldn't happen since no \
         user code runs while it is held, so no thread should ever panic with it"
    )
}
