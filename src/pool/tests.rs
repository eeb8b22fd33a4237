//! Behavioral tests for [SemaphorePool], including white-box checks of the
//! reference-count and permit accounting.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::SemaphorePool;
use crate::error::ConfigError;
use crate::options::PoolOptions;
use crate::releaser::Releaser;

fn releaser_for<K>(pool: &SemaphorePool<K>, key: &K) -> Arc<Releaser<K>>
where
    K: Eq + PartialEq + Hash + Clone + Debug,
{
    Arc::clone(
        pool._shared()
            .bound
            .get(key)
            .expect("no active slot for this key"),
    )
}

// Launch a task that
// 1. locks the given key
// 2. once it has the lock, increments a counter
// 3. then waits until a barrier is released before it releases the lock
fn launch_locking_task(
    pool: &Arc<SemaphorePool<isize>>,
    key: isize,
    counter: &Arc<AtomicU32>,
    barrier: Option<&Arc<tokio::sync::Mutex<()>>>,
) -> tokio::task::JoinHandle<()> {
    let pool = Arc::clone(pool);
    let counter = Arc::clone(counter);
    let barrier = barrier.map(Arc::clone);
    tokio::spawn(async move {
        let _guard = pool.lock_owned_async(key).await;
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = barrier {
            let _barrier = barrier.lock().await;
        }
    })
}

#[tokio::test]
async fn test_simple_lock_unlock() {
    let pool = SemaphorePool::new();
    assert_eq!(0, pool.num_active_keys());
    let guard = pool.lock_async(4).await;
    assert_eq!(1, pool.num_active_keys());
    std::mem::drop(guard);
    assert_eq!(0, pool.num_active_keys());
    assert_eq!(1, pool.num_pooled());
}

#[tokio::test]
async fn test_simple_lock_owned_unlock() {
    let pool = Arc::new(SemaphorePool::new());
    assert_eq!(0, pool.num_active_keys());
    let guard = pool.lock_owned_async(4).await;
    assert_eq!(1, pool.num_active_keys());
    std::mem::drop(guard);
    assert_eq!(0, pool.num_active_keys());
}

#[tokio::test]
async fn test_simple_try_lock_unlock() {
    let pool = SemaphorePool::new();
    let attempt = pool.try_lock_async(4, Duration::from_millis(10)).await;
    assert!(attempt.acquired());
    assert_eq!(1, pool.num_active_keys());
    std::mem::drop(attempt);
    assert_eq!(0, pool.num_active_keys());
}

#[tokio::test]
async fn test_multi_lock_unlock() {
    let pool = SemaphorePool::new();
    assert_eq!(0, pool.num_active_keys());
    let guard1 = pool.lock_async(1).await;
    assert_eq!(1, pool.num_active_keys());
    let guard2 = pool.lock_async(2).await;
    assert_eq!(2, pool.num_active_keys());
    let guard3 = pool.lock_async(3).await;
    assert_eq!(3, pool.num_active_keys());

    std::mem::drop(guard2);
    assert_eq!(2, pool.num_active_keys());
    std::mem::drop(guard1);
    assert_eq!(1, pool.num_active_keys());
    std::mem::drop(guard3);
    assert_eq!(0, pool.num_active_keys());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion() {
    let pool = Arc::new(SemaphorePool::new());
    let inside = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = Arc::clone(&pool);
        let inside = Arc::clone(&inside);
        tasks.push(tokio::spawn(async move {
            for _ in 0..100 {
                let _guard = pool.lock_owned_async(1).await;
                let holders = inside.fetch_add(1, Ordering::SeqCst) + 1;
                assert!(holders <= 1, "two holders inside the same key's section");
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(0, inside.load(Ordering::SeqCst));
    assert_eq!(0, pool.num_active_keys());
}

#[tokio::test(start_paused = true)]
async fn test_bounded_concurrency() {
    let pool = SemaphorePool::with_options(PoolOptions::new().concurrency(2)).unwrap();

    // Two holders fit, the third has to wait.
    let guard1 = pool.lock_async(1).await;
    let guard2 = pool.lock_async(1).await;
    let attempt = pool.try_lock_async(1, Duration::from_millis(10)).await;
    assert!(!attempt.acquired());
    std::mem::drop(attempt);

    // Freeing one slot makes room for exactly one more.
    std::mem::drop(guard1);
    let attempt = pool.try_lock_async(1, Duration::from_millis(10)).await;
    assert!(attempt.acquired());

    std::mem::drop(attempt);
    std::mem::drop(guard2);
    assert_eq!(0, pool.num_active_keys());
}

#[tokio::test(start_paused = true)]
async fn test_independent_keys() {
    let pool = SemaphorePool::new();
    let _held_forever = pool.lock_async("a").await;

    // A lock held on "a" must not delay "b" at all.
    let guard = tokio::time::timeout(Duration::from_secs(5), pool.lock_async("b"))
        .await
        .expect("locking an unrelated key must not wait");
    std::mem::drop(guard);
}

#[tokio::test]
async fn test_concurrent_lock() {
    let pool = Arc::new(SemaphorePool::new());
    let guard = pool.lock_async(5).await;

    let counter = Arc::new(AtomicU32::new(0));

    let child = launch_locking_task(&pool, 5, &counter, None);

    // Check that even if we wait, the child task won't get the lock
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(0, counter.load(Ordering::SeqCst));

    // Check that we can still lock other keys while the child is waiting
    {
        let _g = pool.lock_async(4).await;
    }

    // Now free the lock so the child can get it
    std::mem::drop(guard);

    // And check that the child got it
    child.await.unwrap();
    assert_eq!(1, counter.load(Ordering::SeqCst));

    assert_eq!(0, pool.num_active_keys());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_concurrent_lock() {
    let pool = Arc::new(SemaphorePool::new());
    let guard = pool.lock_async(5).await;

    let counter = Arc::new(AtomicU32::new(0));
    let barrier = Arc::new(tokio::sync::Mutex::new(()));
    let barrier_guard = barrier.lock().await;

    let child1 = launch_locking_task(&pool, 5, &counter, Some(&barrier));
    let child2 = launch_locking_task(&pool, 5, &counter, Some(&barrier));

    // Check that even if we wait, the child tasks won't get the lock
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(0, counter.load(Ordering::SeqCst));

    // Check that we can still lock other keys while the children are waiting
    {
        let _g = pool.lock_async(4).await;
    }

    // Now free the lock so a child can get it
    std::mem::drop(guard);

    // Check that a child got it
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(1, counter.load(Ordering::SeqCst));

    // Allow the child to free the lock
    std::mem::drop(barrier_guard);

    // Check that the other child got it
    child1.await.unwrap();
    child2.await.unwrap();
    assert_eq!(2, counter.load(Ordering::SeqCst));

    assert_eq!(0, pool.num_active_keys());
}

#[tokio::test]
async fn test_refcount_conservation() {
    let pool = Arc::new(SemaphorePool::new());
    let guard = pool.lock_async(5).await;
    let releaser = releaser_for(&pool, &5);

    let counter = Arc::new(AtomicU32::new(0));
    let waiters: Vec<_> = (0..3)
        .map(|_| launch_locking_task(&pool, 5, &counter, None))
        .collect();

    // Let all three waiters register on the slot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(4, releaser.ref_count());

    std::mem::drop(guard);
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(3, counter.load(Ordering::SeqCst));

    // All holders are gone: the slot must be fully retired, not left bound
    // with a count of zero.
    assert_eq!(0, releaser.ref_count());
    assert!(releaser.is_retired());
    assert_eq!(0, pool.num_active_keys());
    assert_eq!(1, pool.num_pooled());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_accounting() {
    let pool = SemaphorePool::new();
    let guard = pool.lock_async(3).await;
    let releaser = releaser_for(&pool, &3);
    assert_eq!(0, releaser.semaphore().available_permits());

    let attempt = pool.try_lock_async(3, Duration::from_millis(10)).await;
    assert!(!attempt.acquired());

    // The timed-out call must not have consumed a permit...
    assert_eq!(0, releaser.semaphore().available_permits());
    assert_eq!(2, releaser.ref_count());

    // ...and disposing its guard must not release one either.
    std::mem::drop(attempt);
    assert_eq!(0, releaser.semaphore().available_permits());
    assert_eq!(1, releaser.ref_count());

    // The real holder still owns the only permit and hands it back on drop.
    std::mem::drop(guard);
    assert_eq!(1, releaser.semaphore().available_permits());
    assert_eq!(0, pool.num_active_keys());
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_is_an_immediate_attempt() {
    let pool = SemaphorePool::new();

    let attempt = pool.try_lock_async(1, Duration::ZERO).await;
    assert!(attempt.acquired());

    let second = pool.try_lock_async(1, Duration::ZERO).await;
    assert!(!second.acquired());

    std::mem::drop(second);
    std::mem::drop(attempt);
    assert_eq!(0, pool.num_active_keys());
}

#[tokio::test]
async fn test_cancelled_token_is_reported_before_waiting() {
    let pool = SemaphorePool::new();
    let cancellation = CancellationToken::new();
    cancellation.cancel();

    // Even an uncontended key must not be entered with a cancelled token.
    let err = pool
        .lock_cancellable_async(7, &cancellation)
        .await
        .unwrap_err();
    assert_eq!(7, err.key);
    assert_eq!(0, pool.num_active_keys());
}

#[tokio::test]
async fn test_cancel_while_waiting() {
    let pool = Arc::new(SemaphorePool::new());
    let guard = pool.lock_async(7).await;
    let releaser = releaser_for(&pool, &7);

    let cancellation = CancellationToken::new();
    let canceller = tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancellation.cancel();
        }
    });

    let err = pool
        .lock_cancellable_async(7, &cancellation)
        .await
        .unwrap_err();
    assert_eq!(7, err.key);
    canceller.await.unwrap();

    // The pool looks as if the cancelled call had never been made.
    assert_eq!(1, releaser.ref_count());
    assert_eq!(0, releaser.semaphore().available_permits());
    assert_eq!(1, pool.num_active_keys());

    std::mem::drop(guard);
    assert_eq!(0, pool.num_active_keys());
    assert_eq!(1, pool.num_pooled());
}

#[tokio::test]
async fn test_try_lock_cancellable() {
    let pool = SemaphorePool::new();

    let cancellation = CancellationToken::new();
    let attempt = pool
        .try_lock_cancellable_async(1, Duration::from_millis(10), &cancellation)
        .await
        .unwrap();
    assert!(attempt.acquired());
    std::mem::drop(attempt);

    cancellation.cancel();
    let err = pool
        .try_lock_cancellable_async(1, Duration::from_millis(10), &cancellation)
        .await
        .unwrap_err();
    assert_eq!(1, err.key);
    assert_eq!(0, pool.num_active_keys());
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_wait_leaves_no_trace() {
    let pool = SemaphorePool::new();
    let guard = pool.lock_async(9).await;
    let releaser = releaser_for(&pool, &9);

    // Dropping the whole pending lock future mid-wait (here through an outer
    // timeout) must unwind its registration.
    let abandoned = tokio::time::timeout(Duration::from_millis(10), pool.lock_async(9)).await;
    assert!(abandoned.is_err());
    assert_eq!(1, releaser.ref_count());
    assert_eq!(0, releaser.semaphore().available_permits());

    std::mem::drop(guard);
    assert_eq!(0, pool.num_active_keys());
    assert_eq!(1, pool.num_pooled());
}

#[tokio::test]
async fn test_pooled_slot_is_rebound_to_a_new_key() {
    let pool = SemaphorePool::new();

    let first = {
        let _guard = pool.lock_async(1).await;
        releaser_for(&pool, &1)
    };
    assert_eq!(0, pool.num_active_keys());
    assert_eq!(1, pool.num_pooled());
    assert_eq!(1, first.semaphore().available_permits());

    // The retired slot gets reused for a different key.
    let guard_y = pool.lock_async(2).await;
    let second = releaser_for(&pool, &2);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(0, pool.num_pooled());

    // A new, independent lock on the old key behaves like a fresh lock and
    // doesn't contend with the reused slot's new binding.
    let guard_x = pool.lock_async(1).await;
    let third = releaser_for(&pool, &1);
    assert!(!Arc::ptr_eq(&second, &third));
    assert_eq!(1, third.ref_count());

    std::mem::drop(guard_x);
    std::mem::drop(guard_y);
    assert_eq!(0, pool.num_active_keys());
    assert_eq!(2, pool.num_pooled());
}

#[tokio::test(start_paused = true)]
async fn test_pooling_disabled() {
    let pool =
        SemaphorePool::with_options(PoolOptions::new().pooling(false).max_pool_size(0)).unwrap();

    let first = {
        let guard = pool.lock_async(1).await;
        let releaser = releaser_for(&pool, &1);

        // Same-key contention still works without pooling.
        let attempt = pool.try_lock_async(1, Duration::from_millis(10)).await;
        assert!(!attempt.acquired());
        std::mem::drop(attempt);
        std::mem::drop(guard);
        releaser
    };

    // Nothing is kept for reuse and the next episode allocates a new slot.
    assert_eq!(0, pool.num_pooled());
    let _guard = pool.lock_async(1).await;
    let second = releaser_for(&pool, &1);
    assert!(!Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_pool_capacity_is_bounded() {
    let pool = SemaphorePool::with_options(PoolOptions::new().max_pool_size(1)).unwrap();

    let guard1 = pool.lock_async(1).await;
    let guard2 = pool.lock_async(2).await;
    std::mem::drop(guard1);
    std::mem::drop(guard2);

    // Two slots retired but only one fits into the pool; the other is dropped.
    assert_eq!(1, pool.num_pooled());
}

#[test]
fn test_invalid_options_fail_fast() {
    let err = SemaphorePool::<isize>::with_options(PoolOptions::new().concurrency(0)).unwrap_err();
    assert_eq!(ConfigError::ZeroConcurrency, err);

    let err = SemaphorePool::<isize>::with_options(PoolOptions::new().max_pool_size(0)).unwrap_err();
    assert_eq!(ConfigError::ZeroPoolCapacity, err);
}

#[tokio::test]
async fn test_guard_exposes_key_and_debug() {
    let pool = SemaphorePool::new();
    let guard = pool.lock_async(4).await;
    assert_eq!(&4, guard.key());
    assert_eq!("Guard(4)", format!("{:?}", guard));
    std::mem::drop(guard);

    let attempt = pool.try_lock_async(4, Duration::from_millis(10)).await;
    assert_eq!(&4, attempt.key());
    assert_eq!("TimeoutGuard(4, acquired: true)", format!("{:?}", attempt));
}

#[tokio::test]
async fn test_lock_owned_guards_can_be_passed_around() {
    let make_guard = || async {
        let pool = Arc::new(SemaphorePool::new());
        pool.lock_owned_async(5).await
    };
    let _guard = make_guard().await;
}

#[tokio::test]
async fn test_guards_can_be_held_across_await_points() {
    let pool = SemaphorePool::new();
    let guard = pool.lock_async(3).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    std::mem::drop(guard);
    assert_eq!(0, pool.num_active_keys());
}
