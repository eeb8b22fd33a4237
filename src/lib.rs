//! This library offers a pool of awaitable locks where individual locks can be
//! acquired and released by key. It initially considers all keys as "unlocked",
//! but they can be locked and if a second task tries to acquire a lock for the
//! same key, it will have to wait.
//!
//! ```
//! use semapool::SemaphorePool;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let pool = SemaphorePool::new();
//! let guard1 = pool.lock_async(4).await;
//! let guard2 = pool.lock_async(5).await;
//!
//! // This next line would deadlock because `4` is already locked on this task
//! // let guard3 = pool.lock_async(4).await;
//!
//! // After dropping the corresponding guard, we can lock it again
//! std::mem::drop(guard1);
//! let guard3 = pool.lock_async(4).await;
//! # });
//! ```
//!
//! You can use an arbitrary type to index locks by, as long as that type implements [PartialEq] + [Eq] + [Hash](std::hash::Hash) + [Clone] + [Debug](std::fmt::Debug).
//!
//! ```
//! use semapool::SemaphorePool;
//!
//! #[derive(PartialEq, Eq, Hash, Clone, Debug)]
//! struct CustomLockKey(u32);
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let pool = SemaphorePool::new();
//! let guard = pool.lock_async(CustomLockKey(4)).await;
//! # });
//! ```
//!
//! Acquisitions can be bounded by a timeout. A timeout is a normal outcome, not
//! an error, and is reported on the returned guard:
//!
//! ```
//! use semapool::SemaphorePool;
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let pool = SemaphorePool::new();
//! let held = pool.lock_async("busy").await;
//!
//! let attempt = pool.try_lock_async("busy", Duration::from_millis(10)).await;
//! assert!(!attempt.acquired());
//! # });
//! ```
//!
//! Under the hood, a [SemaphorePool] is a [HashMap](std::collections::HashMap) of reference-counted
//! [Semaphore](tokio::sync::Semaphore)s, with some logic making sure there aren't any race conditions
//! when accessing the hash map, and with an object pool that reuses retired map entries for new keys
//! to avoid allocation churn. Each per-key semaphore has a fixed number of permits
//! (see [PoolOptions::concurrency]), so a key can also admit a bounded number of concurrent holders
//! instead of a single exclusive one.

#![deny(missing_docs)]

mod error;
mod guard;
mod options;
mod pool;
mod releaser;

pub use error::{AcquireCancelled, ConfigError};
pub use guard::{
    Guard, OwnedPoolGuard, OwnedTimeoutPoolGuard, PoolGuard, TimeoutGuard, TimeoutPoolGuard,
};
pub use options::PoolOptions;
pub use pool::SemaphorePool;

/// Cancellation signal accepted by the `_cancellable_` locking methods,
/// re-exported from [tokio_util] for convenience.
pub use tokio_util::sync::CancellationToken;
