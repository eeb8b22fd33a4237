use std::fmt::Debug;
use thiserror::Error;

/// Errors reported by [SemaphorePool::with_options](crate::SemaphorePool::with_options)
/// when the given [PoolOptions](crate::PoolOptions) are invalid.
///
/// Configuration is validated eagerly when the pool is constructed, never
/// retried or deferred to the first lock call.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The per-key concurrency was configured as zero. A semaphore with zero
    /// permits could never admit a holder, so every lock call would wait forever.
    #[error("the per-key concurrency must be at least 1")]
    ZeroConcurrency,

    /// Pooling was enabled with a maximum pool size of zero. Use
    /// [PoolOptions::pooling](crate::PoolOptions::pooling) to disable pooling instead.
    #[error("the maximum pool size must be at least 1 when pooling is enabled")]
    ZeroPoolCapacity,
}

/// Error returned by the `_cancellable_` locking methods when the given
/// [CancellationToken](crate::CancellationToken) was cancelled before the lock
/// was acquired.
///
/// This is the only error the waiting path can surface. Timeouts are reported
/// as a status on [TimeoutGuard](crate::TimeoutGuard) instead, because a
/// bounded wait elapsing is an expected outcome rather than a failure.
///
/// By the time this error is returned, all bookkeeping for the cancelled
/// caller has already been undone. No permit was consumed and the pool looks
/// as if the call had never been made.
#[derive(Error, Debug)]
#[error("acquiring the lock for key {key:?} was cancelled")]
pub struct AcquireCancelled<K: Debug> {
    /// The key whose acquisition was cancelled.
    pub key: K,
}
