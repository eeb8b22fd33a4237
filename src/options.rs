use crate::error::ConfigError;

const DEFAULT_MAX_POOL_SIZE: usize = 20;

/// Configuration for a [SemaphorePool](crate::SemaphorePool).
///
/// The setters are chainable and don't validate anything by themselves.
/// Validation happens once, eagerly, in
/// [SemaphorePool::with_options](crate::SemaphorePool::with_options).
///
/// ```
/// use semapool::{PoolOptions, SemaphorePool};
///
/// let options = PoolOptions::new().concurrency(2).max_pool_size(50);
/// let pool: SemaphorePool<String> = SemaphorePool::with_options(options).unwrap();
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolOptions {
    pub(crate) concurrency: usize,
    pub(crate) pooling: bool,
    pub(crate) max_pool_size: usize,
}

impl Default for PoolOptions {
    #[inline]
    fn default() -> Self {
        Self {
            concurrency: 1,
            pooling: true,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
        }
    }
}

impl PoolOptions {
    /// Create options with the default values: a concurrency of 1 (each key is
    /// an exclusive lock), pooling enabled, and a maximum pool size of 20.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many holders may be inside the section protected by one key at
    /// the same time. The default of 1 makes each key an exclusive lock; a
    /// larger value turns it into a counting semaphore bounding same-key
    /// concurrency to that number.
    ///
    /// Must be at least 1 or [SemaphorePool::with_options](crate::SemaphorePool::with_options)
    /// returns [ConfigError::ZeroConcurrency](crate::ConfigError::ZeroConcurrency).
    #[inline]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Enable or disable reuse of retired lock slots for new keys.
    ///
    /// With pooling enabled (the default), a key's internal semaphore is kept
    /// around after its last holder releases it and gets rebound to the next
    /// never-seen key instead of allocating a fresh one.
    #[inline]
    pub fn pooling(mut self, pooling: bool) -> Self {
        self.pooling = pooling;
        self
    }

    /// Set the maximum number of retired lock slots kept around for reuse.
    /// Slots retiring while the pool is full are dropped instead.
    ///
    /// Ignored when pooling is disabled. Must be at least 1 otherwise, or
    /// [SemaphorePool::with_options](crate::SemaphorePool::with_options)
    /// returns [ConfigError::ZeroPoolCapacity](crate::ConfigError::ZeroPoolCapacity).
    #[inline]
    pub fn max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    pub(crate) fn validate(self) -> Result<Self, ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.pooling && self.max_pool_size == 0 {
            return Err(ConfigError::ZeroPoolCapacity);
        }
        Ok(self)
    }
}
