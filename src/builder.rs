use std::{any::Any, sync::Arc, time::Duration};

use crate::{PanicHandler, Pool, PoolError, DEFAULT_EXPIRE};

/// A builder of the [`Pool`], which can be used to configure the
/// properties of a new pool.
///
/// # Examples
///
/// ```
/// use wpool::PoolBuilder;
/// use std::time::Duration;
///
/// let pool = PoolBuilder::new()
///     .capacity(8)
///     .expire(Duration::from_secs(5))
///     .panic_handler(|_| eprintln!("a task panicked."))
///     .build()
///     .unwrap();
/// pool.release();
/// ```
pub struct PoolBuilder {
    pub(crate) capacity: usize,
    pub(crate) expire: Duration,
    pub(crate) panic_handler: Option<PanicHandler>,
}

impl Default for PoolBuilder {
    /// Creates a new builder with the default configuration.
    ///
    /// # Default Configuration
    /// - `capacity`: the number of logical cores of the current
    /// system
    /// - `expire`: 3 seconds
    /// - `panic_handler`: none, recovered panics are logged
    fn default() -> Self {
        Self {
            capacity: num_cpus::get(),
            expire: DEFAULT_EXPIRE,
            panic_handler: None,
        }
    }
}

impl PoolBuilder {
    /// Creates the base configuration for the new pool.
    ///
    /// See: [`PoolBuilder::default`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of concurrently running workers.
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the time a worker may remain idle before it is reclaimed.
    #[must_use]
    pub fn expire(mut self, expire: Duration) -> Self {
        self.expire = expire;
        self
    }

    /// Sets the handler that receives the payload of every panic
    /// recovered inside a worker.
    #[must_use]
    pub fn panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        self.panic_handler = Some(Arc::new(handler));
        self
    }

    /// Creates a pool with the arguments.
    ///
    /// # Errors
    ///
    /// [`InvalidCapacity`] if the capacity is zero, [`InvalidExpire`]
    /// if the expiry duration is zero.
    ///
    /// [`InvalidCapacity`]: PoolError::InvalidCapacity
    /// [`InvalidExpire`]: PoolError::InvalidExpire
    pub fn build(self) -> Result<Pool, PoolError> {
        Pool::from_builder(self)
    }
}

#[cfg(test)]
mod tests {
    use super::PoolBuilder;
    use crate::PoolError;
    use std::time::Duration;

    #[test]
    fn test_default_builder_is_valid() {
        let pool = PoolBuilder::default().build().unwrap();
        assert!(!pool.is_closed());
        pool.release();
    }

    #[test]
    fn test_builder_rejects_zero_capacity() {
        let result = PoolBuilder::new().capacity(0).build();
        assert_eq!(Some(PoolError::InvalidCapacity), result.err());
    }

    #[test]
    fn test_builder_rejects_zero_expire() {
        let result = PoolBuilder::new().expire(Duration::ZERO).build();
        assert_eq!(Some(PoolError::InvalidExpire), result.err());
    }
}
