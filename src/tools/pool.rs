//! Object pool for tool instances that are not safe to share
//!
//! Each pooled value is handed to exactly one caller at a time. Values are
//! created lazily when the pool is empty and returned when the guard drops,
//! which also covers early returns and unwinding.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    factory: Factory<T>,
    max_idle: usize,
}

impl<T> Pool<T> {
    /// Create a pool that keeps at most `max_idle` instances between calls
    pub fn new(max_idle: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Pool {
            idle: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            max_idle,
        }
    }

    /// Take an idle instance, or build a fresh one
    pub fn acquire(&self) -> PoolGuard<'_, T> {
        let item = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
            .unwrap_or_else(|| (self.factory)());
        PoolGuard {
            pool: self,
            item: Some(item),
        }
    }

    /// Number of instances currently waiting in the pool
    pub fn idle(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn release(&self, item: T) {
        let mut idle = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if idle.len() < self.max_idle {
            idle.push(item);
        }
    }
}

/// Exclusive handle to a pooled instance
pub struct PoolGuard<'a, T> {
    pool: &'a Pool<T>,
    item: Option<T>,
}

impl<T> Deref for PoolGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only taken in Drop.
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for PoolGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_pool(max_idle: usize) -> (Pool<usize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let pool = Pool::new(max_idle, move || counter.fetch_add(1, Ordering::SeqCst));
        (pool, created)
    }

    #[test]
    fn test_instances_are_reused() {
        let (pool, created) = counting_pool(4);
        {
            let _guard = pool.acquire();
        }
        assert_eq!(pool.idle(), 1);
        {
            let guard = pool.acquire();
            assert_eq!(*guard, 0);
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_acquire_creates_distinct_instances() {
        let (pool, created) = counting_pool(4);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(*a, *b);
        drop(a);
        drop(b);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_max_idle_discards_extra() {
        let (pool, _) = counting_pool(1);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_released_after_panic() {
        let (pool, _) = counting_pool(2);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = pool.acquire();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(pool.idle(), 1);
    }
}
