use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// A thread-safe pool of reusable allocations.
///
/// Objects are created lazily when the pool is empty. At most `capacity`
/// objects are kept around once they are returned.
#[derive(Clone)]
pub struct ObjectPool<T> {
    pool: Arc<Mutex<VecDeque<T>>>,
    create_fn: Arc<dyn Fn() -> T + Send + Sync>,
    capacity: usize,
}

impl<T: Default + Send + 'static> ObjectPool<T> {
    pub fn new<F>(initial_size: usize, create_fn: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let pool: VecDeque<T> = (0..initial_size).map(|_| create_fn()).collect();

        Self {
            pool: Arc::new(Mutex::new(pool)),
            create_fn: Arc::new(create_fn),
            capacity: initial_size,
        }
    }

    #[inline]
    pub fn acquire(&self) -> PooledObject<T> {
        let object = self.pool.lock().pop_front();
        let object = object.unwrap_or_else(|| (self.create_fn)());

        PooledObject {
            object,
            pool: Some(Arc::clone(&self.pool)),
            capacity: self.capacity,
        }
    }

    pub fn available(&self) -> usize {
        self.pool.lock().len()
    }
}

/// Returns its object to the pool on drop.
pub struct PooledObject<T: Default> {
    object: T,
    pool: Option<Arc<Mutex<VecDeque<T>>>>,
    capacity: usize,
}

impl<T: Default> PooledObject<T> {
    /// Detaches the object from the pool.
    pub fn take(mut self) -> T {
        self.pool = None;
        std::mem::take(&mut self.object)
    }
}

impl<T: Default> Deref for PooledObject<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T: Default> DerefMut for PooledObject<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.object
    }
}

impl<T: Default> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let mut pool = pool.lock();
            if pool.len() < self.capacity {
                pool.push_back(std::mem::take(&mut self.object));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuse() {
        let pool = ObjectPool::new(1, || vec![0u8; 1024]);

        let obj1 = pool.acquire();
        let ptr1 = obj1.as_ptr();
        drop(obj1);

        let obj2 = pool.acquire();
        assert_eq!(obj2.as_ptr(), ptr1);
        assert_eq!(obj2.len(), 1024);
    }

    #[test]
    fn test_pool_capacity_limit() {
        let pool = ObjectPool::new(2, || vec![0u8; 64]);

        let held: Vec<_> = (0..3).map(|_| pool.acquire()).collect();
        assert_eq!(pool.available(), 0);

        drop(held);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_pooled_object_take() {
        let pool = ObjectPool::new(1, || vec![7u8; 16]);

        let buf = pool.acquire().take();
        assert_eq!(buf, vec![7u8; 16]);
        assert_eq!(pool.available(), 0);
    }
}
