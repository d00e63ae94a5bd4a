use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{BufferError, TupleBuffer};

/// Fixed pool of equally sized tuple buffers shared by all workers.
///
/// Checkout blocks when the pool is exhausted, which is the engine's only
/// backpressure mechanism. Buffers come back automatically when dropped.
///
/// A number of buffers can be held back as a reserve: the public checkout
/// methods leave at least that many free, and only pipeline stages writing
/// output may take them. The engine sizes the reserve so every worker can
/// finish the task it is running while sources wait.
///
/// # Example
///
/// ```
/// use sluice_core::memory::BufferManager;
///
/// let pool = BufferManager::new(4, 128).unwrap();
/// let buffer = pool.get_buffer_blocking().unwrap();
/// assert_eq!(pool.available(), 3);
/// drop(buffer);
/// assert_eq!(pool.available(), 4);
/// ```
#[derive(Clone)]
pub struct BufferManager {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    /// Stack of free segments
    free: Mutex<Vec<Box<[u8]>>>,
    released: Condvar,
    buffer_size: usize,
    total: usize,
    reserve: AtomicUsize,
    destroyed: AtomicBool,
}

impl PoolInner {
    pub(crate) fn recycle(&self, mut data: Box<[u8]>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        data.fill(0);
        self.free.lock().push(data);
        // Reserve and ordinary waiters wait for different conditions.
        self.released.notify_all();
    }
}

impl BufferManager {
    /// Pre-allocates `buffer_count` buffers of `buffer_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidConfiguration`] if either value is zero.
    pub fn new(buffer_count: usize, buffer_size: usize) -> Result<Self, BufferError> {
        if buffer_count == 0 || buffer_size == 0 {
            return Err(BufferError::InvalidConfiguration(format!(
                "buffer pool needs a positive count and size (count: {buffer_count}, size: {buffer_size})"
            )));
        }
        let free = (0..buffer_count)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();
        tracing::debug!(buffer_count, buffer_size, "buffer pool allocated");
        Ok(Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                released: Condvar::new(),
                buffer_size,
                total: buffer_count,
                reserve: AtomicUsize::new(0),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// Checks out a buffer, waiting as long as necessary.
    ///
    /// Waits while no more than the [`reserve`](Self::reserve) is free.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::PoolDestroyed`] if the pool is destroyed while waiting.
    pub fn get_buffer_blocking(&self) -> Result<TupleBuffer, BufferError> {
        self.checkout(self.reserve())
    }

    /// Checks out a buffer, dipping into the reserve if needed. Waits only
    /// while the pool is empty.
    pub(crate) fn get_reserved_buffer_blocking(&self) -> Result<TupleBuffer, BufferError> {
        self.checkout(0)
    }

    fn checkout(&self, keep: usize) -> Result<TupleBuffer, BufferError> {
        let mut free = self.inner.free.lock();
        loop {
            if self.inner.destroyed.load(Ordering::Acquire) {
                return Err(BufferError::PoolDestroyed);
            }
            if free.len() > keep {
                if let Some(data) = free.pop() {
                    return Ok(TupleBuffer::pooled(data, Arc::clone(&self.inner)));
                }
            }
            self.inner.released.wait(&mut free);
        }
    }

    /// Checks out a buffer, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Timeout`] if no buffer was released in time and
    /// [`BufferError::PoolDestroyed`] if the pool was destroyed.
    pub fn get_buffer_timeout(&self, timeout: Duration) -> Result<TupleBuffer, BufferError> {
        let deadline = Instant::now() + timeout;
        let mut free = self.inner.free.lock();
        loop {
            if self.inner.destroyed.load(Ordering::Acquire) {
                return Err(BufferError::PoolDestroyed);
            }
            if free.len() > self.reserve() {
                if let Some(data) = free.pop() {
                    return Ok(TupleBuffer::pooled(data, Arc::clone(&self.inner)));
                }
            }
            if self.inner.released.wait_until(&mut free, deadline).timed_out()
                && free.len() <= self.reserve()
            {
                return Err(BufferError::Timeout);
            }
        }
    }

    /// Checks out a buffer if one beyond the reserve is free right now.
    #[must_use]
    pub fn try_get_buffer(&self) -> Option<TupleBuffer> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return None;
        }
        let mut free = self.inner.free.lock();
        if free.len() <= self.reserve() {
            return None;
        }
        let data = free.pop()?;
        Some(TupleBuffer::pooled(data, Arc::clone(&self.inner)))
    }

    /// Buffers held back for pipeline stages.
    #[must_use]
    pub fn reserve(&self) -> usize {
        self.inner.reserve.load(Ordering::Acquire)
    }

    pub(crate) fn set_reserve(&self, reserve: usize) {
        let _free = self.inner.free.lock();
        self.inner.reserve.store(reserve, Ordering::Release);
        self.inner.released.notify_all();
    }

    /// Buffers currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Buffers currently checked out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.total - self.available()
    }

    /// Total number of buffers.
    #[must_use]
    pub fn total(&self) -> usize {
        self.inner.total
    }

    /// Size of every buffer in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Releases all pooled memory and wakes blocked callers with an error.
    ///
    /// Buffers still checked out are freed instead of recycled.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut free = self.inner.free.lock();
        free.clear();
        self.inner.released.notify_all();
        tracing::debug!("buffer pool destroyed");
    }

    /// Returns `true` once [`destroy`](Self::destroy) was called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("buffer_size", &self.inner.buffer_size)
            .field("total", &self.inner.total)
            .field("available", &self.available())
            .field("reserve", &self.reserve())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_zero_sized_pool_rejected() {
        assert!(BufferManager::new(0, 10).is_err());
        assert!(BufferManager::new(2, 0).is_err());
    }

    #[test]
    fn test_buffers_recycle_on_drop() {
        let pool = BufferManager::new(2, 16).unwrap();
        let a = pool.get_buffer_blocking().unwrap();
        let b = pool.try_get_buffer().unwrap();
        assert_eq!(pool.in_use(), 2);
        assert!(pool.try_get_buffer().is_none());
        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_shared_buffer_recycles_after_last_clone() {
        let pool = BufferManager::new(1, 16).unwrap();
        let shared = pool.get_buffer_blocking().unwrap().into_shared();
        let clone = Arc::clone(&shared);
        drop(shared);
        assert_eq!(pool.available(), 0);
        drop(clone);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_recycled_buffer_is_reset() {
        let pool = BufferManager::new(1, 4).unwrap();
        let mut buffer = pool.get_buffer_blocking().unwrap();
        buffer.data_mut().copy_from_slice(&[1, 2, 3, 4]);
        buffer.header_mut().number_of_tuples = 1;
        drop(buffer);
        let buffer = pool.get_buffer_blocking().unwrap();
        assert_eq!(buffer.data(), &[0, 0, 0, 0]);
        assert_eq!(buffer.number_of_tuples(), 0);
    }

    #[test]
    fn test_timeout_when_exhausted() {
        let pool = BufferManager::new(1, 4).unwrap();
        let _held = pool.get_buffer_blocking().unwrap();
        assert_eq!(
            pool.get_buffer_timeout(Duration::from_millis(20)).unwrap_err(),
            BufferError::Timeout
        );
    }

    #[test]
    fn test_destroy_wakes_waiters() {
        let pool = BufferManager::new(1, 4).unwrap();
        let held = pool.get_buffer_blocking().unwrap();
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                tx.send(()).unwrap();
                pool.get_buffer_blocking()
            })
        };
        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        pool.destroy();
        assert_eq!(waiter.join().unwrap().unwrap_err(), BufferError::PoolDestroyed);
        drop(held);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_reserve_is_left_to_stages() {
        let pool = BufferManager::new(3, 4).unwrap();
        pool.set_reserve(2);
        let source = pool.try_get_buffer().unwrap();
        assert!(pool.try_get_buffer().is_none());
        assert_eq!(
            pool.get_buffer_timeout(Duration::from_millis(10)).unwrap_err(),
            BufferError::Timeout
        );
        let a = pool.get_reserved_buffer_blocking().unwrap();
        let b = pool.get_reserved_buffer_blocking().unwrap();
        assert_eq!(pool.available(), 0);
        drop((source, a, b));
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_lowering_reserve_wakes_sources() {
        let pool = BufferManager::new(1, 4).unwrap();
        pool.set_reserve(1);
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.get_buffer_blocking().map(|b| b.buffer_size()))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        pool.set_reserve(0);
        assert_eq!(waiter.join().unwrap().unwrap(), 4);
    }
}
