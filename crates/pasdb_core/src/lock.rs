//! Cross-thread serialization lock.

use crate::error::{DbError, DbResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Counters describing lock usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Successful acquisitions.
    pub acquired: u64,
    /// Releases.
    pub released: u64,
    /// Acquisitions that gave up after the timeout.
    pub timeouts: u64,
}

/// A lock owned by one thread at a time, acquired with a timeout.
///
/// Unlike a mutex guard, ownership is not tied to a scope: the connection
/// context acquires on its outermost entry and releases on its outermost
/// exit, which may happen in different call frames.
#[derive(Debug, Default)]
pub struct SerializationLock {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
    acquired_count: AtomicU64,
    released_count: AtomicU64,
    timeout_count: AtomicU64,
}

impl SerializationLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::LockTimeout`] if the lock is not free within
    /// `timeout`, or if the calling thread already owns it.
    pub fn acquire(&self, timeout: Duration) -> DbResult<()> {
        let me = thread::current().id();
        // A deadline past the end of the clock waits without one.
        let deadline = Instant::now().checked_add(timeout);
        let mut owner = self.owner.lock();
        loop {
            match *owner {
                None => break,
                Some(current) if current == me => {
                    return Err(DbError::configuration(
                        "serialization lock is already held by this thread",
                    ));
                }
                Some(_) => match deadline {
                    Some(deadline) => {
                        if self.released.wait_until(&mut owner, deadline).timed_out()
                            && owner.is_some()
                        {
                            self.timeout_count.fetch_add(1, Ordering::Relaxed);
                            return Err(DbError::LockTimeout { timeout });
                        }
                    }
                    None => self.released.wait(&mut owner),
                },
            }
        }
        *owner = Some(me);
        self.acquired_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Releases the lock if the calling thread owns it.
    ///
    /// Returns false if the lock was not owned by this thread.
    pub fn release(&self) -> bool {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        if *owner != Some(me) {
            return false;
        }
        *owner = None;
        drop(owner);
        self.released_count.fetch_add(1, Ordering::Relaxed);
        self.released.notify_one();
        true
    }

    /// Returns true if any thread holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.owner.lock().is_some()
    }

    /// Returns the usage counters.
    #[must_use]
    pub fn stats(&self) -> LockStats {
        LockStats {
            acquired: self.acquired_count.load(Ordering::Relaxed),
            released: self.released_count.load(Ordering::Relaxed),
            timeouts: self.timeout_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_and_release() {
        let lock = SerializationLock::new();
        lock.acquire(Duration::from_millis(10)).unwrap();
        assert!(lock.is_locked());
        assert!(lock.release());
        assert!(!lock.is_locked());
        assert!(!lock.release());

        let stats = lock.stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn second_thread_times_out() {
        let lock = Arc::new(SerializationLock::new());
        lock.acquire(Duration::from_millis(10)).unwrap();

        let other = Arc::clone(&lock);
        let result = thread::spawn(move || other.acquire(Duration::from_millis(50)))
            .join()
            .unwrap();
        assert!(matches!(result, Err(DbError::LockTimeout { .. })));
        assert_eq!(lock.stats().timeouts, 1);
        lock.release();
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        let lock = Arc::new(SerializationLock::new());
        lock.acquire(Duration::from_millis(10)).unwrap();

        let other = Arc::clone(&lock);
        let waiter = thread::spawn(move || {
            other.acquire(Duration::from_secs(5))?;
            other.release();
            Ok::<_, DbError>(())
        });
        thread::sleep(Duration::from_millis(20));
        lock.release();

        waiter.join().unwrap().unwrap();
        assert_eq!(lock.stats().acquired, 2);
        assert_eq!(lock.stats().released, 2);
    }

    #[test]
    fn unbounded_timeout_waits_for_release() {
        let lock = Arc::new(SerializationLock::new());
        lock.acquire(Duration::MAX).unwrap();

        let other = Arc::clone(&lock);
        let waiter = thread::spawn(move || {
            other.acquire(Duration::MAX)?;
            other.release();
            Ok::<_, DbError>(())
        });
        thread::sleep(Duration::from_millis(20));
        lock.release();

        waiter.join().unwrap().unwrap();
        assert_eq!(lock.stats().acquired, 2);
        assert_eq!(lock.stats().timeouts, 0);
    }

    #[test]
    fn reacquire_on_same_thread_fails() {
        let lock = SerializationLock::new();
        lock.acquire(Duration::from_millis(10)).unwrap();
        assert!(lock.acquire(Duration::from_millis(10)).is_err());
        lock.release();
    }
}
