//! Locking primitives used by filesystem operations.

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};

pub use parking_lot::ReentrantMutex;

/// Mutex that knows which thread holds it.
pub struct OwnedMutex<T> {
    inner: Mutex<T>,
    owner: Mutex<Option<ThreadId>>,
}

pub struct OwnedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    owner: &'a Mutex<Option<ThreadId>>,
}

impl<T> OwnedMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            owner: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> OwnedGuard<'_, T> {
        let guard = self.inner.lock();
        *self.owner.lock() = Some(thread::current().id());
        OwnedGuard {
            guard,
            owner: &self.owner,
        }
    }

    pub fn is_owned(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    /// Panics in debug builds if the calling thread holds the lock
    pub fn assert_not_owned(&self) {
        debug_assert!(!self.is_owned(), "lock held by this thread");
    }
}

impl<T> Deref for OwnedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OwnedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OwnedGuard<'_, T> {
    fn drop(&mut self) {
        *self.owner.lock() = None;
    }
}

/// Map of per-key locks, re-entrant per thread.
///
/// Entries exist only while someone holds or waits for them.
pub struct KeyedMutex<K> {
    held: Mutex<HashMap<K, (ThreadId, usize)>>,
    released: Condvar,
}

pub struct KeyedGuard<'a, K: Eq + Hash + Clone> {
    map: &'a KeyedMutex<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    pub fn lock(&self, key: K) -> KeyedGuard<'_, K> {
        let me = thread::current().id();
        let mut held = self.held.lock();
        loop {
            match held.get_mut(&key) {
                None => {
                    held.insert(key.clone(), (me, 1));
                    break;
                }
                Some((owner, depth)) if *owner == me => {
                    *depth += 1;
                    break;
                }
                Some(_) => self.released.wait(&mut held),
            }
        }
        KeyedGuard { map: self, key }
    }

    /// Number of keys currently locked
    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        let mut held = self.map.held.lock();
        if let Some((_, depth)) = held.get_mut(&self.key) {
            *depth -= 1;
            if *depth == 0 {
                held.remove(&self.key);
                self.map.released.notify_all();
            }
        }
    }
}

/// Counting semaphore bounding concurrent work.
pub struct ParallelLimiter {
    available: Mutex<usize>,
    freed: Condvar,
    limit: usize,
}

pub struct LimiterPermit<'a> {
    limiter: &'a ParallelLimiter,
}

impl ParallelLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            available: Mutex::new(limit),
            freed: Condvar::new(),
            limit,
        }
    }

    /// `num_cpus × per_cpu` slots
    pub fn per_cpu(per_cpu: usize) -> Self {
        Self::new(num_cpus::get() * per_cpu)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn acquire(&self) -> LimiterPermit<'_> {
        let mut available = self.available.lock();
        while *available == 0 {
            self.freed.wait(&mut available);
        }
        *available -= 1;
        LimiterPermit { limiter: self }
    }
}

impl Drop for LimiterPermit<'_> {
    fn drop(&mut self) {
        *self.limiter.available.lock() += 1;
        self.limiter.freed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_keyed_mutex_reentrant_and_cleaned_up() {
        let locks = KeyedMutex::new();
        {
            let _a = locks.lock(1u64);
            let _again = locks.lock(1u64);
            let _b = locks.lock(2u64);
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn test_keyed_mutex_excludes_other_threads() {
        let locks = Arc::new(KeyedMutex::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _g = locks.lock("key");
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn test_limiter_bounds_concurrency() {
        let limiter = Arc::new(ParallelLimiter::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|s| {
            for _ in 0..8 {
                let (limiter, running, peak) = (&limiter, &running, &peak);
                s.spawn(move || {
                    let _permit = limiter.acquire();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_owned_mutex_tracks_owner() {
        let m = OwnedMutex::new(5);
        m.assert_not_owned();
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.is_owned());
        }
        m.assert_not_owned();
        assert_eq!(*m.lock(), 6);
    }
}
