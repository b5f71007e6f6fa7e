//! Bounded pool of reusable sessions.
//!
//! Sessions are built lazily by a factory closure, up to `capacity`. A caller
//! either takes one without waiting (`try_get`) or blocks until one is free
//! (`get_blocking`). The `Pooled` guard hands the session back on drop, so a
//! session is never returned twice and never lost on an early `?` return.
//!
//! After `dispose`, idle sessions are dropped, waiters wake with
//! `PoolDisposed`, and sessions still checked out are dropped when their guard
//! goes away.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};

use crate::error::{HybridError, HybridResult};

type Factory<S> = Box<dyn Fn() -> HybridResult<S> + Send + Sync>;

struct PoolState<S> {
    idle: VecDeque<S>,
    /// Sessions alive (idle or checked out) plus constructions in flight
    created: usize,
    disposed: bool,
}

pub struct SessionPool<S> {
    state: Mutex<PoolState<S>>,
    available: Condvar,
    capacity: usize,
    factory: Factory<S>,
}

impl<S> SessionPool<S> {
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> HybridResult<S> + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(PoolState { idle: VecDeque::new(), created: 0, disposed: false }),
            available: Condvar::new(),
            capacity,
            factory: Box::new(factory),
        }
    }

    /// Take an idle session, or build one if under capacity. `Ok(None)` when
    /// every session is checked out and the pool is full.
    pub fn try_get(&self) -> HybridResult<Option<Pooled<'_, S>>> {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(HybridError::PoolDisposed);
            }
            if let Some(session) = state.idle.pop_front() {
                return Ok(Some(Pooled::new(self, session)));
            }
            if state.created >= self.capacity {
                return Ok(None);
            }
            state.created += 1;
        }
        self.construct().map(Some)
    }

    /// Like `try_get`, but waits for a session to be returned when the pool
    /// is full.
    pub fn get_blocking(&self) -> HybridResult<Pooled<'_, S>> {
        {
            let mut state = self.state.lock();
            loop {
                if state.disposed {
                    return Err(HybridError::PoolDisposed);
                }
                if let Some(session) = state.idle.pop_front() {
                    return Ok(Pooled::new(self, session));
                }
                if state.created < self.capacity {
                    state.created += 1;
                    break;
                }
                self.available.wait(&mut state);
            }
        }
        self.construct()
    }

    /// Build a session for a slot already reserved in `created`. Runs outside
    /// the lock; on failure the slot is released and a waiter woken.
    fn construct(&self) -> HybridResult<Pooled<'_, S>> {
        match (self.factory)() {
            Ok(session) => Ok(Pooled::new(self, session)),
            Err(e) => {
                let mut state = self.state.lock();
                state.created -= 1;
                drop(state);
                self.available.notify_one();
                tracing::warn!(error = %e, "session construction failed");
                Err(HybridError::SessionAcquisition { reason: e.to_string() })
            }
        }
    }

    fn release(&self, session: S) {
        let mut state = self.state.lock();
        if state.disposed {
            state.created -= 1;
            drop(state);
            drop(session);
            return;
        }
        state.idle.push_back(session);
        drop(state);
        self.available.notify_one();
    }

    /// Drop idle sessions and refuse further acquisition.
    pub fn dispose(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.disposed = true;
            let idle = std::mem::take(&mut state.idle);
            state.created -= idle.len();
            idle
        };
        drop(idle);
        self.available.notify_all();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Sessions currently alive, idle or checked out.
    pub fn created_count(&self) -> usize {
        self.state.lock().created
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

impl<S> fmt::Debug for SessionPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionPool")
            .field("capacity", &self.capacity)
            .field("created", &state.created)
            .field("idle", &state.idle.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

/// A checked-out session. Returns to its pool on drop.
pub struct Pooled<'a, S> {
    pool: &'a SessionPool<S>,
    session: Option<S>,
}

impl<'a, S> Pooled<'a, S> {
    fn new(pool: &'a SessionPool<S>, session: S) -> Self {
        Self { pool, session: Some(session) }
    }
}

impl<S> Deref for Pooled<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        // Only `drop` takes the session out
        match &self.session {
            Some(session) => session,
            None => unreachable!("pooled session used after release"),
        }
    }
}

impl<S> DerefMut for Pooled<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        match &mut self.session {
            Some(session) => session,
            None => unreachable!("pooled session used after release"),
        }
    }
}

impl<S> Drop for Pooled<'_, S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn counting_pool(capacity: usize) -> (SessionPool<usize>, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let pool = SessionPool::new(capacity, move || Ok(counter.fetch_add(1, Ordering::SeqCst)));
        (pool, built)
    }

    #[test]
    fn test_lazy_construction_and_reuse() {
        let (pool, built) = counting_pool(4);
        assert_eq!(built.load(Ordering::SeqCst), 0);

        let id = {
            let session = pool.try_get().unwrap().unwrap();
            *session
        };
        assert_eq!(pool.idle_count(), 1);

        let again = pool.try_get().unwrap().unwrap();
        assert_eq!(*again, id);
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_get_at_capacity() {
        let (pool, _) = counting_pool(2);
        let a = pool.try_get().unwrap().unwrap();
        let b = pool.try_get().unwrap().unwrap();
        assert!(pool.try_get().unwrap().is_none());
        assert_eq!(pool.created_count(), 2);
        drop(a);
        assert!(pool.try_get().unwrap().is_some());
        drop(b);
    }

    #[test]
    fn test_blocking_waits_for_release() {
        let (pool, _) = counting_pool(1);
        let pool = Arc::new(pool);
        let held = pool.try_get().unwrap().unwrap();
        let held_id = *held;

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || *pool.get_blocking().unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);

        assert_eq!(waiter.join().unwrap(), held_id);
    }

    #[test]
    fn test_dispose_wakes_waiters() {
        let (pool, _) = counting_pool(1);
        let pool = Arc::new(pool);
        let held = pool.try_get().unwrap().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get_blocking().map(|s| *s))
        };
        thread::sleep(Duration::from_millis(50));
        pool.dispose();

        assert!(matches!(waiter.join().unwrap(), Err(HybridError::PoolDisposed)));
        assert!(matches!(pool.try_get(), Err(HybridError::PoolDisposed)));

        // Returned after dispose: dropped, not pooled
        drop(held);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.created_count(), 0);
    }

    #[test]
    fn test_construction_failure_frees_slot() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let pool = SessionPool::new(1, move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(HybridError::Checkpoint { reason: "device busy".to_string() })
            } else {
                Ok(7u32)
            }
        });

        assert!(matches!(pool.try_get(), Err(HybridError::SessionAcquisition { .. })));
        assert_eq!(pool.created_count(), 0);
        assert_eq!(*pool.try_get().unwrap().unwrap(), 7);
    }

    #[test]
    fn test_concurrent_checkout_never_exceeds_capacity() {
        let (pool, built) = counting_pool(3);
        let pool = Arc::new(pool);
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let in_use = Arc::clone(&in_use);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _session = pool.get_blocking().unwrap();
                        let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        in_use.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(built.load(Ordering::SeqCst) <= 3);
    }
}
