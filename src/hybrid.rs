//! Blocking acquisition emulated on top of the lease lock.
//!
//! Waiters park on the row lock instead of spinning on the lease. The winner
//! holds both; everyone else takes and drops the row lock just to wait for
//! the winner's release, then retries the lease.

use crate::lease::LeaseLock;
use crate::row::RowLock;
use crate::store::{LeaseStore, RowStore};
use crate::Result;
use log::*;
use std::thread;
use std::time::{Duration, Instant};

pub struct HybridLock<S: LeaseStore + RowStore> {
    lease: LeaseLock<S>,
    row: RowLock<S>,
    poll: Duration,
}

impl<S: LeaseStore + RowStore> HybridLock<S> {
    pub(crate) fn new(lease: LeaseLock<S>, row: RowLock<S>, poll: Duration) -> Self {
        Self { lease, row, poll }
    }

    pub fn name(&self) -> &str {
        self.lease.name()
    }

    /// Blocks until both the lease and the row are held by the caller.
    pub fn lock(&self) -> Result<()> {
        loop {
            if self.lease.try_acquire()? {
                return self.take_row();
            }

            let start = Instant::now();
            self.row.acquire()?;
            self.row.release()?;

            // The lease may be held by a plain lease-lock user who never
            // touches the row; don't hammer the store in that case.
            let waited = start.elapsed();
            if waited < self.poll {
                debug!("[{}] lease busy, waited {waited:?} on row", self.name());
                thread::sleep(self.poll - waited);
            }
        }
    }

    /// Never blocks on the lease. On success the row is taken as well, which
    /// only waits for a waiter's brief acquire/release.
    pub fn try_acquire(&self) -> Result<bool> {
        if !self.lease.try_acquire()? {
            return Ok(false);
        }

        self.take_row()?;
        Ok(true)
    }

    /// Lease first, row second: the lease never looks free while the row is
    /// still unobtainable. The row is released even if the lease was lost.
    pub fn unlock(&self) -> Result<()> {
        let res = self.lease.release();
        if let Err(e) = &res {
            warn!("[{}] lease release failed, releasing row anyway: {e}", self.name());
        }

        self.row.release()?;
        res
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.lease.is_held_by_current_thread() && self.row.is_held_by_current_thread()
    }

    fn take_row(&self) -> Result<()> {
        if let Err(e) = self.row.acquire() {
            error!("[{}] row acquire failed after lease: {e}", self.name());
            self.lease.release()?;
            return Err(e);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;
    use crate::LockBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::sync::mpsc;

    fn lock(store: &Arc<MemStore>, name: &str) -> HybridLock<MemStore> {
        LockBuilder::new()
            .name(name.to_string())
            .poll_ms(20)
            .build_hybrid(store.clone())
            .unwrap()
    }

    #[test]
    fn lock_unlock() {
        let store = Arc::new(MemStore::new());
        let l = lock(&store, "mylock");
        l.lock().unwrap();
        assert!(l.is_held_by_current_thread());
        l.unlock().unwrap();
        assert!(!l.is_held_by_current_thread());
    }

    #[test]
    fn reentrant() {
        let store = Arc::new(MemStore::new());
        let l = lock(&store, "mylock");
        l.lock().unwrap();
        assert!(l.try_acquire().unwrap());
        l.unlock().unwrap();
        assert!(l.is_held_by_current_thread());
        l.unlock().unwrap();
        assert!(lock(&store, "mylock").try_acquire().unwrap());
    }

    #[test]
    fn waiter_blocks_until_unlock() {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Arc::new(MemStore::new());
        let l = lock(&store, "mylock");
        l.lock().unwrap();

        let s = store.clone();
        let waiter = thread::spawn(move || {
            let w = lock(&s, "mylock");
            assert!(!w.try_acquire().unwrap());
            let start = Instant::now();
            w.lock().unwrap();
            let waited = start.elapsed();
            w.unlock().unwrap();
            waited
        });

        thread::sleep(Duration::from_millis(300));
        l.unlock().unwrap();
        assert!(waiter.join().unwrap() >= Duration::from_millis(200));
    }

    #[test]
    fn lost_lease_still_frees_row() {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Arc::new(MemStore::new());
        let l = LockBuilder::new()
            .name("lapsed".to_string())
            .duration_ms(300)
            .renew_ms(100)
            .poll_ms(20)
            .build_hybrid(store.clone())
            .unwrap();
        l.lock().unwrap();
        store.expire("lapsed");

        let start = Instant::now();
        while l.lease.is_held_by_current_thread() {
            assert!(start.elapsed() < Duration::from_secs(3));
            thread::sleep(Duration::from_millis(10));
        }

        assert!(matches!(l.unlock(), Err(crate::Error::NotOwner { .. })));
        assert!(!l.row.is_held_by_current_thread());

        let (tx, rx) = mpsc::channel();
        let s = store.clone();
        let other = thread::spawn(move || {
            let w = lock(&s, "lapsed");
            w.lock().unwrap();
            tx.send(()).unwrap();
            w.unlock().unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        other.join().unwrap();
    }

    #[test]
    fn one_inside_at_a_time() {
        let store = Arc::new(MemStore::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let s = store.clone();
                let inside = inside.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let l = lock(&s, "counter");
                    for _ in 0..3 {
                        l.lock().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::SeqCst);
                        l.unlock().unwrap();
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(done.load(Ordering::SeqCst), 12);
    }
}
