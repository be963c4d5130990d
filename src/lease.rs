use crate::owner::{Leave, Ownable, Owner};
use crate::renewal::{Renewal, Stop};
use crate::store::{LeaseStore, LockState};
use crate::Result;
use log::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Retries `attempt` every `every` until it succeeds or `timeout` passes.
/// Never reports failure before the deadline.
pub(crate) fn poll_until<F>(timeout: Duration, every: Duration, mut attempt: F) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if attempt()? {
            return Ok(true);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }

        thread::sleep(every.min(deadline - now));
    }
}

/// Non-blocking, reentrant lock over a `(name, state, expire_at)` record.
///
/// Ownership is tracked only in this process, per thread. The record's lease
/// bounds how long a crashed holder can keep the lock. When acquired with the
/// default lease, a background thread keeps extending it until `release`.
pub struct LeaseLock<S: LeaseStore> {
    name: String,
    store: Arc<S>,
    lease: Duration,
    renew: Duration,
    poll: Duration,
    owner: Arc<Owner>,
    renewal: Mutex<Option<Renewal>>,
}

impl<S: LeaseStore> LeaseLock<S> {
    pub(crate) fn new(
        name: String,
        store: Arc<S>,
        lease: Duration,
        renew: Duration,
        poll: Duration,
    ) -> Result<Self> {
        store.ensure_exists(&name)?;
        Ok(Self {
            name,
            store,
            lease,
            renew,
            poll,
            owner: Arc::new(Owner::new()),
            renewal: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires with the default lease and keeps it renewed.
    pub fn try_acquire(&self) -> Result<bool> {
        self.acquire(None)
    }

    /// Acquires for exactly `lease`; no renewal is started.
    pub fn try_acquire_with_lease(&self, lease: Duration) -> Result<bool> {
        self.acquire(Some(lease))
    }

    /// Polls `try_acquire` at a fixed interval until success or `timeout`.
    pub fn try_acquire_timeout(&self, timeout: Duration) -> Result<bool> {
        poll_until(timeout, self.poll, || self.try_acquire())
    }

    pub fn release(&self) -> Result<()> {
        match self.owner.leave(&self.name)? {
            Leave::Reentrant(holds) => {
                debug!("[{}] still held, holds={holds}", self.name);
            }
            Leave::Free => {
                self.renewal.lock().take();
                self.store.compare_and_set_with_lease(
                    &self.name,
                    LockState::Held,
                    LockState::Free,
                    Duration::ZERO,
                )?;

                info!("[{}] released", self.name);
            }
        }

        Ok(())
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.is_owned_by_caller()
    }

    pub fn holds(&self) -> u32 {
        self.owner.holds()
    }

    fn acquire(&self, lease: Option<Duration>) -> Result<bool> {
        // An expired lease means whatever we believed locally is stale.
        if self.store.remaining_lease(&self.name)? <= time::Duration::ZERO {
            self.owner.reset();
        }

        if self.owner.reenter(&self.name)? {
            debug!("[{}] reentered, holds={}", self.name, self.owner.holds());
            return Ok(true);
        }

        let d = lease.unwrap_or(self.lease);
        if !self.store.compare_and_set_with_lease(
            &self.name,
            LockState::Free,
            LockState::Held,
            d,
        )? {
            return Ok(false);
        }

        let epoch = self.owner.claim();
        self.renewal.lock().take();
        info!("[{}] acquired, lease={d:?}", self.name);

        if lease.is_none() {
            if let Err(e) = self.start_renewal(epoch) {
                self.owner.clear_if(epoch);
                self.store.compare_and_set_with_lease(
                    &self.name,
                    LockState::Held,
                    LockState::Free,
                    Duration::ZERO,
                )?;

                return Err(e);
            }
        }

        Ok(true)
    }

    fn start_renewal(&self, epoch: u64) -> Result<()> {
        let store = self.store.clone();
        let owner = self.owner.clone();
        let name = self.name.clone();
        let lease = self.lease;
        let renew = self.renew;
        let r = Renewal::spawn(format!("renew-{}", self.name), move |stop| {
            renew_until_stopped(&*store, &owner, &name, epoch, lease, renew, stop)
        })?;

        *self.renewal.lock() = Some(r);
        Ok(())
    }
}

// Sleeps until the remaining lease falls inside `renew`, then extends it.
// Losing the lease clears the hold this thread was started for.
fn renew_until_stopped<S: LeaseStore>(
    store: &S,
    owner: &Owner,
    name: &str,
    epoch: u64,
    lease: Duration,
    renew: Duration,
    stop: Stop,
) {
    let threshold = time::Duration::try_from(renew).unwrap_or(time::Duration::MAX);
    loop {
        if stop.requested() {
            break;
        }

        let remaining = match store.remaining_lease(name) {
            Ok(v) => v,
            Err(e) => {
                error!("[{name}] remaining_lease failed: {e}");
                owner.clear_if(epoch);
                return;
            }
        };

        if remaining <= time::Duration::ZERO {
            warn!("[{name}] lease lost");
            owner.clear_if(epoch);
            return;
        }

        if remaining > threshold {
            let pause = Duration::try_from(remaining - threshold).unwrap_or_default();
            if stop.wait(pause) {
                break;
            }

            continue;
        }

        match store.extend_lease(name, lease) {
            Ok(true) => debug!("[{name}] lease extended by {lease:?}"),
            Ok(false) => {
                warn!("[{name}] record gone, lease lost");
                owner.clear_if(epoch);
                return;
            }
            Err(e) => {
                error!("[{name}] extend_lease failed: {e}");
                owner.clear_if(epoch);
                return;
            }
        }
    }

    debug!("[{name}] renewal stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;
    use crate::{Error, LockBuilder};
    use std::sync::mpsc;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn lock(store: &Arc<MemStore>, name: &str) -> LeaseLock<MemStore> {
        LockBuilder::new()
            .name(name.to_string())
            .build_lease(store.clone())
            .unwrap()
    }

    fn short_lock(store: &Arc<MemStore>, name: &str) -> LeaseLock<MemStore> {
        LockBuilder::new()
            .name(name.to_string())
            .duration_ms(300)
            .renew_ms(100)
            .poll_ms(20)
            .build_lease(store.clone())
            .unwrap()
    }

    #[test]
    fn exactly_one_of_five_wins() {
        init();
        let store = Arc::new(MemStore::new());
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    let l = lock(&store, "test");
                    let won = l.try_acquire().unwrap();
                    thread::sleep(Duration::from_millis(300));
                    if won {
                        l.release().unwrap();
                    }
                    won
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 1);
    }

    #[test]
    fn reentrant_release_must_match() {
        init();
        let store = Arc::new(MemStore::new());
        let a = lock(&store, "re");
        let b = lock(&store, "re");
        assert!(a.try_acquire().unwrap());
        assert!(a.try_acquire().unwrap());
        assert!(a.try_acquire().unwrap());
        assert_eq!(a.holds(), 3);

        a.release().unwrap();
        a.release().unwrap();
        assert!(a.is_held_by_current_thread());
        assert!(!b.try_acquire().unwrap());

        a.release().unwrap();
        assert!(!a.is_held_by_current_thread());
        assert!(b.try_acquire().unwrap());
        b.release().unwrap();
    }

    #[test]
    fn reentry_skips_the_store_cas() {
        let store = Arc::new(MemStore::new());
        let a = lock(&store, "rt");
        assert!(a.try_acquire().unwrap());
        let before = store.round_trips();
        assert!(a.try_acquire().unwrap());
        // Only the expiry read.
        assert_eq!(store.round_trips(), before + 1);
        a.release().unwrap();
        a.release().unwrap();
    }

    #[test]
    fn non_owner_release_is_rejected() {
        init();
        let store = Arc::new(MemStore::new());
        let a = Arc::new(lock(&store, "own"));
        assert!(matches!(a.release(), Err(Error::NotOwner { .. })));

        assert!(a.try_acquire().unwrap());
        let other = a.clone();
        let res = thread::spawn(move || other.release()).join().unwrap();
        assert!(matches!(res, Err(Error::NotOwner { .. })));
        assert!(a.is_held_by_current_thread());
        assert!(!lock(&store, "own").try_acquire().unwrap());
        a.release().unwrap();
    }

    #[test]
    fn expired_lease_heals_itself() {
        init();
        let store = Arc::new(MemStore::new());
        let crashed = lock(&store, "heal");
        assert!(crashed.try_acquire_with_lease(Duration::from_millis(100)).unwrap());

        let b = lock(&store, "heal");
        assert!(!b.try_acquire().unwrap());
        thread::sleep(Duration::from_millis(200));
        assert!(b.try_acquire().unwrap());
        b.release().unwrap();
    }

    #[test]
    fn renewal_keeps_lease_alive() {
        init();
        let store = Arc::new(MemStore::new());
        let a = short_lock(&store, "renew");
        let b = short_lock(&store, "renew");
        assert!(a.try_acquire().unwrap());
        thread::sleep(Duration::from_millis(900));
        assert!(!b.try_acquire().unwrap());
        assert!(a.is_held_by_current_thread());

        a.release().unwrap();
        assert!(b.try_acquire().unwrap());
        b.release().unwrap();
    }

    #[test]
    fn lost_lease_is_observed_lazily() {
        init();
        let store = Arc::new(MemStore::new());
        let a = short_lock(&store, "lost");
        assert!(a.try_acquire().unwrap());
        store.expire("lost");

        let start = Instant::now();
        while a.is_held_by_current_thread() {
            assert!(start.elapsed() < Duration::from_secs(3));
            thread::sleep(Duration::from_millis(10));
        }

        assert!(matches!(a.release(), Err(Error::NotOwner { .. })));
        assert!(a.try_acquire().unwrap());
        a.release().unwrap();
    }

    #[test]
    fn store_error_during_renewal_drops_the_hold() {
        init();
        let store = Arc::new(MemStore::new());
        let a = short_lock(&store, "flaky");
        assert!(a.try_acquire().unwrap());
        store.fail_next(1);

        let start = Instant::now();
        while a.is_held_by_current_thread() {
            assert!(start.elapsed() < Duration::from_secs(3));
            thread::sleep(Duration::from_millis(10));
        }

        while !a.renewal.lock().as_ref().is_some_and(|r| r.is_finished()) {
            assert!(start.elapsed() < Duration::from_secs(3));
            thread::sleep(Duration::from_millis(10));
        }

        let calls = store.round_trips();
        thread::sleep(Duration::from_millis(400));
        assert_eq!(store.round_trips(), calls);
        assert!(matches!(a.release(), Err(Error::NotOwner { .. })));

        // The unrenewed lease lapses and the name becomes free again.
        assert!(short_lock(&store, "flaky").try_acquire_timeout(Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn release_stops_renewal() {
        init();
        let store = Arc::new(MemStore::new());
        let a = short_lock(&store, "stop");
        assert!(a.try_acquire().unwrap());
        assert!(a.renewal.lock().is_some());

        a.release().unwrap();
        assert!(a.renewal.lock().is_none());

        thread::sleep(Duration::from_millis(20));
        let calls = store.round_trips();
        thread::sleep(Duration::from_millis(600));
        assert_eq!(store.round_trips(), calls);
    }

    #[test]
    fn timed_acquire_succeeds_before_deadline() {
        init();
        let store = Arc::new(MemStore::new());
        let (tx, rx) = mpsc::channel();
        let s = store.clone();
        let holder = thread::spawn(move || {
            let l = short_lock(&s, "timed");
            assert!(l.try_acquire().unwrap());
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(500));
            l.release().unwrap();
        });

        rx.recv().unwrap();
        let b = short_lock(&store, "timed");
        let start = Instant::now();
        assert!(b.try_acquire_timeout(Duration::from_secs(2)).unwrap());
        assert!(start.elapsed() < Duration::from_secs(2));
        holder.join().unwrap();
        b.release().unwrap();
    }

    #[test]
    fn timed_acquire_fails_at_deadline() {
        init();
        let store = Arc::new(MemStore::new());
        let a = short_lock(&store, "deadline");
        let b = short_lock(&store, "deadline");
        assert!(a.try_acquire().unwrap());

        let start = Instant::now();
        assert!(!b.try_acquire_timeout(Duration::from_millis(400)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(400));
        a.release().unwrap();
    }

    #[test]
    fn overflow_aborts_acquire() {
        let store = Arc::new(MemStore::new());
        let a = lock(&store, "overflow");
        assert!(a.try_acquire().unwrap());
        a.owner.force_holds(u32::MAX);
        assert!(matches!(a.try_acquire(), Err(Error::Overflow { .. })));
        assert_eq!(a.holds(), u32::MAX);
    }

    #[test]
    fn poll_until_checks_deadline() {
        let start = Instant::now();
        let mut calls = 0;
        let ok = poll_until(Duration::from_millis(100), Duration::from_millis(30), || {
            calls += 1;
            Ok(false)
        })
        .unwrap();

        assert!(!ok);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(calls >= 2);
    }
}
