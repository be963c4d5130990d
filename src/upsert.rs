//! Lease lock keyed by an explicit holder string.
//!
//! Simpler than [`LeaseLock`](crate::LeaseLock): one upsert takes the record
//! if it is absent or expired, and a fixed-rate thread re-extends it every
//! third of the lease. Deliberately lenient: no reentrancy counting and no
//! ownership errors; a foreign or stale unlock simply deletes nothing.

use crate::lease::poll_until;
use crate::renewal::{Renewal, Stop};
use crate::store::HolderStore;
use crate::{Error, Result};
use log::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Hold {
    locked: bool,
    epoch: u64,
}

impl Hold {
    fn lose(&mut self, epoch: u64) {
        if self.epoch == epoch {
            self.locked = false;
        }
    }
}

/// `<hostname>:<thread id>` of the calling thread.
///
/// This is the machine's host name, not a resolved network address; pass an
/// explicit id to the builder when names are not unique across machines.
pub fn default_holder() -> Result<String> {
    let host = hostname::get()
        .map_err(|e| Error::Config(format!("cannot determine holder identity: {e}")))?;
    Ok(format!(
        "{}:{:?}",
        host.to_string_lossy(),
        thread::current().id()
    ))
}

pub struct UpsertLeaseLock<S: HolderStore> {
    name: String,
    holder: String,
    lease: Duration,
    poll: Duration,
    store: Arc<S>,
    hold: Arc<Mutex<Hold>>,
    renewal: Mutex<Option<Renewal>>,
}

impl<S: HolderStore> UpsertLeaseLock<S> {
    pub(crate) fn new(
        name: String,
        holder: String,
        store: Arc<S>,
        lease: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            name,
            holder,
            lease,
            poll,
            store,
            hold: Arc::new(Mutex::new(Hold::default())),
            renewal: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn is_locked(&self) -> bool {
        self.hold.lock().locked
    }

    pub fn try_acquire(&self) -> Result<bool> {
        if self.is_locked() {
            return Ok(true);
        }

        if !self.store.upsert_lease(&self.name, &self.holder, self.lease)? {
            return Ok(false);
        }

        let epoch = {
            let mut hold = self.hold.lock();
            hold.locked = true;
            hold.epoch = hold.epoch.wrapping_add(1);
            hold.epoch
        };

        info!("[{}] acquired by {}", self.name, self.holder);
        match self.start_renewal(epoch) {
            Ok(r) => *self.renewal.lock() = Some(r),
            Err(e) => {
                self.hold.lock().lose(epoch);
                self.store.delete_holder_lease(&self.name, &self.holder)?;
                return Err(e);
            }
        }

        Ok(true)
    }

    /// Polls `try_acquire` every poll interval until success or `timeout`.
    pub fn try_acquire_timeout(&self, timeout: Duration) -> Result<bool> {
        poll_until(timeout, self.poll, || self.try_acquire())
    }

    pub fn unlock(&self) -> Result<()> {
        if !self.is_locked() {
            return Ok(());
        }

        self.renewal.lock().take();
        if !self.store.delete_holder_lease(&self.name, &self.holder)? {
            debug!("[{}] nothing to delete for {}", self.name, self.holder);
        }

        self.hold.lock().locked = false;
        info!("[{}] unlocked by {}", self.name, self.holder);
        Ok(())
    }

    fn start_renewal(&self, epoch: u64) -> Result<Renewal> {
        let store = self.store.clone();
        let hold = self.hold.clone();
        let name = self.name.clone();
        let holder = self.holder.clone();
        let lease = self.lease;
        Renewal::spawn(format!("renew-{}", self.name), move |stop| {
            renew_at_fixed_rate(&*store, &hold, &name, &holder, epoch, lease, stop)
        })
    }
}

fn renew_at_fixed_rate<S: HolderStore>(
    store: &S,
    hold: &Mutex<Hold>,
    name: &str,
    holder: &str,
    epoch: u64,
    lease: Duration,
    stop: Stop,
) {
    let period = lease / 3;
    let mut next = Instant::now() + period;
    loop {
        if stop.wait(next.saturating_duration_since(Instant::now())) {
            break;
        }

        match store.renew_holder_lease(name, holder, lease) {
            Ok(true) => debug!("[{name}] renewed by {holder}"),
            Ok(false) => {
                warn!("[{name}] renewal hit zero rows, lock lost by {holder}");
                hold.lock().lose(epoch);
                return;
            }
            Err(e) => {
                error!("[{name}] renewal failed: {e}");
                hold.lock().lose(epoch);
                return;
            }
        }

        next += period;
    }

    debug!("[{name}] renewal stopped");
}
