//! Local mutex in front of a lease lock.
//!
//! Threads of the same process race on the local mutex first, so only one of
//! them at a time spends a round-trip on the shared record.

use crate::lease::LeaseLock;
use crate::owner::{Ownable, Owner};
use crate::store::LeaseStore;
use crate::Result;
use log::*;
use scopeguard::ScopeGuard;

pub struct TwoTierLock<S: LeaseStore> {
    local: Owner,
    lease: LeaseLock<S>,
}

impl<S: LeaseStore> TwoTierLock<S> {
    pub(crate) fn new(lease: LeaseLock<S>) -> Self {
        Self {
            local: Owner::new(),
            lease,
        }
    }

    pub fn name(&self) -> &str {
        self.lease.name()
    }

    pub fn try_acquire(&self) -> Result<bool> {
        let name = self.lease.name();
        if !self.local.try_enter(name)? {
            debug!("[{name}] local contention, store not contacted");
            return Ok(false);
        }

        // Never keep the local mutex across a failed distributed attempt.
        let local = scopeguard::guard(&self.local, |local| {
            if let Err(e) = local.leave(name) {
                error!("[{name}] local release failed: {e}");
            }
        });

        if self.lease.try_acquire()? {
            ScopeGuard::into_inner(local);
            return Ok(true);
        }

        Ok(false)
    }

    /// Releases the lease, then the local mutex. The local mutex is released
    /// even if the lease release fails.
    pub fn unlock(&self) -> Result<()> {
        let res = self.lease.release();
        self.local.leave(self.lease.name())?;
        res
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.local.is_owned_by_caller() && self.lease.is_held_by_current_thread()
    }
}
