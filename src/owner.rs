//! Owner identity and reentrancy bookkeeping for a local lock handle.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::thread::{self, ThreadId};

/// Capability to inspect and record which thread owns a handle.
pub trait Ownable {
    fn is_owned_by_caller(&self) -> bool;
    fn set_owner(&self, owner: Option<ThreadId>);
}

/// Outcome of a release on the local handle.
#[derive(Debug, PartialEq, Eq)]
pub enum Leave {
    /// Still held by the caller with this many holds left.
    Reentrant(u32),
    /// Last hold released; the caller must release the shared state.
    Free,
}

#[derive(Debug, Default)]
struct Slot {
    owner: Option<ThreadId>,
    holds: u32,
    epoch: u64,
}

/// Owner thread plus reentrancy count, kept together under one mutex so that
/// a thread setting ownership is observed consistently by every checker.
///
/// `epoch` increases on every claim. Background tasks capture it and may only
/// clear the hold they were started for.
#[derive(Debug, Default)]
pub struct Owner {
    slot: Mutex<Slot>,
}

impl Owner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nested acquire by the current owner. `Ok(false)` if the caller does not
    /// own the handle.
    pub fn reenter(&self, name: &str) -> Result<bool> {
        let me = thread::current().id();
        let mut slot = self.slot.lock();
        if slot.owner != Some(me) {
            return Ok(false);
        }

        slot.holds = slot.holds.checked_add(1).ok_or_else(|| Error::Overflow {
            name: name.to_string(),
        })?;

        Ok(true)
    }

    /// Records the caller as owner with a single hold. Returns the new epoch.
    pub fn claim(&self) -> u64 {
        let mut slot = self.slot.lock();
        slot.owner = Some(thread::current().id());
        slot.holds = 1;
        slot.epoch = slot.epoch.wrapping_add(1);
        slot.epoch
    }

    /// Non-blocking acquire for a purely local mutex: claims a free handle or
    /// re-enters one already owned by the caller.
    pub fn try_enter(&self, name: &str) -> Result<bool> {
        let me = thread::current().id();
        let mut slot = self.slot.lock();
        match slot.owner {
            None => {
                slot.owner = Some(me);
                slot.holds = 1;
                slot.epoch = slot.epoch.wrapping_add(1);
                Ok(true)
            }
            Some(owner) if owner == me => {
                slot.holds = slot.holds.checked_add(1).ok_or_else(|| Error::Overflow {
                    name: name.to_string(),
                })?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// Drops one hold. Fails without touching anything if the caller is not
    /// the owner.
    pub fn leave(&self, name: &str) -> Result<Leave> {
        let me = thread::current().id();
        let mut slot = self.slot.lock();
        if slot.owner != Some(me) {
            return Err(Error::not_owner(name));
        }

        slot.holds = slot.holds.saturating_sub(1);
        if slot.holds > 0 {
            return Ok(Leave::Reentrant(slot.holds));
        }

        slot.owner = None;
        Ok(Leave::Free)
    }

    /// Forgets any owner, e.g. after the lease was observed expired.
    pub fn reset(&self) {
        let mut slot = self.slot.lock();
        slot.owner = None;
        slot.holds = 0;
    }

    /// Resets only if the hold started at `epoch` is still the current one.
    pub fn clear_if(&self, epoch: u64) -> bool {
        let mut slot = self.slot.lock();
        if slot.epoch != epoch || slot.owner.is_none() {
            return false;
        }

        slot.owner = None;
        slot.holds = 0;
        true
    }

    pub fn holds(&self) -> u32 {
        self.slot.lock().holds
    }

    #[cfg(test)]
    pub(crate) fn force_holds(&self, holds: u32) {
        self.slot.lock().holds = holds;
    }
}

impl Ownable for Owner {
    fn is_owned_by_caller(&self) -> bool {
        self.slot.lock().owner == Some(thread::current().id())
    }

    fn set_owner(&self, owner: Option<ThreadId>) {
        self.slot.lock().owner = owner;
    }
}
