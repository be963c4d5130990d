//! In-process store with the same semantics as the PostgreSQL tables.
//!
//! Useful for tests and for single-process deployments. Every trait call
//! counts as one round-trip.

use crate::store::{HolderStore, LeaseStore, LockState, RowStore};
use crate::{Error, Result};
use log::*;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct LeaseRecord {
    state: LockState,
    expire_at: Option<Instant>,
}

#[derive(Debug)]
struct HolderRecord {
    holder: String,
    expire_at: Instant,
}

#[derive(Debug, Default)]
struct Tables {
    leases: HashMap<String, LeaseRecord>,
    // name -> row currently locked by a transaction
    rows: HashMap<String, bool>,
    holders: HashMap<String, HolderRecord>,
}

#[derive(Debug, Default)]
pub struct MemStore {
    tables: Mutex<Tables>,
    row_released: Condvar,
    round_trips: AtomicUsize,
    failures: AtomicUsize,
}

/// Row held by an emulated transaction.
#[derive(Debug)]
pub struct MemRow {
    name: String,
}

fn until(at: Option<Instant>, now: Instant) -> time::Duration {
    match at {
        None => time::Duration::ZERO,
        Some(at) if at >= now => time::Duration::try_from(at - now).unwrap_or(time::Duration::MAX),
        Some(at) => -time::Duration::try_from(now - at).unwrap_or(time::Duration::MAX),
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store calls made so far.
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Makes the current lease on `name` expire now, as if its holder stalled.
    pub fn expire(&self, name: &str) {
        let now = Instant::now();
        let mut t = self.tables.lock();
        if let Some(rec) = t.leases.get_mut(name) {
            rec.expire_at = Some(now);
        }

        if let Some(rec) = t.holders.get_mut(name) {
            rec.expire_at = now;
        }

        warn!("[{name}] lease forcibly expired");
    }

    /// Makes the next `n` store calls fail as if the database went away.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn tick(&self) -> Result<()> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Runtime(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "store unavailable",
            )));
        }

        Ok(())
    }
}

impl LeaseStore for MemStore {
    fn ensure_exists(&self, name: &str) -> Result<()> {
        self.tick()?;
        self.tables
            .lock()
            .leases
            .entry(name.to_string())
            .or_insert(LeaseRecord {
                state: LockState::Free,
                expire_at: None,
            });

        Ok(())
    }

    fn compare_and_set_with_lease(
        &self,
        name: &str,
        expect: LockState,
        update: LockState,
        lease: Duration,
    ) -> Result<bool> {
        self.tick()?;
        let now = Instant::now();
        let mut t = self.tables.lock();
        let Some(rec) = t.leases.get_mut(name) else {
            return Ok(false);
        };

        let expired = rec.expire_at.is_some_and(|at| at < now);
        if rec.state != expect && !expired {
            return Ok(false);
        }

        rec.state = update;
        rec.expire_at = Some(now + lease);
        Ok(true)
    }

    fn extend_lease(&self, name: &str, lease: Duration) -> Result<bool> {
        self.tick()?;
        let mut t = self.tables.lock();
        match t.leases.get_mut(name) {
            Some(rec) => {
                rec.expire_at = rec.expire_at.map(|at| at + lease);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remaining_lease(&self, name: &str) -> Result<time::Duration> {
        self.tick()?;
        let now = Instant::now();
        let t = self.tables.lock();
        match t.leases.get(name) {
            Some(rec) => Ok(until(rec.expire_at, now)),
            None => Err(Error::missing(name)),
        }
    }
}

impl RowStore for MemStore {
    type Row = MemRow;

    fn ensure_row(&self, name: &str) -> Result<()> {
        self.tick()?;
        self.tables.lock().rows.entry(name.to_string()).or_insert(false);
        Ok(())
    }

    fn acquire_row_exclusive(&self, name: &str) -> Result<MemRow> {
        self.tick()?;
        let mut t = self.tables.lock();
        loop {
            let held = match t.rows.get(name) {
                Some(held) => *held,
                None => return Err(Error::missing(name)),
            };

            if !held {
                t.rows.insert(name.to_string(), true);
                return Ok(MemRow {
                    name: name.to_string(),
                });
            }

            self.row_released.wait(&mut t);
        }
    }

    fn release_row_exclusive(&self, row: MemRow) -> Result<()> {
        // A failed commit still ends the transaction once the connection drops.
        let res = self.tick();
        let mut t = self.tables.lock();
        if let Some(held) = t.rows.get_mut(&row.name) {
            *held = false;
        }

        self.row_released.notify_all();
        res
    }
}

impl HolderStore for MemStore {
    fn upsert_lease(&self, name: &str, holder: &str, lease: Duration) -> Result<bool> {
        self.tick()?;
        let now = Instant::now();
        let mut t = self.tables.lock();
        if let Some(rec) = t.holders.get(name) {
            if rec.expire_at > now {
                return Ok(false);
            }
        }

        t.holders.insert(
            name.to_string(),
            HolderRecord {
                holder: holder.to_string(),
                expire_at: now + lease,
            },
        );

        Ok(true)
    }

    fn renew_holder_lease(&self, name: &str, holder: &str, lease: Duration) -> Result<bool> {
        self.tick()?;
        let now = Instant::now();
        let mut t = self.tables.lock();
        match t.holders.get_mut(name) {
            Some(rec) if rec.holder == holder => {
                rec.expire_at = now + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_holder_lease(&self, name: &str, holder: &str) -> Result<bool> {
        self.tick()?;
        let mut t = self.tables.lock();
        if t.holders.get(name).is_some_and(|rec| rec.holder == holder) {
            t.holders.remove(name);
            return Ok(true);
        }

        Ok(false)
    }
}
