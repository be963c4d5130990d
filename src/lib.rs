//! Distributed locks whose shared state lives in a PostgreSQL table.
//!
//! Four protocols share one store abstraction:
//!
//! - [`LeaseLock`]: non-blocking compare-and-set on `(name, state, expire_at)`,
//!   reentrant, with a background thread renewing the default lease.
//! - [`RowLock`]: blocking `SELECT ... FOR UPDATE` held in an open
//!   transaction, reentrant.
//! - [`HybridLock`] and [`TwoTierLock`]: blocking acquisition over the lease
//!   lock, and a local mutex in front of it.
//! - [`UpsertLeaseLock`]: one conditional upsert plus fixed-rate renewal.
//!
//! The API is synchronous; ownership belongs to the calling thread.
//!
//! ```rust,no_run
//! use dblock::{LockBuilder, PgStore};
//! use std::sync::Arc;
//!
//! # fn main() -> dblock::Result<()> {
//! let store = Arc::new(PgStore::builder().url("postgres://localhost/db".to_string()).build()?);
//! let lock = LockBuilder::new()
//!     .name("reports".to_string())
//!     .duration_ms(30_000)
//!     .build_lease(store)?;
//!
//! if lock.try_acquire()? {
//!     // ...
//!     lock.release()?;
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod hybrid;
mod lease;
mod mem;
mod owner;
mod pg;
mod renewal;
mod row;
mod store;
mod two_tier;
mod upsert;

pub use error::{Error, Result};
pub use hybrid::HybridLock;
pub use lease::LeaseLock;
pub use mem::{MemRow, MemStore};
pub use owner::{Leave, Ownable, Owner};
pub use pg::{ENV_URL, PgRow, PgStore, PgStoreBuilder};
pub use row::RowLock;
pub use store::{HolderStore, LeaseStore, LockState, RowStore};
pub use two_tier::TwoTierLock;
pub use upsert::{UpsertLeaseLock, default_holder};

use std::sync::Arc;
use std::time::Duration;

/// Settings shared by every lock kind. `renew_ms` of zero means a third of
/// `duration_ms`; `id` of empty means [`default_holder`].
pub struct LockBuilder {
    name: String,
    id: String,
    duration_ms: u64,
    renew_ms: u64,
    poll_ms: u64,
}

impl Default for LockBuilder {
    fn default() -> Self {
        Self {
            name: String::new(),
            id: String::new(),
            duration_ms: 30_000,
            renew_ms: 0,
            poll_ms: 100,
        }
    }
}

struct Settings {
    lease: Duration,
    renew: Duration,
    poll: Duration,
}

impl LockBuilder {
    pub fn new() -> LockBuilder {
        LockBuilder::default()
    }

    pub fn name(mut self, name: String) -> LockBuilder {
        self.name = name;
        self
    }

    /// Holder identity for [`UpsertLeaseLock`].
    pub fn id(mut self, id: String) -> LockBuilder {
        self.id = id;
        self
    }

    /// Default lease length.
    pub fn duration_ms(mut self, ms: u64) -> LockBuilder {
        self.duration_ms = ms;
        self
    }

    /// Renew once the remaining lease drops below this.
    pub fn renew_ms(mut self, ms: u64) -> LockBuilder {
        self.renew_ms = ms;
        self
    }

    /// Sleep between attempts of the timed acquires.
    pub fn poll_ms(mut self, ms: u64) -> LockBuilder {
        self.poll_ms = ms;
        self
    }

    pub fn build_lease<S: LeaseStore>(self, store: Arc<S>) -> Result<LeaseLock<S>> {
        let s = self.settings()?;
        LeaseLock::new(self.name, store, s.lease, s.renew, s.poll)
    }

    /// Only the name matters here; a row lock has no lease.
    pub fn build_row<S: RowStore>(self, store: Arc<S>) -> Result<RowLock<S>> {
        self.check_name()?;
        RowLock::new(self.name, store)
    }

    pub fn build_hybrid<S: LeaseStore + RowStore>(self, store: Arc<S>) -> Result<HybridLock<S>> {
        let s = self.settings()?;
        let lease = LeaseLock::new(self.name.clone(), store.clone(), s.lease, s.renew, s.poll)?;
        let row = RowLock::new(self.name, store)?;
        Ok(HybridLock::new(lease, row, s.poll))
    }

    pub fn build_two_tier<S: LeaseStore>(self, store: Arc<S>) -> Result<TwoTierLock<S>> {
        Ok(TwoTierLock::new(self.build_lease(store)?))
    }

    pub fn build_upsert<S: HolderStore>(self, store: Arc<S>) -> Result<UpsertLeaseLock<S>> {
        let s = self.settings()?;
        let holder = if self.id.is_empty() {
            default_holder()?
        } else {
            self.id
        };

        Ok(UpsertLeaseLock::new(self.name, holder, store, s.lease, s.poll))
    }

    fn check_name(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("lock name is empty".to_string()));
        }

        Ok(())
    }

    fn settings(&self) -> Result<Settings> {
        self.check_name()?;
        if self.duration_ms == 0 {
            return Err(Error::Config("lease duration must be positive".to_string()));
        }

        let renew_ms = match self.renew_ms {
            0 => self.duration_ms / 3,
            ms => ms,
        };

        if renew_ms >= self.duration_ms {
            return Err(Error::Config(format!(
                "renew threshold {renew_ms}ms must be below the lease {}ms",
                self.duration_ms
            )));
        }

        Ok(Settings {
            lease: Duration::from_millis(self.duration_ms),
            renew: Duration::from_millis(renew_ms),
            poll: Duration::from_millis(self.poll_ms.max(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let b = LockBuilder::new().name("x".to_string());
        let s = b.settings().unwrap();
        assert_eq!(s.lease, Duration::from_secs(30));
        assert_eq!(s.renew, Duration::from_secs(10));
        assert_eq!(s.poll, Duration::from_millis(100));
    }

    #[test]
    fn builder_rejects_bad_settings() {
        let store = Arc::new(MemStore::new());
        assert!(matches!(
            LockBuilder::new().build_lease(store.clone()),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            LockBuilder::new()
                .name("x".to_string())
                .duration_ms(0)
                .build_lease(store.clone()),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            LockBuilder::new()
                .name("x".to_string())
                .duration_ms(100)
                .renew_ms(100)
                .build_lease(store),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn row_lock_ignores_lease_settings() {
        let store = Arc::new(MemStore::new());
        let row = LockBuilder::new()
            .name("rows".to_string())
            .duration_ms(0)
            .renew_ms(5)
            .build_row(store.clone())
            .unwrap();
        row.acquire().unwrap();
        row.release().unwrap();

        assert!(matches!(
            LockBuilder::new().duration_ms(0).build_row(store),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn construction_creates_records() {
        let store = Arc::new(MemStore::new());
        let lease = LockBuilder::new()
            .name("made".to_string())
            .build_lease(store.clone())
            .unwrap();
        assert!(store.remaining_lease(lease.name()).unwrap() <= time::Duration::ZERO);

        let row = LockBuilder::new()
            .name("made".to_string())
            .build_row(store.clone())
            .unwrap();
        row.acquire().unwrap();
        row.release().unwrap();
    }
}
