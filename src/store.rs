//! Atomic operations on the shared lock tables.
//!
//! Each method is a single round-trip and is atomic at the database level.
//! Nothing here retries; callers poll through the timed acquire variants.

use crate::Result;
use std::time::Duration;

/// Value of the `state` column in the lease table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held,
}

impl LockState {
    pub fn code(self) -> i16 {
        match self {
            LockState::Free => 0,
            LockState::Held => 1,
        }
    }
}

/// Lease table: `(name, state, expire_at)`.
pub trait LeaseStore: Send + Sync + 'static {
    /// Creates the record if absent. A concurrent duplicate create is not an error.
    fn ensure_exists(&self, name: &str) -> Result<()>;

    /// Sets `state = update` and `expire_at = now + lease` when the current
    /// state equals `expect` or the previous lease has already expired.
    fn compare_and_set_with_lease(
        &self,
        name: &str,
        expect: LockState,
        update: LockState,
        lease: Duration,
    ) -> Result<bool>;

    /// Pushes `expire_at` forward by `lease`. False when the record is gone.
    fn extend_lease(&self, name: &str, lease: Duration) -> Result<bool>;

    /// Signed time left until `expire_at`; zero or negative means expired or
    /// never leased.
    fn remaining_lease(&self, name: &str) -> Result<time::Duration>;
}

/// Row table: `(name)`. Ownership is the liveness of a transaction holding
/// the row with `SELECT ... FOR UPDATE`.
pub trait RowStore: Send + Sync + 'static {
    /// Dedicated connection with an open transaction holding the row.
    type Row: Send + 'static;

    fn ensure_row(&self, name: &str) -> Result<()>;

    /// Blocks the calling thread until any previous holder's transaction ends.
    fn acquire_row_exclusive(&self, name: &str) -> Result<Self::Row>;

    /// Commits the transaction, which releases the row.
    fn release_row_exclusive(&self, row: Self::Row) -> Result<()>;
}

/// Holder table: `(lock_key, holder, expire_at)`.
pub trait HolderStore: Send + Sync + 'static {
    /// Inserts or takes over the record, only if absent or expired.
    fn upsert_lease(&self, name: &str, holder: &str, lease: Duration) -> Result<bool>;

    /// Resets `expire_at = now + lease` for the exact holder. False on zero rows.
    fn renew_holder_lease(&self, name: &str, holder: &str, lease: Duration) -> Result<bool>;

    /// Deletes the record for the exact holder; returns whether a row went away.
    fn delete_holder_lease(&self, name: &str, holder: &str) -> Result<bool>;
}
