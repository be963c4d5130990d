use crate::owner::{Leave, Ownable, Owner};
use crate::store::RowStore;
use crate::Result;
use log::*;
use parking_lot::Mutex;
use std::sync::Arc;

/// Blocking, reentrant lock held as a `SELECT ... FOR UPDATE` inside an open
/// transaction on a dedicated connection.
///
/// There is no lease: if the owning process dies without releasing, the row
/// stays locked until the server tears the connection down.
pub struct RowLock<S: RowStore> {
    name: String,
    store: Arc<S>,
    owner: Owner,
    held: Mutex<Option<S::Row>>,
}

impl<S: RowStore> RowLock<S> {
    pub(crate) fn new(name: String, store: Arc<S>) -> Result<Self> {
        store.ensure_row(&name)?;
        Ok(Self {
            name,
            store,
            owner: Owner::new(),
            held: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the row is ours. No timeout.
    pub fn acquire(&self) -> Result<()> {
        if self.owner.reenter(&self.name)? {
            debug!("[{}] reentered, holds={}", self.name, self.owner.holds());
            return Ok(());
        }

        let row = self.store.acquire_row_exclusive(&self.name)?;
        *self.held.lock() = Some(row);
        self.owner.claim();
        info!("[{}] row acquired", self.name);
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        match self.owner.leave(&self.name)? {
            Leave::Reentrant(holds) => {
                debug!("[{}] still held, holds={holds}", self.name);
            }
            Leave::Free => {
                let row = self.held.lock().take();
                if let Some(row) = row {
                    self.store.release_row_exclusive(row)?;
                }

                info!("[{}] row released", self.name);
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
}
