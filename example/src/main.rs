use anyhow::Context;
use dblock::{LockBuilder, PgStoreBuilder};
use log::info;
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::Duration;

// Usage: DBLOCK_DATABASE_URL=postgres://... example [name]
fn main() -> anyhow::Result<()> {
    env_logger::init();
    let (tx, rx) = channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    let name = std::env::args().nth(1).unwrap_or("dblock-demo".to_string());
    let store = Arc::new(
        PgStoreBuilder::from_env()?
            .build()
            .context("connecting to the lock database")?,
    );
    store.migrate()?;

    // Hold the hybrid lock (lease + row) until Ctrl-C. A second instance of
    // this program blocks in lock() until the first one exits.
    let lock = LockBuilder::new()
        .name(name.clone())
        .duration_ms(5000)
        .build_hybrid(store.clone())?;

    info!("waiting for [{name}]...");
    lock.lock()?;
    info!("[{name}] is ours, Ctrl-C to release");

    // The holder-string variant, for comparison.
    let upsert = LockBuilder::new()
        .name(format!("{name}-upsert"))
        .duration_ms(5000)
        .build_upsert(store)?;
    let locked = upsert.try_acquire_timeout(Duration::from_secs(2))?;
    info!("upsert lock: locked={locked}, holder={}", upsert.holder());

    rx.recv()?;
    upsert.unlock()?;
    lock.unlock()?;
    info!("[{name}] released");
    Ok(())
}
