//! PostgreSQL implementation of the lock tables.
//!
//! `tokio-postgres` is driven on a private tokio runtime; every public call
//! blocks the calling thread with `Runtime::block_on`, so none of these
//! methods may be called from inside an async context.

use crate::store::{HolderStore, LeaseStore, LockState, RowStore};
use crate::{Error, Result};
use log::*;
use std::env;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio_postgres::{Client, NoTls};

pub const ENV_URL: &str = "DBLOCK_DATABASE_URL";

struct Sql {
    insert_lease: String,
    cas: String,
    extend: String,
    remaining: String,
    insert_row: String,
    select_for_update: String,
    upsert: String,
    renew: String,
    delete: String,
    schema: String,
}

impl Sql {
    fn new(lease: &str, row: &str, holder: &str) -> Self {
        Self {
            insert_lease: format!(
                "insert into {lease} (name, state) values ($1, 0) on conflict do nothing"
            ),
            cas: format!(
                "update {lease} set state = $1, expire_at = now() + make_interval(secs => $2::float8) \
                 where name = $3 and (state = $4 or expire_at < now())"
            ),
            extend: format!(
                "update {lease} set expire_at = expire_at + make_interval(secs => $1::float8) \
                 where name = $2"
            ),
            remaining: format!(
                "select (extract(epoch from (expire_at - now())) * 1000)::bigint \
                 from {lease} where name = $1"
            ),
            insert_row: format!("insert into {row} (name) values ($1) on conflict do nothing"),
            select_for_update: format!("select name from {row} where name = $1 for update"),
            upsert: format!(
                "insert into {holder} (lock_key, holder, expire_at) \
                 values ($1, $2, now() + make_interval(secs => $3::float8)) \
                 on conflict (lock_key) do update \
                 set holder = excluded.holder, expire_at = excluded.expire_at \
                 where {holder}.expire_at <= now()"
            ),
            renew: format!(
                "update {holder} set expire_at = now() + make_interval(secs => $1::float8) \
                 where lock_key = $2 and holder = $3"
            ),
            delete: format!("delete from {holder} where lock_key = $1 and holder = $2"),
            schema: format!(
                "create table if not exists {lease} (\
                   name text primary key, \
                   state smallint not null default 0, \
                   expire_at timestamptz); \
                 create table if not exists {row} (name text primary key); \
                 create table if not exists {holder} (\
                   lock_key text primary key, \
                   holder text not null, \
                   expire_at timestamptz not null);"
            ),
        }
    }
}

async fn connect(url: &str) -> Result<Client> {
    let (client, conn) = tokio_postgres::connect(url, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            error!("connection failed: {e}");
        }
    });

    Ok(client)
}

// Opens a dedicated connection and parks in `for update` until the row is ours.
async fn lock_row(url: &str, sql: &str, name: &str) -> Result<PgRow> {
    let client = connect(url).await?;
    client.batch_execute("begin").await?;
    match client.query_opt(sql, &[&name]).await? {
        Some(_) => Ok(PgRow { client }),
        None => {
            client.batch_execute("rollback").await?;
            Err(Error::missing(name))
        }
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Dedicated connection holding an open transaction on a locked row.
pub struct PgRow {
    client: Client,
}

pub struct PgStore {
    rt: Runtime,
    client: Client,
    url: String,
    sql: Sql,
}

impl PgStore {
    pub fn builder() -> PgStoreBuilder {
        PgStoreBuilder::default()
    }

    /// Creates the configured tables if they don't exist yet.
    pub fn migrate(&self) -> Result<()> {
        self.rt.block_on(self.client.batch_execute(&self.sql.schema))?;
        Ok(())
    }
}

impl LeaseStore for PgStore {
    fn ensure_exists(&self, name: &str) -> Result<()> {
        self.rt
            .block_on(self.client.execute(&self.sql.insert_lease, &[&name]))?;
        Ok(())
    }

    fn compare_and_set_with_lease(
        &self,
        name: &str,
        expect: LockState,
        update: LockState,
        lease: Duration,
    ) -> Result<bool> {
        let n = self.rt.block_on(self.client.execute(
            &self.sql.cas,
            &[
                &update.code(),
                &lease.as_secs_f64(),
                &name,
                &expect.code(),
            ],
        ))?;

        Ok(n == 1)
    }

    fn extend_lease(&self, name: &str, lease: Duration) -> Result<bool> {
        let n = self.rt.block_on(
            self.client
                .execute(&self.sql.extend, &[&lease.as_secs_f64(), &name]),
        )?;

        Ok(n == 1)
    }

    fn remaining_lease(&self, name: &str) -> Result<time::Duration> {
        let row = self
            .rt
            .block_on(self.client.query_opt(&self.sql.remaining, &[&name]))?
            .ok_or_else(|| Error::missing(name))?;

        // Null expire_at: never leased.
        let ms: Option<i64> = row.try_get(0)?;
        Ok(ms.map_or(time::Duration::ZERO, time::Duration::milliseconds))
    }
}

impl RowStore for PgStore {
    type Row = PgRow;

    fn ensure_row(&self, name: &str) -> Result<()> {
        self.rt
            .block_on(self.client.execute(&self.sql.insert_row, &[&name]))?;
        Ok(())
    }

    fn acquire_row_exclusive(&self, name: &str) -> Result<PgRow> {
        let start = Instant::now();
        let row = self
            .rt
            .block_on(lock_row(&self.url, &self.sql.select_for_update, name))?;

        debug!("[{name}] row granted after {:?}", start.elapsed());
        Ok(row)
    }

    fn release_row_exclusive(&self, row: PgRow) -> Result<()> {
        // Dropping the client afterwards closes the dedicated connection.
        self.rt.block_on(row.client.batch_execute("commit"))?;
        Ok(())
    }
}

impl HolderStore for PgStore {
    fn upsert_lease(&self, name: &str, holder: &str, lease: Duration) -> Result<bool> {
        let n = self.rt.block_on(self.client.execute(
            &self.sql.upsert,
            &[&name, &holder, &lease.as_secs_f64()],
        ))?;

        Ok(n > 0)
    }

    fn renew_holder_lease(&self, name: &str, holder: &str, lease: Duration) -> Result<bool> {
        let n = self.rt.block_on(self.client.execute(
            &self.sql.renew,
            &[&lease.as_secs_f64(), &name, &holder],
        ))?;

        Ok(n > 0)
    }

    fn delete_holder_lease(&self, name: &str, holder: &str) -> Result<bool> {
        let n = self
            .rt
            .block_on(self.client.execute(&self.sql.delete, &[&name, &holder]))?;

        Ok(n > 0)
    }
}

pub struct PgStoreBuilder {
    url: String,
    lease_table: String,
    row_table: String,
    holder_table: String,
}

impl Default for PgStoreBuilder {
    fn default() -> Self {
        Self {
            url: String::new(),
            lease_table: "dblock_lease".to_string(),
            row_table: "dblock_row".to_string(),
            holder_table: "dblock_holder".to_string(),
        }
    }
}

impl PgStoreBuilder {
    pub fn new() -> PgStoreBuilder {
        PgStoreBuilder::default()
    }

    /// Builder with the connection string taken from `DBLOCK_DATABASE_URL`.
    pub fn from_env() -> Result<PgStoreBuilder> {
        let url = env::var(ENV_URL).map_err(|_| Error::Config(format!("{ENV_URL} is not set")))?;
        Ok(PgStoreBuilder::default().url(url))
    }

    pub fn url(mut self, url: String) -> PgStoreBuilder {
        self.url = url;
        self
    }

    pub fn lease_table(mut self, table: String) -> PgStoreBuilder {
        self.lease_table = table;
        self
    }

    pub fn row_table(mut self, table: String) -> PgStoreBuilder {
        self.row_table = table;
        self
    }

    pub fn holder_table(mut self, table: String) -> PgStoreBuilder {
        self.holder_table = table;
        self
    }

    pub fn build(self) -> Result<PgStore> {
        if self.url.is_empty() {
            return Err(Error::Config("empty connection url".to_string()));
        }

        for t in [&self.lease_table, &self.row_table, &self.holder_table] {
            if !is_identifier(t) {
                return Err(Error::Config(format!("invalid table name [{t}]")));
            }
        }

        let rt = Runtime::new()?;
        let client = rt.block_on(connect(&self.url))?;
        info!(
            "lease={}, row={}, holder={}",
            self.lease_table, self.row_table, self.holder_table
        );

        Ok(PgStore {
            rt,
            client,
            url: self.url,
            sql: Sql::new(&self.lease_table, &self.row_table, &self.holder_table),
        })
    }
}
