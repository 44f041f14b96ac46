#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::missing_errors_doc)]

mod connection;
pub mod models;

use std::str::FromStr as _;

pub use connection::{Connection, Transaction};
pub use sqlx::Error;

use sqlx::Row as _;

/// Key of the advisory lock that keeps a second queue-runner process from
/// racing this one. Stable; do not reuse for anything else.
const GLOBAL_LOCK_KEY: i64 = 0x4651_5255_4e52; // "FQRUNR"

#[derive(Clone)]
pub struct Database {
    pool: sqlx::PgPool,
}

/// Session-scoped advisory lock. The lock lives as long as the held
/// connection; release it explicitly on clean shutdown.
pub struct GlobalLock {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
}

impl GlobalLock {
    pub async fn release(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(GLOBAL_LOCK_KEY)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }
}

impl Database {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        Ok(Self {
            pool: sqlx::postgres::PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(url)
                .await?,
        })
    }

    pub async fn get(&self) -> Result<Connection, sqlx::Error> {
        let conn = self.pool.acquire().await?;
        Ok(Connection::new(conn))
    }

    /// Try to become the single queue-runner process. Returns `None` if
    /// another process already holds the lock.
    pub async fn acquire_global_lock(&self) -> Result<Option<GlobalLock>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        let locked: bool = sqlx::query("SELECT pg_try_advisory_lock($1) AS locked")
            .bind(GLOBAL_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?
            .try_get("locked")?;
        Ok(locked.then_some(GlobalLock { conn }))
    }

    #[tracing::instrument(skip(self, url), err)]
    pub fn reconfigure_pool(&self, url: &str) -> anyhow::Result<()> {
        self.pool
            .set_connect_options(sqlx::postgres::PgConnectOptions::from_str(url)?);
        Ok(())
    }

    pub async fn listener(
        &self,
        channels: Vec<&str>,
    ) -> Result<
        impl futures::Stream<Item = Result<sqlx::postgres::PgNotification, sqlx::Error>> + Unpin,
        sqlx::Error,
    > {
        let mut listener = sqlx::postgres::PgListener::connect_with(&self.pool).await?;
        listener.listen_all(channels).await?;
        Ok(listener.into_stream())
    }
}
