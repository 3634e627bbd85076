use futures::future::BoxFuture;
use futures::stream::BoxStream;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

/// Thin gateway over a pooled Postgres client.
///
/// Every subsystem in this crate talks to the database through a `PgClient`.
/// Single statements run directly against the pool; multi-statement work that
/// must be atomic goes through [`PgClient::with_transaction`].
#[derive(Clone)]
pub struct PgClient {
    pool: PgPool,
}

impl PgClient {
    /// Wraps an already connected pool.
    pub fn new(pool: PgPool) -> Self {
        PgClient { pool }
    }

    /// Connects a new pool to the given database url.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(PgClient { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Streams the rows produced by `sql`.
    pub fn query<'a>(&'a self, sql: &'a str) -> BoxStream<'a, Result<PgRow, sqlx::Error>> {
        sqlx::query(sql).fetch(&self.pool)
    }

    /// Checks a single connection out of the pool. The connection is returned
    /// to the pool when the guard is dropped, including on cancellation.
    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>, sqlx::Error> {
        self.pool.acquire().await
    }

    /// Begins a transaction on a pooled connection. Dropping the transaction
    /// without committing rolls it back.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Runs `op` with a checked-out connection.
    pub async fn with_connection<T, E, F>(&self, op: F) -> Result<T, E>
    where
        E: From<sqlx::Error>,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>,
    {
        let mut conn = self.pool.acquire().await.map_err(E::from)?;
        op(&mut conn).await
    }

    /// Runs `op` inside `BEGIN` / `COMMIT`, rolling back if `op` returns an
    /// error or the calling task is cancelled mid-flight.
    pub async fn with_transaction<T, E, F>(&self, op: F) -> Result<T, E>
    where
        E: From<sqlx::Error>,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>,
    {
        let mut tx = self.pool.begin().await.map_err(E::from)?;

        match op(tx.as_mut()).await {
            Ok(value) => {
                tx.commit().await.map_err(E::from)?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback().await.map_err(E::from)?;
                Err(e)
            }
        }
    }
}
