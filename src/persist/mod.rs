//! Key-value persistence with optional time-to-live.
//!
//! Values are stored as JSON in `_hb_pg_persist`. Rows whose expiration has
//! passed are treated as absent on read and physically removed by the
//! periodic sweeper.

mod migrations;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::types::Json;
use sqlx::{query, query_scalar};
use thiserror::Error;
use tokio::select;
use tracing::{debug, info};

use crate::client::PgClient;
use crate::migrations::{MigrationError, Migrations};
use crate::shutdown_signal::ShutdownSignal;

use migrations::CREATE_PERSIST_TABLE;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Errors raised by the persist driver.
#[derive(Error, Debug)]
pub enum PersistError {
    /// `create` found an existing key.
    #[error("key already exists")]
    Duplicate,

    /// The stored payload did not decode into the requested type.
    #[error("stored value did not match the requested type: {0}")]
    InvalidConversion(serde_json::Error),

    /// The migration run this driver depends on failed.
    #[error("migrations failed before the persist driver could start: {0}")]
    MigrationFailed(Arc<MigrationError>),

    #[error("Error occured while serializing value: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Error occured while query: {0}")]
    Sql(#[from] sqlx::Error),
}

impl From<Arc<MigrationError>> for PersistError {
    fn from(e: Arc<MigrationError>) -> Self {
        PersistError::MigrationFailed(e)
    }
}

/// Key-value store driver backed by `_hb_pg_persist`.
///
/// Construction registers the driver's own migration (group `_hb_persist`)
/// with the shared engine; every operation waits for the engine to complete
/// before touching the database.
#[derive(Clone)]
pub struct PersistDriver {
    client: PgClient,
    migrations: Arc<Migrations>,
    sweep_interval: Duration,
}

impl PersistDriver {
    pub fn new(client: PgClient, migrations: Arc<Migrations>) -> Self {
        migrations.add(CREATE_PERSIST_TABLE);

        PersistDriver {
            client,
            migrations,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Overrides how often the sweeper deletes expired rows.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Inserts a fresh entry. Fails with [`PersistError::Duplicate`] when the
    /// key is already present, even if the existing row has expired.
    pub async fn create(
        &self,
        key: &str,
        value: &impl Serialize,
        ttl: Option<Duration>,
    ) -> Result<(), PersistError> {
        self.migrations.wait_until_completed().await?;
        let data = serde_json::to_value(value)?;

        let result = query(
            r#"
                INSERT INTO _hb_pg_persist (id, data, expires)
                    VALUES ($1, $2::json, coalesce($3, 'infinity'::timestamptz))
            "#,
        )
        .bind(key)
        .bind(Json(data))
        .bind(absolute_expiry(ttl))
        .execute(self.client.pool())
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(PersistError::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    /// Inserts or replaces an entry. An upsert replaces both payload and
    /// expiration; omitting the TTL resets the row to never expire.
    pub async fn set(
        &self,
        key: &str,
        value: &impl Serialize,
        ttl: Option<Duration>,
    ) -> Result<(), PersistError> {
        self.migrations.wait_until_completed().await?;
        let data = serde_json::to_value(value)?;

        query(
            r#"
                INSERT INTO _hb_pg_persist (id, data, expires)
                    VALUES ($1, $2::json, coalesce($3, 'infinity'::timestamptz))
                    ON CONFLICT (id)
                    DO UPDATE SET data = excluded.data, expires = excluded.expires
            "#,
        )
        .bind(key)
        .bind(Json(data))
        .bind(absolute_expiry(ttl))
        .execute(self.client.pool())
        .await?;

        Ok(())
    }

    /// Reads an entry, treating expired rows as absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistError> {
        self.migrations.wait_until_completed().await?;

        let row: Option<Json<serde_json::Value>> =
            query_scalar("SELECT data FROM _hb_pg_persist WHERE id = $1 AND expires > now()")
                .bind(key)
                .fetch_optional(self.client.pool())
                .await?;

        match row {
            None => Ok(None),
            Some(Json(data)) => serde_json::from_value(data)
                .map(Some)
                .map_err(PersistError::InvalidConversion),
        }
    }

    /// Deletes an entry regardless of expiration.
    pub async fn remove(&self, key: &str) -> Result<(), PersistError> {
        self.migrations.wait_until_completed().await?;

        query("DELETE FROM _hb_pg_persist WHERE id = $1")
            .bind(key)
            .execute(self.client.pool())
            .await?;

        Ok(())
    }

    /// Periodically deletes expired rows until `shutdown` resolves. Waits for
    /// the migration engine before the first sweep; intended to be spawned as
    /// its own task.
    pub async fn run_sweeper(&self, shutdown: ShutdownSignal) -> Result<(), PersistError> {
        self.migrations.wait_until_completed().await?;
        info!(interval = ?self.sweep_interval, "Persist sweeper started");

        let mut interval = tokio::time::interval(self.sweep_interval);
        loop {
            select! {
                _ = interval.tick() => {
                    let done = query("DELETE FROM _hb_pg_persist WHERE expires < now()")
                        .execute(self.client.pool())
                        .await?;
                    debug!(deleted = done.rows_affected(), "Swept expired persist entries");
                }
                _ = shutdown.clone() => {
                    info!("Persist sweeper stopped");
                    return Ok(());
                }
            }
        }
    }
}

fn absolute_expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = ttl?;
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    let expires = Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    Some(expires)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_absent_without_a_ttl() {
        assert_eq!(absolute_expiry(None), None);
    }

    #[test]
    fn expiry_is_in_the_future_with_a_ttl() {
        let expires = absolute_expiry(Some(Duration::from_secs(60))).unwrap();
        assert!(expires > Utc::now());
        assert!(expires <= Utc::now() + chrono::Duration::seconds(61));
    }
}
