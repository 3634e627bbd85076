#![allow(dead_code)]

use std::future::Future;

use chrono::{DateTime, Utc};
use hb_postgres::PgClient;
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use tokio::sync::OnceCell;
use tokio::task::LocalSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct TestDatabase {
    pub source_pool: PgPool,
    pub test_pool: PgPool,
    pub name: String,
}

impl TestDatabase {
    async fn drop(&self) {
        self.test_pool.close().await;
        sqlx::query(&format!("DROP DATABASE {} WITH (FORCE)", self.name))
            .execute(&self.source_pool)
            .await
            .expect("Failed to drop test database");
    }

    pub fn client(&self) -> PgClient {
        PgClient::new(self.test_pool.clone())
    }

    /// Ledger rows as `(name, group)` in insertion order.
    pub async fn get_applied_migrations(&self) -> Vec<(String, String)> {
        sqlx::query_as(
            r#"select "name", "group" from _hb_pg_migrations order by "order" asc"#,
        )
        .fetch_all(&self.test_pool)
        .await
        .expect("Failed to read migration ledger")
    }

    /// Job rows as `(id, status)`.
    pub async fn get_job_rows(&self) -> Vec<(Uuid, i16)> {
        sqlx::query_as("select id, status from _hb_pg_jobs order by lastModified asc")
            .fetch_all(&self.test_pool)
            .await
            .expect("Failed to read jobs")
    }

    /// Queue entries as `(job_id, delayed_until)` in claim order.
    pub async fn get_queue_entries(&self) -> Vec<(Uuid, Option<DateTime<Utc>>)> {
        sqlx::query_as("select job_id, delayed_until from _hb_pg_job_queue order by createdAt asc")
            .fetch_all(&self.test_pool)
            .await
            .expect("Failed to read job queue")
    }

    pub async fn count_persist_rows(&self) -> i64 {
        sqlx::query_scalar("select count(*) from _hb_pg_persist")
            .fetch_one(&self.test_pool)
            .await
            .expect("Failed to count persist rows")
    }

    pub async fn table_exists(&self, name: &str) -> bool {
        sqlx::query_scalar(
            "select exists (select from information_schema.tables where table_name = $1)",
        )
        .bind(name)
        .fetch_one(&self.test_pool)
        .await
        .expect("Failed to check table existence")
    }
}

pub async fn create_test_database() -> TestDatabase {
    let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let mut pg_conn_options: PgConnectOptions =
        db_url.parse().expect("Failed to parse DATABASE_URL");
    pg_conn_options = pg_conn_options.application_name("__test_hb_postgres");

    let pg_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect_with(pg_conn_options.clone())
        .await
        .expect("Failed to connect to database");

    let db_id = Uuid::new_v4();
    let db_name = format!("__test_hb_postgres_{}", db_id.simple());

    sqlx::query(&format!("CREATE DATABASE {}", db_name))
        .execute(&pg_pool)
        .await
        .expect("Failed to create test database");

    let test_options = pg_conn_options.database(&db_name);

    let test_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect_with(test_options)
        .await
        .expect("Failed to connect to test database");

    TestDatabase {
        source_pool: pg_pool,
        test_pool,
        name: db_name,
    }
}

pub async fn with_test_db<F, Fut>(test_fn: F)
where
    F: FnOnce(TestDatabase) -> Fut + 'static,
    Fut: Future<Output = ()>,
{
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL not set; skipping database test");
        return;
    }

    let local_set = LocalSet::new();

    local_set
        .run_until(async move {
            let test_db = create_test_database().await;
            let test_db_2 = test_db.clone();

            let result = tokio::task::spawn_local(async move {
                test_fn(test_db_2).await;
            })
            .await;

            test_db.drop().await;
            result.expect("Test failed");
        })
        .await;
}

pub async fn enable_logs() {
    static ONCE: OnceCell<()> = OnceCell::const_new();

    ONCE.get_or_init(|| async {
        let fmt_layer = tracing_subscriber::fmt::layer();
        // Log level set to debug except for sqlx set at warn (to not show all sql requests)
        let filter_layer = EnvFilter::try_new("debug,sqlx=warn").unwrap();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    })
    .await;
}
