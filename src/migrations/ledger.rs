use indoc::indoc;
use sqlx::{query, query_as, FromRow, PgConnection};

/// A row of the migration ledger. The `order` column reflects insertion
/// order and is the only ordering the engine ever relies on.
#[derive(FromRow, Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub order: i32,
    pub name: String,
    pub group: String,
}

/// Idempotent DDL for the ledger table. `order` and `group` are reserved
/// words, hence the quoting.
pub(crate) async fn ensure_table(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    query(indoc! {r#"
        CREATE TABLE IF NOT EXISTS _hb_pg_migrations (
            "order" SERIAL PRIMARY KEY,
            "name"  TEXT,
            "group" TEXT
        );
    "#})
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) async fn insert(
    conn: &mut PgConnection,
    name: &str,
    group: &str,
) -> Result<(), sqlx::Error> {
    query(r#"INSERT INTO _hb_pg_migrations ("name", "group") VALUES ($1, $2)"#)
        .bind(name)
        .bind(group)
        .execute(conn)
        .await?;

    Ok(())
}

pub(crate) async fn delete_by_name(conn: &mut PgConnection, name: &str) -> Result<(), sqlx::Error> {
    query(r#"DELETE FROM _hb_pg_migrations WHERE "name" = $1"#)
        .bind(name)
        .execute(conn)
        .await?;

    Ok(())
}

pub(crate) async fn list_ordered(
    conn: &mut PgConnection,
) -> Result<Vec<AppliedMigration>, sqlx::Error> {
    query_as(indoc! {r#"
        SELECT "order", "name", "group"
            FROM _hb_pg_migrations
            ORDER BY "order" ASC
    "#})
    .fetch_all(conn)
    .await
}
