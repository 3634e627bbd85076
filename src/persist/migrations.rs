use indoc::indoc;

use crate::migrations::{MigrationGroup, SqlMigration};

pub(crate) const CREATE_PERSIST_TABLE: SqlMigration = SqlMigration {
    name: "create-persist-table",
    group: MigrationGroup::PERSIST,
    apply: &[indoc! {r#"
        CREATE TABLE _hb_pg_persist (
            id      TEXT PRIMARY KEY,
            data    JSON NOT NULL,
            expires TIMESTAMPTZ NOT NULL
        );
    "#}],
    revert: &["DROP TABLE _hb_pg_persist;"],
};
