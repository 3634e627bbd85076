use indoc::indoc;

use crate::migrations::{MigrationGroup, SqlMigration};

/// The job queue schema, in declaration order. Later migrations build on
/// earlier ones, so the slice order is load-bearing.
pub(crate) const JOB_QUEUE_MIGRATIONS: &[SqlMigration] = &[
    CREATE_JOBS_TABLE,
    CREATE_JOB_QUEUE_TABLE,
    CREATE_JOB_QUEUE_METADATA_TABLE,
    ADD_JOB_DELAY,
];

const CREATE_JOBS_TABLE: SqlMigration = SqlMigration {
    name: "create-jobs-table",
    group: MigrationGroup::JOB_QUEUE,
    apply: &[
        indoc! {r#"
            CREATE TABLE _hb_pg_jobs (
                id           UUID PRIMARY KEY,
                job          BYTEA,
                status       SMALLINT,
                lastModified TIMESTAMPTZ DEFAULT now()
            );
        "#},
        "CREATE INDEX _hb_job_status ON _hb_pg_jobs (status);",
    ],
    revert: &["DROP TABLE _hb_pg_jobs;"],
};

const CREATE_JOB_QUEUE_TABLE: SqlMigration = SqlMigration {
    name: "create-job-queue-table",
    group: MigrationGroup::JOB_QUEUE,
    apply: &[
        indoc! {r#"
            CREATE TABLE _hb_pg_job_queue (
                job_id    UUID PRIMARY KEY,
                createdAt TIMESTAMPTZ
            );
        "#},
        "CREATE INDEX _hb_job_queueidx ON _hb_pg_job_queue (createdAt ASC);",
    ],
    revert: &["DROP TABLE _hb_pg_job_queue;"],
};

const CREATE_JOB_QUEUE_METADATA_TABLE: SqlMigration = SqlMigration {
    name: "create-job-queue-metadata-table",
    group: MigrationGroup::JOB_QUEUE,
    apply: &[indoc! {r#"
        CREATE TABLE _hb_pg_job_queue_metadata (
            key   TEXT PRIMARY KEY,
            value BYTEA
        );
    "#}],
    revert: &["DROP TABLE _hb_pg_job_queue_metadata;"],
};

const ADD_JOB_DELAY: SqlMigration = SqlMigration {
    name: "add-job-delay",
    group: MigrationGroup::JOB_QUEUE,
    apply: &["ALTER TABLE _hb_pg_job_queue ADD COLUMN delayed_until TIMESTAMPTZ;"],
    revert: &["ALTER TABLE _hb_pg_job_queue DROP COLUMN delayed_until;"],
};
