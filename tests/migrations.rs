use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use hb_postgres::{Migration, MigrationError, MigrationGroup, Migrations, SqlMigration};
use sqlx::PgConnection;

use crate::helpers::with_test_db;

mod helpers;

type ActionLog = Arc<Mutex<Vec<String>>>;

/// A migration that creates a marker table and records every apply/revert in
/// a shared log so tests can assert on execution order.
#[derive(Clone, Debug)]
struct TrackedMigration {
    name: &'static str,
    group: MigrationGroup,
    log: ActionLog,
}

impl TrackedMigration {
    fn new(name: &'static str, group: MigrationGroup, log: &ActionLog) -> Self {
        TrackedMigration {
            name,
            group,
            log: log.clone(),
        }
    }
}

impl Migration for TrackedMigration {
    fn name(&self) -> &str {
        self.name
    }

    fn group(&self) -> MigrationGroup {
        self.group.clone()
    }

    fn apply<'c>(&'c self, conn: &'c mut PgConnection) -> BoxFuture<'c, Result<(), sqlx::Error>> {
        async move {
            sqlx::query(&format!("CREATE TABLE mig_{} (id int)", self.name))
                .execute(&mut *conn)
                .await?;
            self.log.lock().unwrap().push(format!("apply {}", self.name));
            Ok(())
        }
        .boxed()
    }

    fn revert<'c>(&'c self, conn: &'c mut PgConnection) -> BoxFuture<'c, Result<(), sqlx::Error>> {
        async move {
            sqlx::query(&format!("DROP TABLE mig_{}", self.name))
                .execute(&mut *conn)
                .await?;
            self.log
                .lock()
                .unwrap()
                .push(format!("revert {}", self.name));
            Ok(())
        }
        .boxed()
    }
}

fn action_log() -> ActionLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn logged(log: &ActionLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[tokio::test]
async fn apply_runs_declared_migrations_in_order() {
    with_test_db(|db| async move {
        let client = db.client();
        let log = action_log();

        let migrations = Migrations::new();
        migrations.add(TrackedMigration::new("test1", MigrationGroup::DEFAULT, &log));
        migrations.add(TrackedMigration::new("test2", MigrationGroup::DEFAULT, &log));

        migrations
            .apply(&client, &[], false)
            .await
            .expect("Failed to apply migrations");

        assert_eq!(logged(&log), ["apply test1", "apply test2"]);
        let applied = db.get_applied_migrations().await;
        assert_eq!(
            applied,
            [
                ("test1".to_string(), "_hb_default".to_string()),
                ("test2".to_string(), "_hb_default".to_string()),
            ]
        );
        assert!(db.table_exists("mig_test1").await);

        migrations
            .wait_until_completed()
            .await
            .expect("Engine should have completed");
    })
    .await;
}

#[tokio::test]
async fn apply_twice_is_a_no_op() {
    with_test_db(|db| async move {
        let client = db.client();
        let log = action_log();

        let migrations = Migrations::new();
        migrations.add(TrackedMigration::new("test1", MigrationGroup::DEFAULT, &log));

        migrations
            .apply(&client, &[], false)
            .await
            .expect("Failed to apply migrations");
        migrations
            .apply(&client, &[], false)
            .await
            .expect("Second apply should succeed");

        assert_eq!(logged(&log), ["apply test1"]);
        assert_eq!(db.get_applied_migrations().await.len(), 1);
    })
    .await;
}

#[tokio::test]
async fn revert_backs_out_everything_in_reverse_order() {
    with_test_db(|db| async move {
        let client = db.client();
        let log = action_log();

        let migrations = Migrations::new();
        migrations.add(TrackedMigration::new("test1", MigrationGroup::DEFAULT, &log));
        migrations.add(TrackedMigration::new("test2", MigrationGroup::DEFAULT, &log));

        migrations
            .apply(&client, &[], false)
            .await
            .expect("Failed to apply migrations");
        migrations
            .revert(&client, &[], false)
            .await
            .expect("Failed to revert migrations");

        assert_eq!(
            logged(&log),
            ["apply test1", "apply test2", "revert test2", "revert test1"]
        );
        assert!(db.get_applied_migrations().await.is_empty());
        assert!(!db.table_exists("mig_test1").await);
    })
    .await;
}

#[tokio::test]
async fn removed_migration_is_reported_and_revertable() {
    with_test_db(|db| async move {
        let client = db.client();
        let log = action_log();

        // First run declares three migrations.
        let first_run = Migrations::new();
        first_run.add(TrackedMigration::new("test1", MigrationGroup::DEFAULT, &log));
        first_run.add(TrackedMigration::new("test2", MigrationGroup::DEFAULT, &log));
        first_run.add(TrackedMigration::new("test3", MigrationGroup::DEFAULT, &log));
        first_run
            .apply(&client, &[], false)
            .await
            .expect("Failed to apply migrations");

        // A later run no longer declares test3 but keeps its revert around.
        let second_run = Migrations::new();
        second_run.add(TrackedMigration::new("test1", MigrationGroup::DEFAULT, &log));
        second_run.add(TrackedMigration::new("test2", MigrationGroup::DEFAULT, &log));
        second_run.register(TrackedMigration::new("test3", MigrationGroup::DEFAULT, &log));

        let err = second_run
            .apply(&client, &[], false)
            .await
            .expect_err("Apply should report drift");
        assert!(matches!(
            &*err,
            MigrationError::AppliedMigrationsInconsistent { .. }
        ));

        let err = second_run
            .wait_until_completed()
            .await
            .expect_err("Waiters should observe the failure");
        assert!(matches!(
            &*err,
            MigrationError::AppliedMigrationsInconsistent { .. }
        ));

        second_run
            .revert_inconsistent(&client, &[], false)
            .await
            .expect("Failed to revert the divergent tail");

        let applied: Vec<String> = db
            .get_applied_migrations()
            .await
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(applied, ["test1", "test2"]);
        assert!(logged(&log).contains(&"revert test3".to_string()));

        second_run
            .apply(&client, &[], false)
            .await
            .expect("Apply should succeed once the tail is reverted");
    })
    .await;
}

#[tokio::test]
async fn dry_run_reports_pending_work_without_applying() {
    with_test_db(|db| async move {
        let client = db.client();
        let log = action_log();

        let migrations = Migrations::new();
        migrations.add(TrackedMigration::new("test1", MigrationGroup::DEFAULT, &log));
        migrations.add(TrackedMigration::new("test2", MigrationGroup::DEFAULT, &log));

        let err = migrations
            .apply(&client, &[], true)
            .await
            .expect_err("Dry run should report pending migrations");
        assert!(matches!(&*err, MigrationError::RequiresChanges));
        assert!(logged(&log).is_empty());
        assert!(db.get_applied_migrations().await.is_empty());

        migrations
            .apply(&client, &[], false)
            .await
            .expect("Failed to apply migrations");
        migrations
            .apply(&client, &[], true)
            .await
            .expect("Dry run should succeed once the database is up to date");
    })
    .await;
}

#[tokio::test]
async fn groups_are_reconciled_independently() {
    with_test_db(|db| async move {
        let client = db.client();
        let log = action_log();
        let test_group = MigrationGroup::new("test");

        let first_run = Migrations::new();
        first_run.add(TrackedMigration::new("test1", MigrationGroup::DEFAULT, &log));
        first_run.add(TrackedMigration::new("test2", test_group.clone(), &log));
        first_run
            .apply(&client, &[], false)
            .await
            .expect("Failed to apply migrations");

        // A later run appends test1_2 to the default group. The ledger keeps
        // historical order: test2 was applied before test1_2 existed.
        let second_run = Migrations::new();
        second_run.add(TrackedMigration::new("test1", MigrationGroup::DEFAULT, &log));
        second_run.add(TrackedMigration::new(
            "test1_2",
            MigrationGroup::DEFAULT,
            &log,
        ));
        second_run.add(TrackedMigration::new("test2", test_group.clone(), &log));
        second_run
            .apply(&client, &[], false)
            .await
            .expect("Failed to apply migrations");

        let applied: Vec<String> = db
            .get_applied_migrations()
            .await
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(applied, ["test1", "test2", "test1_2"]);
    })
    .await;
}

#[tokio::test]
async fn duplicate_names_fail_before_any_sql() {
    with_test_db(|db| async move {
        let client = db.client();
        let log = action_log();

        let migrations = Migrations::new();
        migrations.add(TrackedMigration::new("test1", MigrationGroup::DEFAULT, &log));
        migrations.add(TrackedMigration::new("test1", MigrationGroup::DEFAULT, &log));

        let err = migrations
            .apply(&client, &[], false)
            .await
            .expect_err("Duplicate names should be rejected");
        assert!(matches!(&*err, MigrationError::DuplicateNames { .. }));
        assert!(logged(&log).is_empty());
    })
    .await;
}

#[tokio::test]
async fn failed_migration_rolls_back_the_whole_run() {
    with_test_db(|db| async move {
        let client = db.client();
        let log = action_log();

        let migrations = Migrations::new();
        migrations.add(TrackedMigration::new("test1", MigrationGroup::DEFAULT, &log));
        migrations.add(SqlMigration {
            name: "broken",
            group: MigrationGroup::DEFAULT,
            apply: &["THIS IS NOT SQL"],
            revert: &[],
        });

        let err = migrations
            .apply(&client, &[], false)
            .await
            .expect_err("Broken migration should fail the run");
        assert!(matches!(&*err, MigrationError::Sql(_)));

        // The successful first migration must have been rolled back with it.
        assert!(db.get_applied_migrations().await.is_empty());
        assert!(!db.table_exists("mig_test1").await);
    })
    .await;
}

#[tokio::test]
async fn revert_without_a_descriptor_fails() {
    with_test_db(|db| async move {
        let client = db.client();
        let log = action_log();

        let first_run = Migrations::new();
        first_run.add(TrackedMigration::new("test1", MigrationGroup::DEFAULT, &log));
        first_run
            .apply(&client, &[], false)
            .await
            .expect("Failed to apply migrations");

        // A fresh engine that knows nothing about test1 cannot revert it.
        let second_run = Migrations::new();
        let err = second_run
            .revert(&client, &[], false)
            .await
            .expect_err("Revert should fail without a descriptor");
        assert!(matches!(&*err, MigrationError::CannotRevertMigration { .. }));
        assert_eq!(db.get_applied_migrations().await.len(), 1);
    })
    .await;
}
