//! Schema migration engine.
//!
//! A [`Migrations`] instance holds an ordered list of declared migrations and
//! reconciles it against the ledger of already-applied migrations persisted in
//! `_hb_pg_migrations`. Migrations are namespaced by [`MigrationGroup`] and
//! each group is reconciled independently, so libraries shipping their own
//! migrations (persist, job queue) can evolve without disturbing the host
//! application's migration history.

mod ledger;

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::{query, PgConnection};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

use crate::client::PgClient;

pub use ledger::AppliedMigration;

/// Namespace of migrations reconciled independently from other groups.
/// Comparison is plain string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MigrationGroup(Cow<'static, str>);

impl MigrationGroup {
    /// Group used by migrations that do not declare one.
    pub const DEFAULT: MigrationGroup = MigrationGroup::from_static("_hb_default");
    /// Group owned by the persist driver.
    pub const PERSIST: MigrationGroup = MigrationGroup::from_static("_hb_persist");
    /// Group owned by the job queue driver.
    pub const JOB_QUEUE: MigrationGroup = MigrationGroup::from_static("_hb_jobqueue");

    pub const fn from_static(name: &'static str) -> Self {
        MigrationGroup(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        MigrationGroup(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MigrationGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single schema migration. Identity is `(group, name)`; names must be
/// unique within a group.
pub trait Migration: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn group(&self) -> MigrationGroup {
        MigrationGroup::DEFAULT
    }

    /// Runs the forward DDL on the supplied connection. The engine composes
    /// this with a ledger insert inside one transaction.
    fn apply<'c>(&'c self, conn: &'c mut PgConnection) -> BoxFuture<'c, Result<(), sqlx::Error>>;

    /// Runs the backward DDL on the supplied connection.
    fn revert<'c>(&'c self, conn: &'c mut PgConnection) -> BoxFuture<'c, Result<(), sqlx::Error>>;
}

/// A migration defined by static SQL statement lists.
#[derive(Debug, Clone)]
pub struct SqlMigration {
    pub name: &'static str,
    pub group: MigrationGroup,
    pub apply: &'static [&'static str],
    pub revert: &'static [&'static str],
}

impl Migration for SqlMigration {
    fn name(&self) -> &str {
        self.name
    }

    fn group(&self) -> MigrationGroup {
        self.group.clone()
    }

    fn apply<'c>(&'c self, conn: &'c mut PgConnection) -> BoxFuture<'c, Result<(), sqlx::Error>> {
        async move {
            for statement in self.apply {
                query(statement).execute(&mut *conn).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn revert<'c>(&'c self, conn: &'c mut PgConnection) -> BoxFuture<'c, Result<(), sqlx::Error>> {
        async move {
            for statement in self.revert {
                query(statement).execute(&mut *conn).await?;
            }
            Ok(())
        }
        .boxed()
    }
}

/// Errors raised by the migration engine.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Two declared migrations share a name within one group.
    #[error("duplicate migration name '{name}' declared in group '{group}'")]
    DuplicateNames { group: String, name: String },

    /// A dry run found migrations that still need to be applied or reverted.
    #[error("database requires changes to match the declared migration list")]
    RequiresChanges,

    /// The applied ledger diverges from the declared migration list. Requires
    /// operator intervention, usually via `revert_inconsistent`.
    #[error("applied migrations in group '{group}' are inconsistent with the declared migration list")]
    AppliedMigrationsInconsistent { group: String },

    /// A ledger entry needs reverting but no descriptor for it is available.
    #[error("no migration available to revert '{name}' in group '{group}'")]
    CannotRevertMigration { group: String, name: String },

    #[error("Error occured while query: {0}")]
    Sql(#[from] sqlx::Error),
}

/// Completion state broadcast to `wait_until_completed` callers.
#[derive(Clone, Default)]
enum MigrationState {
    #[default]
    Waiting,
    Completed,
    Failed(Arc<MigrationError>),
}

#[derive(Default)]
struct Registry {
    declared: Vec<Arc<dyn Migration>>,
    reverts: HashMap<String, Arc<dyn Migration>>,
}

/// The migration engine.
///
/// `add` and `register` may be called from anywhere until the first `apply`;
/// `apply` and the revert operations are serialized against each other, while
/// any number of tasks may concurrently block on
/// [`Migrations::wait_until_completed`]. Errors from a failed run are shared
/// with every waiter, hence the `Arc<MigrationError>` in the signatures.
pub struct Migrations {
    registry: Mutex<Registry>,
    state: watch::Sender<MigrationState>,
    op_lock: tokio::sync::Mutex<()>,
}

impl Default for Migrations {
    fn default() -> Self {
        Self::new()
    }
}

impl Migrations {
    pub fn new() -> Self {
        let (state, _) = watch::channel(MigrationState::Waiting);
        Migrations {
            registry: Mutex::new(Registry::default()),
            state,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Appends a migration to the declared list. Declaration order matters:
    /// it is the order migrations are applied in within their group.
    pub fn add(&self, migration: impl Migration + 'static) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.declared.push(Arc::new(migration));
    }

    /// Records a migration for revert purposes only. Registered migrations
    /// are never applied, but `revert` and `revert_inconsistent` can use them
    /// to back out ledger entries that are no longer declared.
    pub fn register(&self, migration: impl Migration + 'static) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let migration: Arc<dyn Migration> = Arc::new(migration);
        registry.reverts.insert(migration.name().to_string(), migration);
    }

    /// Reconciles the declared migration list against the applied ledger and
    /// applies whatever is missing, all within a single transaction.
    ///
    /// With an empty `groups` list every group mentioned by either the
    /// declared list or the ledger is reconciled. With `dry_run` no DDL is
    /// executed; pending work is reported as
    /// [`MigrationError::RequiresChanges`].
    pub async fn apply(
        &self,
        client: &PgClient,
        groups: &[MigrationGroup],
        dry_run: bool,
    ) -> Result<(), Arc<MigrationError>> {
        let _guard = self.op_lock.lock().await;
        self.state.send_replace(MigrationState::Waiting);

        match self.apply_inner(client, groups, dry_run).await {
            Ok(()) => {
                self.state.send_replace(MigrationState::Completed);
                Ok(())
            }
            Err(e) => {
                let e = Arc::new(e);
                self.state.send_replace(MigrationState::Failed(e.clone()));
                Err(e)
            }
        }
    }

    /// Reverts every applied migration in reverse insertion order.
    pub async fn revert(
        &self,
        client: &PgClient,
        groups: &[MigrationGroup],
        dry_run: bool,
    ) -> Result<(), Arc<MigrationError>> {
        let _guard = self.op_lock.lock().await;
        self.revert_where(client, groups, dry_run, RevertScope::All)
            .await
            .map_err(Arc::new)
    }

    /// Reverts only the applied entries that diverge from the declared list,
    /// leaving the common prefix in place.
    pub async fn revert_inconsistent(
        &self,
        client: &PgClient,
        groups: &[MigrationGroup],
        dry_run: bool,
    ) -> Result<(), Arc<MigrationError>> {
        let _guard = self.op_lock.lock().await;
        self.revert_where(client, groups, dry_run, RevertScope::InconsistentTail)
            .await
            .map_err(Arc::new)
    }

    /// Suspends until the most recent `apply` run reaches its terminal state.
    /// Resolves immediately once the engine has completed; a failed run is
    /// observed by every waiter.
    pub async fn wait_until_completed(&self) -> Result<(), Arc<MigrationError>> {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we
        // hold `&self`.
        let state = rx
            .wait_for(|state| !matches!(state, MigrationState::Waiting))
            .await
            .expect("migration state channel closed");

        if let MigrationState::Failed(e) = &*state {
            return Err(e.clone());
        }
        Ok(())
    }

    fn snapshot(&self) -> (Vec<Arc<dyn Migration>>, HashMap<String, Arc<dyn Migration>>) {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        (registry.declared.clone(), registry.reverts.clone())
    }

    async fn apply_inner(
        &self,
        client: &PgClient,
        groups: &[MigrationGroup],
        dry_run: bool,
    ) -> Result<(), MigrationError> {
        let (declared, _) = self.snapshot();
        check_duplicate_names(&declared)?;

        let applied = read_ledger(client).await?;

        let groups = if groups.is_empty() {
            group_sequence(&declared, &applied)
        } else {
            groups.to_vec()
        };

        let mut planned: Vec<Arc<dyn Migration>> = Vec::new();
        for group in &groups {
            let declared_in_group: Vec<_> = declared
                .iter()
                .filter(|m| m.group() == *group)
                .cloned()
                .collect();
            let applied_in_group: Vec<_> = applied
                .iter()
                .filter(|m| m.group == group.as_str())
                .collect();

            planned.extend(pending_for_group(
                group,
                &declared_in_group,
                &applied_in_group,
            )?);
        }

        if dry_run {
            if planned.is_empty() {
                return Ok(());
            }
            return Err(MigrationError::RequiresChanges);
        }

        if planned.is_empty() {
            return Ok(());
        }

        client
            .with_transaction::<_, MigrationError, _>(move |conn| {
                async move {
                    for migration in &planned {
                        info!(
                            name = migration.name(),
                            group = %migration.group(),
                            "Applying migration"
                        );
                        migration.apply(&mut *conn).await?;
                        ledger::insert(&mut *conn, migration.name(), migration.group().as_str())
                            .await?;
                    }
                    Ok(())
                }
                .boxed()
            })
            .await
    }

    async fn revert_where(
        &self,
        client: &PgClient,
        groups: &[MigrationGroup],
        dry_run: bool,
        scope: RevertScope,
    ) -> Result<(), MigrationError> {
        let (declared, registered) = self.snapshot();

        // Registered reverts first, declared-by-name takes precedence.
        let mut descriptors = registered;
        for migration in &declared {
            descriptors.insert(migration.name().to_string(), migration.clone());
        }

        let applied = read_ledger(client).await?;

        let groups = if groups.is_empty() {
            group_sequence(&declared, &applied)
        } else {
            groups.to_vec()
        };

        let mut planned: Vec<Arc<dyn Migration>> = Vec::new();
        for group in &groups {
            let declared_names: Vec<&str> = declared
                .iter()
                .filter(|m| m.group() == *group)
                .map(|m| m.name())
                .collect();
            let applied_in_group: Vec<_> = applied
                .iter()
                .filter(|m| m.group == group.as_str())
                .collect();

            let skip = match scope {
                RevertScope::All => 0,
                RevertScope::InconsistentTail => {
                    common_prefix_len(&declared_names, &applied_in_group)
                }
            };

            for entry in applied_in_group[skip..].iter().rev() {
                let descriptor = descriptors.get(&entry.name).ok_or_else(|| {
                    MigrationError::CannotRevertMigration {
                        group: group.as_str().to_string(),
                        name: entry.name.clone(),
                    }
                })?;
                planned.push(descriptor.clone());
            }
        }

        if dry_run {
            if planned.is_empty() {
                return Ok(());
            }
            return Err(MigrationError::RequiresChanges);
        }

        if planned.is_empty() {
            return Ok(());
        }

        client
            .with_transaction::<_, MigrationError, _>(move |conn| {
                async move {
                    for migration in &planned {
                        info!(
                            name = migration.name(),
                            group = %migration.group(),
                            "Reverting migration"
                        );
                        migration.revert(&mut *conn).await?;
                        ledger::delete_by_name(&mut *conn, migration.name()).await?;
                    }
                    Ok(())
                }
                .boxed()
            })
            .await
    }
}

#[derive(Clone, Copy)]
enum RevertScope {
    All,
    InconsistentTail,
}

async fn read_ledger(client: &PgClient) -> Result<Vec<AppliedMigration>, MigrationError> {
    let mut conn = client.acquire().await?;
    ledger::ensure_table(&mut conn).await?;
    let applied = ledger::list_ordered(&mut conn).await?;
    Ok(applied)
}

fn check_duplicate_names(declared: &[Arc<dyn Migration>]) -> Result<(), MigrationError> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    for migration in declared {
        let key = (
            migration.group().as_str().to_string(),
            migration.name().to_string(),
        );
        if !seen.insert(key) {
            return Err(MigrationError::DuplicateNames {
                group: migration.group().as_str().to_string(),
                name: migration.name().to_string(),
            });
        }
    }
    Ok(())
}

/// Unique groups in first-seen order: declared first, then any group only
/// the ledger still knows about.
fn group_sequence(
    declared: &[Arc<dyn Migration>],
    applied: &[AppliedMigration],
) -> Vec<MigrationGroup> {
    let mut sequence: Vec<MigrationGroup> = Vec::new();
    let groups = declared
        .iter()
        .map(|m| m.group())
        .chain(applied.iter().map(|m| MigrationGroup::new(m.group.clone())));

    for group in groups {
        if !sequence.contains(&group) {
            sequence.push(group);
        }
    }
    sequence
}

fn common_prefix_len(declared_names: &[&str], applied: &[&AppliedMigration]) -> usize {
    declared_names
        .iter()
        .zip(applied.iter())
        .take_while(|(declared, applied)| **declared == applied.name)
        .count()
}

/// Plans the migrations still to apply for one group, or fails if the ledger
/// has drifted from the declared prefix.
fn pending_for_group(
    group: &MigrationGroup,
    declared: &[Arc<dyn Migration>],
    applied: &[&AppliedMigration],
) -> Result<Vec<Arc<dyn Migration>>, MigrationError> {
    let declared_names: Vec<&str> = declared.iter().map(|m| m.name()).collect();
    let prefix = common_prefix_len(&declared_names, applied);

    if prefix < applied.len() {
        error!(
            group = %group,
            "Applied migrations diverge from the declared list:\n{}",
            alignment_diff(&declared_names, applied)
        );
        return Err(MigrationError::AppliedMigrationsInconsistent {
            group: group.as_str().to_string(),
        });
    }

    Ok(declared[prefix..].to_vec())
}

fn alignment_diff(declared_names: &[&str], applied: &[&AppliedMigration]) -> String {
    let mut diff = String::new();
    for i in 0..declared_names.len().max(applied.len()) {
        let declared = declared_names.get(i).copied().unwrap_or("<none>");
        let applied = applied.get(i).map(|m| m.name.as_str()).unwrap_or("<none>");
        let marker = if declared == applied { "  " } else { "! " };
        diff.push_str(&format!(
            "{marker}applied: {applied:<32} declared: {declared}\n"
        ));
    }
    diff
}
