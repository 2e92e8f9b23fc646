//! Staging-then-promote table replacement for one dataset build.
//!
//! A build imports into a fresh `temp_<dataset>_<secs>` namespace, captures the
//! grants on the live tables, moves the staged tables over the live ones inside
//! a single transaction (grant replay included), re-installs functions and
//! finally drops the staging namespace. Every exit path after the namespace is
//! created goes through [`StagingSchema::teardown`].

use std::path::PathBuf;

use cdl_core::{staging_schema_name, IdentError, SqlIdent, TableRef};
use cdl_datasets::{DatabaseParams, DatasetImporter, ImportContext, ImportError};
use chrono::Utc;
use sqlx::{Connection, PgConnection};
use thiserror::Error;
use tracing::{info, warn};

use crate::functions::reinstall_functions;
use crate::grants::{self, GrantError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    Idle,
    StagingCreated,
    Imported,
    PermissionsSnapshotted,
    LivePromoted,
    FunctionsReinstalled,
    Done,
    RolledBack,
}

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("invalid staging namespace: {0}")]
    Ident(#[from] IdentError),
    #[error("import failed: {0}")]
    Import(#[from] ImportError),
    #[error(transparent)]
    Grant(#[from] GrantError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub async fn ensure_schema(conn: &mut PgConnection, schema: &SqlIdent) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// A freshly created staging namespace that is active on the build connection.
///
/// Dropping the namespace needs the connection, so release is the explicit
/// async [`teardown`](Self::teardown). A guard dropped without it only logs;
/// `cdl db staging gc` cleans up what such a run leaves behind.
#[derive(Debug)]
pub struct StagingSchema {
    name: SqlIdent,
    live: bool,
}

impl StagingSchema {
    /// Drops any leftover namespace of the same name, creates it, and points the
    /// session search path at `search_path` (which should start with `name`).
    pub async fn enter(
        conn: &mut PgConnection,
        name: SqlIdent,
        search_path: &[SqlIdent],
    ) -> Result<Self, sqlx::Error> {
        let path = search_path
            .iter()
            .map(SqlIdent::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        // A multi-statement simple query runs as one implicit transaction.
        sqlx::raw_sql(&format!(
            "DROP SCHEMA IF EXISTS {name} CASCADE; CREATE SCHEMA {name}; SET search_path TO {path};"
        ))
        .execute(&mut *conn)
        .await?;
        info!(schema = %name, search_path = %path, "entered staging namespace");
        Ok(Self { name, live: true })
    }

    pub fn name(&self) -> &SqlIdent {
        &self.name
    }

    pub async fn teardown(mut self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(&format!(
            "DROP SCHEMA IF EXISTS {} CASCADE; SET search_path TO public;",
            self.name
        ))
        .execute(&mut *conn)
        .await?;
        self.live = false;
        info!(schema = %self.name, "dropped staging namespace");
        Ok(())
    }
}

impl Drop for StagingSchema {
    fn drop(&mut self) {
        if self.live {
            warn!(schema = %self.name, "staging namespace left behind; run `cdl db staging gc` to remove it");
        }
    }
}

/// Everything one build needs, resolved up front from the dataset definition.
#[derive(Debug, Clone)]
pub struct SwapPlan {
    pub dataset: SqlIdent,
    pub tables: Vec<TableRef>,
    pub target_schema: SqlIdent,
    /// Searched after `public` during import.
    pub aux_search_path: Vec<SqlIdent>,
    pub function_sql: String,
    pub root_dir: PathBuf,
    pub use_test_data: bool,
    pub database: DatabaseParams,
}

impl SwapPlan {
    pub fn staging_search_path(&self, staging: &SqlIdent) -> Vec<SqlIdent> {
        let mut path = vec![staging.clone(), SqlIdent::public()];
        for extra in &self.aux_search_path {
            if !path.contains(extra) {
                path.push(extra.clone());
            }
        }
        path
    }

    pub fn import_context(&self, staging: &SqlIdent) -> ImportContext {
        ImportContext {
            dataset: self.dataset.clone(),
            search_path: self.staging_search_path(staging),
            root_dir: self.root_dir.clone(),
            use_test_data: self.use_test_data,
            database: self.database.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapReport {
    pub staging_schema: SqlIdent,
    pub tables: Vec<TableRef>,
    pub grants_replayed: bool,
    pub functions_reinstalled: bool,
    pub final_state: SwapState,
}

struct Progress<'a> {
    dataset: &'a SqlIdent,
    state: SwapState,
}

impl Progress<'_> {
    fn advance(&mut self, next: SwapState) {
        info!(dataset = %self.dataset, from = ?self.state, state = ?next, "swap state");
        self.state = next;
    }
}

/// Runs the full staging, promotion and cleanup sequence for one dataset.
///
/// The caller downloads raw files beforehand; `importer` only loads them.
/// On failure the live namespace is left as it was and the staging namespace
/// is dropped before the error is returned.
pub async fn swap_dataset(
    conn: &mut PgConnection,
    plan: &SwapPlan,
    importer: &dyn DatasetImporter,
) -> Result<SwapReport, SwapError> {
    let mut progress = Progress {
        dataset: &plan.dataset,
        state: SwapState::Idle,
    };

    let name = staging_schema_name(&plan.dataset, Utc::now())?;
    let search_path = plan.staging_search_path(&name);
    let staging = StagingSchema::enter(conn, name, &search_path).await?;
    progress.advance(SwapState::StagingCreated);

    let outcome = stage_and_promote(conn, plan, importer, staging.name(), &mut progress).await;
    match outcome {
        Ok(mut report) => {
            staging.teardown(conn).await?;
            progress.advance(SwapState::Done);
            report.final_state = SwapState::Done;
            Ok(report)
        }
        Err(err) => {
            warn!(dataset = %plan.dataset, failed_in = ?progress.state, error = %err, "rolling back build");
            progress.advance(SwapState::RolledBack);
            if let Err(cleanup) = staging.teardown(conn).await {
                warn!(dataset = %plan.dataset, error = %cleanup, "dropping staging namespace failed");
            }
            Err(err)
        }
    }
}

async fn stage_and_promote(
    conn: &mut PgConnection,
    plan: &SwapPlan,
    importer: &dyn DatasetImporter,
    staging: &SqlIdent,
    progress: &mut Progress<'_>,
) -> Result<SwapReport, SwapError> {
    let ctx = plan.import_context(staging);
    importer.import_into_db(&ctx, conn).await?;
    for table in &plan.tables {
        grants::ensure_table_exists(conn, staging, &table.name).await?;
    }
    progress.advance(SwapState::Imported);

    let target = &plan.target_schema;
    ensure_schema(conn, target).await?;
    grants::create_placeholder_tables(conn, &plan.tables, target).await?;
    let snapshot = grants::snapshot(conn, &plan.tables, target).await?;
    progress.advance(SwapState::PermissionsSnapshotted);

    // Dropping the transaction guard on error queues a ROLLBACK on the connection.
    let mut tx = conn.begin().await?;
    for table in &plan.tables {
        sqlx::query(&format!(
            "DROP TABLE IF EXISTS {} CASCADE",
            table.qualified(target)
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "ALTER TABLE {} SET SCHEMA {target}",
            table.qualified(staging)
        ))
        .execute(&mut *tx)
        .await?;
    }
    grants::replay(&mut *tx, &snapshot).await?;
    tx.commit().await?;
    progress.advance(SwapState::LivePromoted);

    let functions_reinstalled = reinstall_functions(conn, target, &plan.function_sql).await?;
    progress.advance(SwapState::FunctionsReinstalled);

    Ok(SwapReport {
        staging_schema: staging.clone(),
        tables: plan.tables.clone(),
        grants_replayed: !snapshot.is_empty(),
        functions_reinstalled,
        final_state: progress.state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> SwapPlan {
        SwapPlan {
            dataset: SqlIdent::new("hpd_registrations").unwrap(),
            tables: vec![TableRef::new(
                SqlIdent::new("hpd_registrations").unwrap(),
                "hpd_registrations",
            )],
            target_schema: SqlIdent::public(),
            aux_search_path: vec![SqlIdent::new("public").unwrap(), SqlIdent::new("pluto").unwrap()],
            function_sql: String::new(),
            root_dir: PathBuf::from("/var/nycdb"),
            use_test_data: false,
            database: DatabaseParams {
                host: "localhost".into(),
                port: 5432,
                user: None,
                password: None,
                database: "nycdb".into(),
            },
        }
    }

    #[test]
    fn staging_comes_first_and_public_is_not_repeated() {
        let staging = SqlIdent::new("temp_hpd_registrations_1546300800").unwrap();
        let ctx = plan().import_context(&staging);
        assert_eq!(
            ctx.search_path_sql(),
            "temp_hpd_registrations_1546300800, public, pluto"
        );
        assert_eq!(ctx.dataset.as_str(), "hpd_registrations");
    }
}
