//! Builds against a real PostgreSQL server. Every test returns early with a
//! notice unless `CDL_TEST_DATABASE_URL` points at a reachable database.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cdl_core::{SqlIdent, TableRef};
use cdl_datasets::{DatabaseParams, DatasetImporter, ImportContext, ImportError};
use cdl_sync::grants::{self, GrantError};
use cdl_sync::tooling::list_staging_schemas;
use cdl_sync::{swap_dataset, SwapError, SwapPlan, SwapState};
use serial_test::serial;
use sqlx::{Connection, Executor, PgConnection, Row};

async fn test_conn() -> Option<PgConnection> {
    let Ok(url) = std::env::var("CDL_TEST_DATABASE_URL") else {
        eprintln!("skipping postgres swap test: set CDL_TEST_DATABASE_URL");
        return None;
    };
    match PgConnection::connect(&url).await {
        Ok(conn) => Some(conn),
        Err(err) => {
            eprintln!("skipping postgres swap test: cannot connect: {err}");
            None
        }
    }
}

/// Creates `rows` rows in each table of the first namespace on the search path.
struct FakeImporter {
    tables: Vec<&'static str>,
    rows: i64,
    extra_sql: Option<&'static str>,
    fail_after_import: bool,
    imports: AtomicUsize,
}

impl FakeImporter {
    fn new(tables: &[&'static str], rows: i64) -> Self {
        Self {
            tables: tables.to_vec(),
            rows,
            extra_sql: None,
            fail_after_import: false,
            imports: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DatasetImporter for FakeImporter {
    async fn download(&self, _ctx: &ImportContext) -> Result<(), ImportError> {
        Ok(())
    }

    async fn import_into_db(
        &self,
        _ctx: &ImportContext,
        conn: &mut PgConnection,
    ) -> Result<(), ImportError> {
        self.imports.fetch_add(1, Ordering::SeqCst);
        for table in &self.tables {
            let sql = format!(
                "CREATE TABLE {table} (id int); INSERT INTO {table} SELECT generate_series(1, {});",
                self.rows
            );
            (&mut *conn).execute(sqlx::raw_sql(&sql)).await?;
        }
        if let Some(sql) = self.extra_sql {
            (&mut *conn).execute(sqlx::raw_sql(sql)).await?;
        }
        if self.fail_after_import {
            return Err(ImportError::Message("import blew up".into()));
        }
        Ok(())
    }
}

fn plan(dataset: &str, tables: &[&str], function_sql: &str) -> SwapPlan {
    let dataset = SqlIdent::new(dataset).unwrap();
    SwapPlan {
        tables: tables
            .iter()
            .map(|t| TableRef::new(SqlIdent::new(t).unwrap(), dataset.as_str()))
            .collect(),
        dataset,
        target_schema: SqlIdent::public(),
        aux_search_path: Vec::new(),
        function_sql: function_sql.to_string(),
        root_dir: PathBuf::from("/tmp"),
        use_test_data: true,
        database: DatabaseParams {
            host: "localhost".into(),
            port: 5432,
            user: None,
            password: None,
            database: "unused".into(),
        },
    }
}

async fn reset(conn: &mut PgConnection, tables: &[&str]) {
    for table in tables {
        sqlx::query(&format!("DROP TABLE IF EXISTS public.{table} CASCADE"))
            .execute(&mut *conn)
            .await
            .unwrap();
    }
}

async fn row_count(conn: &mut PgConnection, table: &str) -> i64 {
    sqlx::query(&format!("SELECT COUNT(*) AS n FROM public.{table}"))
        .fetch_one(&mut *conn)
        .await
        .unwrap()
        .get("n")
}

async fn search_path(conn: &mut PgConnection) -> String {
    sqlx::query("SHOW search_path")
        .fetch_one(&mut *conn)
        .await
        .unwrap()
        .get(0)
}

async fn create_readonly_user(conn: &mut PgConnection, role: &str) {
    sqlx::raw_sql(&format!(
        "DO $$ BEGIN \
           IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = '{role}') THEN \
             CREATE ROLE {role} NOLOGIN; \
           END IF; \
         END $$; \
         GRANT USAGE ON SCHEMA public TO {role};"
    ))
    .execute(&mut *conn)
    .await
    .unwrap();
}

#[tokio::test]
#[serial]
async fn building_twice_is_idempotent() {
    let Some(mut conn) = test_conn().await else { return };
    let tables = ["cdl_idem_a", "cdl_idem_b"];
    reset(&mut conn, &tables).await;
    let plan = plan("cdl_idem", &tables, "");
    let importer = FakeImporter::new(&tables, 3);

    for _ in 0..2 {
        let report = swap_dataset(&mut conn, &plan, &importer).await.unwrap();
        assert_eq!(report.final_state, SwapState::Done);
        assert!(report.staging_schema.as_str().starts_with("temp_cdl_idem_"));
        for table in tables {
            assert_eq!(row_count(&mut conn, table).await, 3);
        }
        assert!(list_staging_schemas(&mut conn, &plan.dataset).await.unwrap().is_empty());
        assert_eq!(search_path(&mut conn).await, "public");
    }
    assert_eq!(importer.imports.load(Ordering::SeqCst), 2);
    reset(&mut conn, &tables).await;
}

#[tokio::test]
#[serial]
async fn grants_survive_table_replacement() {
    let Some(mut conn) = test_conn().await else { return };
    let tables = ["cdl_perm_t"];
    reset(&mut conn, &tables).await;
    create_readonly_user(&mut conn, "cdl_test_reader").await;
    let plan = plan("cdl_perm", &tables, "");
    let importer = FakeImporter::new(&tables, 2);

    swap_dataset(&mut conn, &plan, &importer).await.unwrap();
    sqlx::query("GRANT SELECT ON public.cdl_perm_t TO cdl_test_reader")
        .execute(&mut conn)
        .await
        .unwrap();

    let report = swap_dataset(&mut conn, &plan, &importer).await.unwrap();
    assert!(report.grants_replayed);
    let allowed: bool =
        sqlx::query("SELECT has_table_privilege('cdl_test_reader', 'public.cdl_perm_t', 'SELECT') AS ok")
            .fetch_one(&mut conn)
            .await
            .unwrap()
            .get("ok");
    assert!(allowed);
    reset(&mut conn, &tables).await;
}

#[tokio::test]
#[serial]
async fn snapshot_of_missing_table_names_it() {
    let Some(mut conn) = test_conn().await else { return };
    reset(&mut conn, &["ghost"]).await;
    let ghost = vec![TableRef::new(SqlIdent::new("ghost").unwrap(), "spooky")];

    let err = grants::snapshot(&mut conn, &ghost, &SqlIdent::public())
        .await
        .unwrap_err();
    assert!(matches!(err, GrantError::MissingTable { .. }));
    assert_eq!(err.to_string(), "Table public.ghost does not exist!");
}

#[tokio::test]
#[serial]
async fn failed_import_leaves_live_tables_alone() {
    let Some(mut conn) = test_conn().await else { return };
    let tables = ["cdl_fail_t"];
    reset(&mut conn, &tables).await;
    let plan = plan("cdl_fail", &tables, "");

    swap_dataset(&mut conn, &plan, &FakeImporter::new(&tables, 3))
        .await
        .unwrap();

    let mut broken = FakeImporter::new(&tables, 50);
    broken.fail_after_import = true;
    let err = swap_dataset(&mut conn, &plan, &broken).await.unwrap_err();
    assert!(matches!(err, SwapError::Import(_)));

    assert_eq!(row_count(&mut conn, "cdl_fail_t").await, 3);
    assert!(list_staging_schemas(&mut conn, &plan.dataset).await.unwrap().is_empty());
    assert_eq!(search_path(&mut conn).await, "public");
    reset(&mut conn, &tables).await;
}

#[tokio::test]
#[serial]
async fn import_missing_a_declared_table_is_rolled_back() {
    let Some(mut conn) = test_conn().await else { return };
    let tables = ["cdl_decl_a", "cdl_decl_b"];
    reset(&mut conn, &tables).await;
    let plan = plan("cdl_decl", &tables, "");

    let err = swap_dataset(&mut conn, &plan, &FakeImporter::new(&tables[..1], 1))
        .await
        .unwrap_err();
    match err {
        SwapError::Grant(GrantError::MissingTable { schema, table }) => {
            assert!(schema.starts_with("temp_cdl_decl_"));
            assert_eq!(table, "cdl_decl_b");
        }
        other => panic!("unexpected error: {other}"),
    }
    let exists: bool = sqlx::query("SELECT to_regclass('public.cdl_decl_a') IS NOT NULL AS present")
        .fetch_one(&mut conn)
        .await
        .unwrap()
        .get("present");
    assert!(!exists);
    assert!(list_staging_schemas(&mut conn, &plan.dataset).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn functions_are_reinstalled_in_the_live_namespace() {
    let Some(mut conn) = test_conn().await else { return };
    let tables = ["cdl_fn_t"];
    reset(&mut conn, &tables).await;
    sqlx::query("DROP FUNCTION IF EXISTS public.cdl_fn_count()")
        .execute(&mut conn)
        .await
        .unwrap();

    let function_sql = "CREATE OR REPLACE FUNCTION cdl_fn_count() RETURNS bigint AS $$ \
                        SELECT count(*) FROM cdl_fn_t $$ LANGUAGE SQL;";
    let plan = plan("cdl_fn", &tables, function_sql);
    let mut importer = FakeImporter::new(&tables, 4);
    importer.extra_sql = Some(function_sql);

    let report = swap_dataset(&mut conn, &plan, &importer).await.unwrap();
    assert!(report.functions_reinstalled);

    let count: i64 = sqlx::query("SELECT public.cdl_fn_count() AS n")
        .fetch_one(&mut conn)
        .await
        .unwrap()
        .get("n");
    assert_eq!(count, 4);
    assert_eq!(search_path(&mut conn).await, "public");

    sqlx::query("DROP FUNCTION IF EXISTS public.cdl_fn_count()")
        .execute(&mut conn)
        .await
        .unwrap();
    reset(&mut conn, &tables).await;
}

#[tokio::test]
#[serial]
async fn readers_see_the_old_set_or_the_new_set_never_a_mix() {
    let Some(mut conn) = test_conn().await else { return };
    let Some(mut reader) = test_conn().await else { return };
    let tables = ["cdl_vis_a", "cdl_vis_b"];
    reset(&mut conn, &tables).await;
    let plan = plan("cdl_vis", &tables, "");
    swap_dataset(&mut conn, &plan, &FakeImporter::new(&tables, 5))
        .await
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let watching = {
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while !stop.load(Ordering::SeqCst) {
                let row = sqlx::query(
                    "SELECT (SELECT COUNT(*) FROM public.cdl_vis_a) AS a, \
                            (SELECT COUNT(*) FROM public.cdl_vis_b) AS b",
                )
                .fetch_one(&mut reader)
                .await
                .unwrap();
                seen.push((row.get::<i64, _>("a"), row.get::<i64, _>("b")));
            }
            seen
        })
    };

    let mut importer = FakeImporter::new(&tables, 7);
    importer.extra_sql = Some("SELECT pg_sleep(0.2);");
    swap_dataset(&mut conn, &plan, &importer).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    stop.store(true, Ordering::SeqCst);

    let seen = watching.await.unwrap();
    assert!(!seen.is_empty());
    for pair in &seen {
        assert!(*pair == (5, 5) || *pair == (7, 7), "reader saw {pair:?}");
    }
    assert_eq!(seen.last(), Some(&(7, 7)));
    reset(&mut conn, &tables).await;
}
