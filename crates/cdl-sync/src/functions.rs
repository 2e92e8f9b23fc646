//! Re-installs dataset functions in the live namespace after promotion.
//!
//! Functions created during import live in the staging namespace and vanish
//! with it, so the function-defining SQL files are run again against the
//! target namespace. Those files are `CREATE OR REPLACE FUNCTION` only and
//! therefore safe to repeat.

use cdl_core::SqlIdent;
use sqlx::PgConnection;
use tracing::info;

/// Returns whether anything was executed.
pub async fn reinstall_functions(
    conn: &mut PgConnection,
    target_schema: &SqlIdent,
    function_sql: &str,
) -> Result<bool, sqlx::Error> {
    if function_sql.trim().is_empty() {
        return Ok(false);
    }
    info!(schema = %target_schema, "re-running CREATE FUNCTION statements");
    sqlx::query(&format!("SET search_path TO {target_schema}, public"))
        .execute(&mut *conn)
        .await?;
    sqlx::raw_sql(function_sql).execute(&mut *conn).await?;
    Ok(true)
}
