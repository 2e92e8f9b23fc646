//! Snapshot and replay of table-level GRANTs across a table replacement.

use cdl_core::{SqlIdent, TableRef};
use sqlx::{PgConnection, Row};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum GrantError {
    #[error("Table {schema}.{table} does not exist!")]
    MissingTable { schema: String, table: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Replayable `GRANT` statements captured before tables are replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantSnapshot(String);

impl GrantSnapshot {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_sql(&self) -> &str {
        &self.0
    }
}

pub async fn table_exists(
    conn: &mut PgConnection,
    schema: &SqlIdent,
    table: &SqlIdent,
) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
         WHERE table_schema::text = $1 AND table_name::text = $2) AS present",
    )
    .bind(schema.as_str())
    .bind(table.as_str())
    .fetch_one(&mut *conn)
    .await?;
    row.try_get("present")
}

pub async fn ensure_table_exists(
    conn: &mut PgConnection,
    schema: &SqlIdent,
    table: &SqlIdent,
) -> Result<(), GrantError> {
    if !table_exists(conn, schema, table).await? {
        return Err(GrantError::MissingTable {
            schema: schema.to_string(),
            table: table.to_string(),
        });
    }
    Ok(())
}

// One statement per (table, grantee, grantable); the owner's implicit grants are skipped.
const GRANT_SQL_QUERY: &str = r#"
SELECT format(
    'GRANT %s ON TABLE %I.%I TO %s%s;',
    string_agg(tg.privilege_type, ', ' ORDER BY tg.privilege_type),
    tg.table_schema,
    tg.table_name,
    CASE WHEN tg.grantee = 'PUBLIC' THEN 'PUBLIC' ELSE quote_ident(tg.grantee) END,
    CASE WHEN tg.is_grantable = 'YES' THEN ' WITH GRANT OPTION' ELSE '' END
) AS grant_sql
FROM information_schema.role_table_grants tg
JOIN pg_tables t ON t.schemaname = tg.table_schema AND t.tablename = tg.table_name
WHERE tg.table_schema::text = $1
  AND tg.table_name::text = $2
  AND t.tableowner <> tg.grantee
GROUP BY tg.table_schema, tg.table_name, tg.grantee, tg.is_grantable
ORDER BY tg.grantee, tg.is_grantable
"#;

/// GRANT statements reproducing every non-owner privilege on `schema.table`.
pub async fn grant_sql(
    conn: &mut PgConnection,
    table: &SqlIdent,
    schema: &SqlIdent,
) -> Result<String, GrantError> {
    ensure_table_exists(conn, schema, table).await?;
    let rows = sqlx::query(GRANT_SQL_QUERY)
        .bind(schema.as_str())
        .bind(table.as_str())
        .fetch_all(&mut *conn)
        .await?;
    let mut sql = String::new();
    for row in rows {
        sql.push_str(&row.try_get::<String, _>("grant_sql")?);
    }
    Ok(sql)
}

/// Empty `schema.table ()` for every table that does not exist yet, so roles with
/// default privileges on the schema show up in the snapshot.
pub async fn create_placeholder_tables(
    conn: &mut PgConnection,
    tables: &[TableRef],
    schema: &SqlIdent,
) -> Result<(), sqlx::Error> {
    for table in tables {
        sqlx::query(&format!("CREATE TABLE IF NOT EXISTS {} ()", table.qualified(schema)))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub async fn snapshot(
    conn: &mut PgConnection,
    tables: &[TableRef],
    schema: &SqlIdent,
) -> Result<GrantSnapshot, GrantError> {
    let mut sql = String::new();
    for table in tables {
        sql.push_str(&grant_sql(conn, &table.name, schema).await?);
    }
    debug!(%schema, tables = tables.len(), grants = %sql, "captured grant snapshot");
    Ok(GrantSnapshot(sql))
}

/// Runs the captured statements verbatim; an empty snapshot is not sent at all.
pub async fn replay(conn: &mut PgConnection, snapshot: &GrantSnapshot) -> Result<(), sqlx::Error> {
    if snapshot.is_empty() {
        return Ok(());
    }
    info!("re-applying table grants");
    sqlx::raw_sql(snapshot.as_sql()).execute(&mut *conn).await?;
    Ok(())
}
