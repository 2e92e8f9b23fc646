//! Operator helpers behind `cdl db ...`.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use cdl_core::{friendly_staging_creation_time, staging_schema_prefix, SqlIdent, TableRef};
use cdl_datasets::DatasetRegistry;
use cdl_storage::{KvError, KvStore, LastmodInfo};
use sqlx::{PgConnection, Row};
use tracing::info;

use crate::grants::table_exists;
use crate::lock::BuildLock;
use crate::CommandError;

/// Expands `all` and rejects unknown names.
pub fn validate_dataset_names(
    registry: &DatasetRegistry,
    names: &[String],
) -> Result<Vec<String>, CommandError> {
    let mut validated = Vec::new();
    for name in names {
        if name == "all" {
            validated.extend(registry.names().into_iter().map(str::to_string));
        } else if let Some(def) = registry.get(name) {
            validated.push(def.name.to_string());
        } else {
            return Err(CommandError::InvalidDataset(name.clone()));
        }
    }
    Ok(validated)
}

/// Staging namespaces for `dataset` still present in the database, oldest first.
pub async fn list_staging_schemas(
    conn: &mut PgConnection,
    dataset: &SqlIdent,
) -> Result<Vec<String>, sqlx::Error> {
    let prefix = staging_schema_prefix(dataset);
    // `_` is a LIKE wildcard, so compare the prefix literally.
    let rows = sqlx::query(
        "SELECT schema_name::text AS name FROM information_schema.schemata \
         WHERE left(schema_name::text, length($1)) = $1 ORDER BY schema_name",
    )
    .bind(&prefix)
    .fetch_all(&mut *conn)
    .await?;

    let mut schemas = Vec::new();
    for row in rows {
        let name: String = row.try_get("name")?;
        // `temp_hpd_` must not pick up `temp_hpd_registrations_...`.
        let suffix = &name[prefix.len()..];
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            schemas.push(name);
        }
    }
    Ok(schemas)
}

/// Drops leftover staging namespaces. Takes the build lock first when
/// `use_lock` is set so a running build keeps its own namespace.
pub async fn gc_staging_schemas(
    conn: &mut PgConnection,
    dataset: &SqlIdent,
    use_lock: bool,
) -> Result<Vec<String>> {
    let lock = if use_lock {
        match BuildLock::try_acquire(conn, dataset).await? {
            Some(lock) => Some(lock),
            None => return Err(CommandError::BuildInProgress(dataset.to_string()).into()),
        }
    } else {
        None
    };

    let schemas = list_staging_schemas(conn, dataset).await?;
    for schema in &schemas {
        info!(%dataset, schema = %schema, "dropping stale staging namespace");
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
            .execute(&mut *conn)
            .await
            .with_context(|| format!("dropping {schema}"))?;
    }

    if let Some(lock) = lock {
        lock.release(conn).await?;
    }
    Ok(schemas)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCount {
    pub table: String,
    /// `None` when the table is not present in that namespace.
    pub rows: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCountSection {
    pub heading: String,
    pub counts: Vec<RowCount>,
}

pub async fn row_counts(
    conn: &mut PgConnection,
    tables: &[TableRef],
    schema: &str,
) -> Result<Vec<RowCount>> {
    let schema = SqlIdent::new(schema)?;
    let mut counts = Vec::with_capacity(tables.len());
    for table in tables {
        let rows = if table_exists(conn, &schema, &table.name).await? {
            let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", table.qualified(&schema)))
                .fetch_one(&mut *conn)
                .await?;
            Some(row.try_get::<i64, _>("n")?)
        } else {
            None
        };
        counts.push(RowCount {
            table: table.name.to_string(),
            rows,
        });
    }
    Ok(counts)
}

/// Counts for every stale staging namespace of the dataset, then for its live namespace.
pub async fn dataset_row_count_report(
    conn: &mut PgConnection,
    dataset: &SqlIdent,
    tables: &[TableRef],
    target_schema: &SqlIdent,
) -> Result<Vec<RowCountSection>> {
    let mut sections = Vec::new();
    for schema in list_staging_schemas(conn, dataset).await? {
        let created = friendly_staging_creation_time(&schema).unwrap_or_else(|| "an unknown date".into());
        sections.push(RowCountSection {
            heading: format!("For {dataset}'s temporary schema created on {created}:"),
            counts: row_counts(conn, tables, &schema).await?,
        });
    }
    sections.push(RowCountSection {
        heading: format!("For {dataset}'s {target_schema} schema:"),
        counts: row_counts(conn, tables, target_schema.as_str()).await?,
    });
    Ok(sections)
}

pub fn format_thousands(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub fn render_row_counts(sections: &[RowCountSection]) -> String {
    let mut out = String::new();
    for section in sections {
        let _ = writeln!(out, "{}\n", section.heading);
        for count in &section.counts {
            let _ = match count.rows {
                Some(rows) => writeln!(out, "  {} has {} rows.", count.table, format_thousands(rows)),
                None => writeln!(out, "  {} does not exist.", count.table),
            };
        }
        out.push('\n');
    }
    out
}

pub async fn describe_lastmods(
    kv: &dyn KvStore,
    dataset: &str,
    urls: &[String],
) -> Result<Vec<String>, KvError> {
    let mut lines = vec![format!("For the dataset {dataset}:")];
    if urls.is_empty() {
        lines.push("  This dataset has no source URLs.".to_string());
    }
    for url in urls {
        let info = LastmodInfo::read_from(url, kv).await?;
        lines.push(match info.last_modified {
            Some(when) => format!("  The URL {url} was last modified on {when}."),
            None => format!("  The URL {url} has no metadata about its last modification date."),
        });
    }
    Ok(lines)
}

/// Forgets stored validators so the next build downloads unconditionally.
/// Returns how many URLs had anything stored.
pub async fn reset_lastmods(kv: &dyn KvStore, urls: &[String]) -> Result<usize, KvError> {
    let mut cleared = 0;
    for url in urls {
        let stored = LastmodInfo::read_from(url, kv).await?;
        if stored.etag.is_some() || stored.last_modified.is_some() {
            cleared += 1;
        }
        LastmodInfo::new(url.as_str()).write_to(kv).await?;
    }
    Ok(cleared)
}
