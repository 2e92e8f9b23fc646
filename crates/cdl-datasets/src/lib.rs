//! Dataset definitions, SQL source inspection, and import collaborators.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use cdl_core::{Frequency, SqlIdent, TableRef};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{Executor, PgConnection};
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

pub const CRATE_NAME: &str = "cdl-datasets";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Downloaded and bulk-loaded by the external import program.
    #[default]
    Standard,
    /// Built from other datasets by running bundled SQL scripts in order.
    Composite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub url: String,
    pub dest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaTable {
    pub table_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(item) => vec![item],
        OneOrMany::Many(items) => items,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetDefinition {
    pub name: SqlIdent,
    #[serde(default)]
    pub kind: DatasetKind,
    #[serde(default)]
    pub files: Vec<SourceFile>,
    /// Replaces `files` when running against reduced sample data.
    #[serde(default)]
    pub test_files: Option<Vec<SourceFile>>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub schema: Vec<SchemaTable>,
    #[serde(default)]
    pub sql: Vec<String>,
    #[serde(default = "SqlIdent::public")]
    pub target_schema: SqlIdent,
    /// Extra namespaces searched after `public` while importing (shared helpers).
    #[serde(default)]
    pub search_path: Vec<SqlIdent>,
    #[serde(default)]
    pub schedule: Frequency,
}

impl DatasetDefinition {
    pub fn files(&self, use_test_data: bool) -> &[SourceFile] {
        match (&self.test_files, use_test_data) {
            (Some(test_files), true) => test_files,
            _ => &self.files,
        }
    }

    pub fn source_urls(&self, use_test_data: bool) -> Vec<String> {
        self.files(use_test_data)
            .iter()
            .map(|f| f.url.clone())
            .collect()
    }

    /// Union of structured schema tables and `CREATE TABLE` targets in the SQL files.
    pub fn target_tables(&self, sql_dir: &Path) -> Result<Vec<TableRef>> {
        let mut names: Vec<String> = self.schema.iter().map(|t| t.table_name.clone()).collect();
        names.extend(parse_created_tables_in_dir(sql_dir, &self.sql)?);

        let mut seen = HashSet::new();
        let mut tables = Vec::new();
        for name in names {
            let ident = SqlIdent::new(&name)
                .with_context(|| format!("table name '{name}' in dataset {}", self.name))?;
            if seen.insert(ident.clone()) {
                tables.push(TableRef::new(ident, self.name.as_str()));
            }
        }
        Ok(tables)
    }

    pub fn function_sql(&self, sql_dir: &Path) -> Result<String> {
        collect_function_sql(sql_dir, &self.sql)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetDefinition>,
}

impl DatasetRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing dataset definitions")?;
        let mut seen = HashSet::new();
        for ds in &registry.datasets {
            if !seen.insert(ds.name.clone()) {
                bail!("dataset '{}' is defined more than once", ds.name);
            }
        }
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Names fold to lower case like the identifiers they are stored as.
    pub fn get(&self, name: &str) -> Option<&DatasetDefinition> {
        self.datasets
            .iter()
            .find(|ds| ds.name.as_str().eq_ignore_ascii_case(name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.datasets.iter().map(|ds| ds.name.as_str()).collect()
    }
}

fn create_table_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*create\s+table\s+(?:if\s+not\s+exists\s+)?((?:[a-z_][a-z0-9_$]*\.)?[a-z_][a-z0-9_$]*)",
        )
        .expect("static regex")
    })
}

fn strip_sql_comments(sql: &str) -> String {
    static BLOCK: OnceLock<Regex> = OnceLock::new();
    static LINE: OnceLock<Regex> = OnceLock::new();
    let block = BLOCK.get_or_init(|| Regex::new(r"(?s)/\*.*?\*/").expect("static regex"));
    let line = LINE.get_or_init(|| Regex::new(r"--[^\n]*").expect("static regex"));
    line.replace_all(&block.replace_all(sql, " "), "").into_owned()
}

/// Names of tables created by `CREATE TABLE` statements, in source order and as written.
pub fn parse_created_tables(sql: &str) -> Vec<String> {
    let re = create_table_regex();
    strip_sql_comments(sql)
        .split(';')
        .filter_map(|stmt| re.captures(stmt))
        .filter_map(|caps| caps.get(1))
        .map(|m| {
            let name = m.as_str();
            name.rsplit('.').next().unwrap_or(name).to_string()
        })
        .collect()
}

pub fn parse_created_tables_in_dir(sql_dir: &Path, files: &[String]) -> Result<Vec<String>> {
    let mut tables = Vec::new();
    for file in files {
        let path = sql_dir.join(file);
        let sql = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        tables.extend(parse_created_tables(&sql));
    }
    Ok(tables)
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// True if the SQL defines functions via `CREATE OR REPLACE FUNCTION`.
///
/// Such files are expected to be idempotent and free of `CREATE TABLE`.
pub fn does_sql_create_functions(sql: &str) -> bool {
    collapse_whitespace(sql)
        .to_ascii_uppercase()
        .contains("CREATE OR REPLACE FUNCTION")
}

/// Concatenation of only the function-defining files among `files`.
pub fn collect_function_sql(sql_dir: &Path, files: &[String]) -> Result<String> {
    let mut sqls = Vec::new();
    for file in files {
        let path = sql_dir.join(file);
        let sql = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        if does_sql_create_functions(&sql) {
            sqls.push(sql);
        }
    }
    Ok(sqls.join("\n"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseParams {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
}

/// Everything an importer needs to load one dataset into a staging namespace.
#[derive(Debug, Clone)]
pub struct ImportContext {
    pub dataset: SqlIdent,
    /// Staging first, then `public`, then any auxiliary namespaces.
    pub search_path: Vec<SqlIdent>,
    pub root_dir: PathBuf,
    pub use_test_data: bool,
    pub database: DatabaseParams,
}

impl ImportContext {
    pub fn search_path_sql(&self) -> String {
        self.search_path
            .iter()
            .map(SqlIdent::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{program} exited with {status}")]
    Command { program: String, status: ExitStatus },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Downloads a dataset's raw files and bulk-loads them into the first namespace
/// on the active search path.
///
/// Re-importing into an already-populated namespace must be safe.
#[async_trait]
pub trait DatasetImporter: Send + Sync {
    async fn download(&self, ctx: &ImportContext) -> Result<(), ImportError>;

    async fn import_into_db(
        &self,
        ctx: &ImportContext,
        conn: &mut PgConnection,
    ) -> Result<(), ImportError>;
}

/// Drives the `nycdb` command-line tool.
///
/// The import runs on its own connection, so the staging search path is handed
/// over through `PGOPTIONS`.
#[derive(Debug, Clone)]
pub struct NycdbCommandImporter {
    program: String,
}

impl NycdbCommandImporter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn command_args(&self, action: &str, ctx: &ImportContext) -> Vec<String> {
        let db = &ctx.database;
        let mut args = vec![
            action.to_string(),
            ctx.dataset.to_string(),
            "-H".to_string(),
            db.host.clone(),
            "--port".to_string(),
            db.port.to_string(),
            "-D".to_string(),
            db.database.clone(),
        ];
        if let Some(user) = &db.user {
            args.extend(["-U".to_string(), user.clone()]);
        }
        if let Some(password) = &db.password {
            args.extend(["-P".to_string(), password.clone()]);
        }
        args.extend(["--root-dir".to_string(), ctx.root_dir.display().to_string()]);
        args
    }

    pub fn pg_options(ctx: &ImportContext) -> String {
        let path = ctx
            .search_path
            .iter()
            .map(SqlIdent::as_str)
            .collect::<Vec<_>>()
            .join(",");
        format!("-c search_path={path}")
    }

    async fn run(&self, action: &str, ctx: &ImportContext) -> Result<(), ImportError> {
        let args = self.command_args(action, ctx);
        info!(program = %self.program, action, dataset = %ctx.dataset, root_dir = %ctx.root_dir.display(), "running import command");

        let status = Command::new(&self.program)
            .args(&args)
            .env("PGOPTIONS", Self::pg_options(ctx))
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        if !status.success() {
            return Err(ImportError::Command {
                program: format!("{} {action} {}", self.program, ctx.dataset),
                status,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DatasetImporter for NycdbCommandImporter {
    async fn download(&self, ctx: &ImportContext) -> Result<(), ImportError> {
        tokio::fs::create_dir_all(&ctx.root_dir).await?;
        self.run("--download", ctx).await
    }

    async fn import_into_db(
        &self,
        ctx: &ImportContext,
        _conn: &mut PgConnection,
    ) -> Result<(), ImportError> {
        self.run("--load", ctx).await
    }
}

/// Builds a composite dataset by executing bundled SQL scripts in order on the
/// orchestrator's connection.
#[derive(Debug, Clone)]
pub struct SqlScriptImporter {
    sql_dir: PathBuf,
    scripts: Vec<String>,
}

impl SqlScriptImporter {
    pub fn new(sql_dir: impl Into<PathBuf>, scripts: Vec<String>) -> Self {
        Self {
            sql_dir: sql_dir.into(),
            scripts,
        }
    }
}

#[async_trait]
impl DatasetImporter for SqlScriptImporter {
    async fn download(&self, ctx: &ImportContext) -> Result<(), ImportError> {
        info!(dataset = %ctx.dataset, "composite dataset has nothing to download");
        Ok(())
    }

    async fn import_into_db(
        &self,
        ctx: &ImportContext,
        conn: &mut PgConnection,
    ) -> Result<(), ImportError> {
        for script in &self.scripts {
            let path = self.sql_dir.join(script);
            info!(dataset = %ctx.dataset, script = %script, "running SQL script");
            let sql = tokio::fs::read_to_string(&path).await.map_err(|err| {
                ImportError::Message(format!("reading {}: {err}", path.display()))
            })?;
            (&mut *conn).execute(sqlx::raw_sql(&sql)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn no_tables_when_nothing_is_created() {
        assert!(parse_created_tables("ALTER TABLE hpd_registrations ADD COLUMN bbl char(10);").is_empty());
    }

    #[test]
    fn parses_create_table_as_select() {
        let sql = "\
    DROP TABLE IF EXISTS blarg;

    CREATE TABLE blarg
    as SELECT
    first(floof) as floof,
    FROM goopy
    GROUP BY bbl, jibjab;

    create index on blarg (floof);
    ";

        assert_eq!(parse_created_tables(sql), vec!["blarg"]);
        assert_eq!(parse_created_tables(&sql.to_lowercase()), vec!["blarg"]);
        assert_eq!(parse_created_tables(&sql.to_uppercase()), vec!["BLARG"]);
    }

    #[test]
    fn parses_unterminated_parenthesised_select() {
        let sql = "\
    CREATE TABLE  foo AS (
       SELECT BusinessHouseNumber,
       blah
       FROM thing
       WHERE boop IS NOT NULL;
    ";
        assert_eq!(parse_created_tables(sql), vec!["foo"]);
    }

    #[test]
    fn ignores_commented_out_and_qualified_names() {
        let sql = "-- CREATE TABLE nope (id int);\n/* CREATE TABLE also_nope (); */\nCREATE TABLE IF NOT EXISTS wow.wow_bldgs (bbl text);";
        assert_eq!(parse_created_tables(sql), vec!["wow_bldgs"]);
    }

    #[test]
    fn classifies_function_files() {
        assert!(does_sql_create_functions("CREATE OR REPLACE FUNCTION boop() RETURNS int AS $$ SELECT 1 $$ LANGUAGE sql;"));
        assert!(does_sql_create_functions("create or  replace  \nfunction boop()"));
        assert!(!does_sql_create_functions("CREATE TABLE blarg (id int);"));
        assert!(!does_sql_create_functions("create function boop()"));
    }

    #[test]
    fn collects_only_function_files() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("funcs.sql"), "CREATE OR REPLACE FUNCTION boop() RETURNS int AS $$ SELECT 1 $$ LANGUAGE sql;").unwrap();
        fs::write(dir.path().join("tables.sql"), "CREATE TABLE blarg (id int);").unwrap();

        let sql = collect_function_sql(dir.path(), &["tables.sql".into(), "funcs.sql".into()]).unwrap();
        assert!(sql.contains("boop"));
        assert!(!sql.contains("blarg"));

        assert_eq!(collect_function_sql(dir.path(), &["tables.sql".into()]).unwrap(), "");
    }

    const REGISTRY_YAML: &str = r#"
datasets:
  - name: hpd_registrations
    schedule: daily
    files:
      - url: https://example.com/registrations.zip
        dest: hpd_registrations.zip
    test_files:
      - url: https://example.com/registrations-sample.zip
        dest: hpd_registrations.zip
    schema:
      table_name: hpd_registrations
    sql:
      - hpd_registrations/grouped.sql
  - name: wow
    kind: composite
    target_schema: wow
    search_path: [oca]
    sql:
      - wow/bldgs.sql
"#;

    #[test]
    fn registry_loads_and_derives_target_tables() {
        let dir = tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("hpd_registrations")).unwrap();
        fs::write(
            dir.path().join("hpd_registrations/grouped.sql"),
            "CREATE TABLE hpd_registrations_grouped_by_bbl AS SELECT 1;\nCREATE TABLE HPD_REGISTRATIONS AS SELECT 2;",
        )
        .unwrap();

        let registry = DatasetRegistry::from_yaml_str(REGISTRY_YAML).unwrap();
        assert_eq!(registry.names(), vec!["hpd_registrations", "wow"]);

        let hpd = registry.get("hpd_registrations").unwrap();
        assert_eq!(hpd.kind, DatasetKind::Standard);
        assert_eq!(hpd.schedule, Frequency::Daily);
        assert_eq!(hpd.target_schema.as_str(), "public");
        assert_eq!(hpd.source_urls(false), vec!["https://example.com/registrations.zip"]);
        assert_eq!(hpd.source_urls(true), vec!["https://example.com/registrations-sample.zip"]);

        let tables: Vec<_> = hpd
            .target_tables(dir.path())
            .unwrap()
            .into_iter()
            .map(|t| t.name.to_string())
            .collect();
        assert_eq!(tables, vec!["hpd_registrations", "hpd_registrations_grouped_by_bbl"]);

        let wow = registry.get("wow").unwrap();
        assert_eq!(wow.kind, DatasetKind::Composite);
        assert_eq!(wow.target_schema.as_str(), "wow");
        assert_eq!(wow.schedule, Frequency::Yearly);
        assert!(wow.source_urls(false).is_empty());
        assert!(registry.get("blarg").is_none());
        assert_eq!(registry.get("HPD_Registrations").map(|ds| ds.name.as_str()), Some("hpd_registrations"));
    }

    #[test]
    fn registry_rejects_duplicates_and_bad_names() {
        let dup = "datasets:\n  - name: a\n  - name: a\n";
        assert!(DatasetRegistry::from_yaml_str(dup).is_err());

        let bad = "datasets:\n  - name: \"a; drop\"\n";
        assert!(DatasetRegistry::from_yaml_str(bad).is_err());
    }

    fn ctx() -> ImportContext {
        ImportContext {
            dataset: SqlIdent::new("hpd_registrations").unwrap(),
            search_path: vec![
                SqlIdent::new("temp_hpd_registrations_1").unwrap(),
                SqlIdent::public(),
            ],
            root_dir: PathBuf::from("/var/nycdb"),
            use_test_data: false,
            database: DatabaseParams {
                host: "db".into(),
                port: 5432,
                user: Some("nycdb".into()),
                password: None,
                database: "nycdb".into(),
            },
        }
    }

    #[test]
    fn nycdb_command_carries_connection_and_search_path() {
        let importer = NycdbCommandImporter::new("nycdb");
        let ctx = ctx();
        assert_eq!(
            importer.command_args("--load", &ctx),
            vec![
                "--load", "hpd_registrations", "-H", "db", "--port", "5432", "-D", "nycdb", "-U",
                "nycdb", "--root-dir", "/var/nycdb"
            ]
        );
        assert_eq!(
            NycdbCommandImporter::pg_options(&ctx),
            "-c search_path=temp_hpd_registrations_1,public"
        );
        assert_eq!(ctx.search_path_sql(), "temp_hpd_registrations_1, public");
    }

    #[tokio::test]
    async fn failing_import_command_is_reported() {
        let importer = NycdbCommandImporter::new("false");
        let dir = tempdir().expect("tempdir");
        let mut ctx = ctx();
        ctx.root_dir = dir.path().to_path_buf();
        let err = importer.download(&ctx).await.unwrap_err();
        assert!(matches!(err, ImportError::Command { .. }), "{err}");
    }
}
