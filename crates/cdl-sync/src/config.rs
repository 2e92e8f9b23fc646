use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use cdl_core::SqlIdent;
use cdl_datasets::DatabaseParams;
use reqwest::Url;

/// Process-wide settings, built once at startup and passed by reference.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub database_url: String,
    pub use_test_data: bool,
    pub data_dir: PathBuf,
    pub test_data_dir: PathBuf,
    pub datasets_file: PathBuf,
    pub sql_dir: PathBuf,
    pub metadata_schema: SqlIdent,
    pub import_command: String,
    pub slack_webhook_url: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub user_agent: String,
    pub build_lock: bool,
    pub scheduler_enabled: bool,
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes" | "yup")
}

impl LoaderConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;
        let metadata_schema = SqlIdent::new(var("CDL_METADATA_SCHEMA", "dataset_loader"))
            .context("parsing CDL_METADATA_SCHEMA")?;

        Ok(Self {
            database_url,
            // Any non-empty value turns sample mode on.
            use_test_data: lookup("USE_TEST_DATA").is_some_and(|v| !v.is_empty()),
            data_dir: PathBuf::from(var("CDL_DATA_DIR", "/var/nycdb")),
            test_data_dir: PathBuf::from(var("CDL_TEST_DATA_DIR", "./test-data")),
            datasets_file: PathBuf::from(var("CDL_DATASETS_FILE", "./datasets.yaml")),
            sql_dir: PathBuf::from(var("CDL_SQL_DIR", "./sql")),
            metadata_schema,
            import_command: var("CDL_IMPORT_COMMAND", "nycdb"),
            slack_webhook_url: lookup("SLACK_WEBHOOK_URL").filter(|v| !v.is_empty()),
            http_timeout_secs: lookup("CDL_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            user_agent: var("CDL_USER_AGENT", "cdl-loader/0.1"),
            build_lock: lookup("CDL_BUILD_LOCK").map(|v| parse_flag(&v)).unwrap_or(true),
            scheduler_enabled: lookup("CDL_SCHEDULER_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
        })
    }

    pub fn import_root(&self) -> &Path {
        if self.use_test_data {
            &self.test_data_dir
        } else {
            &self.data_dir
        }
    }

    pub fn http_timeout(&self) -> Option<Duration> {
        self.http_timeout_secs.map(Duration::from_secs)
    }

    /// Connection parts for tools that do not accept a URL.
    pub fn database_params(&self) -> Result<DatabaseParams> {
        let url = Url::parse(&self.database_url).context("parsing DATABASE_URL")?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("DATABASE_URL has no host"))?
            .to_string();
        let user = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        Ok(DatabaseParams {
            host,
            port: url.port().unwrap_or(5432),
            user,
            password: url.password().map(str::to_string),
            database: url.path().trim_start_matches('/').to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config =
            LoaderConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://nycdb:pw@db:5433/nycdb")]))
                .unwrap();
        assert!(!config.use_test_data);
        assert!(config.build_lock);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.metadata_schema.as_str(), "dataset_loader");
        assert_eq!(config.import_root(), Path::new("/var/nycdb"));
        assert_eq!(config.slack_webhook_url, None);
        assert_eq!(config.http_timeout(), None);

        let params = config.database_params().unwrap();
        assert_eq!(
            params,
            DatabaseParams {
                host: "db".into(),
                port: 5433,
                user: Some("nycdb".into()),
                password: Some("pw".into()),
                database: "nycdb".into(),
            }
        );
    }

    #[test]
    fn sample_mode_switches_import_root() {
        let config = LoaderConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/nycdb"),
            ("USE_TEST_DATA", "yup"),
            ("CDL_TEST_DATA_DIR", "/data/sample"),
            ("SLACK_WEBHOOK_URL", ""),
            ("CDL_BUILD_LOCK", "false"),
            ("CDL_HTTP_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();
        assert!(config.use_test_data);
        assert!(!config.build_lock);
        assert_eq!(config.import_root(), Path::new("/data/sample"));
        assert_eq!(config.slack_webhook_url, None);
        assert_eq!(config.http_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.database_params().unwrap().user, None);
    }

    #[test]
    fn database_url_is_required() {
        assert!(LoaderConfig::from_lookup(lookup(&[])).is_err());
        assert!(LoaderConfig::from_lookup(lookup(&[("DATABASE_URL", "")])).is_err());
    }
}
