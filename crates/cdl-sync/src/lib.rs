//! Dataset build orchestration: change detection, staging, promotion and bookkeeping.

pub mod config;
pub mod functions;
pub mod grants;
pub mod lock;
pub mod notify;
pub mod schedule;
pub mod swap;
pub mod tooling;

use std::sync::Arc;

use anyhow::{Context, Result};
use cdl_core::SqlIdent;
use cdl_datasets::{
    DatasetDefinition, DatasetImporter, DatasetKind, DatasetRegistry, ImportContext,
    NycdbCommandImporter, SqlScriptImporter,
};
use cdl_storage::{
    BackoffPolicy, ConditionalFetcher, DatasetTracker, HttpClientConfig, HttpFetcher, KvStore,
    PgKvStore, UrlChangeDetector,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::LoaderConfig;
pub use notify::{Notifier, RecordingNotifier, SlackNotifier};
pub use swap::{swap_dataset, SwapError, SwapPlan, SwapReport, SwapState};

pub const CRATE_NAME: &str = "cdl-sync";

/// Table holding HTTP cache validators inside the metadata namespace.
pub const LASTMOD_TABLE: &str = "dbhash";
/// Table holding last successful build times inside the metadata namespace.
pub const TRACKER_TABLE: &str = "dataset_tracker";

/// Problems caused by how the loader was invoked; the CLI exits with status 1.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("'{0}' is not a valid dataset.")]
    InvalidDataset(String),
    #[error("Please specify a dataset to load (or set the DATASET environment variable).")]
    MissingDataset,
    #[error("The dataset `{0}` is already being built by another process.")]
    BuildInProgress(String),
}

/// How a named dataset gets built, decided once from its definition.
#[derive(Debug, Clone, Copy)]
pub enum BuildableDataset<'a> {
    /// Downloaded and bulk-loaded by the external import program.
    StandardImport(&'a DatasetDefinition),
    /// Assembled from already-loaded datasets by bundled SQL scripts.
    CompositeView(&'a DatasetDefinition),
}

impl<'a> BuildableDataset<'a> {
    pub fn resolve(registry: &'a DatasetRegistry, name: &str) -> Result<Self, CommandError> {
        let def = registry
            .get(name)
            .ok_or_else(|| CommandError::InvalidDataset(name.to_string()))?;
        Ok(match def.kind {
            DatasetKind::Standard => Self::StandardImport(def),
            DatasetKind::Composite => Self::CompositeView(def),
        })
    }

    pub fn definition(&self) -> &'a DatasetDefinition {
        match self {
            Self::StandardImport(def) | Self::CompositeView(def) => def,
        }
    }

    pub fn default_importer(&self, config: &LoaderConfig) -> Arc<dyn DatasetImporter> {
        match self {
            Self::StandardImport(_) => Arc::new(NycdbCommandImporter::new(&config.import_command)),
            Self::CompositeView(def) => {
                Arc::new(SqlScriptImporter::new(&config.sql_dir, def.sql.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Run change detection even in sample-data mode.
    pub force_check_urls: bool,
}

#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub run_id: Uuid,
    pub dataset: String,
    pub report: SwapReport,
}

#[derive(Debug, Clone)]
pub enum LoadOutcome {
    /// No source URL changed since the last successful build.
    Unchanged,
    Built(BuildSummary),
}

/// Opens the metadata tables on `pool`, creating the namespace and tables if needed.
pub async fn open_metadata_stores(
    pool: &PgPool,
    config: &LoaderConfig,
) -> Result<(Arc<dyn KvStore>, Arc<dyn KvStore>)> {
    let lastmods = PgKvStore::open(pool.clone(), &config.metadata_schema, &SqlIdent::new(LASTMOD_TABLE)?)
        .await
        .context("opening lastmod store")?;
    let tracker = PgKvStore::open(pool.clone(), &config.metadata_schema, &SqlIdent::new(TRACKER_TABLE)?)
        .await
        .context("opening dataset tracker store")?;
    Ok((Arc::new(lastmods), Arc::new(tracker)))
}

pub async fn connect_pool(config: &LoaderConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")
}

/// Builds datasets from one process-wide configuration.
pub struct DatasetLoader {
    config: LoaderConfig,
    registry: DatasetRegistry,
    notifier: Arc<dyn Notifier>,
    importer: Option<Arc<dyn DatasetImporter>>,
    fetcher: Option<Arc<dyn ConditionalFetcher>>,
}

impl DatasetLoader {
    pub fn new(config: LoaderConfig, registry: DatasetRegistry, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            registry,
            notifier,
            importer: None,
            fetcher: None,
        }
    }

    /// Replaces the importer chosen from the dataset kind.
    pub fn with_importer(mut self, importer: Arc<dyn DatasetImporter>) -> Self {
        self.importer = Some(importer);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ConditionalFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    fn fetcher(&self) -> Result<Arc<dyn ConditionalFetcher>> {
        if let Some(fetcher) = &self.fetcher {
            return Ok(fetcher.clone());
        }
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: self.config.http_timeout(),
            user_agent: Some(self.config.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        })?;
        Ok(Arc::new(fetcher))
    }

    pub fn plan_for(&self, def: &DatasetDefinition) -> Result<SwapPlan> {
        Ok(SwapPlan {
            dataset: def.name.clone(),
            tables: def.target_tables(&self.config.sql_dir)?,
            target_schema: def.target_schema.clone(),
            aux_search_path: def.search_path.clone(),
            function_sql: def.function_sql(&self.config.sql_dir)?,
            root_dir: self.config.import_root().to_path_buf(),
            use_test_data: self.config.use_test_data,
            database: self.config.database_params()?,
        })
    }

    /// Builds `name` end to end. Any failure is announced before it is returned.
    pub async fn load(&self, name: &str, opts: LoadOptions) -> Result<LoadOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("dataset_build", %run_id, dataset = name);
        let result = self.load_inner(name, run_id, opts).instrument(span).await;
        if result.is_err() {
            self.notifier
                .send(&format!("Alas, an error occurred when loading the dataset `{name}`."))
                .await;
        }
        result
    }

    async fn load_inner(&self, name: &str, run_id: Uuid, opts: LoadOptions) -> Result<LoadOutcome> {
        if name.is_empty() {
            return Err(CommandError::MissingDataset.into());
        }
        let buildable = BuildableDataset::resolve(&self.registry, name)?;
        let def = buildable.definition();
        let plan = self.plan_for(def)?;
        let importer = match &self.importer {
            Some(importer) => importer.clone(),
            None => buildable.default_importer(&self.config),
        };

        let pool = connect_pool(&self.config).await?;
        let (lastmods, tracker_kv) = open_metadata_stores(&pool, &self.config).await?;
        let mut conn = PgConnection::connect(&self.config.database_url)
            .await
            .context("opening build connection")?;

        let lock = if self.config.build_lock {
            match lock::BuildLock::try_acquire(&mut conn, &def.name).await? {
                Some(lock) => Some(lock),
                None => return Err(CommandError::BuildInProgress(name.to_string()).into()),
            }
        } else {
            None
        };

        let outcome = self
            .build_locked(&mut conn, def, &plan, importer.as_ref(), lastmods, tracker_kv, run_id, opts)
            .await;

        if let Some(lock) = lock {
            if let Err(err) = lock.release(&mut conn).await {
                warn!(dataset = %def.name, error = %err, "releasing build lock failed; closing the connection frees it");
            }
        }
        conn.close().await.ok();
        pool.close().await;
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_locked(
        &self,
        conn: &mut PgConnection,
        def: &DatasetDefinition,
        plan: &SwapPlan,
        importer: &dyn DatasetImporter,
        lastmods: Arc<dyn KvStore>,
        tracker_kv: Arc<dyn KvStore>,
        run_id: Uuid,
        opts: LoadOptions,
    ) -> Result<LoadOutcome> {
        let name = def.name.as_str();
        let check_urls = opts.force_check_urls || !self.config.use_test_data;

        let mut detector = None;
        if check_urls {
            let mut tracker = UrlChangeDetector::new(
                def.source_urls(self.config.use_test_data),
                lastmods,
                self.fetcher()?,
            );
            if !tracker.has_any_url_changed().await? {
                self.notifier
                    .send(&format!("The dataset `{name}` has not changed since we last retrieved it."))
                    .await;
                return Ok(LoadOutcome::Unchanged);
            }
            detector = Some(tracker);
        }

        self.notifier
            .send(&format!("Downloading the dataset `{name}`..."))
            .await;
        let download_ctx = ImportContext {
            dataset: plan.dataset.clone(),
            search_path: vec![SqlIdent::public()],
            root_dir: plan.root_dir.clone(),
            use_test_data: plan.use_test_data,
            database: plan.database.clone(),
        };
        importer
            .download(&download_ctx)
            .await
            .with_context(|| format!("downloading {name}"))?;

        self.notifier
            .send(&format!(
                "Downloaded the dataset `{name}`. Loading it into the database..."
            ))
            .await;
        let report = swap_dataset(conn, plan, importer)
            .await
            .with_context(|| format!("building {name}"))?;

        DatasetTracker::new(name, tracker_kv)
            .record_build_completed()
            .await
            .context("recording build completion")?;
        if let Some(detector) = detector {
            detector.commit().await.context("saving cache validators")?;
        }

        self.notifier
            .send(&format!("Finished loading the dataset `{name}` into the database."))
            .await;
        info!(tables = report.tables.len(), "dataset build complete");
        Ok(LoadOutcome::Built(BuildSummary {
            run_id,
            dataset: name.to_string(),
            report,
        }))
    }
}
