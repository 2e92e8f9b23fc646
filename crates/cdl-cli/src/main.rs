use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use cdl_core::SqlIdent;
use cdl_datasets::DatasetRegistry;
use cdl_sync::schedule::{self, EnvVar, K8sJobOptions};
use cdl_sync::{tooling, CommandError, DatasetLoader, LoadOptions, LoadOutcome, LoaderConfig, SlackNotifier};
use clap::{Parser, Subcommand};
use sqlx::{Connection, PgConnection};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "cdl")]
#[command(about = "Loads civic datasets into PostgreSQL with zero-downtime table swaps")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build one dataset if its upstream files changed.
    Load {
        #[arg(env = "DATASET", default_value = "")]
        dataset: String,
        /// Check upstream validators even with USE_TEST_DATA set.
        #[arg(long)]
        force_check_urls: bool,
    },
    /// List dataset names with their schedules.
    Datasets,
    /// Inspect or repair loader state in the database.
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
    /// Generate or run dataset schedules.
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommands {
    /// Row counts for live and leftover staging tables (`all` for every dataset).
    Rowcounts {
        #[arg(required = true)]
        datasets: Vec<String>,
    },
    Lastmod {
        #[command(subcommand)]
        command: LastmodCommands,
    },
    Staging {
        #[command(subcommand)]
        command: StagingCommands,
    },
}

#[derive(Debug, Subcommand)]
enum LastmodCommands {
    /// Show stored Last-Modified values per source URL.
    List {
        #[arg(required = true)]
        datasets: Vec<String>,
    },
    /// Forget stored validators so the next load downloads again.
    Reset {
        #[arg(required = true)]
        datasets: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum StagingCommands {
    List { dataset: String },
    /// Drop staging namespaces left behind by interrupted builds.
    Gc { dataset: String },
}

#[derive(Debug, Subcommand)]
enum ScheduleCommands {
    /// Write one Kubernetes CronJob manifest per dataset.
    K8s {
        #[arg(default_value = "k8s-jobs")]
        dir: PathBuf,
        #[arg(long, default_value = "cdl-loader:latest")]
        image: String,
    },
    /// Print one EventBridge rule line per dataset.
    Aws,
    /// Run the in-process scheduler until interrupted.
    Run,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("CDL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<CommandError>() {
            Some(user_error) => {
                eprintln!("{user_error}");
                ExitCode::from(1)
            }
            None => {
                eprintln!("Error: {err:?}");
                ExitCode::from(2)
            }
        },
    }
}

fn load_registry(config: &LoaderConfig) -> Result<DatasetRegistry> {
    DatasetRegistry::load(&config.datasets_file)
}

async fn connect(config: &LoaderConfig) -> Result<PgConnection> {
    PgConnection::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Load {
            dataset,
            force_check_urls,
        } => {
            let config = LoaderConfig::from_env()?;
            std::fs::create_dir_all(config.import_root())
                .with_context(|| format!("creating {}", config.import_root().display()))?;
            let registry = load_registry(&config)?;
            let notifier = Arc::new(
                SlackNotifier::new(config.slack_webhook_url.clone()).context("building slack client")?,
            );
            let loader = DatasetLoader::new(config, registry, notifier);
            match loader.load(&dataset, LoadOptions { force_check_urls }).await? {
                LoadOutcome::Unchanged => println!("{dataset} is up to date."),
                LoadOutcome::Built(summary) => println!(
                    "loaded {}: run_id={} tables={}",
                    summary.dataset,
                    summary.run_id,
                    summary.report.tables.len()
                ),
            }
        }
        Commands::Datasets => {
            let config = LoaderConfig::from_env()?;
            let registry = load_registry(&config)?;
            for ds in &registry.datasets {
                println!("{}\t{}", ds.name, ds.schedule);
            }
        }
        Commands::Db { command } => run_db(command).await?,
        Commands::Schedule { command } => run_schedule(command).await?,
    }
    Ok(())
}

async fn run_db(command: DbCommands) -> Result<()> {
    let config = LoaderConfig::from_env()?;
    let registry = load_registry(&config)?;

    match command {
        DbCommands::Rowcounts { datasets } => {
            let names = tooling::validate_dataset_names(&registry, &datasets)?;
            let mut conn = connect(&config).await?;
            for name in names {
                let Some(def) = registry.get(&name) else { continue };
                let tables = def.target_tables(&config.sql_dir)?;
                let sections =
                    tooling::dataset_row_count_report(&mut conn, &def.name, &tables, &def.target_schema)
                        .await?;
                print!("{}", tooling::render_row_counts(&sections));
            }
        }
        DbCommands::Lastmod { command } => {
            let pool = cdl_sync::connect_pool(&config).await?;
            let (lastmods, _) = cdl_sync::open_metadata_stores(&pool, &config).await?;
            match command {
                LastmodCommands::List { datasets } => {
                    for name in tooling::validate_dataset_names(&registry, &datasets)? {
                        let Some(def) = registry.get(&name) else { continue };
                        let urls = def.source_urls(config.use_test_data);
                        for line in tooling::describe_lastmods(lastmods.as_ref(), &name, &urls).await? {
                            println!("{line}");
                        }
                    }
                }
                LastmodCommands::Reset { datasets } => {
                    for name in tooling::validate_dataset_names(&registry, &datasets)? {
                        let Some(def) = registry.get(&name) else { continue };
                        let urls = def.source_urls(config.use_test_data);
                        let cleared = tooling::reset_lastmods(lastmods.as_ref(), &urls).await?;
                        println!("Cleared stored validators for {cleared} URL(s) of {name}.");
                    }
                }
            }
            pool.close().await;
        }
        DbCommands::Staging { command } => {
            let (dataset, gc) = match command {
                StagingCommands::List { dataset } => (dataset, false),
                StagingCommands::Gc { dataset } => (dataset, true),
            };
            tooling::validate_dataset_names(&registry, std::slice::from_ref(&dataset))?;
            let dataset = SqlIdent::new(&dataset)?;
            let mut conn = connect(&config).await?;
            if gc {
                let dropped = tooling::gc_staging_schemas(&mut conn, &dataset, config.build_lock).await?;
                println!("Dropped {} staging namespace(s).", dropped.len());
            } else {
                for schema in tooling::list_staging_schemas(&mut conn, &dataset).await? {
                    let created = cdl_core::friendly_staging_creation_time(&schema).unwrap_or_default();
                    println!("{schema}\t{created}");
                }
            }
        }
    }
    Ok(())
}

async fn run_schedule(command: ScheduleCommands) -> Result<()> {
    let config = LoaderConfig::from_env()?;
    let registry = load_registry(&config)?;

    match command {
        ScheduleCommands::K8s { dir, image } => {
            let env = ["DATABASE_URL", "USE_TEST_DATA"]
                .into_iter()
                .map(|name| EnvVar {
                    name: name.to_string(),
                    value: std::env::var(name).unwrap_or_default(),
                })
                .collect();
            let written = schedule::write_k8s_jobs(&registry, &dir, &K8sJobOptions { image, env })?;
            for path in written {
                println!("Wrote {}.", path.display());
            }
        }
        ScheduleCommands::Aws => {
            for line in schedule::aws_rule_lines(&registry) {
                println!("{line}");
            }
        }
        ScheduleCommands::Run => {
            let exe = std::env::current_exe().context("locating cdl executable")?;
            let Some(sched) = schedule::maybe_build_scheduler(&config, &registry, exe).await? else {
                anyhow::bail!("set CDL_SCHEDULER_ENABLED=true to run the in-process scheduler");
            };
            sched.start().await.context("starting scheduler")?;
            info!(datasets = registry.datasets.len(), "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        }
    }
    Ok(())
}
