//! Scheduling artifacts over the dataset list, plus the in-process scheduler.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use cdl_datasets::DatasetRegistry;
use serde::Serialize;
use tokio::process::Command;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::LoaderConfig;

pub const JOB_NAME_PREFIX: &str = "cdl-load-";

/// Dataset names may contain `_`, which Kubernetes object names reject.
pub fn slugify(name: &str) -> String {
    name.replace('_', "-")
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CronJobSpec,
}

#[derive(Debug, Serialize)]
pub struct ObjectMeta {
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobSpec {
    pub schedule: String,
    pub concurrency_policy: String,
    pub job_template: JobTemplate,
}

#[derive(Debug, Serialize)]
pub struct JobTemplate {
    pub spec: JobSpec,
}

#[derive(Debug, Serialize)]
pub struct JobSpec {
    pub template: PodTemplate,
}

#[derive(Debug, Serialize)]
pub struct PodTemplate {
    pub spec: PodSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub restart_policy: String,
    pub containers: Vec<Container>,
}

#[derive(Debug, Serialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone)]
pub struct K8sJobOptions {
    pub image: String,
    /// Copied into every container, e.g. `DATABASE_URL` and `USE_TEST_DATA`.
    pub env: Vec<EnvVar>,
}

pub fn cron_job_for(dataset: &str, schedule: String, opts: &K8sJobOptions) -> CronJob {
    CronJob {
        api_version: "batch/v1".to_string(),
        kind: "CronJob".to_string(),
        metadata: ObjectMeta {
            name: format!("{JOB_NAME_PREFIX}{}", slugify(dataset)),
        },
        spec: CronJobSpec {
            schedule,
            concurrency_policy: "Forbid".to_string(),
            job_template: JobTemplate {
                spec: JobSpec {
                    template: PodTemplate {
                        spec: PodSpec {
                            restart_policy: "Never".to_string(),
                            containers: vec![Container {
                                name: "cdl".to_string(),
                                image: opts.image.clone(),
                                command: vec!["cdl".into(), "load".into(), dataset.to_string()],
                                env: opts.env.clone(),
                            }],
                        },
                    },
                },
            },
        },
    }
}

/// Writes one `load_dataset_<name>.yml` CronJob manifest per dataset.
pub fn write_k8s_jobs(
    registry: &DatasetRegistry,
    jobs_dir: &Path,
    opts: &K8sJobOptions,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(jobs_dir).with_context(|| format!("creating {}", jobs_dir.display()))?;
    let mut written = Vec::new();
    for ds in &registry.datasets {
        let job = cron_job_for(ds.name.as_str(), ds.schedule.k8s(), opts);
        let path = jobs_dir.join(format!("load_dataset_{}.yml", ds.name));
        let yaml = serde_yaml::to_string(&job).context("serializing CronJob")?;
        fs::write(&path, yaml).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "wrote k8s job");
        written.push(path);
    }
    Ok(written)
}

/// One `<rule-name>\t<schedule-expression>` line per dataset.
pub fn aws_rule_lines(registry: &DatasetRegistry) -> Vec<String> {
    registry
        .datasets
        .iter()
        .map(|ds| format!("{JOB_NAME_PREFIX}{}\t{}", slugify(ds.name.as_str()), ds.schedule.aws()))
        .collect()
}

async fn run_load_child(exe: &Path, dataset: &str) {
    info!(%dataset, "scheduled load starting");
    let status = Command::new(exe)
        .args(["load", dataset])
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => info!(%dataset, "scheduled load finished"),
        Ok(status) => error!(%dataset, %status, "scheduled load failed"),
        Err(err) => error!(%dataset, error = %err, "could not start scheduled load"),
    }
}

/// `None` unless `CDL_SCHEDULER_ENABLED` is set. Each due dataset runs as its
/// own `<exe> load <dataset>` process, so builds never share a connection.
pub async fn maybe_build_scheduler(
    config: &LoaderConfig,
    registry: &DatasetRegistry,
    exe: PathBuf,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for ds in &registry.datasets {
        let cron = ds.schedule.tokio_cron();
        let dataset = ds.name.to_string();
        let exe = exe.clone();
        let job = Job::new_async(&cron, move |_uuid, _l| {
            let exe = exe.clone();
            let dataset = dataset.clone();
            Box::pin(async move {
                run_load_child(&exe, &dataset).await;
            })
        })
        .with_context(|| format!("creating scheduler job for {} ({cron})", ds.name))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(dataset = %ds.name, schedule = %ds.schedule, cron = %cron, "scheduled dataset");
    }
    Ok(Some(sched))
}
