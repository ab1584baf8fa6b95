//! CLI commands: local pipeline execution and the orchestrator server.

use crate::config::{load_project_config, YamlConfigLoader};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Args, Subcommand};
use console::style;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use zephyr_core::context::TriggerContext;
use zephyr_core::ids::{JobId, ProjectId, RunId};
use zephyr_core::metrics::{MetricsRegistry, MetricsSink};
use zephyr_core::pipeline::{PipelineDefinition, TriggerType};
use zephyr_core::ports::{LogSink, Store};
use zephyr_core::run::{JobStatus, LogStream, Project};
use zephyr_runner::{
    ExecutionTarget, ExecutorConfig, FirecrackerDriver, JobRequest, NetworkAllocator,
    NetworkConfig, PoolConfig, StepExecutor, VmPool, VmTemplate,
};
use zephyr_scheduler::{
    dag::{JobDag, JobNode},
    plan, resolve_pipelines, JobScheduler, ObserverBus, SchedulerConfig,
};
use zephyr_store::SqliteStore;

#[derive(Subcommand)]
pub enum Commands {
    /// Run pipelines locally, in-process, in dependency order.
    Run(RunArgs),
    /// Start the orchestrator: store, scheduler, warm pool, HTTP edge.
    Serve(ServeArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Run only this pipeline.
    #[arg(long)]
    pub pipeline: Option<String>,
    /// Run only this job (its dependencies are assumed satisfied).
    #[arg(long)]
    pub job: Option<String>,
    /// Project configuration file.
    #[arg(long, default_value = "zephyr.yaml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Project configuration file.
    #[arg(long, default_value = "zephyr.yaml")]
    pub config: PathBuf,
    /// SQLite database path.
    #[arg(long, default_value = "zephyr.db")]
    pub db: PathBuf,
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,
    /// Maximum concurrently running jobs.
    #[arg(long, default_value_t = 4)]
    pub max_concurrent: usize,
    /// Scheduler poll interval in seconds.
    #[arg(long, default_value_t = 2)]
    pub poll_interval: u64,
    /// Working directories root.
    #[arg(long, default_value = ".zephyr/workspaces")]
    pub workspace_root: PathBuf,
    /// Shared API key for /api/v1 (env: ZEPHYR_API_KEY).
    #[arg(long, env = "ZEPHYR_API_KEY")]
    pub api_key: Option<String>,

    /// Maintain a warm Firecracker VM pool.
    #[arg(long)]
    pub vm_pool: bool,
    /// Guest kernel image (required with --vm-pool).
    #[arg(long)]
    pub kernel: Option<String>,
    /// Guest root filesystem (required with --vm-pool).
    #[arg(long)]
    pub rootfs: Option<String>,
    #[arg(long, default_value_t = 2)]
    pub vcpus: u32,
    #[arg(long, default_value_t = 2048)]
    pub memory_mb: u32,
    #[arg(long, default_value_t = 1)]
    pub min_idle: usize,
    #[arg(long, default_value_t = 2)]
    pub max_idle: usize,
    #[arg(long, default_value_t = 4)]
    pub max_total: usize,
    /// Uplink interface for guest NAT.
    #[arg(long)]
    pub nat_interface: Option<String>,
}

pub async fn dispatch(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Run(args) => run_local(args).await,
        Commands::Serve(args) => serve(args).await,
    }
}

/// Log sink for local runs: print lines as they arrive.
struct ConsoleSink {
    seq: AtomicU64,
}

#[async_trait]
impl LogSink for ConsoleSink {
    async fn append(
        &self,
        _job_id: &JobId,
        stream: LogStream,
        content: &str,
    ) -> zephyr_core::Result<u64> {
        match stream {
            LogStream::Stdout => println!("  {}", content),
            LogStream::Stderr => println!("  {}", style(content).yellow()),
        }
        Ok(self.seq.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

async fn run_local(args: RunArgs) -> Result<ExitCode> {
    let config = load_project_config(&args.config)?;
    let ctx = TriggerContext::new(TriggerType::Manual);
    let pipelines = resolve_pipelines(&config.pipelines, &ctx);

    let selected: Vec<&PipelineDefinition> = match &args.pipeline {
        Some(name) => {
            let found: Vec<_> = pipelines.iter().filter(|p| &p.name == name).collect();
            if found.is_empty() {
                bail!("pipeline '{name}' not found in {}", args.config.display());
            }
            found
        }
        None => pipelines.iter().collect(),
    };

    let mut all_ok = true;
    for pipeline in selected {
        println!(
            "{} pipeline {}",
            style("▶").cyan().bold(),
            style(&pipeline.name).bold()
        );
        if !run_pipeline_local(pipeline, &ctx, args.job.as_deref()).await? {
            all_ok = false;
        }
    }

    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_pipeline_local(
    pipeline: &PipelineDefinition,
    ctx: &TriggerContext,
    job_filter: Option<&str>,
) -> Result<bool> {
    let planned = plan(pipeline, ctx).context("pipeline failed validation")?;
    let mut dag = JobDag::build(
        planned
            .jobs
            .iter()
            .map(|j| JobNode::new(j.expanded.instance_id.clone(), j.depends_on.clone()))
            .collect(),
    )?;
    let order: Vec<String> = dag
        .topological_order()
        .iter()
        .map(|n| n.id.clone())
        .collect();

    let workdir = std::env::current_dir()?;
    let executor = StepExecutor::new(
        ExecutorConfig {
            toolchain_root: workdir.join(".zephyr").join("toolchains"),
            kill_grace: Duration::from_secs(5),
        },
        Arc::new(ConsoleSink {
            seq: AtomicU64::new(0),
        }),
    );

    let run_id = RunId::new();
    let mut needs_outputs: HashMap<String, String> = HashMap::new();
    let mut needs_status: HashMap<String, String> = HashMap::new();

    for instance_id in &order {
        let planned_job = planned
            .jobs
            .iter()
            .find(|j| &j.expanded.instance_id == instance_id)
            .context("planned job missing for DAG node")?;

        if let Some(filter) = job_filter {
            let logical = &planned_job.expanded.definition.name;
            if logical != filter && instance_id != filter {
                continue;
            }
        }

        if dag.status(instance_id) == Some(JobStatus::Skipped) {
            println!(
                "{} {} (skipped)",
                style("○").dim(),
                style(&planned_job.expanded.display_name).dim()
            );
            continue;
        }

        println!(
            "{} {}",
            style("●").cyan(),
            style(&planned_job.expanded.display_name).bold()
        );

        if job_filter.is_none() {
            dag.mark_running(instance_id)?;
        }

        let request = JobRequest {
            job_id: JobId::new(run_id, instance_id),
            definition: planned_job.expanded.definition.clone(),
            workdir: workdir.clone(),
            target: ExecutionTarget::Local,
            secrets: HashMap::new(),
            needs_outputs: needs_outputs.clone(),
            needs_status: needs_status.clone(),
            branch: ctx.branch.clone(),
            event_type: Some(ctx.event_type.as_str().to_string()),
        };
        let report = executor.execute(&request, &CancellationToken::new()).await?;

        for step in &report.steps {
            let (mark, label) = match step.status {
                zephyr_runner::StepStatus::Success => (style("✓").green(), style(&step.name)),
                zephyr_runner::StepStatus::Failure => {
                    (style("✗").red(), style(&step.name).red())
                }
                zephyr_runner::StepStatus::Skipped => (style("○").dim(), style(&step.name).dim()),
            };
            println!("  {} {} ({}ms)", mark, label, step.duration_ms);
        }

        let success = report.status == JobStatus::Success;
        needs_status.insert(
            planned_job.expanded.definition.name.clone(),
            report.status.as_str().to_string(),
        );
        for (key, value) in &report.outputs {
            needs_outputs.insert(
                format!("{}.{}", planned_job.expanded.definition.name, key),
                value.clone(),
            );
        }

        if job_filter.is_none() {
            dag.mark_completed(instance_id, success)?;
        } else if !success {
            return Ok(false);
        }
    }

    Ok(!dag.has_failures())
}

async fn serve(args: ServeArgs) -> Result<ExitCode> {
    let config =
        load_project_config(&args.config).context("cannot load project configuration")?;

    let store: Arc<SqliteStore> = Arc::new(
        SqliteStore::open(&args.db)
            .await
            .context("cannot open database")?,
    );
    let project = upsert_project(store.as_ref(), &config.project.name, &args).await?;

    let metrics: Arc<MetricsRegistry> = Arc::new(MetricsRegistry::new());
    let observer = Arc::new(ObserverBus::default());

    let pool = if args.vm_pool {
        let kernel = args
            .kernel
            .clone()
            .context("--kernel is required with --vm-pool")?;
        let rootfs = args
            .rootfs
            .clone()
            .context("--rootfs is required with --vm-pool")?;
        let driver = Arc::new(FirecrackerDriver::new(
            args.workspace_root.join("vmm-sockets"),
        ));
        let network = Arc::new(NetworkAllocator::new(NetworkConfig {
            nat_interface: args.nat_interface.clone(),
            ..Default::default()
        }));
        let pool = VmPool::new(
            driver,
            network,
            VmTemplate {
                kernel,
                rootfs,
                vcpus: args.vcpus,
                memory_mb: args.memory_mb,
            },
            PoolConfig {
                min_idle: args.min_idle,
                max_idle: args.max_idle,
                max_total: args.max_total,
                ..Default::default()
            },
            Arc::clone(&metrics) as Arc<dyn MetricsSink>,
        )?;
        pool.start().await?;
        Some(pool)
    } else {
        None
    };

    let scheduler = JobScheduler::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(YamlConfigLoader),
        pool.clone(),
        Arc::clone(&observer),
        Arc::clone(&metrics) as Arc<dyn MetricsSink>,
        SchedulerConfig {
            max_concurrent: args.max_concurrent,
            poll_interval: Duration::from_secs(args.poll_interval),
            workspace_root: args.workspace_root.clone(),
            secrets: HashMap::new(),
        },
    );

    scheduler.reconcile().await?;
    scheduler.start().await;

    let state = Arc::new(zephyr_api::AppState {
        store: Arc::clone(&store) as Arc<dyn Store>,
        scheduler: Arc::clone(&scheduler),
        observer,
        metrics,
        api_key: args.api_key.clone(),
    });
    let router = zephyr_api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("cannot bind {}", args.listen))?;
    info!(listen = %args.listen, project = %project.name, "Zephyr orchestrator listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server error")?;

    scheduler.stop().await;
    if let Some(pool) = pool {
        pool.stop().await?;
    }
    store.destroy().await?;
    Ok(ExitCode::SUCCESS)
}

async fn upsert_project(store: &SqliteStore, name: &str, args: &ServeArgs) -> Result<Project> {
    let existing = store.list_projects().await?;
    if let Some(project) = existing.into_iter().find(|p| p.name == name) {
        return Ok(project);
    }
    let project = Project {
        id: ProjectId::new(),
        name: name.to_string(),
        description: None,
        config_path: args.config.display().to_string(),
    };
    store.create_project(&project).await?;
    info!(project = %project.name, id = %project.id, "Project registered");
    Ok(project)
}
