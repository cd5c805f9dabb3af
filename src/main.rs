use clap::{Parser, Subcommand};
use genqueue::analytics::{self, ReportRange};
use genqueue::broadcast::Event;
use genqueue::config::{ConfigLoader, ServiceConfig};
use genqueue::metrics::MetricsSnapshot;
use genqueue::model::{JobStatus, ProviderProfile};
use genqueue::output::{self, ExportFormat};
use genqueue::selector::ROLES;
use genqueue::store::{JobQuery, SqliteStore, Store};
use genqueue::{
    Clock, Engine, EngineParts, HttpAutomation, JobService, Scheduler, SystemClock,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

#[derive(Parser)]
#[command(name = "genqueue")]
#[command(version)]
#[command(about = "Image generation job queue with adaptive per-provider throttling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker, submitting the configured batch if there is one
    Run {
        /// Path to the configuration file (JSON/YAML/TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Show progress bars (stderr)
        #[arg(short, long)]
        progress: bool,
    },
    /// Validate a configuration file
    Check {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Export stored jobs
    Export {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long, value_enum, default_value_t = ExportFormat::Console)]
        format: ExportFormat,

        /// Only jobs in this status (queued, processing, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<JobStatus>,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print a performance report as JSON
    Report {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long, value_enum, default_value_t = ReportRange::Day)]
        range: ReportRange,
    },
}

fn build_engine(config: &ServiceConfig, store: Arc<dyn Store>) -> anyhow::Result<Arc<Engine>> {
    let automation = HttpAutomation::new(
        Url::parse(&config.automation.endpoint)?,
        Duration::from_secs(config.automation.request_timeout_secs),
    )?;
    let engine = Engine::new(
        EngineParts {
            store,
            clock: Arc::new(SystemClock),
            automation: Arc::new(automation),
            governor: config.governor.clone(),
            selector_ttl: config.selector_ttl(),
        },
        config.worker_settings(),
    );
    Ok(Arc::new(engine))
}

fn progress_message(snapshot: &MetricsSnapshot) -> String {
    format!(
        "Done: {} | Failed: {} | Retries: {} | Deferred: {} | Success: {:.1}%",
        snapshot.jobs_completed,
        snapshot.jobs_failed,
        snapshot.jobs_retried,
        snapshot.jobs_deferred,
        snapshot.success_rate
    )
}

async fn run(
    config: ServiceConfig,
    progress: bool,
    multi: Arc<indicatif::MultiProgress>,
) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.database_path).await?);
    let engine = build_engine(&config, store.clone())?;
    let scheduler = Scheduler::new(store.clone(), engine.clock().clone(), config.scheduler.clone());
    let service = JobService::new(engine.clone(), scheduler);

    let now = engine.clock().now();
    let profiles: Vec<ProviderProfile> = config
        .providers
        .iter()
        .cloned()
        .map(|seed| seed.into_profile(now))
        .collect();
    service.seed_providers(&profiles).await?;
    engine.restore().await?;

    let mut events = UnboundedReceiverStream::new(engine.broadcaster().subscribe());
    let batch = match &config.batch {
        Some(batch) => Some(
            service
                .create_batch(&batch.name, batch.prompts.clone(), batch.providers.clone())
                .await?,
        ),
        None => None,
    };

    let mut progress_task = None;
    let progress_bar = if progress {
        let total = batch.as_ref().map(|b| b.progress.total).unwrap_or(0);
        let pb = multi.add(ProgressBar::new(total));
        pb.set_style(ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("#>-"));

        let mut metrics_rx = engine.watch_metrics();
        let pb_clone = pb.clone();
        progress_task = Some(tokio::spawn(async move {
            while metrics_rx.changed().await.is_ok() {
                let snapshot = metrics_rx.borrow().clone();
                pb_clone.set_position(snapshot.finished());
                pb_clone.set_message(progress_message(&snapshot));
            }
        }));
        Some(pb)
    } else {
        None
    };

    let batch_id = batch.as_ref().map(|b| b.id.clone());
    let batch_done = async {
        let Some(batch_id) = batch_id else {
            return std::future::pending::<()>().await;
        };
        while let Some(event) = events.next().await {
            if !matches!(event, Event::JobStatusUpdate { .. } | Event::JobCancelled { .. }) {
                continue;
            }
            match store.get_batch(&batch_id).await {
                Ok(Some(batch)) if batch.progress.is_finished() => {
                    log::info!("Batch {} finished", batch_id);
                    return;
                }
                Ok(_) => {}
                Err(e) => log::error!("Could not read batch {}: {}", batch_id, e),
            }
        }
    };

    log::info!("Starting worker...");
    engine
        .run_until(async {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = batch_done => {}
            }
        })
        .await;

    if let Some(task) = progress_task {
        task.abort();
    }
    let final_metrics = engine.get_metrics();
    if let Some(pb) = progress_bar {
        pb.set_style(ProgressStyle::default_bar()
            .template("✅ [{elapsed_precise}] [{bar:40.green/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"));
        pb.finish_with_message(progress_message(&final_metrics));
    }

    let health = service.health().await?;
    println!("\n✅ Worker stopped:");
    println!("   Jobs Completed: {}", final_metrics.jobs_completed);
    println!("   Jobs Failed: {}", final_metrics.jobs_failed);
    println!("   Sent to Manual Review: {}", final_metrics.jobs_escalated);
    println!("   Attempt Success Rate: {:.1}%", final_metrics.success_rate);
    println!("   Average Attempt: {}ms", final_metrics.avg_latency_ms);
    println!("   Still Queued: {}", health.queued_jobs);
    println!("   Total Time: {:.1}s", final_metrics.elapsed_seconds);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "info"); }
    }
    let cli = Cli::parse();
    let logger = env_logger::Builder::from_default_env().build();
    let multi = Arc::new(indicatif::MultiProgress::new());

    match cli.command {
        Commands::Run { config, progress } => {
            if progress {
                indicatif_log_bridge::LogWrapper::new((*multi).clone(), logger).try_init()?;
            } else {
                log::set_max_level(logger.filter());
                log::set_boxed_logger(Box::new(logger))?;
            }

            log::info!("Loading config from {:?}", config);
            let config_data = ConfigLoader::load(&config)?;
            run(config_data, progress, multi).await?;
        }
        Commands::Check { config } => match ConfigLoader::load(&config) {
            Ok(cfg) => {
                println!("✅ Config is valid:");
                println!("   Database: {}", cfg.database_path);
                println!("   Automation endpoint: {}", cfg.automation.endpoint);
                println!("   Max retries: {}", cfg.max_retries);
                for provider in &cfg.providers {
                    println!(
                        "   Provider: {} ({}, {}/min, {}s timeout)",
                        provider.name,
                        if provider.enabled { "enabled" } else { "disabled" },
                        provider.rate_limit_per_minute,
                        provider.timeout_seconds
                    );
                    let missing: Vec<&str> = ROLES
                        .iter()
                        .copied()
                        .filter(|role| !provider.selectors.contains_key(*role))
                        .collect();
                    if !missing.is_empty() {
                        println!("     ⚠️  No selector for: {}", missing.join(", "));
                    }
                }
                if let Some(batch) = &cfg.batch {
                    println!(
                        "   Batch: {} ({} prompts × {} providers)",
                        batch.name,
                        batch.prompts.len(),
                        batch.providers.len()
                    );
                }
            }
            Err(e) => {
                eprintln!("❌ Config error: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Export {
            config,
            format,
            status,
            limit,
            output: output_path,
        } => {
            env_logger::Builder::from_default_env().try_init().ok();
            let config_data = ConfigLoader::load(&config)?;
            let store = SqliteStore::open(&config_data.database_path).await?;

            let mut query = JobQuery::new().limit(limit);
            if let Some(status) = status {
                query = query.status(status);
            }
            let jobs = store.list_jobs(&query).await?;
            let mut sink = output::create_sink(format, output_path.as_deref(), None)?;
            for job in &jobs {
                sink.write(job).await?;
            }
            sink.close().await?;
            store.close().await;
            log::info!("Exported {} jobs", jobs.len());
        }
        Commands::Report { config, range } => {
            env_logger::Builder::from_default_env().try_init().ok();
            let config_data = ConfigLoader::load(&config)?;
            let store = SqliteStore::open(&config_data.database_path).await?;
            let report = analytics::performance_report(&store, range, SystemClock.now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            store.close().await;
        }
    }

    Ok(())
}
