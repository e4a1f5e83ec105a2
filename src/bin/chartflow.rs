//! chartflow CLI: operator interface to the job coordinator.

use chartflow::chart::extract_tracks;
use chartflow::config::Config;
use chartflow::db::Db;
use chartflow::enrich::NoEnrichment;
use chartflow::identity;
use chartflow::model::{Job, JobFilter, JobId, JobStatus};
use chartflow::notifier::PgNotifier;
use chartflow::processor::BatchProcessor;
use chartflow::producer::{DispatchOptions, Producer};
use chartflow::telemetry::{TelemetryConfig, init_telemetry};
use chartflow::worker::Worker;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "chartflow", about = "Chart fan-out/fan-in job coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run item workers until Ctrl-C
    Serve {
        /// Number of concurrent worker loops
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Item operations
    Item {
        #[command(subcommand)]
        action: ItemAction,
    },
    /// Completion event operations
    Completions {
        #[command(subcommand)]
        action: CompletionAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Create a job from a chart file and enqueue its tracks
    Dispatch {
        /// Chart JSON file
        chart: PathBuf,
        /// Reference to the chart carried on the job (defaults to the file path)
        #[arg(long)]
        source_ref: Option<String>,
        /// Reject a second dispatch with the same key
        #[arg(long)]
        idempotency_key: Option<String>,
        /// Skip tracks already in the item store
        #[arg(long)]
        skip_known: bool,
    },
    /// Show a job
    Show {
        /// Job ID (full UUID)
        id: String,
    },
    /// List jobs
    List {
        /// Filter by status (processing | completed)
        #[arg(long)]
        status: Option<String>,
        /// Only jobs created more than this many minutes ago
        #[arg(long)]
        older_than_mins: Option<i64>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum ItemAction {
    /// Show the stored item for a title and artist
    Show { title: String, artist: String },
}

#[derive(Subcommand)]
enum CompletionAction {
    /// Republish completion events that were never handed off
    Flush,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from(&config))?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    for queue in [
        &config.item_queue,
        &config.completion_queue,
        &config.dead_letter_queue,
    ] {
        db.create_queue(queue).await?;
    }
    let db = Arc::new(db);

    match cli.command {
        Command::Serve { workers } => cmd_serve(db, &config, workers).await,
        Command::Job { action } => match action {
            JobAction::Dispatch {
                chart,
                source_ref,
                idempotency_key,
                skip_known,
            } => {
                cmd_job_dispatch(
                    db,
                    &config,
                    chart,
                    source_ref,
                    DispatchOptions {
                        idempotency_key,
                        skip_known,
                    },
                )
                .await
            }
            JobAction::Show { id } => cmd_job_show(&db, id).await,
            JobAction::List {
                status,
                older_than_mins,
                limit,
            } => cmd_job_list(&db, status, older_than_mins, limit).await,
        },
        Command::Item {
            action: ItemAction::Show { title, artist },
        } => cmd_item_show(&db, &title, &artist).await,
        Command::Completions {
            action: CompletionAction::Flush,
        } => cmd_completions_flush(db, &config).await,
    }
}

fn processor(db: &Arc<Db>, config: &Config) -> BatchProcessor<Db, PgNotifier, NoEnrichment> {
    BatchProcessor::new(
        Arc::clone(db),
        Arc::new(PgNotifier::new(Arc::clone(db), &config.completion_queue)),
        Arc::new(NoEnrichment),
        config.max_deliveries,
    )
}

async fn cmd_serve(db: Arc<Db>, config: &Config, workers: usize) -> anyhow::Result<()> {
    db.health_check().await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = Worker::new(
        "worker-0",
        processor(&db, config),
        Arc::clone(&db),
        config.worker_config(),
        shutdown_rx,
    );

    let mut handles = Vec::with_capacity(workers.max(1));
    for n in 0..workers.max(1) {
        let w = worker.named(format!("worker-{n}"));
        handles.push(tokio::spawn(w.run()));
    }

    tokio::signal::ctrl_c().await.ok();
    let _ = shutdown_tx.send(true);

    for handle in handles {
        handle.await??;
    }
    Ok(())
}

async fn cmd_job_dispatch(
    db: Arc<Db>,
    config: &Config,
    chart: PathBuf,
    source_ref: Option<String>,
    options: DispatchOptions,
) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(&chart).await?;
    let document: serde_json::Value = serde_json::from_str(&content)?;
    let tracks = extract_tracks(&document);
    let source_ref = source_ref.unwrap_or_else(|| chart.display().to_string());

    let producer = Producer::new(Arc::clone(&db), Arc::clone(&db), &config.item_queue);
    match producer.dispatch(&source_ref, tracks, options).await? {
        Some(report) => {
            println!(
                "Created: {} (expected: {}, sent: {})",
                report.job.id, report.job.expected, report.sent
            );
            println!(
                "Tracks: {} in chart, {} known, {} repeated",
                report.total_tracks, report.skipped_known, report.skipped_duplicate
            );
        }
        None => println!("No new tracks in {source_ref}; no job created."),
    }
    Ok(())
}

async fn cmd_job_show(db: &Db, id: String) -> anyhow::Result<()> {
    let id: JobId = id.parse()?;
    let job = db.get_job(id).await?;
    print_job(&job);
    Ok(())
}

async fn cmd_job_list(
    db: &Db,
    status: Option<String>,
    older_than_mins: Option<i64>,
    limit: i64,
) -> anyhow::Result<()> {
    let status: Option<JobStatus> = status.map(|s| s.parse()).transpose()?;
    let created_before =
        older_than_mins.map(|m| chrono::Utc::now() - chrono::Duration::minutes(m));

    let jobs = db
        .list_jobs(&JobFilter {
            status,
            created_before,
            limit,
        })
        .await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:>9}  {:<16}  SOURCE",
        "ID", "STATUS", "PROGRESS", "CREATED"
    );
    println!("{}", "-".repeat(90));

    for job in &jobs {
        println!(
            "{:<8}  {:<10}  {:>9}  {:<16}  {}",
            job.id.short(),
            job.status,
            format!("{}/{}", job.processed, job.expected),
            job.created_at.format("%Y-%m-%d %H:%M").to_string(),
            job.source_ref
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}

fn print_job(job: &Job) {
    println!("ID:         {}", job.id);
    println!("Source:     {}", job.source_ref);
    println!(
        "Key:        {}",
        job.idempotency_key.as_deref().unwrap_or("-")
    );
    println!("Status:     {}", job.status);
    println!("Progress:   {}/{}", job.processed, job.expected);
    println!("Created:    {}", job.created_at);
    println!("Updated:    {}", job.updated_at);
    if let Some(completed) = job.completed_at {
        println!("Completed:  {completed}");
    }
    if let Some(notified) = job.notified_at {
        println!("Notified:   {notified}");
    }
}

async fn cmd_item_show(db: &Db, title: &str, artist: &str) -> anyhow::Result<()> {
    let id = identity::identity(title, artist);
    match db.get_item(&id).await? {
        Some(item) => {
            println!("ID:         {}", item.id);
            println!("Created:    {}", item.created_at);
            println!("Updated:    {}", item.updated_at);
            println!(
                "Attributes: {}",
                serde_json::to_string_pretty(&item.attributes)?
            );
        }
        None => println!("No item for {id}"),
    }
    Ok(())
}

async fn cmd_completions_flush(db: Arc<Db>, config: &Config) -> anyhow::Result<()> {
    let delivered = processor(&db, config)
        .republish_pending(Duration::ZERO)
        .await?;
    println!("Republished {delivered} completion event(s).");
    Ok(())
}
