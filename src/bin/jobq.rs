//! jobq CLI: run the server or workers, and operate on the queue.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use jobq::config::Config;
use jobq::config::secrets::ExposeSecret;
use jobq::handler::{CommandHandler, JobHandler, SimulatedHandler};
use jobq::model::{JobId, NewJob, RequeueResult};
use jobq::queue::Queue;
use jobq::store::{MemoryStore, PgStore, Store};
use jobq::sweeper::{Sweeper, SweeperConfig};
use jobq::telemetry::{TelemetryConfig, init_telemetry};
use jobq::worker::{Worker, WorkerConfig};
use std::path::PathBuf;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "jobq", about = "Durable job queue with consumer groups and recovery")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API, optionally with in-process workers and a sweeper
    Serve {
        /// In-process simulated workers
        #[arg(long, default_value_t = 0)]
        workers: usize,
        /// Run the recovery sweeper
        #[arg(long)]
        sweep: bool,
        /// Let the sweeper requeue stuck jobs instead of only reporting them
        #[arg(long, requires = "sweep")]
        auto_requeue: bool,
        /// Simulated job duration for in-process workers
        #[arg(long, default_value_t = 2000)]
        job_duration_ms: u64,
    },
    /// Run workers until interrupted
    Work {
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        /// Consumer id (suffixed per worker when concurrency > 1)
        #[arg(long)]
        consumer: Option<String>,
        /// Executable run per job; simulated work when omitted
        #[arg(long)]
        command: Option<PathBuf>,
        #[arg(long, default_value_t = 2000)]
        job_duration_ms: u64,
        /// Take over jobs idle this long before taking new ones
        #[arg(long)]
        reclaim_idle_secs: Option<u64>,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Append a job
    Submit {
        job_type: String,
        /// Payload field as key=value (repeatable)
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Append synthetic build jobs
    Seed {
        #[arg(long, default_value_t = 2)]
        count: usize,
    },
    /// Show a job record and its result
    Show { id: JobId },
    /// Jobs appended but not yet delivered
    Pending {
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Jobs stuck in flight past the idle threshold
    Aborted {
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Most recent results
    Completed {
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Requeue a job under a new id
    Requeue { id: JobId },
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = match cli.command {
        Command::Job { .. } => None,
        _ => Some(init_telemetry(TelemetryConfig {
            endpoint: config.otel_endpoint.clone(),
            service_name: "jobq".to_string(),
            log_level: config.log_level.clone(),
        })?),
    };

    match config.database_url {
        Some(ref url) => {
            let store = PgStore::connect(url.expose_secret()).await?;
            store.migrate().await?;
            run(cli.command, &config, Arc::new(store)).await
        }
        None => {
            if matches!(cli.command, Command::Job { .. } | Command::Work { .. }) {
                warn!("DATABASE_URL is not set, using a process-local memory store");
                eprintln!("warning: DATABASE_URL is not set; state will not outlive this process");
            }
            run(cli.command, &config, Arc::new(MemoryStore::new())).await
        }
    }
}

async fn run<S: Store>(command: Command, config: &Config, store: Arc<S>) -> anyhow::Result<()> {
    let queue = Queue::new(store, config.queue_keys())
        .with_host_name(config.host_name.clone())
        .with_idle_threshold(config.idle_threshold);
    queue.ensure_group(config.group_start).await?;

    match command {
        Command::Serve {
            workers,
            sweep,
            auto_requeue,
            job_duration_ms,
        } => {
            cmd_serve(
                queue,
                config,
                workers,
                sweep.then_some(auto_requeue),
                Duration::from_millis(job_duration_ms),
            )
            .await
        }
        Command::Work {
            concurrency,
            consumer,
            command,
            job_duration_ms,
            reclaim_idle_secs,
        } => {
            let queue = match reclaim_idle_secs {
                Some(secs) => queue.with_reclaim_idle(Duration::from_secs(secs)),
                None => queue,
            };
            let consumer = consumer.unwrap_or_else(|| WorkerConfig::default().consumer_id);
            let cancel = shutdown_token();
            let mut tasks = JoinSet::new();
            match command {
                Some(path) => spawn_workers(
                    &mut tasks,
                    queue,
                    Arc::new(CommandHandler::new(path)),
                    &consumer,
                    concurrency,
                    &cancel,
                ),
                None => spawn_workers(
                    &mut tasks,
                    queue,
                    Arc::new(SimulatedHandler::new(Duration::from_millis(job_duration_ms))),
                    &consumer,
                    concurrency,
                    &cancel,
                ),
            }
            join_all(tasks, &cancel).await
        }
        Command::Job { action } => cmd_job(&queue, action).await,
    }
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        token.cancel();
    });
    cancel
}

fn spawn_workers<S: Store, H: JobHandler>(
    tasks: &mut JoinSet<jobq::error::Result<()>>,
    queue: Queue<S>,
    handler: Arc<H>,
    consumer: &str,
    concurrency: usize,
    cancel: &CancellationToken,
) {
    let worker = Worker::new(queue, handler, WorkerConfig::new(consumer));
    for n in 0..concurrency {
        let worker = if concurrency > 1 {
            worker.with_consumer_id(format!("{consumer}-{n}"))
        } else {
            worker.clone()
        };
        let cancel = cancel.clone();
        tasks.spawn(async move { worker.run(&cancel).await.map(|_| ()) });
    }
}

/// Wait for every task; the first failure cancels the rest.
async fn join_all(
    mut tasks: JoinSet<jobq::error::Result<()>>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut first_error: Option<anyhow::Error> = None;
    while let Some(joined) = tasks.join_next().await {
        let failure = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => anyhow::Error::from(e),
            Err(e) => anyhow::Error::from(e),
        };
        error!(error = %failure, "task failed, shutting down");
        cancel.cancel();
        first_error.get_or_insert(failure);
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn cmd_serve<S: Store>(
    queue: Queue<S>,
    config: &Config,
    workers: usize,
    sweep: Option<bool>,
    job_duration: Duration,
) -> anyhow::Result<()> {
    let cancel = shutdown_token();
    let mut tasks = JoinSet::new();

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tasks.spawn(jobq::http::serve(listener, queue.clone(), cancel.clone()));

    if workers > 0 {
        let consumer = format!("{}-worker", config.host_name);
        spawn_workers(
            &mut tasks,
            queue.clone(),
            Arc::new(SimulatedHandler::new(job_duration)),
            &consumer,
            workers,
            &cancel,
        );
    }

    if let Some(auto_requeue) = sweep {
        let sweeper = Sweeper::new(
            queue,
            SweeperConfig {
                idle_threshold: config.idle_threshold,
                auto_requeue,
                ..SweeperConfig::default()
            },
        );
        let cancel = cancel.clone();
        tasks.spawn(async move { sweeper.run(&cancel).await });
    }

    join_all(tasks, &cancel).await
}

async fn cmd_job<S: Store>(queue: &Queue<S>, action: JobAction) -> anyhow::Result<()> {
    match action {
        JobAction::Submit { job_type, fields } => {
            let job = fields
                .into_iter()
                .fold(NewJob::new(job_type), |job, (k, v)| job.field(k, v));
            let record = queue.submit(job).await?;
            println!("Appended: {} ({})", record.id, record.job_type);
        }
        JobAction::Seed { count } => {
            for id in queue.create_dummy_jobs(count).await? {
                println!("Appended: {id}");
            }
        }
        JobAction::Show { id } => {
            let Some(record) = queue.get(id).await? else {
                anyhow::bail!("no job with id {id}");
            };
            println!("ID:          {}", record.id);
            println!("Type:        {}", record.job_type);
            println!("Enqueued:    {}", record.enqueued_at);
            println!("Payload:     {}", serde_json::to_string_pretty(&record.payload)?);
            if let Some(from) = record.requeued_from {
                println!("Requeued From: {from}");
            }
            if let Some(by) = record.retired_by {
                println!("Retired By:  {by}");
            }
            if let Some(result) = queue.result(id).await? {
                println!("---");
                println!("Status:      {}", result.status);
                println!("Message:     {}", result.message);
                println!("Host:        {}", result.host_name);
                println!("Recorded:    {}", result.timestamp);
            }
        }
        JobAction::Pending { count } => print_records(&queue.list_idle(count).await?),
        JobAction::Aborted { count } => print_records(&queue.list_aborted(count).await?),
        JobAction::Completed { count } => {
            let results = queue.completed(count).await?;
            if results.is_empty() {
                println!("No results found.");
                return Ok(());
            }
            println!(
                "{:<18}  {:<12}  {:<8}  {:<16}  {:<20}  MESSAGE",
                "ID", "TYPE", "STATUS", "HOST", "RECORDED"
            );
            println!("{}", "-".repeat(100));
            for r in &results {
                println!(
                    "{:<18}  {:<12}  {:<8}  {:<16}  {:<20}  {}",
                    r.job_id.to_string(),
                    r.job_type,
                    r.status.to_string(),
                    r.host_name,
                    r.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                    r.message
                );
            }
            println!("\n{} result(s)", results.len());
        }
        JobAction::Requeue { id } => match queue.requeue(id).await? {
            RequeueResult::Requeued { original, new_id } => {
                println!("Requeued: {original} → {new_id}")
            }
            RequeueResult::AlreadyRequeued { original, new_id } => {
                println!("Already requeued: {original} → {new_id}")
            }
        },
    }
    Ok(())
}

fn print_records(records: &[jobq::model::JobRecord]) {
    if records.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!("{:<18}  {:<12}  {:<20}  PAYLOAD", "ID", "TYPE", "ENQUEUED");
    println!("{}", "-".repeat(100));
    for record in records {
        let payload = record
            .payload
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<18}  {:<12}  {:<20}  {}",
            record.id.to_string(),
            record.job_type,
            record.enqueued_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            payload
        );
    }
    println!("\n{} job(s)", records.len());
}
