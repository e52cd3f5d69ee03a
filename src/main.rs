use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use uuid::Uuid;

use queuectl::config::{ExecutorConfig, QueueConfig, DEFAULT_CONFIG_FILE};
use queuectl::error::{QueueError, Result};
use queuectl::jobs::builtin_registry;
use queuectl::logging;
use queuectl::metrics::{Metrics, MetricsReporter};
use queuectl::queue::manager::parse_payload;
use queuectl::queue::{DeadLetter, DeadLetterQueue, ExecutionMode, Job, JobState, QueueManager};
use queuectl::shutdown::install_shutdown_handler;
use queuectl::store::JobStore;
use queuectl::worker::{JobExecutor, Worker};

/// Upper bound for `start-workers --workers`.
const MAX_WORKERS: u64 = 256;

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "A lightweight persistent background job queue")]
#[command(propagate_version = true)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Add a new job to the queue
    Enqueue {
        /// Shell command, or a handler reference (target.callable) with --dynamic
        job: String,

        /// Extra words appended to a shell command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// JSON object passed as named arguments to a dynamic handler
        #[arg(long)]
        payload: Option<String>,

        /// Run the job with a registered handler instead of the shell
        #[arg(long, visible_alias = "python")]
        dynamic: bool,

        /// Override the configured retry limit for this job
        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// List live jobs
    List {
        /// Only show jobs in this state
        #[arg(long)]
        state: Option<StateFilter>,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Show a single job
    Status {
        /// The job ID (UUID)
        job_id: Uuid,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Run worker loops until SIGINT/SIGTERM
    StartWorkers {
        /// Seconds between polls when the queue is empty
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        poll: Option<u64>,

        /// Number of worker loops in this process
        #[arg(long, default_value = "1", value_parser = clap::value_parser!(u64).range(1..=MAX_WORKERS))]
        workers: u64,
    },

    /// Dead-letter queue operations
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
}

#[derive(clap::Subcommand, Debug)]
enum DlqCommands {
    /// List dead-letter entries
    List {
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
    /// Move an entry back into the queue as pending
    Retry {
        #[arg(long)]
        id: Uuid,
    },
    /// Delete every entry
    Purge,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StateFilter {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl From<StateFilter> for JobState {
    fn from(filter: StateFilter) -> Self {
        match filter {
            StateFilter::Pending => JobState::Pending,
            StateFilter::Processing => JobState::Processing,
            StateFilter::Completed => JobState::Completed,
            StateFilter::Failed => JobState::Failed,
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn shorten(text: &str, width: usize) -> String {
    if text.chars().count() > width {
        let head: String = text.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

fn print_job_table(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }

    println!(
        "{:<38} {:<11} {:<8} {:<8} COMMAND",
        "JOB ID", "STATE", "MODE", "ATTEMPTS"
    );
    println!("{}", "-".repeat(90));
    for job in jobs {
        println!(
            "{:<38} {:<11} {:<8} {:<8} {}",
            job.id.to_string(),
            job.state,
            job.mode,
            format!("{}/{}", job.attempts, job.max_retries),
            shorten(&job.command, 40)
        );
    }
}

fn print_job_detail(job: &Job) {
    println!("Job ID:      {}", job.id);
    println!("State:       {}", job.state);
    println!("Mode:        {}", job.mode);
    println!("Command:     {}", job.command);
    if let Some(payload) = &job.payload {
        println!("Payload:     {}", serde_json::Value::Object(payload.clone()));
    }
    println!("Attempts:    {}/{}", job.attempts, job.max_retries);
    println!("Created:     {}", job.created_at.to_rfc3339());
    println!("Updated:     {}", job.updated_at.to_rfc3339());
    if let Some(result) = &job.result {
        println!("Result:      {}", result);
    }
    if let Some(error) = &job.last_error {
        println!("Last error:");
        for line in error.lines() {
            println!("  {}", line);
        }
    }
}

fn print_dead_letter_table(entries: &[DeadLetter]) {
    if entries.is_empty() {
        println!("Dead-letter queue is empty.");
        return;
    }

    println!(
        "{:<38} {:<8} {:<8} {:<30} COMMAND",
        "JOB ID", "MODE", "ATTEMPTS", "LAST ERROR"
    );
    println!("{}", "-".repeat(100));
    for entry in entries {
        println!(
            "{:<38} {:<8} {:<8} {:<30} {}",
            entry.id.to_string(),
            entry.mode,
            format!("{}/{}", entry.attempts, entry.max_retries),
            shorten(entry.last_error.as_deref().unwrap_or("-"), 30),
            shorten(&entry.command, 30)
        );
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_enqueue(
    manager: &QueueManager,
    job: String,
    args: Vec<String>,
    payload: Option<String>,
    dynamic: bool,
    max_retries: Option<u32>,
    output: &OutputFormat,
) -> Result<()> {
    let payload = payload.as_deref().map(parse_payload).transpose()?;
    let (command, mode) = if dynamic {
        (job, ExecutionMode::Dynamic)
    } else {
        let command = std::iter::once(job)
            .chain(args)
            .collect::<Vec<_>>()
            .join(" ");
        (command, ExecutionMode::Shell)
    };

    let job = manager.enqueue(&command, mode, payload, max_retries).await?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            println!("Job enqueued successfully!");
            println!("Job ID: {}", job.id);
        }
    }
    Ok(())
}

async fn handle_list(
    manager: &QueueManager,
    state: Option<StateFilter>,
    output: &OutputFormat,
) -> Result<()> {
    let jobs = match state {
        Some(filter) => manager.jobs_in_state(filter.into()).await?,
        None => manager.list_jobs().await?,
    };

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            print_job_table(&jobs);
            if state.is_none() && !jobs.is_empty() {
                let counts = manager.counts().await?;
                let summary: Vec<String> = [
                    JobState::Pending,
                    JobState::Processing,
                    JobState::Failed,
                    JobState::Completed,
                ]
                .iter()
                .map(|s| format!("{} {}", counts.get(s).copied().unwrap_or(0), s))
                .collect();
                println!();
                println!("{} jobs: {}", jobs.len(), summary.join(", "));
            }
        }
    }
    Ok(())
}

async fn handle_status(
    manager: &QueueManager,
    dlq: &DeadLetterQueue,
    job_id: Uuid,
    output: &OutputFormat,
) -> Result<()> {
    if let Some(job) = manager.get_job(&job_id).await? {
        match output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
            OutputFormat::Table => print_job_detail(&job),
        }
        return Ok(());
    }

    // Dead jobs only live in the dead-letter store.
    match dlq.get(&job_id).await? {
        Some(entry) => {
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entry)?),
                OutputFormat::Table => {
                    println!("Job {} is dead (in the dead-letter queue)", entry.id);
                    println!("Attempts:    {}/{}", entry.attempts, entry.max_retries);
                    if let Some(error) = &entry.last_error {
                        println!("Last error:  {}", error);
                    }
                }
            }
            Ok(())
        }
        None => Err(QueueError::JobNotFound(job_id)),
    }
}

async fn handle_start_workers(
    config: &QueueConfig,
    manager: QueueManager,
    executor: JobExecutor,
    poll: Option<u64>,
    workers: u64,
) -> Result<()> {
    let shutdown = install_shutdown_handler()?;
    let metrics = Arc::new(Metrics::new());

    if config.metrics_enabled {
        let reporter = MetricsReporter::new(config.metrics_interval());
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            reporter.run(metrics, shutdown).await;
        });
    }

    tracing::info!(
        workers,
        db_path = %config.db_path.display(),
        handlers = ?executor.registry().names(),
        "Starting workers"
    );

    let mut handles = Vec::new();
    for worker_id in 1..=workers {
        let mut worker = Worker::new(
            worker_id,
            manager.clone(),
            executor.clone(),
            config,
            metrics.clone(),
        );
        if let Some(secs) = poll {
            worker = worker.with_poll_interval(Duration::from_secs(secs));
        }
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            worker.run(shutdown).await;
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task ended abnormally");
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        processed = snapshot.processed,
        failed = snapshot.failed,
        avg_exec_time = snapshot.avg_exec_time,
        "All workers stopped"
    );
    Ok(())
}

async fn handle_dlq(dlq: &DeadLetterQueue, command: DlqCommands) -> Result<()> {
    match command {
        DlqCommands::List { output } => {
            let entries = dlq.list().await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                OutputFormat::Table => print_dead_letter_table(&entries),
            }
        }
        DlqCommands::Retry { id } => {
            if !dlq.retry(&id).await? {
                return Err(QueueError::JobNotFound(id));
            }
            println!("OK: job {} requeued", id);
        }
        DlqCommands::Purge => {
            let purged = dlq.purge().await?;
            println!("Purged {}", purged);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

async fn run(args: Args) -> Result<()> {
    let config = QueueConfig::load(&args.config)?;
    logging::init(&config)?;

    let workers = match &args.command {
        Commands::StartWorkers { workers, .. } => *workers,
        _ => 0,
    };
    let pool_size = u32::try_from(workers + 1).unwrap_or(u32::MAX);
    let store = JobStore::open(&config.db_path, pool_size).await?;

    let registry = Arc::new(builtin_registry());
    let manager = QueueManager::new(store.clone(), registry.clone(), config.max_retries);
    let dlq = DeadLetterQueue::new(store.clone());

    let result = match args.command {
        Commands::Enqueue {
            job,
            args,
            payload,
            dynamic,
            max_retries,
            output,
        } => handle_enqueue(&manager, job, args, payload, dynamic, max_retries, &output).await,
        Commands::List { state, output } => handle_list(&manager, state, &output).await,
        Commands::Status { job_id, output } => {
            handle_status(&manager, &dlq, job_id, &output).await
        }
        Commands::StartWorkers { poll, workers } => {
            let executor = JobExecutor::new(ExecutorConfig::default(), registry);
            handle_start_workers(&config, manager, executor, poll, workers).await
        }
        Commands::Dlq { command } => handle_dlq(&dlq, command).await,
    };

    store.close().await;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
