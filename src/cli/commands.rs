//! CLI command definitions for deferq.
//!
//! Every command connects to the configured store, performs one operation
//! and prints the result. `run` keeps the scheduler loop going until Ctrl+C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::{retention_from_secs, SchedulerConfig};
use crate::job::{CallableRef, JobOptions};
use crate::metrics;
use crate::scheduler::{
    ControlOutcome, PromotionReport, RequeueOutcome, ScheduledJob, Scheduler, SchedulerLoop,
};
use crate::store::{RedisStore, Store};

/// Lease-coordinated scheduler for deferred jobs.
#[derive(Parser)]
#[command(name = "deferq")]
#[command(about = "Schedule deferred jobs and promote them into execution queues")]
#[command(version)]
#[command(
    long_about = "deferq keeps deferred jobs in a Redis registry and promotes them into execution queues when they fall due.\n\nAny number of `deferq run` instances may point at the same Redis; a lease makes sure only one promotes at a time.\n\nExample usage:\n  deferq schedule app.jobs.sleep --args '[5]' --in 10m\n  deferq run --interval 5"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL (overrides the config file).
    #[arg(long, env = "DEFERQ_REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// YAML configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the scheduler loop.
    Run(RunArgs),

    /// Schedule a job.
    Schedule(ScheduleArgs),

    /// Cancel a scheduled or queued job.
    Cancel(JobArgs),

    /// Mark a running job as stopped.
    Stop(JobArgs),

    /// Run a finished or failed job again, or promote a scheduled one now.
    Requeue(JobArgs),

    /// Show a job record as JSON.
    Status(JobArgs),

    /// Remove a job from the registry and delete its record.
    Discard(JobArgs),

    /// List scheduled jobs, earliest first.
    List(ListArgs),

    /// Inspect or clear an execution queue.
    Queue(QueueArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Promote due jobs once and exit.
    #[arg(long)]
    pub burst: bool,

    /// Poll interval in seconds.
    #[arg(short, long)]
    pub interval: Option<u64>,

    /// Lease TTL in seconds (must exceed the poll interval).
    #[arg(long)]
    pub lease_ttl: Option<u64>,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Parser, Debug)]
pub struct ScheduleArgs {
    /// Function path handed to workers, e.g. `app.jobs.sleep`.
    pub func: String,

    /// Positional arguments as a JSON array.
    #[arg(long)]
    pub args: Option<String>,

    /// Keyword arguments as a JSON object.
    #[arg(long)]
    pub kwargs: Option<String>,

    /// Execution queue.
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Absolute due time (RFC 3339).
    #[arg(long, value_parser = parse_run_at, conflicts_with = "delay")]
    pub at: Option<DateTime<Utc>>,

    /// Relative due time, e.g. `90s`, `10m`, `2h`, `1d`.
    #[arg(long = "in", value_parser = parse_duration)]
    pub delay: Option<Duration>,

    /// Execution timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Seconds to keep a finished job (-1 keeps it forever).
    #[arg(long, allow_negative_numbers = true)]
    pub result_ttl: Option<i64>,

    /// Seconds to keep a failed job (-1 keeps it forever).
    #[arg(long, allow_negative_numbers = true)]
    pub failure_ttl: Option<i64>,

    #[arg(long)]
    pub description: Option<String>,

    /// Explicit job id.
    #[arg(long)]
    pub id: Option<String>,
}

#[derive(Parser, Debug)]
pub struct JobArgs {
    /// Job id.
    pub job_id: String,
}

#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Output as JSON.
    #[arg(short, long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct QueueArgs {
    /// Queue name.
    pub name: String,

    /// Drop every job id from the queue.
    #[arg(long)]
    pub clear: bool,
}

/// Parse command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the command.
///
/// For control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config =
        SchedulerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = cli.redis_url {
        config = config.with_redis_url(url);
    }

    match cli.command {
        Commands::Run(args) => run_loop_command(config, args).await,
        Commands::Schedule(args) => run_schedule_command(config, args).await,
        Commands::Cancel(args) => {
            let outcome = connect(&config).await?.cancel(&args.job_id).await?;
            print_control_outcome(&args.job_id, "cancelled", outcome);
            Ok(())
        }
        Commands::Stop(args) => {
            let outcome = connect(&config).await?.stop(&args.job_id).await?;
            print_control_outcome(&args.job_id, "stopped", outcome);
            Ok(())
        }
        Commands::Requeue(args) => {
            match connect(&config).await?.requeue(&args.job_id).await? {
                RequeueOutcome::Enqueued { job_id } => println!("{}", job_id),
                RequeueOutcome::Promoted => println!("{}: promoted", args.job_id),
                RequeueOutcome::Unchanged { current } => {
                    println!("{}: unchanged ({})", args.job_id, current)
                }
            }
            Ok(())
        }
        Commands::Status(args) => {
            let record = connect(&config)
                .await?
                .fetch(&args.job_id)
                .await?
                .with_context(|| format!("Job '{}' not found", args.job_id))?;
            println!("{}", serde_json::to_string_pretty(&record.to_json())?);
            Ok(())
        }
        Commands::Discard(args) => {
            if connect(&config).await?.discard(&args.job_id).await? {
                println!("{}: discarded", args.job_id);
            } else {
                println!("{}: not found", args.job_id);
            }
            Ok(())
        }
        Commands::List(args) => {
            let jobs = connect(&config).await?.scheduled_jobs().await?;
            if args.json {
                let listing: Vec<serde_json::Value> = jobs.iter().map(scheduled_job_json).collect();
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                for job in &jobs {
                    println!("{}", scheduled_job_line(job));
                }
            }
            Ok(())
        }
        Commands::Queue(args) => {
            let scheduler = connect(&config).await?;
            if args.clear {
                let count = scheduler.clear_queue(&args.name).await?;
                println!("{}: cleared {} job(s)", args.name, count);
            } else {
                let ids = scheduler.queues().job_ids(&args.name).await?;
                println!("{}: {} job(s)", args.name, ids.len());
                for id in ids {
                    println!("  {}", id);
                }
            }
            Ok(())
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn connect_store(config: &SchedulerConfig) -> anyhow::Result<Arc<dyn Store>> {
    let store = RedisStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to {}", config.redis_url))?;
    Ok(Arc::new(store))
}

async fn connect(config: &SchedulerConfig) -> anyhow::Result<Scheduler> {
    Ok(Scheduler::from_store(connect_store(config).await?, config))
}

async fn run_loop_command(mut config: SchedulerConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(secs) = args.interval {
        config = config.with_poll_interval(Duration::from_secs(secs));
    }
    if let Some(secs) = args.lease_ttl {
        config = config.with_lease_ttl(Duration::from_secs(secs));
    }
    config.validate()?;

    let store = connect_store(&config).await?;
    let runner = SchedulerLoop::from_store(store, &config);

    if args.burst {
        match runner.run_once().await? {
            Some(report) => print_report(&report),
            None => println!("Another scheduler holds the lease; nothing done"),
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let metrics_task = match args.metrics_addr {
        Some(addr) => {
            metrics::init_metrics()?;
            let mut stop = shutdown_tx.subscribe();
            Some(tokio::spawn(async move {
                metrics::server::serve(addr, async move {
                    let _ = stop.recv().await;
                })
                .await
            }))
        }
        None => None,
    };

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
        }
        let _ = signal_tx.send(());
    });

    runner.run(shutdown_rx).await?;

    if let Some(task) = metrics_task {
        let _ = shutdown_tx.send(());
        task.await?.context("Metrics server failed")?;
    }
    Ok(())
}

async fn run_schedule_command(config: SchedulerConfig, args: ScheduleArgs) -> anyhow::Result<()> {
    let callable = build_callable(&args)?;
    let options = build_options(&args);
    let scheduler = connect(&config).await?;

    let job_id = match (args.at, args.delay) {
        (Some(at), _) => scheduler.schedule(callable, at, options).await?,
        (None, Some(delay)) => scheduler.enqueue_in(delay, callable, options).await?,
        (None, None) => {
            let record = options.build(callable, scheduler.defaults());
            scheduler.enqueue_now(record).await?
        }
    };
    println!("{}", job_id);
    Ok(())
}

fn build_callable(args: &ScheduleArgs) -> anyhow::Result<CallableRef> {
    let mut callable = CallableRef::new(args.func.clone());
    if let Some(raw) = &args.args {
        callable.args = serde_json::from_str(raw).context("--args must be a JSON array")?;
    }
    if let Some(raw) = &args.kwargs {
        callable.kwargs = serde_json::from_str(raw).context("--kwargs must be a JSON object")?;
    }
    Ok(callable)
}

fn build_options(args: &ScheduleArgs) -> JobOptions {
    JobOptions {
        id: args.id.clone(),
        queue: args.queue.clone(),
        timeout: args.timeout.map(Duration::from_secs),
        result_ttl: args.result_ttl.map(retention_from_secs),
        failure_ttl: args.failure_ttl.map(retention_from_secs),
        description: args.description.clone(),
        meta: serde_json::Map::new(),
    }
}

fn print_control_outcome(job_id: &str, verb: &str, outcome: ControlOutcome) {
    match outcome {
        ControlOutcome::Applied => println!("{}: {}", job_id, verb),
        ControlOutcome::Unchanged { current } => {
            println!("{}: unchanged, already {}", job_id, current)
        }
    }
}

fn print_report(report: &PromotionReport) {
    println!("Promoted:     {}", report.promoted.len());
    println!("Stale:        {}", report.stale_removed.len());
    println!("Unpromotable: {}", report.unpromotable.len());
    for id in &report.unpromotable {
        println!("  {}", id);
    }
}

fn scheduled_job_line(job: &ScheduledJob) -> String {
    let due_at = job.entry.due_at.to_rfc3339();
    match &job.record {
        Ok(record) => format!(
            "{}  {}  {}  {}",
            due_at, job.entry.job_id, record.origin, record.description
        ),
        Err(e) => format!("{}  {}  UNREADABLE  {}", due_at, job.entry.job_id, e),
    }
}

fn scheduled_job_json(job: &ScheduledJob) -> serde_json::Value {
    let (record, error) = match &job.record {
        Ok(record) => (record.to_json(), serde_json::Value::Null),
        Err(e) => (serde_json::Value::Null, serde_json::Value::from(e.to_string())),
    };
    serde_json::json!({
        "job_id": job.entry.job_id,
        "due_at": job.entry.due_at.to_rfc3339(),
        "job": record,
        "error": error,
    })
}

fn parse_run_at(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {}", e))
}

/// Parses `90`, `90s`, `10m`, `2h` or `1d`.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", raw))?;
    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        other => return Err(format!("unknown duration unit '{}'", other)),
    };
    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{}' is too large", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::registry::DueEntry;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["deferq", "run"]).expect("should parse");

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run(args) => {
                assert!(!args.burst);
                assert!(args.interval.is_none());
                assert!(args.metrics_addr.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_command_with_options() {
        let cli = Cli::try_parse_from([
            "deferq",
            "--log-level",
            "debug",
            "run",
            "--burst",
            "-i",
            "5",
            "--lease-ttl",
            "20",
            "--metrics-addr",
            "127.0.0.1:9100",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert!(args.burst);
                assert_eq!(args.interval, Some(5));
                assert_eq!(args.lease_ttl, Some(20));
                assert_eq!(
                    args.metrics_addr,
                    Some("127.0.0.1:9100".parse().expect("addr"))
                );
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_schedule_command() {
        let cli = Cli::try_parse_from([
            "deferq",
            "schedule",
            "app.jobs.sleep",
            "--args",
            "[5]",
            "--kwargs",
            "{\"verbose\": true}",
            "-q",
            "paper:default",
            "--in",
            "10m",
            "--result-ttl",
            "-1",
            "--id",
            "nightly",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Schedule(args) => {
                assert_eq!(args.delay, Some(Duration::from_secs(600)));
                assert!(args.at.is_none());

                let callable = build_callable(&args).expect("valid json");
                assert_eq!(callable.args, vec![serde_json::json!(5)]);
                assert_eq!(callable.kwargs.get("verbose"), Some(&serde_json::json!(true)));

                let options = build_options(&args);
                assert_eq!(options.queue.as_deref(), Some("paper:default"));
                assert_eq!(options.result_ttl, Some(None));
                assert_eq!(options.failure_ttl, None);
                assert_eq!(options.id.as_deref(), Some("nightly"));
            }
            _ => panic!("Expected Schedule command"),
        }
    }

    #[test]
    fn test_schedule_at_and_in_conflict() {
        let result = Cli::try_parse_from([
            "deferq",
            "schedule",
            "app.jobs.sleep",
            "--at",
            "2030-01-01T00:00:00Z",
            "--in",
            "5m",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_schedule_bad_args_json() {
        let cli = Cli::try_parse_from(["deferq", "schedule", "app.jobs.sleep", "--args", "{}"])
            .expect("should parse");
        match cli.command {
            Commands::Schedule(args) => assert!(build_callable(&args).is_err()),
            _ => panic!("Expected Schedule command"),
        }
    }

    #[test]
    fn test_job_commands() {
        for name in ["cancel", "stop", "requeue", "status", "discard"] {
            let cli = Cli::try_parse_from(["deferq", name, "abc"]).expect("should parse");
            let job_id = match cli.command {
                Commands::Cancel(args)
                | Commands::Stop(args)
                | Commands::Requeue(args)
                | Commands::Status(args)
                | Commands::Discard(args) => args.job_id,
                _ => panic!("Expected a job command"),
            };
            assert_eq!(job_id, "abc");
        }
    }

    #[test]
    fn test_queue_and_list_commands() {
        let cli = Cli::try_parse_from(["deferq", "queue", "default", "--clear"])
            .expect("should parse");
        match cli.command {
            Commands::Queue(args) => {
                assert_eq!(args.name, "default");
                assert!(args.clear);
            }
            _ => panic!("Expected Queue command"),
        }

        let cli = Cli::try_parse_from(["deferq", "list", "--json"]).expect("should parse");
        assert!(matches!(cli.command, Commands::List(ListArgs { json: true })));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("90s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("10m"), Ok(Duration::from_secs(600)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1d"), Ok(Duration::from_secs(86_400)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5w").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn test_parse_run_at() {
        let at = parse_run_at("2030-01-01T12:00:00+02:00").expect("valid");
        assert_eq!(at.to_rfc3339(), "2030-01-01T10:00:00+00:00");
        assert!(parse_run_at("tomorrow").is_err());
    }

    #[test]
    fn test_unreadable_listing_line() {
        let job = ScheduledJob {
            entry: DueEntry {
                job_id: "abc".to_string(),
                due_at: Utc::now(),
            },
            record: Err(JobError::Deserialization {
                job_id: "abc".to_string(),
                reason: "bad data".to_string(),
            }),
        };
        assert!(scheduled_job_line(&job).contains("UNREADABLE"));

        let value = scheduled_job_json(&job);
        assert!(value["job"].is_null());
        assert!(value["error"]
            .as_str()
            .expect("error string")
            .contains("bad data"));
    }
}
