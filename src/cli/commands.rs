//! CLI command definitions for pool-forge.
//!
//! `validate` checks a topology file; `run` spawns its pools and pushes a
//! JSONL file of tasks through the manager, the dead-letter queue and the
//! aggregator.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::aggregator::MemoryAggregator;
use crate::config::{OrchestratorConfig, Topology};
use crate::dlq::{DeadLetterQueue, RetryPolicy};
use crate::events::{BroadcastEventSink, SharedEventSink};
use crate::manager::{PoolManager, RoutingStrategy, Submission, SubmissionOutcome};
use crate::metrics::{export_metrics, init_metrics};
use crate::pool::Pool;
use crate::sinks::{
    DurableSink, InMemoryDurableSink, SqliteDurableSink, TracingAnalyticsSink,
};
use crate::task::Task;

/// Worker-pool orchestrator.
#[derive(Parser)]
#[command(name = "pool-forge")]
#[command(about = "Route tasks across worker pools with dead-letter retries and result aggregation")]
#[command(version)]
#[command(
    long_about = "pool-forge spawns the pools declared in a topology file, routes tasks to healthy pools, retries failures through a dead-letter queue and syncs collected results to a durable store.\n\nExample usage:\n  pool-forge validate topology.yaml\n  pool-forge run topology.yaml --tasks tasks.jsonl --drain-secs 30"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Parse and validate a topology file, then print its pools.
    Validate(ValidateArgs),

    /// Spawn a topology and execute a JSONL file of tasks.
    Run(RunArgs),
}

#[derive(clap::Args)]
pub struct ValidateArgs {
    /// Topology YAML file.
    pub topology: PathBuf,
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// Topology YAML file.
    pub topology: PathBuf,

    /// JSONL file, one task per line.
    #[arg(short, long)]
    pub tasks: PathBuf,

    /// Routing strategy, overriding the topology and environment.
    #[arg(long)]
    pub strategy: Option<RoutingStrategy>,

    /// Retry policy for failed tasks without one of their own.
    #[arg(long)]
    pub retry_policy: Option<RetryPolicy>,

    /// Retry budget for failed tasks without one of their own.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Seconds to keep the retry processor running after submission.
    #[arg(long, default_value = "0")]
    pub drain_secs: u64,

    /// SQLite database for collected results; in-memory when omitted.
    #[arg(long, env = "POOL_FORGE_DATABASE_URL")]
    pub database: Option<String>,

    /// Query the synced results before shutting down.
    #[arg(long)]
    pub search: Option<String>,

    /// Write Prometheus metrics to this file on exit.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}

/// One line of a tasks file.
#[derive(Debug, Deserialize)]
struct TaskLine {
    payload: serde_json::Value,
    #[serde(default)]
    target_pools: Vec<String>,
    #[serde(default)]
    affinity: BTreeSet<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    max_retries: Option<u32>,
}

impl TaskLine {
    fn into_submission(self, default_policy: Option<RetryPolicy>, default_retries: Option<u32>) -> Submission {
        let mut task = Task::new(self.payload);
        task.affinity = self.affinity;
        task.timeout_ms = self.timeout_ms;

        Submission {
            task,
            target_pools_hint: self.target_pools,
            retry_policy: self.retry_policy.or(default_policy),
            max_retries: self.max_retries.or(default_retries),
            mode: Default::default(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct SubmissionTally {
    completed: usize,
    queued_for_retry: usize,
    rejected: usize,
}

/// Parse command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Validate(args) => run_validate_command(args),
        Commands::Run(args) => run_run_command(args).await,
    }
}

fn run_validate_command(args: ValidateArgs) -> anyhow::Result<()> {
    let topology = Topology::from_file(&args.topology)?;
    let config = OrchestratorConfig::from_env()?;

    let strategy = topology
        .routing_strategy
        .unwrap_or(config.manager.routing_strategy);
    println!("Topology {} is valid", args.topology.display());
    println!("Routing strategy: {}", strategy);
    println!();
    println!("{:<24} {:<10} {:>4} {:>4}  TAGS / ENDPOINT", "POOL", "KIND", "MIN", "MAX");
    for spec in &topology.pools {
        let tags = spec.tags.iter().cloned().collect::<Vec<_>>().join(",");
        let endpoint = spec.endpoint.as_deref().unwrap_or("-");
        println!(
            "{:<24} {:<10} {:>4} {:>4}  [{}] {}",
            spec.name,
            spec.kind.to_string(),
            spec.min_workers,
            spec.max_workers,
            tags,
            endpoint
        );
    }
    Ok(())
}

fn load_task_lines(path: &Path) -> anyhow::Result<Vec<TaskLine>> {
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read tasks file {}: {}", path.display(), e))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| {
                anyhow::anyhow!("{}:{}: invalid task line: {}", path.display(), index + 1, e)
            })
        })
        .collect()
}

/// Forwards events to the log at debug level.
fn spawn_event_logger(sink: &BroadcastEventSink) {
    let mut stream = sink.stream();
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => debug!(
                    event_type = %event.event_type,
                    entity_id = %event.entity_id,
                    payload = %event.payload,
                    "Event"
                ),
                Err(e) => warn!(error = %e, "Event logger lagged"),
            }
        }
    });
}

async fn open_durable_sink(database: Option<&str>) -> anyhow::Result<Arc<dyn DurableSink>> {
    let sink: Arc<dyn DurableSink> = match database {
        Some(url) if url.starts_with("sqlite:") => Arc::new(SqliteDurableSink::connect(url).await?),
        Some(path) => Arc::new(SqliteDurableSink::open(Path::new(path)).await?),
        None => {
            info!("No database configured, keeping results in memory");
            Arc::new(InMemoryDurableSink::new())
        }
    };
    Ok(sink)
}

async fn run_run_command(args: RunArgs) -> anyhow::Result<()> {
    let topology = Topology::from_file(&args.topology)?;
    let lines = load_task_lines(&args.tasks)?;

    let mut config = OrchestratorConfig::from_env()?;
    if let Some(strategy) = args.strategy.or(topology.routing_strategy) {
        config.manager.routing_strategy = strategy;
    }
    if let Some(database) = args.database.clone() {
        config.database_url = Some(database);
    }

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registry unavailable");
    }

    let broadcast = BroadcastEventSink::new();
    spawn_event_logger(&broadcast);
    let events: SharedEventSink = Arc::new(broadcast);

    let dlq = Arc::new(DeadLetterQueue::new(config.dlq.clone(), events.clone()));
    let manager = Arc::new(
        PoolManager::new(config.manager.clone(), events.clone()).with_dead_letter_queue(dlq.clone()),
    );

    for spec in &topology.pools {
        let pool = Pool::spawn(spec.pool_config(), spec.build_backend()?, events.clone()).await?;
        manager.register(pool)?;
    }
    manager.start_monitors();
    info!(pools = topology.pools.len(), tasks = lines.len(), strategy = %manager.strategy(), "Topology running");

    let submissions = lines
        .into_iter()
        .map(|line| line.into_submission(args.retry_policy, args.max_retries));
    let outcomes = join_all(submissions.map(|submission| manager.submit(submission))).await;

    let mut tally = SubmissionTally::default();
    for outcome in outcomes {
        match outcome {
            Ok(SubmissionOutcome::Completed(_)) => tally.completed += 1,
            Ok(SubmissionOutcome::QueuedForRetry { .. }) => tally.queued_for_retry += 1,
            Ok(SubmissionOutcome::Accepted { .. }) => {}
            Err(e) => {
                warn!(error = %e, "Submission rejected");
                tally.rejected += 1;
            }
        }
    }

    if args.drain_secs > 0 && tally.queued_for_retry > 0 {
        manager.start_retry_processor()?;
        tokio::time::sleep(Duration::from_secs(args.drain_secs)).await;
        dlq.stop_processor().await;
    }

    let durable = open_durable_sink(config.database_url.as_deref()).await?;
    let aggregator = MemoryAggregator::new(
        manager.clone(),
        durable,
        Arc::new(TracingAnalyticsSink::new()),
        config.aggregator.clone(),
        events.clone(),
    );
    let sync = aggregator.collect_and_sync().await;

    let search = match &args.search {
        Some(query) => Some(aggregator.cross_pool_search(query, 10).await?),
        None => None,
    };

    let health = manager.health_all().await;
    manager.close_all().await;

    if let Some(path) = &args.metrics_out {
        fs::write(path, export_metrics())?;
    }

    let summary = json!({
        "submissions": tally,
        "pools": health,
        "dead_letter": dlq.stats(),
        "sync": sync,
        "search": search,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_args() {
        let cli = Cli::try_parse_from([
            "pool-forge",
            "run",
            "topology.yaml",
            "--tasks",
            "tasks.jsonl",
            "--strategy",
            "round_robin",
            "--retry-policy",
            "immediate",
            "--drain-secs",
            "5",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.strategy, Some(RoutingStrategy::RoundRobin));
        assert_eq!(args.retry_policy, Some(RetryPolicy::Immediate));
        assert_eq!(args.drain_secs, 5);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_load_task_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        fs::write(
            &path,
            "{\"payload\": {\"command\": \"echo a\"}}\n\n{\"payload\": {\"command\": \"echo b\"}, \"affinity\": [\"gpu\"], \"retry_policy\": \"never\"}\n",
        )
        .unwrap();

        let lines = load_task_lines(&path).unwrap();
        assert_eq!(lines.len(), 2);

        let submission = lines
            .into_iter()
            .nth(1)
            .unwrap()
            .into_submission(Some(RetryPolicy::Linear), Some(2));
        assert!(submission.task.affinity.contains("gpu"));
        assert_eq!(submission.retry_policy, Some(RetryPolicy::Never));
        assert_eq!(submission.max_retries, Some(2));
    }

    #[test]
    fn test_load_task_lines_reports_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        fs::write(&path, "{\"payload\": 1}\nnot json\n").unwrap();

        let err = load_task_lines(&path).unwrap_err().to_string();
        assert!(err.contains(":2:"), "{}", err);
    }
}
