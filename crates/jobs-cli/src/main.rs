//! `jobs` - run, check and feed job pipelines from a TOML config.

mod config;
mod container;
mod executor;
mod telemetry;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use jobs_core::impls::DefaultBrokerFactory;
use jobs_core::ports::BrokerFactory;
use jobs_core::{JobQueueService, PipelineName, PushOptions, WorkerExecutor};

use crate::config::AppConfig;
use crate::container::{Container, JobsService, StatsReporter};
use crate::executor::CommandExecutor;

#[derive(Parser)]
#[command(name = "jobs", version, about = "Job pipelines over AMQP, SQS, beanstalkd or in-process queues")]
struct Cli {
    /// Config file
    #[arg(short, long, env = "JOBS_CONFIG", default_value = "jobs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume every pipeline until ctrl-c
    Serve,
    /// Build each pipeline's broker and run its connection check
    Check,
    /// Push one job
    Push(PushArgs),
    /// Print pipeline stats as JSON
    Stat {
        /// Only this pipeline
        pipeline: Option<String>,
    },
}

#[derive(clap::Args)]
struct PushArgs {
    pipeline: String,

    /// Handler name carried with the job
    #[arg(long)]
    name: Option<String>,

    /// Payload text (reads --file when omitted)
    payload: Option<String>,

    #[arg(long, conflicts_with = "payload")]
    file: Option<PathBuf>,

    /// e.g. `30s`, `5m`
    #[arg(long, value_parser = parse_duration)]
    delay: Option<Duration>,

    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(long)]
    dead_letter: Option<String>,

    /// `key=value`, repeatable
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(raw).map_err(|e| e.to_string())
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;
    telemetry::init(&config.log);

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Check => check(config).await,
        Command::Push(args) => push(config, args).await,
        Command::Stat { pipeline } => stat(config, pipeline).await,
    }
}

async fn build(config: &AppConfig, executor: Arc<dyn WorkerExecutor>) -> anyhow::Result<Arc<JobQueueService>> {
    let service = JobQueueService::builder(config.jobs.clone())
        .executor(executor)
        .build()
        .await
        .context("building jobs service")?;
    Ok(Arc::new(service))
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    if config.worker.command.is_empty() {
        bail!("worker.command must name the program that handles jobs");
    }
    let executor = Arc::new(CommandExecutor::new(config.worker.clone()));
    let jobs = build(&config, executor).await?;

    let container = Container::new()
        .with(Arc::new(JobsService::new(Arc::clone(&jobs))))
        .with(Arc::new(StatsReporter::new(Arc::clone(&jobs), config.log.stats_interval)));
    container.serve().await?;
    tracing::info!(pipelines = jobs.pipelines().await.len(), "serving");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");
    container.stop().await;
    Ok(())
}

async fn check(config: AppConfig) -> anyhow::Result<()> {
    config.jobs.validate()?;
    let factory = DefaultBrokerFactory::default();
    let mut failed = 0;
    for pipeline in &config.jobs.pipelines {
        let result = match factory.build(pipeline).await {
            Ok(broker) => {
                let checked = broker.check().await;
                let _ = broker.stop().await;
                checked
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => println!("ok    {} ({})", pipeline.name, pipeline.driver.name()),
            Err(err) if pipeline.optional => {
                println!("warn  {} ({}): {err}", pipeline.name, pipeline.driver.name())
            }
            Err(err) => {
                failed += 1;
                println!("FAIL  {} ({}): {err}", pipeline.name, pipeline.driver.name());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} required pipeline(s) failed their check");
    }
    Ok(())
}

async fn push(config: AppConfig, args: PushArgs) -> anyhow::Result<()> {
    let payload = match (args.payload, &args.file) {
        (Some(text), _) => text.into_bytes(),
        (None, Some(path)) => std::fs::read(path)
            .with_context(|| format!("reading payload from {}", path.display()))?,
        (None, None) => bail!("give a payload or --file"),
    };

    let mut options = PushOptions::new();
    options.name = args.name;
    options.delay = args.delay;
    options.max_attempts = args.max_attempts;
    options.dead_letter = args.dead_letter.map(PipelineName::new);
    options.headers = args.headers.into_iter().collect::<BTreeMap<_, _>>();

    let jobs = build(&config, Arc::new(CommandExecutor::new(config.worker.clone()))).await?;
    let pipeline = PipelineName::new(args.pipeline);
    let id = jobs
        .push(&pipeline, payload, options)
        .await
        .with_context(|| format!("pushing to `{pipeline}`"))?;
    jobs.stop().await;
    println!("{id}");
    Ok(())
}

async fn stat(config: AppConfig, pipeline: Option<String>) -> anyhow::Result<()> {
    let jobs = build(&config, Arc::new(CommandExecutor::new(config.worker.clone()))).await?;
    let stats = match pipeline {
        Some(name) => vec![jobs.stat_pipeline(&PipelineName::new(name)).await?],
        None => jobs.stat().await,
    };
    jobs.stop().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
