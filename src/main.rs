use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{error, info};

use promptpulse::config::Config;
use promptpulse::core::engine::{CronSupervisor, Executor, Governor, RetryPolicy, ScheduleRunner};
use promptpulse::core::llm::{Registry, registry};
use promptpulse::core::models::Temperature;
use promptpulse::core::store::{Database, HybridStore};
use promptpulse::logging;

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(e) = run().await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn print_help() {
    println!("promptpulse: cron-driven prompt execution engine\n");
    println!("Usage: promptpulse [command] [--config <path>] [--temperature <t>]\n");
    println!("Commands:");
    println!("  scheduler    Run the cron supervisor until interrupted (default)");
    println!("  run          Execute all enabled prompts against all enabled LLMs once");
    println!("  help         Show this help");
}

struct Args {
    command: String,
    config_path: String,
    temperature: Temperature,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut command = "scheduler".to_string();
    let mut config_path = "promptpulse.yaml".to_string();
    let mut temperature = Temperature::Fixed(0.7);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                let Some(value) = args.get(i + 1) else {
                    bail!("--config requires a path");
                };
                config_path = value.clone();
                i += 2;
            }
            "--temperature" | "-t" => {
                let Some(value) = args.get(i + 1) else {
                    bail!("--temperature requires a value");
                };
                let parsed: f64 = value
                    .parse()
                    .with_context(|| format!("invalid temperature: {value}"))?;
                temperature = Temperature::from_stored(parsed)
                    .map_err(|e| anyhow::anyhow!(e))?;
                i += 2;
            }
            other if !other.starts_with('-') => {
                command = other.to_string();
                i += 1;
            }
            other => bail!("unknown flag: {other}"),
        }
    }

    Ok(Args {
        command,
        config_path,
        temperature,
    })
}

async fn run() -> Result<()> {
    let args = parse_args(&std::env::args().collect::<Vec<_>>())?;

    if args.command == "help" {
        print_help();
        return Ok(());
    }

    let config = if std::path::Path::new(&args.config_path).exists() {
        Config::load(&args.config_path)?
    } else {
        info!("No config file at {}, using defaults", args.config_path);
        Config::default()
    };

    let store: Arc<dyn Database> = Arc::new(HybridStore::new(&config));
    store.connect().await?;

    let provider_registry = Arc::new(Registry::new());
    registry::bootstrap(&provider_registry, store.as_ref()).await?;

    let governor = Arc::new(Governor::new());
    let executor = Arc::new(Executor::new(
        store.clone(),
        provider_registry,
        governor,
        RetryPolicy::default(),
    ));
    let runner = Arc::new(ScheduleRunner::new(store.clone(), executor));

    match args.command.as_str() {
        "scheduler" => run_scheduler(store.clone(), runner).await?,
        "run" => {
            let cancel = tokio_util::sync::CancellationToken::new();
            runner.run_once(&cancel, args.temperature).await?;
        }
        other => {
            print_help();
            bail!("unknown command: {other}");
        }
    }

    store.disconnect().await?;
    Ok(())
}

async fn run_scheduler(store: Arc<dyn Database>, runner: Arc<ScheduleRunner>) -> Result<()> {
    let supervisor = CronSupervisor::new(store, runner);
    supervisor.start().await?;

    info!("Scheduler is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Stopping scheduler...");
    supervisor.stop().await?;
    Ok(())
}
