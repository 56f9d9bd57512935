//! affinity CLI: exercise the affinity scheduler against a live host thread.

use affinity_sched::config::Config;
use affinity_sched::telemetry::{TelemetryConfig, init_telemetry};
use affinity_sched::{AffinityThread, SchedulerFactory, TaskQueue};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Parser)]
#[command(name = "affinity", about = "Single-thread affinity task scheduler")]
struct Cli {
    /// TOML config file; environment variables are used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ordering scenario and a concurrent-producer load
    Demo {
        /// Producer tasks submitting from off the affinity thread
        #[arg(long, default_value_t = 4)]
        producers: usize,
        /// Tasks submitted by each producer
        #[arg(long, default_value_t = 50)]
        tasks: usize,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Config => {
            println!("thread_name:       {}", config.thread_name);
            println!("yields_per_switch: {}", config.yields_per_switch);
            println!(
                "otel_endpoint:     {}",
                config.otel_endpoint.as_deref().unwrap_or("-")
            );
            println!("log_level:         {}", config.log_level);
            Ok(())
        }
        Command::Demo { producers, tasks } => cmd_demo(config, producers, tasks).await,
    }
}

async fn cmd_demo(config: Config, producers: usize, tasks: usize) -> anyhow::Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "affinity-demo".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    // The factory exists before the affinity thread does.
    let host = Arc::new(AffinityThread::new(config.thread_config()));
    let factory = SchedulerFactory::new(host.clone());
    let queue = Arc::new(factory.create_queue());
    host.start()?;

    let log = ordering_scenario(&host, &queue).await?;
    println!("execution log: {}", log.join(" "));

    let max_seen = producer_load(&queue, producers, tasks).await?;
    println!(
        "{} tasks from {producers} producers, max concurrent bodies: {max_seen}",
        producers * tasks
    );

    factory.wait_idle().await;
    host.shutdown();
    anyhow::ensure!(max_seen == 1, "observed {max_seen} concurrent task bodies");
    Ok(())
}

/// A, B and C submitted on the affinity thread while D arrives from outside.
async fn ordering_scenario(
    host: &Arc<AffinityThread>,
    queue: &Arc<TaskQueue>,
) -> anyhow::Result<Vec<String>> {
    let log = Arc::new(Mutex::new(Vec::new()));

    let d = {
        let log = Arc::clone(&log);
        queue.schedule_action("D", None, move || {
            log.lock().map_err(|_| anyhow::anyhow!("log poisoned"))?.push("D".to_string());
            Ok(())
        })?
    };

    let affine = {
        let host = Arc::clone(host);
        let queue = Arc::clone(queue);
        let log = Arc::clone(&log);
        tokio::task::spawn_blocking(move || {
            host.invoke(move || -> affinity_sched::Result<()> {
                for name in ["A", "B", "C"] {
                    let log = Arc::clone(&log);
                    let handle = queue.schedule_action(name, None, move || {
                        log.lock()
                            .map_err(|_| anyhow::anyhow!("log poisoned"))?
                            .push(name.to_string());
                        Ok(())
                    })?;
                    // Ran inline, so this cannot deadlock.
                    if let Err(e) = handle.wait() {
                        tracing::warn!(task = name, error = %e, "affine task failed");
                    }
                }
                Ok(())
            })
        })
    };
    affine.await???;
    d.await?;

    let entries = log
        .lock()
        .map_err(|_| anyhow::anyhow!("log poisoned"))?
        .clone();
    Ok(entries)
}

async fn producer_load(
    queue: &Arc<TaskQueue>,
    producers: usize,
    tasks: usize,
) -> anyhow::Result<usize> {
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut joins = Vec::with_capacity(producers);
    for p in 0..producers {
        let queue = Arc::clone(queue);
        let active = Arc::clone(&active);
        let max_seen = Arc::clone(&max_seen);
        joins.push(tokio::spawn(async move {
            let mut handles = Vec::with_capacity(tasks);
            for t in 0..tasks {
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                handles.push(queue.schedule_fn(&format!("p{p}-t{t}"), None, move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::yield_now();
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(t)
                })?);
            }
            for handle in handles {
                handle.await?;
            }
            anyhow::Ok(())
        }));
    }
    for join in joins {
        join.await??;
    }

    Ok(max_seen.load(Ordering::SeqCst))
}
