//! throttle-bench — push a burst of synthetic work through a bounded scheduler.
//!
//! Each top-level unit sleeps for `--work-ms`, optionally spawns `--children`
//! child units and waits on them from inside its worker loop (exercising the
//! inline path), then the final scheduler metrics are printed as JSON.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{info, warn};

use throttle_scheduler::{Scheduler, SchedulerConfig, SubstrateKind, UnitStatus};

// ── CLI ─────────────────────────────────────────────────────────────

/// Bounded-concurrency scheduler benchmark.
#[derive(Parser, Debug)]
#[command(name = "throttle-bench", version, about)]
struct Cli {
    /// Path to a scheduler TOML config (falls back to environment + defaults).
    #[arg(long, env = "THROTTLE_CONFIG")]
    config: Option<String>,

    /// Override the maximum degree of parallelism.
    #[arg(long)]
    degree: Option<usize>,

    /// Override the execution substrate: rayon, thread or tokio.
    #[arg(long)]
    substrate: Option<String>,

    /// Number of top-level units to submit.
    #[arg(long, default_value_t = 100)]
    units: usize,

    /// Simulated work per unit in milliseconds.
    #[arg(long, default_value_t = 5)]
    work_ms: u64,

    /// Child units each top-level unit spawns and waits on.
    #[arg(long, default_value_t = 0)]
    children: usize,

    /// Give up if the scheduler has not drained after this many seconds.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

fn load_config(cli: &Cli) -> anyhow::Result<SchedulerConfig> {
    let mut config = match &cli.config {
        Some(path) => match SchedulerConfig::from_file(path) {
            Ok(cfg) => {
                info!(path = %path, "loaded scheduler config");
                cfg
            }
            Err(e) => {
                warn!(error = %e, path = %path, "failed to load config, using environment");
                SchedulerConfig::from_env()?
            }
        },
        None => SchedulerConfig::from_env()?,
    };

    if let Some(degree) = cli.degree {
        config.max_degree_of_parallelism = degree;
    }
    if let Some(substrate) = &cli.substrate {
        config.substrate = substrate.parse()?;
    }
    config.validate()?;
    Ok(config)
}

// ── main ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    config.log_summary();

    // The tokio substrate hands worker loops to the ambient runtime.
    let runtime = match config.substrate {
        SubstrateKind::Tokio => Some(tokio::runtime::Runtime::new()?),
        _ => None,
    };
    let _enter = runtime.as_ref().map(|rt| rt.enter());

    let scheduler = Scheduler::from_config(&config)?;

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let work = Duration::from_millis(cli.work_ms);
    let children = cli.children;

    let started = Instant::now();
    let units: Vec<_> = (0..cli.units)
        .map(|i| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            scheduler.spawn(format!("unit-{i}"), move |ctx| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(work);
                running.fetch_sub(1, Ordering::SeqCst);

                let spawned: Vec<_> = (0..children)
                    .map(|j| {
                        ctx.scheduler().spawn(format!("unit-{i}-child-{j}"), move |_| {
                            std::thread::sleep(work);
                            Ok(())
                        })
                    })
                    .collect();
                for child in &spawned {
                    if let UnitStatus::Failed(e) = ctx.run_or_wait(child) {
                        anyhow::bail!("child {} failed: {}", child.name(), e);
                    }
                }
                Ok(())
            })
        })
        .collect();

    let timeout = Duration::from_secs(cli.timeout_secs);
    if !scheduler.wait_idle(timeout) {
        anyhow::bail!("scheduler did not drain within {:?}", timeout);
    }

    let failed = units
        .iter()
        .filter(|u| matches!(u.status(), UnitStatus::Failed(_)))
        .count();
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        units = units.len(),
        failed,
        peak_concurrency = peak.load(Ordering::SeqCst),
        "burst complete"
    );

    println!("{}", serde_json::to_string_pretty(&scheduler.metrics())?);
    Ok(())
}
