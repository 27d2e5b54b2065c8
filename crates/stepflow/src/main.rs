//! `stepflow` command line: inspect backoff schedules and run a demo workflow.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use stepflow::{
    calculate_delay,
    config::Config,
    from_fn, metrics, retry, timeout, BackoffConfig, Error, JitterConfig, JitterKind, ThreadRandom,
    Workflow,
};

#[derive(Parser)]
#[command(author, version, about = "Durable-step workflow executor", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error). Overrides LOG_LEVEL.
    #[arg(short, long)]
    log_level: Option<String>,

    /// YAML configuration file. Environment variables are used when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the delay before each retry for a backoff policy
    Delays {
        /// Policy kind; falls back to the configured retry.backoff
        #[arg(short, long, value_enum)]
        kind: Option<BackoffKind>,

        /// Base (exponential), initial (linear) or fixed (constant) delay in ms
        #[arg(short, long, default_value_t = 1000)]
        base_ms: u64,

        /// Exponential growth factor
        #[arg(short, long, default_value_t = 2.0)]
        factor: f64,

        /// Linear increment in ms, defaults to the base
        #[arg(long)]
        increment_ms: Option<u64>,

        /// Cap applied before jitter, in ms
        #[arg(short, long)]
        max_ms: Option<u64>,

        /// Jitter strategy (full, equal, decorrelated)
        #[arg(short, long)]
        jitter: Option<String>,

        /// Number of retries to print
        #[arg(short, long, default_value_t = 8)]
        retries: u32,
    },

    /// Run a sample workflow with flaky and slow steps under retry and timeout
    Demo {
        /// Failures the fetch step produces before succeeding
        #[arg(long, default_value_t = 2)]
        fail_times: u32,

        /// How long the first transform attempt hangs, in ms
        #[arg(long, default_value_t = 500)]
        slow_ms: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BackoffKind {
    Exponential,
    Linear,
    Constant,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_yaml_file(path)?,
        None => Config::load()?,
    };

    // Initialize logging
    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    let log_filter = format!("stepflow={},info", level);
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_filter))
        .init();

    metrics::register_metrics()?;
    info!("Loaded configuration: {:?}", config);

    match cli.command {
        Commands::Delays {
            kind,
            base_ms,
            factor,
            increment_ms,
            max_ms,
            jitter,
            retries,
        } => {
            let policy = match kind {
                Some(kind) => build_policy(kind, base_ms, factor, increment_ms, max_ms, jitter.as_deref())?,
                None => config
                    .retry
                    .backoff
                    .clone()
                    .ok_or_else(|| anyhow!("no backoff policy: pass --kind or configure retry.backoff"))?,
            };
            print_delays(&policy, retries)?;
        }
        Commands::Demo { fail_times, slow_ms } => {
            run_demo(&config, fail_times, Duration::from_millis(slow_ms)).await?;
        }
    }

    Ok(())
}

fn build_policy(
    kind: BackoffKind,
    base_ms: u64,
    factor: f64,
    increment_ms: Option<u64>,
    max_ms: Option<u64>,
    jitter: Option<&str>,
) -> Result<BackoffConfig> {
    let base = Duration::from_millis(base_ms);
    let mut policy = match kind {
        BackoffKind::Exponential => BackoffConfig::Exponential {
            base,
            factor,
            max: None,
            jitter: None,
        },
        BackoffKind::Linear => {
            BackoffConfig::linear(base, increment_ms.map(Duration::from_millis).unwrap_or(base))
        }
        BackoffKind::Constant => BackoffConfig::constant(base),
    };
    if let Some(max_ms) = max_ms {
        policy = policy.with_max(Duration::from_millis(max_ms));
    }
    if let Some(jitter) = jitter {
        let kind: JitterKind = jitter.parse()?;
        policy = policy.with_jitter(JitterConfig::new(kind));
    }
    Ok(policy)
}

fn print_delays(policy: &BackoffConfig, retries: u32) -> Result<()> {
    policy.validate()?;
    println!("{}", serde_yaml::to_string(policy)?);
    for retry in 0..retries {
        let delay = calculate_delay(policy, retry, &ThreadRandom);
        println!("retry {:>3}: {:?}", retry + 1, delay);
    }
    Ok(())
}

async fn run_demo(config: &Config, fail_times: u32, slow: Duration) -> Result<()> {
    let mut options = config.retry.to_options();
    if options.delay.is_none() {
        options = options.with_backoff(
            BackoffConfig::exponential(Duration::from_millis(50))
                .with_max(Duration::from_secs(1))
                .with_jitter(JitterConfig::new(JitterKind::Full)),
        );
    }
    let deadline = config.retry.timeout.unwrap_or(Duration::from_millis(200));

    let workflow = Workflow::<u32, String>::make("demo", move |ctx, fail_times| {
        let options = options.clone();
        Box::pin(async move {
            let fetches = Arc::new(AtomicU32::new(0));
            let fetch = from_fn(move || {
                let fetches = fetches.clone();
                async move {
                    let n = fetches.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= fail_times {
                        warn!("fetch attempt {} hit a simulated outage", n);
                        Err(Error::from(anyhow!("upstream unavailable")))
                    } else {
                        Ok(vec![42u64, 7, 19])
                    }
                }
            });
            let records = ctx.step("fetch", retry(options.clone(), fetch)).await?;

            let transforms = Arc::new(AtomicU32::new(0));
            let transform = from_fn(move || {
                let transforms = transforms.clone();
                let mut records = records.clone();
                async move {
                    if transforms.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(slow).await;
                    }
                    records.sort_unstable();
                    Ok::<_, Error>(records)
                }
            });
            let sorted = ctx
                .step("transform", retry(options, timeout(deadline, transform)))
                .await?;

            let summary = format!("published {} records: {:?}", sorted.len(), sorted);
            let message = summary.clone();
            ctx.step_fn("publish", move || {
                let message = message.clone();
                async move {
                    info!("{}", message);
                    Ok::<_, Error>(())
                }
            })
            .await?;

            Ok::<_, Error>(summary)
        })
    });

    let (report, result) = workflow.run_with_report(fail_times).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    match result {
        Ok(summary) => println!("{}", summary),
        Err(e) => println!("workflow failed: {}", e),
    }
    print!("{}", metrics::gather_metrics()?);
    Ok(())
}
