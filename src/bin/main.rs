use anyhow::Context;
use clap::{Parser, Subcommand};
use netpulse::history::{JsonFileStore, ResultHistory, TestRecord};
use netpulse::reporter::{
    format_latency, format_session, format_summary, run_reporter_task, Reporter,
};
use netpulse::{
    Config, HttpTransport, LatencyProber, MonitoringManager, ProgressEvent, TestOrchestrator,
    TestServer,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "netpulse")]
#[command(about = "Measure latency, throughput, jitter and packet loss, once or continuously", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Base URL of the measurement endpoint
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Output in JSON format
    #[arg(short = 'J', long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full latency, download and upload test
    Test {
        /// Number of parallel connections
        #[arg(short = 'P', long)]
        parallel: Option<usize>,

        /// Duration of each transfer phase in seconds
        #[arg(short = 't', long)]
        time: Option<u64>,

        /// Number of latency samples
        #[arg(short = 'n', long)]
        samples: Option<usize>,

        /// Candidate server URL; repeat to select the best of several
        #[arg(long = "candidate")]
        candidates: Vec<String>,

        /// Skip the payload sizing probe
        #[arg(long)]
        no_probe: bool,

        /// Report a simulated result when every connection fails
        #[arg(long)]
        simulated_fallback: bool,

        /// Append the result to this history file
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// Measure latency only
    Latency {
        /// Number of samples
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Pause between samples in milliseconds
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Monitor continuously until Ctrl-C or the duration elapses
    Monitor {
        /// Sampling interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Number of data points kept
        #[arg(long)]
        max_points: Option<usize>,
    },
}

fn base_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::new(),
    };
    if let Some(server) = &cli.server {
        config = config.with_server_url(server.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = base_config(&cli)?;
    let json = cli.json;

    match cli.command {
        Commands::Test {
            parallel,
            time,
            samples,
            candidates,
            no_probe,
            simulated_fallback,
            history,
        } => {
            if let Some(parallel) = parallel {
                config = config.with_parallel_connections(parallel);
            }
            if let Some(time) = time {
                config = config.with_transfer_duration(Duration::from_secs(time));
            }
            if let Some(samples) = samples {
                config = config.with_latency_sample_count(samples);
            }
            if !candidates.is_empty() {
                let servers = candidates
                    .iter()
                    .enumerate()
                    .map(|(i, url)| TestServer::new(format!("candidate-{}", i + 1), url.clone()))
                    .collect();
                config = config.with_candidate_servers(servers);
            }
            if no_probe {
                config = config.with_probe_payload(false);
            }
            if simulated_fallback {
                config = config.with_simulated_fallback(true);
            }
            let history_limit = config.history_limit;

            let (reporter, receiver) = Reporter::new();
            let report_task = tokio::spawn(run_reporter_task(receiver, json));

            let orchestrator = Arc::new(TestOrchestrator::new(config)?.with_callback(reporter.clone()));
            let stopper = orchestrator.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stopper.stop_test();
                }
            });

            let outcome = orchestrator.start_test().await;
            reporter.complete();
            let _ = report_task.await;
            let result = outcome?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", format_summary(&result));
            }

            if let Some(path) = history {
                ResultHistory::new(JsonFileStore::new(&path), history_limit)
                    .push(TestRecord::from_result(&result))
                    .with_context(|| format!("failed to update history at {}", path.display()))?;
            }
        }

        Commands::Latency { count, interval } => {
            if let Some(count) = count {
                config = config.with_latency_sample_count(count);
            }
            if let Some(interval) = interval {
                config = config.with_latency_interval(Duration::from_millis(interval));
            }
            config.validate()?;

            let (reporter, receiver) = Reporter::new();
            let report_task = tokio::spawn(run_reporter_task(receiver, json));

            let transport = Arc::new(HttpTransport::new(&config.server_url)?);
            let sink = reporter.clone();
            let prober = LatencyProber::from_config(transport, &config)
                .with_callback(move |event: ProgressEvent| sink.progress(event));
            let stopper = prober.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stopper.cancel();
                }
            });

            let outcome = prober
                .measure_series(
                    config.latency_sample_count,
                    config.latency_interval,
                    config.latency_timeout,
                )
                .await;
            reporter.complete();
            let _ = report_task.await;
            let result = outcome?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", format_latency(&result));
            }
        }

        Commands::Monitor {
            interval,
            duration,
            max_points,
        } => {
            if let Some(interval) = interval {
                config = config.with_monitoring_interval(Duration::from_secs(interval));
            }
            if let Some(max_points) = max_points {
                config = config.with_max_data_points(max_points);
            }

            let (reporter, receiver) = Reporter::new();
            let report_task = tokio::spawn(run_reporter_task(receiver, json));

            let manager = MonitoringManager::new(config)?.with_callback(reporter.clone());
            manager.start().await?;

            match duration {
                Some(secs) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                        _ = tokio::signal::ctrl_c() => {}
                    }
                }
                None => {
                    tokio::signal::ctrl_c().await?;
                }
            }

            let session = manager.stop()?;
            reporter.complete();
            let _ = report_task.await;

            if json {
                println!("{}", serde_json::to_string_pretty(session.as_ref())?);
            } else {
                println!("{}", format_session(&session));
            }
        }
    }

    Ok(())
}
