//! Cadence CLI
//!
//! Publishes synthetic events at a fixed rate until interrupted.
//!
//! # Example
//!
//! ```bash
//! # 100 events per second to stdout, for one minute
//! cadence --events-per-second 100 --topic demo --duration 1m
//!
//! # Against the Pub/Sub emulator
//! PUBSUB_EMULATOR_HOST=localhost:8085 cadence --qps 500 \
//!     --topic projects/demo/topics/events --transport pubsub-rest
//! ```

use std::{collections::BTreeMap, process::ExitCode, time::Duration};

use cadence::{
    DeliveryAggregate, Error, Generator, GeneratorConfig, RateSpec, RetryPolicy,
    config::{ConfigError, DEFAULT_MAX_IN_FLIGHT, parse_attribute},
    report::{JsonReporter, LogReporter, Reporter, RunReport},
    transport::{PubsubRestTransport, StdoutTransport, Transport},
};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// One JSON payload per line on stdout
    Stdout,
    /// Pub/Sub REST API (emulator or authenticating proxy)
    PubsubRest,
}

/// Cadence
///
/// Publishes a steady stream of synthetic events to a message-bus topic.
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version, about, long_about = None)]
struct Args {
    /// Events per second to publish
    #[arg(long, visible_alias = "qps")]
    events_per_second: u64,

    /// Destination topic, e.g. projects/<project>/topics/<topic>
    #[arg(long)]
    topic: String,

    /// Where to publish
    #[arg(long, value_enum, default_value_t = TransportKind::Stdout)]
    transport: TransportKind,

    /// Pub/Sub REST endpoint
    #[arg(long, env = "PUBSUB_EMULATOR_HOST", default_value = "localhost:8085")]
    endpoint: String,

    /// Per-request timeout for network transports
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    request_timeout: Duration,

    /// Events allowed between emission and a final publish outcome
    #[arg(long, default_value_t = DEFAULT_MAX_IN_FLIGHT)]
    max_in_flight: usize,

    /// Retries after the first attempt for transient failures
    #[arg(long, default_value_t = 5)]
    max_retries: u32,

    /// Delay before the first retry
    #[arg(long, default_value = "100ms", value_parser = humantime::parse_duration)]
    initial_backoff: Duration,

    /// Upper bound on the delay between retries
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    max_backoff: Duration,

    /// Growth factor between consecutive retry delays
    #[arg(long, default_value_t = 2.0)]
    backoff_multiplier: f64,

    /// Time allowed for in-flight publishes to resolve on shutdown
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    shutdown_grace: Duration,

    /// Stop after this long instead of running until interrupted
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Message attribute as key=value; may be repeated
    #[arg(long = "attribute", value_parser = parse_attribute_arg)]
    attributes: Vec<(String, String)>,

    /// Print the final report as JSON on stderr
    #[arg(long)]
    json_report: bool,
}

fn parse_attribute_arg(raw: &str) -> Result<(String, String), ConfigError> {
    parse_attribute(raw)
}

impl Args {
    fn config(&self) -> Result<GeneratorConfig, Error> {
        let config = GeneratorConfig {
            rate: RateSpec::new(self.events_per_second)?,
            topic: self.topic.clone(),
            max_in_flight: self.max_in_flight,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                initial_delay: self.initial_backoff,
                max_delay: self.max_backoff,
                multiplier: self.backoff_multiplier,
            },
            shutdown_grace: self.shutdown_grace,
            run_for: self.duration,
            attributes: self.attributes.iter().cloned().collect::<BTreeMap<_, _>>(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,cadence=info")),
        )
        .init();

    let args = Args::parse();

    match run(&args).await {
        Ok(totals) => {
            let report = RunReport::from(totals);
            let reported = if args.json_report {
                JsonReporter.report(&report).await
            } else {
                LogReporter.report(&report).await
            };
            if let Err(e) = reported {
                tracing::warn!("Could not write the run report: {e}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("cadence: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<DeliveryAggregate, Error> {
    let config = args.config()?;

    match args.transport {
        TransportKind::Stdout => execute(config, StdoutTransport::new()).await,
        TransportKind::PubsubRest => {
            let transport = PubsubRestTransport::new(&args.endpoint, args.request_timeout)
                .map_err(|e| Error::TransportUnavailable {
                    topic: config.topic.clone(),
                    reason: e.to_string(),
                })?;
            execute(config, transport).await
        }
    }
}

async fn execute<T: Transport>(
    config: GeneratorConfig,
    transport: T,
) -> Result<DeliveryAggregate, Error> {
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));
    Generator::new(config, transport).run(cancel).await
}

/// Cancels on Ctrl-C, or SIGTERM on unix.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!("Cannot listen for Ctrl-C: {e}");
                return;
            }
        }
        _ = terminate => {}
    }
    tracing::info!("Shutdown requested, draining in-flight publishes...");
    cancel.cancel();
}
