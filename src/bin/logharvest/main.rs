// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use std::io::{BufWriter, Write};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::metadata::LevelFilter;
use tracing::{debug, error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use logharvest::bounded_channel::BoundedReceiver;
use logharvest::harvester::{ChannelPipeline, Delivery};
use logharvest::init::args::HarvestRun;
use logharvest::init::config::load_config;
use logharvest::init::wait;
use logharvest::input::InputManager;

/// Deliveries written to stdout before they are acknowledged together
const OUTPUT_BATCH_SIZE: usize = 256;

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run the harvester
    Start(Box<HarvestRun>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "logharvest")]
#[command(bin_name = "logharvest")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "LOGHARVEST_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version())
        }
        Some(Commands::Start(run)) => {
            let _guard = match setup_logging(&opt.log_format) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            if let Err(e) = run_harvester(run) {
                error!(error = e, "Failed to run harvester.");
                return ExitCode::from(1);
            }
        }
        None => {
            // Not reachable, a subcommand is required
            eprintln!("ERROR: must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_harvester(args: Box<HarvestRun>) -> Result<(), BoxError> {
    let config = load_config(&args)?;
    if config.inputs.is_empty() {
        return Err("no inputs configured, use --config or --paths".into());
    }

    let (pipeline, deliveries) = ChannelPipeline::new(args.output_queue_size);
    let manager = InputManager::new(config, Arc::new(pipeline))?;
    manager.test()?;
    if args.test_config {
        info!("Configuration OK");
        return Ok(());
    }

    let mut task_set: JoinSet<wait::TaskResult> = JoinSet::new();
    let cancel_token = CancellationToken::new();
    {
        let token = cancel_token.clone();
        task_set.spawn(async move { manager.run(token).await.map_err(|e| e.into()) });
    }
    // Exits once every harvester has dropped its client
    task_set.spawn(write_output(deliveries));

    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_int = signal(SignalKind::interrupt())?;
    select! {
        _ = sig_term.recv() => info!("Shutdown signal received."),
        _ = sig_int.recv() => info!("Shutdown signal received."),
        e = wait::wait_for_any_task(&mut task_set) => {
            match e {
                Ok(()) => warn!("Unexpected early exit of harvester."),
                Err(e) => return Err(e),
            }
        },
    }
    cancel_token.cancel();

    wait::wait_for_tasks_with_timeout(&mut task_set, *args.shutdown_timeout).await
}

/// Print every delivered event as one JSON line and acknowledge it once written.
async fn write_output(mut deliveries: BoundedReceiver<Delivery>) -> wait::TaskResult {
    let mut stdout = BufWriter::new(std::io::stdout());
    let mut written = 0u64;
    while let Some(first) = deliveries.next().await {
        let mut batch = vec![first];
        while batch.len() < OUTPUT_BATCH_SIZE {
            match deliveries.try_recv() {
                Some(delivery) => batch.push(delivery),
                None => break,
            }
        }

        for delivery in &batch {
            serde_json::to_writer(&mut stdout, &delivery.event.to_json())?;
            stdout.write_all(b"\n")?;
        }
        stdout.flush()?;
        written += batch.len() as u64;
        Delivery::ack_all(batch);
    }
    debug!(events = written, "Output closed");
    Ok(())
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    // Events go to stdout, logs to stderr
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?
        .add_directive("notify=warn".parse()?);

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io;
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = io::stderr().is_terminal();

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}
