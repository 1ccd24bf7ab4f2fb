// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use std::error::Error;
use std::process::ExitCode;
use std::time::Duration;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use tailship::config::{OutputConfig, ShipperConfig};
use tailship::init::agent::Agent;
use tailship::init::args::ShipperArgs;
use tailship::init::wait;

// Extra time on top of the agent's own shutdown timeout
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run the shipper
    Start(Box<ShipperArgs>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "tailship")]
#[command(bin_name = "tailship")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "TAILSHIP_LOG_FORMAT",
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
        Some(Commands::Start(args)) => {
            let config = match args.build_config() {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("ERROR: {}", e);
                    return ExitCode::from(1);
                }
            };

            // Events go to stdout with the stdout sink, keep logs out of the way.
            let log_to_stderr = matches!(config.output, OutputConfig::Stdout);
            let _guard = match setup_logging(&opt.log_format, log_to_stderr) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            if let Err(e) = run_agent(config) {
                error!(error = e, "Failed to run shipper.");
                return ExitCode::from(1);
            }
        }
        _ => {
            // unreachable while a subcommand is required
            error!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_agent(config: ShipperConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut agent_join_set = JoinSet::new();
    let shutdown_timeout = config.shutdown_timeout.saturating_add(SHUTDOWN_GRACE);

    let cancel_token = CancellationToken::new();
    {
        let token = cancel_token.clone();
        agent_join_set.spawn(async move { Agent::new(config).run(token).await });
    }

    let mut sig_term = sig(SignalKind::terminate())?;
    let mut sig_int = sig(SignalKind::interrupt())?;

    select! {
        _ = sig_term.recv() => {
            info!("Signal SIGTERM received, shutting down.");
            cancel_token.cancel();
        },
        _ = sig_int.recv() => {
            info!("Signal SIGINT received, shutting down.");
            cancel_token.cancel();
        },
        e = wait::wait_for_any_task(&mut agent_join_set) => {
            match e {
                Ok(()) => warn!("Unexpected early exit of shipper."),
                Err(e) => return Err(e),
            }
        },
    }

    // The agent enforces its own per-stage deadlines, this only guards against a hang.
    wait::wait_for_tasks_with_timeout(&mut agent_join_set, shutdown_timeout).await?;

    Ok(())
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg, to_stderr: bool) -> Result<LoggerGuard, BoxError> {
    LogTracer::init().map_err(|e| format!("unable to setup log tracer: {}", e))?;

    let (non_blocking_writer, guard) = if to_stderr {
        tracing_appender::non_blocking(std::io::stderr())
    } else {
        tracing_appender::non_blocking(std::io::stdout())
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

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
        let use_ansi = if to_stderr {
            io::stderr().is_terminal()
        } else {
            io::stdout().is_terminal()
        };

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

fn sig(kind: SignalKind) -> Result<tokio::signal::unix::Signal, BoxError> {
    signal(kind).map_err(|e| format!("unable to install signal handler: {}", e).into())
}
