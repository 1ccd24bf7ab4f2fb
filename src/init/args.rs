// SPDX-License-Identifier: Apache-2.0

use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{OutputConfig, ShipperConfig, StartAt};
use crate::error::{Error, Result};
use crate::init::parse;
use crate::publisher::RetryConfig;

/// Where to start reading files that have no registry entry
#[derive(Copy, Clone, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum StartAtArg {
    /// Ship existing content
    #[default]
    Beginning,
    /// Only ship content appended after discovery
    End,
}

impl From<StartAtArg> for StartAt {
    fn from(s: StartAtArg) -> Self {
        match s {
            StartAtArg::Beginning => StartAt::Beginning,
            StartAtArg::End => StartAt::End,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputArg {
    /// JSON lines on stdout
    #[default]
    Stdout,
    /// JSON lines appended to --output-file
    File,
    /// Discard everything (testing)
    Blackhole,
}

#[derive(Debug, Args, Clone)]
pub struct ShipperArgs {
    /// Comma-separated glob patterns for files to harvest (e.g., "/var/log/*.log,/tmp/*.log")
    #[arg(long, env = "TAILSHIP_INCLUDE", value_delimiter = ',', required = true)]
    pub include: Vec<String>,

    /// Comma-separated glob patterns for files to exclude
    #[arg(long, env = "TAILSHIP_EXCLUDE", value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// How often to rescan the include patterns
    #[arg(long, env = "TAILSHIP_SCAN_INTERVAL", default_value = "10s",
        value_parser = humantime::parse_duration)]
    pub scan_interval: Duration,

    /// Where to start reading files that have no registry entry
    #[arg(value_enum, long, env = "TAILSHIP_START_AT", default_value = "beginning")]
    pub start_at: StartAtArg,

    /// Ignore files not modified within this duration
    #[arg(long, env = "TAILSHIP_IGNORE_OLDER", value_parser = humantime::parse_duration)]
    pub ignore_older: Option<Duration>,

    /// How long a removed or rotated file must stay idle at EOF before it is closed
    #[arg(long, env = "TAILSHIP_CLOSE_REMOVED_AFTER", default_value = "5s",
        value_parser = humantime::parse_duration)]
    pub close_removed_after: Duration,

    /// Initial wait before polling a file again at EOF
    #[arg(long, env = "TAILSHIP_BACKOFF", default_value = "1s",
        value_parser = humantime::parse_duration)]
    pub backoff: Duration,

    /// Maximum wait between polls at EOF
    #[arg(long, env = "TAILSHIP_MAX_BACKOFF", default_value = "10s",
        value_parser = humantime::parse_duration)]
    pub max_backoff: Duration,

    /// Multiplier applied to the poll wait after each poll with no new data
    #[arg(long, env = "TAILSHIP_BACKOFF_FACTOR", default_value = "2")]
    pub backoff_factor: u32,

    /// Bytes read from a file per read call
    #[arg(long, env = "TAILSHIP_HARVESTER_BUFFER_SIZE", default_value = "16384")]
    pub harvester_buffer_size: usize,

    /// Maximum line size in bytes (longer lines are truncated)
    #[arg(long, env = "TAILSHIP_MAX_LINE_BYTES", default_value = "10485760")]
    pub max_line_bytes: usize,

    /// Maximum number of events per published batch
    #[arg(long, env = "TAILSHIP_SPOOL_SIZE", default_value = "2048")]
    pub spool_size: usize,

    /// Maximum time an event waits in the spool before the batch is published
    #[arg(long, env = "TAILSHIP_IDLE_TIMEOUT", default_value = "5s",
        value_parser = humantime::parse_duration)]
    pub idle_timeout: Duration,

    /// Registry file holding acknowledged offsets
    #[arg(
        long,
        env = "TAILSHIP_REGISTRY_FILE",
        default_value = "/var/lib/tailship/registry.json"
    )]
    pub registry_file: PathBuf,

    /// Interval between periodic registry checkpoints
    #[arg(long, env = "TAILSHIP_CHECKPOINT_INTERVAL", default_value = "1s",
        value_parser = humantime::parse_duration)]
    pub checkpoint_interval: Duration,

    /// Maximum duration of consecutive registry write failures before exiting
    #[arg(long, env = "TAILSHIP_MAX_CHECKPOINT_FAILURE_DURATION", default_value = "60s",
        value_parser = humantime::parse_duration)]
    pub max_checkpoint_failure_duration: Duration,

    /// Comma-separated, key=value pairs added to every event
    #[arg(long, env = "TAILSHIP_FIELDS", value_parser = parse::parse_key_val::<String, String>, value_delimiter = ',')]
    pub fields: Vec<(String, String)>,

    /// Capacity of the harvester to spooler channel
    #[arg(long, env = "TAILSHIP_EVENT_QUEUE_SIZE", default_value = "2048")]
    pub event_queue_size: usize,

    /// Output sink
    #[arg(value_enum, long, env = "TAILSHIP_OUTPUT", default_value = "stdout")]
    pub output: OutputArg,

    /// Output file path (when output=file)
    #[arg(long, env = "TAILSHIP_OUTPUT_FILE")]
    pub output_file: Option<PathBuf>,

    /// Initial delay before retrying a failed publish
    #[arg(long, env = "TAILSHIP_RETRY_INITIAL_BACKOFF", default_value = "5s",
        value_parser = humantime::parse_duration)]
    pub retry_initial_backoff: Duration,

    /// Maximum delay between publish retries
    #[arg(long, env = "TAILSHIP_RETRY_MAX_BACKOFF", default_value = "30s",
        value_parser = humantime::parse_duration)]
    pub retry_max_backoff: Duration,

    /// Give up on a batch after retrying for this long
    #[arg(long, env = "TAILSHIP_RETRY_MAX_ELAPSED_TIME", default_value = "300s",
        value_parser = humantime::parse_duration)]
    pub retry_max_elapsed_time: Duration,

    /// Maximum time to wait for in-flight data to drain on shutdown
    #[arg(long, env = "TAILSHIP_SHUTDOWN_TIMEOUT", default_value = "10s",
        value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Duration,
}

impl ShipperArgs {
    /// Build and validate the pipeline config from command line args
    pub fn build_config(&self) -> Result<ShipperConfig> {
        let output = match self.output {
            OutputArg::Stdout => OutputConfig::Stdout,
            OutputArg::Blackhole => OutputConfig::Blackhole,
            OutputArg::File => match &self.output_file {
                Some(path) => OutputConfig::File { path: path.clone() },
                None => {
                    return Err(Error::Config(
                        "--output-file is required when --output=file".to_string(),
                    ));
                }
            },
        };

        let config = ShipperConfig {
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            scan_interval: self.scan_interval,
            start_at: self.start_at.into(),
            ignore_older: self.ignore_older,
            close_removed_after: self.close_removed_after,
            backoff: self.backoff,
            max_backoff: self.max_backoff,
            backoff_factor: self.backoff_factor,
            harvester_buffer_size: self.harvester_buffer_size,
            max_line_bytes: self.max_line_bytes,
            spool_size: self.spool_size,
            idle_timeout: self.idle_timeout,
            registry_file: self.registry_file.clone(),
            checkpoint_interval: self.checkpoint_interval,
            max_checkpoint_failure_duration: self.max_checkpoint_failure_duration,
            fields: self.fields.iter().cloned().collect(),
            event_channel_size: self.event_queue_size,
            output,
            retry: RetryConfig {
                initial_backoff: self.retry_initial_backoff,
                max_backoff: self.retry_max_backoff,
                max_elapsed_time: self.retry_max_elapsed_time,
            },
            shutdown_timeout: self.shutdown_timeout,
            ..Default::default()
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ShipperArgs,
    }

    fn parse(args: &[&str]) -> ShipperArgs {
        let mut argv = vec!["tailship"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap().args
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--include", "/var/log/*.log"]).build_config().unwrap();
        assert_eq!(config.include, vec!["/var/log/*.log".to_string()]);
        assert_eq!(config.start_at, StartAt::Beginning);
        assert_eq!(config.scan_interval, Duration::from_secs(10));
        assert_eq!(config.spool_size, 2048);
        assert_eq!(config.output, OutputConfig::Stdout);
        assert_eq!(config.batch_channel_size, 1);
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--include",
            "/a/*.log,/b/*.log",
            "--start-at",
            "end",
            "--idle-timeout",
            "250ms",
            "--fields",
            "env=prod,team=core",
            "--output",
            "file",
            "--output-file",
            "/tmp/out.json",
        ])
        .build_config()
        .unwrap();

        assert_eq!(config.include.len(), 2);
        assert_eq!(config.start_at, StartAt::End);
        assert_eq!(config.idle_timeout, Duration::from_millis(250));
        assert_eq!(config.fields.get("team"), Some(&"core".to_string()));
        assert_eq!(
            config.output,
            OutputConfig::File {
                path: PathBuf::from("/tmp/out.json")
            }
        );
    }

    #[test]
    fn test_file_output_requires_path() {
        let args = parse(&["--include", "/a/*.log", "--output", "file"]);
        assert!(matches!(args.build_config(), Err(Error::Config(_))));
    }
}
