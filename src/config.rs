// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::publisher::RetryConfig;

/// Ceiling for every timer and deadline setting. Larger values would overflow
/// when added to the current instant.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Where to begin reading a file that has no registry entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartAt {
    /// Ship the file's existing content
    #[default]
    Beginning,
    /// Skip existing content and only ship what is appended later
    End,
}

/// Destination for published batches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputConfig {
    /// JSON lines on stdout
    #[default]
    Stdout,
    /// JSON lines appended to a file
    File { path: PathBuf },
    /// Accept and discard
    Blackhole,
}

/// Validated configuration consumed by the shipping pipeline.
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// Glob patterns for files to harvest
    pub include: Vec<String>,
    /// Glob patterns removed from the include matches
    pub exclude: Vec<String>,
    /// How often the prospector rescans the include patterns
    pub scan_interval: Duration,
    /// Start position for files never seen before
    pub start_at: StartAt,
    /// Skip never-seen files whose modification time is older than this
    pub ignore_older: Option<Duration>,
    /// How long a removed or rotated file must stay idle at EOF before its harvester stops
    pub close_removed_after: Duration,
    /// Initial poll delay once a harvester reaches EOF
    pub backoff: Duration,
    /// Upper bound on the poll delay
    pub max_backoff: Duration,
    /// Multiplier applied to the poll delay after each empty poll
    pub backoff_factor: u32,
    /// Size of each read from disk
    pub harvester_buffer_size: usize,
    /// Lines longer than this are truncated in the emitted event
    pub max_line_bytes: usize,
    /// Maximum events per batch
    pub spool_size: usize,
    /// Maximum time an event waits in the spool before a flush
    pub idle_timeout: Duration,
    /// Location of the persisted registry
    pub registry_file: PathBuf,
    /// Interval between periodic registry checkpoints
    pub checkpoint_interval: Duration,
    /// Consecutive persist failures tolerated for this long before the registrar gives up
    pub max_checkpoint_failure_duration: Duration,
    /// Static fields attached to every event
    pub fields: BTreeMap<String, String>,
    /// Capacity of the harvester to spooler channel
    pub event_channel_size: usize,
    /// Capacity of the spooler to publisher channel
    pub batch_channel_size: usize,
    /// Capacity of the channel into the registrar
    pub registrar_channel_size: usize,
    pub output: OutputConfig,
    pub retry: RetryConfig,
    /// Upper bound on the drain after a shutdown signal
    pub shutdown_timeout: Duration,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            scan_interval: Duration::from_secs(10),
            start_at: StartAt::Beginning,
            ignore_older: None,
            close_removed_after: Duration::from_secs(5),
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            backoff_factor: 2,
            harvester_buffer_size: 16 * 1024,
            max_line_bytes: 10 * 1024 * 1024,
            spool_size: 2048,
            idle_timeout: Duration::from_secs(5),
            registry_file: PathBuf::from(".tailship/registry.json"),
            checkpoint_interval: Duration::from_secs(1),
            max_checkpoint_failure_duration: Duration::from_secs(60),
            fields: BTreeMap::new(),
            event_channel_size: 2048,
            batch_channel_size: 1,
            registrar_channel_size: 16,
            output: OutputConfig::default(),
            retry: RetryConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ShipperConfig {
    /// Check the settings that would otherwise fail deep inside a running task.
    pub fn validate(&self) -> Result<()> {
        if self.include.is_empty() {
            return Err(Error::Config(
                "at least one include pattern is required".to_string(),
            ));
        }

        for pattern in self.include.iter().chain(self.exclude.iter()) {
            glob::Pattern::new(pattern)
                .map_err(|e| Error::InvalidGlob(format!("{}: {}", pattern, e)))?;
        }

        if self.spool_size == 0 {
            return Err(Error::Config("spool size must be greater than 0".to_string()));
        }
        if self.harvester_buffer_size == 0 {
            return Err(Error::Config(
                "harvester buffer size must be greater than 0".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(Error::Config(
                "max line bytes must be greater than 0".to_string(),
            ));
        }
        if self.event_channel_size == 0
            || self.batch_channel_size == 0
            || self.registrar_channel_size == 0
        {
            return Err(Error::Config(
                "channel capacities must be greater than 0".to_string(),
            ));
        }
        if self.scan_interval.is_zero()
            || self.idle_timeout.is_zero()
            || self.checkpoint_interval.is_zero()
        {
            return Err(Error::Config(
                "scan interval, idle timeout and checkpoint interval must be non-zero".to_string(),
            ));
        }
        if self.backoff.is_zero() || self.backoff > self.max_backoff {
            return Err(Error::Config(format!(
                "backoff ({:?}) must be non-zero and no larger than max backoff ({:?})",
                self.backoff, self.max_backoff
            )));
        }
        if self.backoff_factor == 0 {
            return Err(Error::Config(
                "backoff factor must be at least 1".to_string(),
            ));
        }
        let timers = [
            ("scan interval", self.scan_interval),
            ("close removed after", self.close_removed_after),
            ("backoff", self.backoff),
            ("max backoff", self.max_backoff),
            ("idle timeout", self.idle_timeout),
            ("checkpoint interval", self.checkpoint_interval),
            (
                "max checkpoint failure duration",
                self.max_checkpoint_failure_duration,
            ),
            ("retry initial backoff", self.retry.initial_backoff),
            ("retry max backoff", self.retry.max_backoff),
            ("retry max elapsed time", self.retry.max_elapsed_time),
            ("shutdown timeout", self.shutdown_timeout),
        ];
        for (name, value) in timers {
            if value > MAX_DURATION {
                return Err(Error::Config(format!(
                    "{} ({:?}) must not exceed {:?}",
                    name, value, MAX_DURATION
                )));
            }
        }
        if self.registry_file.as_os_str().is_empty() {
            return Err(Error::Config("registry file path is empty".to_string()));
        }
        if let OutputConfig::File { path } = &self.output {
            if path.as_os_str().is_empty() {
                return Err(Error::Config("output file path is empty".to_string()));
            }
        }

        Ok(())
    }
}
