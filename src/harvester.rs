// SPDX-License-Identifier: Apache-2.0

//! Harvester: tails a single file and emits one event per complete line.
//!
//! A harvester owns its file handle for its whole life. It never touches the
//! registry; the position it reports through [`HarvesterProgress`] is the end
//! of the last line handed to the spooler, which is where a restarted
//! harvester for the same file picks up.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use portable_atomic::{AtomicU64, AtomicU8, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bounded_channel::{BoundedSender, SendError};
use crate::config::ShipperConfig;
use crate::error::{Error, Result};
use crate::event::{Event, Position};
use crate::input::{FileId, Line, LineReader, identity_async};

#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    /// Size of each read from disk
    pub buffer_size: usize,
    pub max_line_bytes: usize,
    /// Initial poll delay at EOF
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: u32,
    /// Idle time at EOF before a removed or rotated file is closed
    pub close_removed_after: Duration,
    pub fields: Arc<BTreeMap<String, String>>,
}

impl From<&ShipperConfig> for HarvesterConfig {
    fn from(config: &ShipperConfig) -> Self {
        Self {
            buffer_size: config.harvester_buffer_size,
            max_line_bytes: config.max_line_bytes,
            backoff: config.backoff,
            max_backoff: config.max_backoff,
            backoff_factor: config.backoff_factor,
            close_removed_after: config.close_removed_after,
            fields: Arc::new(config.fields.clone()),
        }
    }
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self::from(&ShipperConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HarvesterState {
    Starting = 0,
    Reading = 1,
    Waiting = 2,
    Truncated = 3,
    Removed = 4,
    Rotated = 5,
    Stopped = 6,
}

impl HarvesterState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Reading,
            2 => Self::Waiting,
            3 => Self::Truncated,
            4 => Self::Removed,
            5 => Self::Rotated,
            _ => Self::Stopped,
        }
    }
}

/// Why a harvester stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown or an explicit stop from the prospector
    Cancelled,
    /// The path no longer exists and the file stayed idle for the grace period
    Removed,
    /// The path now names a different file and this one stayed idle for the grace period
    Rotated,
    /// The file at the path changed between discovery and open
    IdentityMismatch,
    /// The spooler is gone
    ChannelClosed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Cancelled => "cancelled",
            StopReason::Removed => "removed",
            StopReason::Rotated => "rotated",
            StopReason::IdentityMismatch => "identity mismatch",
            StopReason::ChannelClosed => "channel closed",
        };
        f.write_str(s)
    }
}

/// Live view of a harvester, shared with the prospector.
#[derive(Debug)]
pub struct HarvesterProgress {
    generation: AtomicU64,
    offset: AtomicU64,
    state: AtomicU8,
}

impl HarvesterProgress {
    fn new(start: Position) -> Self {
        Self {
            generation: AtomicU64::new(start.generation),
            offset: AtomicU64::new(start.offset),
            state: AtomicU8::new(HarvesterState::Starting as u8),
        }
    }

    /// End of the last line handed downstream.
    pub fn position(&self) -> Position {
        Position::new(
            self.generation.load(Ordering::Acquire),
            self.offset.load(Ordering::Acquire),
        )
    }

    pub fn state(&self) -> HarvesterState {
        HarvesterState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_position(&self, position: Position) {
        self.generation.store(position.generation, Ordering::Release);
        self.offset.store(position.offset, Ordering::Release);
    }

    fn set_state(&self, state: HarvesterState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Delay between reads at EOF. Grows by `factor` after every idle poll up
/// to `max` and drops back to `initial` once data shows up.
#[derive(Debug, Clone)]
struct PollBackoff {
    initial: Duration,
    max: Duration,
    factor: u32,
    current: Duration,
}

impl PollBackoff {
    fn new(initial: Duration, max: Duration, factor: u32) -> Self {
        Self {
            initial,
            max,
            factor,
            current: initial.min(max),
        }
    }

    fn current(&self) -> Duration {
        self.current
    }

    fn grow(&mut self) {
        self.current = self
            .current
            .checked_mul(self.factor)
            .map_or(self.max, |next| next.min(self.max));
    }

    fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

pub struct Harvester {
    file_id: FileId,
    path: PathBuf,
    config: HarvesterConfig,
    events: BoundedSender<Event>,
    progress: Arc<HarvesterProgress>,
    generation: u64,
    reader: LineReader,
}

impl Harvester {
    pub fn new(
        file_id: FileId,
        path: PathBuf,
        start: Position,
        config: HarvesterConfig,
        events: BoundedSender<Event>,
    ) -> Self {
        let reader = LineReader::new(start.offset, config.max_line_bytes);
        Self {
            file_id,
            path,
            config,
            events,
            progress: Arc::new(HarvesterProgress::new(start)),
            generation: start.generation,
            reader,
        }
    }

    pub fn progress(&self) -> Arc<HarvesterProgress> {
        self.progress.clone()
    }

    /// Tail the file until it is retired or `cancel` fires.
    ///
    /// Open and read failures are returned as errors. The prospector retries
    /// from the last reported position on its next scan.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<StopReason> {
        let result = self.harvest(&cancel).await;
        self.set_state(HarvesterState::Stopped);
        match &result {
            Ok(reason) => debug!(
                file_id = %self.file_id,
                path = ?self.path,
                offset = self.reader.committed_offset(),
                reason = %reason,
                "Harvester stopped"
            ),
            Err(e) => warn!(
                file_id = %self.file_id,
                path = ?self.path,
                error = %e,
                "Harvester failed"
            ),
        }
        result
    }

    async fn harvest(&mut self, cancel: &CancellationToken) -> Result<StopReason> {
        let Some(mut file) = self.open().await? else {
            return Ok(StopReason::IdentityMismatch);
        };

        let mut buf = vec![0u8; self.config.buffer_size];
        let mut backoff = PollBackoff::new(
            self.config.backoff,
            self.config.max_backoff,
            self.config.backoff_factor,
        );
        // Set while the path no longer leads to this file and we sit at EOF
        let mut closing_since: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }

            let n = file.read(&mut buf).await?;

            if n > 0 {
                self.set_state(HarvesterState::Reading);
                backoff.reset();
                closing_since = None;

                let lines = self.reader.push(&buf[..n]);
                if let Some(reason) = self.emit(lines, cancel).await {
                    return Ok(reason);
                }
                continue;
            }

            // EOF: look for truncation, then for removal or rotation
            let size = file.metadata().await?.len();
            if size < self.reader.read_offset() {
                self.truncated(&mut file, size).await?;
                continue;
            }

            if let Some(state) = self.path_changed().await {
                self.set_state(state);
                let since = *closing_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.config.close_removed_after {
                    return Ok(match state {
                        HarvesterState::Removed => StopReason::Removed,
                        _ => StopReason::Rotated,
                    });
                }
            } else {
                closing_since = None;
                self.set_state(HarvesterState::Waiting);
            }

            let delay = match closing_since {
                Some(since) => backoff.current().min(
                    self.config
                        .close_removed_after
                        .saturating_sub(since.elapsed())
                        .max(Duration::from_millis(1)),
                ),
                None => backoff.current(),
            };

            select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(StopReason::Cancelled),
            }

            backoff.grow();
        }
    }

    /// Open the file, confirm it is still the file we were started for, and
    /// seek to the start position. Returns None on an identity mismatch.
    async fn open(&mut self) -> Result<Option<File>> {
        self.set_state(HarvesterState::Starting);

        let mut file = File::open(&self.path).await.map_err(|e| Error::Open {
            path: self.path.clone(),
            source: e,
        })?;

        let metadata = file.metadata().await?;
        let opened = FileId::from_metadata(&metadata, &self.path);
        if opened != self.file_id {
            debug!(
                expected = %self.file_id,
                found = %opened,
                path = ?self.path,
                "File changed before it could be opened"
            );
            return Ok(None);
        }

        let start = self.reader.committed_offset();
        if metadata.len() < start {
            self.truncated(&mut file, metadata.len()).await?;
        } else {
            file.seek(SeekFrom::Start(start)).await?;
        }

        debug!(
            file_id = %self.file_id,
            path = ?self.path,
            offset = self.reader.committed_offset(),
            generation = self.generation,
            "Harvester started"
        );
        Ok(Some(file))
    }

    /// The file shrank below what was already read: its content restarted.
    async fn truncated(&mut self, file: &mut File, size: u64) -> Result<()> {
        self.set_state(HarvesterState::Truncated);
        warn!(
            file_id = %self.file_id,
            path = ?self.path,
            offset = self.reader.read_offset(),
            size,
            "File truncated, reading from the beginning"
        );

        file.seek(SeekFrom::Start(0)).await?;
        self.reader.reset(0);
        self.generation += 1;
        self.progress.set_position(Position::new(self.generation, 0));
        Ok(())
    }

    /// Check whether the path still leads to this file.
    async fn path_changed(&self) -> Option<HarvesterState> {
        match identity_async(&self.path).await {
            Ok(Some(id)) if id == self.file_id => None,
            Ok(Some(_)) => Some(HarvesterState::Rotated),
            Ok(None) => Some(HarvesterState::Removed),
            Err(e) => {
                debug!(path = ?self.path, error = %e, "Failed to stat harvested path");
                None
            }
        }
    }

    /// Hand lines downstream in order, suspending while the channel is full.
    async fn emit(&mut self, lines: Vec<Line>, cancel: &CancellationToken) -> Option<StopReason> {
        for line in lines {
            let end = line.range.end_offset();
            let event = Event {
                file_id: self.file_id,
                source: self.path.clone(),
                line: line.content,
                range: line.range,
                generation: self.generation,
                read_at: Utc::now(),
                fields: self.config.fields.clone(),
            };

            match self.events.send_or_cancel(event, cancel).await {
                Ok(()) => self
                    .progress
                    .set_position(Position::new(self.generation, end)),
                Err(SendError::Cancelled) => return Some(StopReason::Cancelled),
                Err(SendError::Disconnected) => {
                    info!(path = ?self.path, "Event channel closed, stopping harvester");
                    return Some(StopReason::ChannelClosed);
                }
            }
        }
        None
    }

    fn set_state(&self, state: HarvesterState) {
        self.progress.set_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::{self, BoundedReceiver};
    use crate::input::identity;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    fn fast_config() -> HarvesterConfig {
        HarvesterConfig {
            buffer_size: 8,
            backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            close_removed_after: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn append(path: &Path, data: &str) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(data.as_bytes()).unwrap();
        f.sync_all().unwrap();
    }

    async fn recv(rx: &mut BoundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    fn start(
        path: &Path,
        position: Position,
        capacity: usize,
    ) -> (
        Arc<HarvesterProgress>,
        BoundedReceiver<Event>,
        CancellationToken,
        tokio::task::JoinHandle<Result<StopReason>>,
    ) {
        start_with(path, position, capacity, fast_config())
    }

    fn start_with(
        path: &Path,
        position: Position,
        capacity: usize,
        config: HarvesterConfig,
    ) -> (
        Arc<HarvesterProgress>,
        BoundedReceiver<Event>,
        CancellationToken,
        tokio::task::JoinHandle<Result<StopReason>>,
    ) {
        let file_id = identity(path).unwrap().unwrap();
        let (tx, rx) = bounded_channel::bounded(capacity);
        let harvester = Harvester::new(file_id, path.to_path_buf(), position, config, tx);
        let progress = harvester.progress();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(harvester.run(cancel.clone()));
        (progress, rx, cancel, handle)
    }

    #[tokio::test]
    async fn test_reads_lines_and_waits_for_terminator() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "first line\nsecond").unwrap();

        let (progress, mut rx, cancel, handle) = start(&path, Position::new(0, 0), 16);

        let e = recv(&mut rx).await;
        assert_eq!(e.line, "first line");
        assert_eq!(e.range.offset, 0);
        assert_eq!(e.range.end_offset(), 11);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_none());

        append(&path, " half\n");
        let e = recv(&mut rx).await;
        assert_eq!(e.line, "second half");
        assert_eq!(e.range.offset, 11);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(progress.position(), Position::new(0, 23));

        cancel.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), StopReason::Cancelled);
        assert_eq!(progress.state(), HarvesterState::Stopped);
    }

    #[tokio::test]
    async fn test_resumes_from_seed_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "aaaa\nbbbb\ncccc\n").unwrap();

        let (_progress, mut rx, cancel, handle) = start(&path, Position::new(0, 5), 16);

        let e = recv(&mut rx).await;
        assert_eq!(e.line, "bbbb");
        assert_eq!(e.range.offset, 5);
        assert_eq!(recv(&mut rx).await.line, "cccc");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_truncation_restarts_at_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        let content: String = (0..50).map(|i| format!("line {:04}\n", i)).collect();
        assert_eq!(content.len(), 500);
        fs::write(&path, &content).unwrap();

        let (progress, mut rx, cancel, handle) = start(&path, Position::new(0, 500), 16);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let shorter: String = (0..10).map(|i| format!("new  {:04}\n", i)).collect();
        assert_eq!(shorter.len(), 100);
        fs::write(&path, &shorter).unwrap();

        let e = recv(&mut rx).await;
        assert_eq!(e.range.offset, 0);
        assert_eq!(e.generation, 1);
        assert_eq!(e.line, "new  0000");

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(progress.position().generation, 1);
    }

    #[tokio::test]
    async fn test_seed_beyond_size_is_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "short\n").unwrap();

        let (_progress, mut rx, cancel, handle) = start(&path, Position::new(0, 500), 16);

        let e = recv(&mut rx).await;
        assert_eq!(e.range.offset, 0);
        assert_eq!(e.generation, 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotated_file_drained_then_stopped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let rotated = dir.path().join("app.log.1");
        fs::write(&path, "before\n").unwrap();

        let (_progress, mut rx, _cancel, handle) = start(&path, Position::new(0, 0), 16);
        assert_eq!(recv(&mut rx).await.line, "before");

        fs::rename(&path, &rotated).unwrap();
        append(&rotated, "tail after rename\n");
        fs::write(&path, "new file\n").unwrap();

        assert_eq!(recv(&mut rx).await.line, "tail after rename");
        let reason = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Rotated);
        assert!(rx.try_recv().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_removed_file_stops_after_grace() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.log");
        fs::write(&path, "x\n").unwrap();

        let (_progress, mut rx, _cancel, handle) = start(&path, Position::new(0, 0), 16);
        recv(&mut rx).await;
        fs::remove_file(&path).unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Removed);
    }

    #[tokio::test]
    async fn test_blocked_send_observes_cancel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "1\n2\n3\n4\n").unwrap();

        let (progress, _rx, cancel, handle) = start(&path, Position::new(0, 0), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // only the first line fits in the channel
        assert_eq!(progress.position(), Position::new(0, 2));

        cancel.cancel();
        let reason = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Cancelled);
    }

    #[test]
    fn test_poll_backoff_grows_caps_and_resets() {
        let mut backoff = PollBackoff::new(Duration::from_secs(1), Duration::from_secs(10), 2);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(backoff.current().as_secs());
            backoff.grow();
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 10, 10]);

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[test]
    fn test_poll_backoff_huge_factor_saturates_at_max() {
        let max = Duration::from_secs(3600);
        let mut backoff = PollBackoff::new(Duration::from_secs(u64::MAX / 2), max, u32::MAX);
        assert_eq!(backoff.current(), max);

        backoff.grow();
        backoff.grow();
        assert_eq!(backoff.current(), max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_polls_back_off_to_cap_then_reset_on_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idle.log");
        fs::write(&path, "").unwrap();

        let config = HarvesterConfig {
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
            backoff_factor: 2,
            close_removed_after: Duration::from_secs(3600),
            ..Default::default()
        };
        let started = Instant::now();
        let (_progress, mut rx, cancel, handle) = start_with(&path, Position::new(0, 0), 16, config);

        // idle polls land at 0s, 1s, 3s, 7s, 11s with the delay capped at 4s
        tokio::time::sleep(Duration::from_millis(7500)).await;
        append(&path, "x\n");
        let e = recv(&mut rx).await;
        assert_eq!(e.line, "x");
        let first = started.elapsed();
        assert!(
            first >= Duration::from_millis(10500) && first <= Duration::from_millis(11500),
            "first line seen after {:?}",
            first
        );

        // data resets the delay to its initial value
        let seen_at = Instant::now();
        tokio::time::sleep(Duration::from_millis(500)).await;
        append(&path, "y\n");
        let e = recv(&mut rx).await;
        assert_eq!(e.line, "y");
        let second = seen_at.elapsed();
        assert!(
            second <= Duration::from_millis(1500),
            "second line seen after {:?}",
            second
        );

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_open_failure_is_error() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = bounded_channel::bounded(1);
        let harvester = Harvester::new(
            FileId::new(0, 0),
            dir.path().join("missing.log"),
            Position::new(0, 0),
            fast_config(),
            tx,
        );

        let result = harvester.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Open { .. })));
    }
}
