// SPDX-License-Identifier: Apache-2.0

//! Prospector: discovers files and manages one harvester per file identity.
//!
//! The prospector is the only owner of the harvester set. Each scan it reaps
//! finished harvesters, resolves the configured globs, and starts a harvester
//! for every matched file that has none. Resume positions come from the
//! registry snapshot loaded at startup and, afterwards, from the last
//! position each harvester reported.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::join_all;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{BoundedSender, SendError};
use crate::config::{ShipperConfig, StartAt};
use crate::error::{Error, Result};
use crate::event::{Event, Position};
use crate::harvester::{Harvester, HarvesterConfig, HarvesterProgress, HarvesterState, StopReason};
use crate::input::{FileFinder, FileId};
use crate::registrar::{FileState, RegistrarMessage};

#[derive(Debug, Clone)]
pub struct ProspectorConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub scan_interval: Duration,
    pub start_at: StartAt,
    pub ignore_older: Option<Duration>,
    pub harvester: HarvesterConfig,
}

impl From<&ShipperConfig> for ProspectorConfig {
    fn from(config: &ShipperConfig) -> Self {
        Self {
            include: config.include.clone(),
            exclude: config.exclude.clone(),
            scan_interval: config.scan_interval,
            start_at: config.start_at,
            ignore_older: config.ignore_older,
            harvester: HarvesterConfig::from(config),
        }
    }
}

/// Bookkeeping for one running harvester.
pub struct HarvesterHandle {
    pub file_id: FileId,
    pub path: PathBuf,
    progress: Arc<HarvesterProgress>,
    cancel: CancellationToken,
    task: JoinHandle<Result<StopReason>>,
}

impl HarvesterHandle {
    /// End of the last line the harvester handed downstream.
    pub fn position(&self) -> Position {
        self.progress.position()
    }

    pub fn state(&self) -> HarvesterState {
        self.progress.state()
    }

    pub fn is_live(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

pub struct Prospector {
    config: ProspectorConfig,
    finder: FileFinder,
    /// Resume position for every identity seen so far
    known: HashMap<FileId, Position>,
    handles: HashMap<FileId, HarvesterHandle>,
    /// Identity last seen at each path, for rotation logging
    path_index: HashMap<PathBuf, FileId>,
    events: BoundedSender<Event>,
    registrar: BoundedSender<RegistrarMessage>,
    warned_empty: bool,
}

impl Prospector {
    pub fn new(
        config: ProspectorConfig,
        states: &HashMap<FileId, FileState>,
        events: BoundedSender<Event>,
        registrar: BoundedSender<RegistrarMessage>,
    ) -> Result<Self> {
        let finder = FileFinder::new(config.include.clone(), config.exclude.clone())?;
        let known = states
            .iter()
            .map(|(id, state)| (*id, state.position()))
            .collect();

        Ok(Self {
            config,
            finder,
            known,
            handles: HashMap::new(),
            path_index: HashMap::new(),
            events,
            registrar,
            warned_empty: false,
        })
    }

    /// Scan on every tick until `cancel` fires, then wait for all harvesters.
    ///
    /// Dropping the prospector afterwards releases its event sender, which is
    /// what lets the spooler drain and exit.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            include = ?self.config.include,
            interval = ?self.config.scan_interval,
            "Prospector started"
        );

        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            select! {
                biased;

                _ = cancel.cancelled() => break Ok(()),

                _ = ticker.tick() => {
                    if let Err(e) = self.scan(&cancel).await {
                        break Err(e);
                    }
                }
            }
        };

        self.shutdown().await;
        result
    }

    /// Number of harvesters currently running.
    pub fn live_harvesters(&self) -> usize {
        self.handles.values().filter(|h| h.is_live()).count()
    }

    pub fn handle(&self, file_id: &FileId) -> Option<&HarvesterHandle> {
        self.handles.get(file_id)
    }

    /// One discovery pass.
    pub async fn scan(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.reap().await;

        let paths = match self.finder.find_files() {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, "File discovery failed");
                return Ok(());
            }
        };

        if paths.is_empty() && !self.warned_empty {
            warn!(include = ?self.config.include, "No files matched the include patterns");
            self.warned_empty = true;
        }

        for path in paths {
            let metadata = match std::fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = ?path, error = %e, "Failed to stat matched file");
                    continue;
                }
            };
            let file_id = FileId::from_metadata(&metadata, &path);

            self.note_path(&path, file_id);

            if self.handles.contains_key(&file_id) {
                continue;
            }

            if self.is_ignored(&metadata) {
                if !self.known.contains_key(&file_id) {
                    debug!(path = ?path, "Skipping file older than ignore_older");
                    self.discover(file_id, &path, Position::new(0, metadata.len()), cancel)
                        .await?;
                }
                continue;
            }

            let start = match self.known.get(&file_id) {
                Some(position) => *position,
                None => {
                    let position = match self.config.start_at {
                        StartAt::Beginning => Position::new(0, 0),
                        StartAt::End => Position::new(0, metadata.len()),
                    };
                    self.discover(file_id, &path, position, cancel).await?;
                    position
                }
            };

            self.start_harvester(file_id, path, start, cancel);
        }

        Ok(())
    }

    fn start_harvester(
        &mut self,
        file_id: FileId,
        path: PathBuf,
        start: Position,
        cancel: &CancellationToken,
    ) {
        debug!(
            file_id = %file_id,
            path = ?path,
            offset = start.offset,
            generation = start.generation,
            "Starting harvester"
        );

        let harvester = Harvester::new(
            file_id,
            path.clone(),
            start,
            self.config.harvester.clone(),
            self.events.clone(),
        );
        let progress = harvester.progress();
        let child = cancel.child_token();
        let task = tokio::spawn(harvester.run(child.clone()));

        self.handles.insert(
            file_id,
            HarvesterHandle {
                file_id,
                path,
                progress,
                cancel: child,
                task,
            },
        );
    }

    /// First sighting of an identity: remember where it starts and create its
    /// registry entry.
    async fn discover(
        &mut self,
        file_id: FileId,
        path: &Path,
        position: Position,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(file_id = %file_id, path = ?path, offset = position.offset, "Discovered new file");
        self.known.insert(file_id, position);

        let state = FileState::new(file_id, position.offset, path.to_path_buf());
        match self
            .registrar
            .send_or_cancel(RegistrarMessage::Discovered(state), cancel)
            .await
        {
            Ok(()) | Err(SendError::Cancelled) => Ok(()),
            Err(SendError::Disconnected) => Err(Error::ChannelClosed),
        }
    }

    fn is_ignored(&self, metadata: &std::fs::Metadata) -> bool {
        let Some(ignore_older) = self.config.ignore_older else {
            return false;
        };
        metadata
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .is_some_and(|age| age > ignore_older)
    }

    fn note_path(&mut self, path: &Path, file_id: FileId) {
        if let Some(previous) = self.path_index.insert(path.to_path_buf(), file_id) {
            if previous != file_id {
                let draining = self.handles.get(&previous).is_some_and(|h| h.is_live());
                info!(
                    path = ?path,
                    old = %previous,
                    new = %file_id,
                    draining,
                    "File rotated"
                );
            }
        }
    }

    /// Release handles whose harvester has finished, keeping their last position.
    async fn reap(&mut self) {
        let finished: Vec<FileId> = self
            .handles
            .iter()
            .filter(|(_, h)| !h.is_live())
            .map(|(id, _)| *id)
            .collect();

        for file_id in finished {
            if let Some(handle) = self.handles.remove(&file_id) {
                self.retire(handle).await;
            }
        }
    }

    async fn retire(&mut self, handle: HarvesterHandle) {
        let position = handle.position();
        match handle.task.await {
            Ok(Ok(reason)) => debug!(
                file_id = %handle.file_id,
                path = ?handle.path,
                reason = %reason,
                "Harvester finished"
            ),
            Ok(Err(e)) => warn!(
                file_id = %handle.file_id,
                path = ?handle.path,
                error = %e,
                "Harvester failed, will retry on next scan"
            ),
            Err(e) => error!(file_id = %handle.file_id, "Failed to join harvester: {:?}", e),
        }
        self.known.insert(handle.file_id, position);
    }

    async fn shutdown(&mut self) {
        for handle in self.handles.values() {
            handle.stop();
        }

        let handles: Vec<HarvesterHandle> = self.handles.drain().map(|(_, h)| h).collect();
        let count = handles.len();
        let results = join_all(handles.into_iter().map(|h| async move {
            let position = h.position();
            (h.file_id, position, h.task.await)
        }))
        .await;

        for (file_id, position, result) in results {
            if let Ok(Err(e)) = result {
                debug!(file_id = %file_id, error = %e, "Harvester ended with error during shutdown");
            }
            self.known.insert(file_id, position);
        }

        info!(harvesters = count, "Prospector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::{self, BoundedReceiver};
    use crate::input::identity;
    use std::fs;
    use tempfile::TempDir;

    fn config(dir: &Path, start_at: StartAt) -> ProspectorConfig {
        ProspectorConfig {
            include: vec![format!("{}/*.log", dir.display())],
            exclude: vec![],
            scan_interval: Duration::from_millis(20),
            start_at,
            ignore_older: None,
            harvester: HarvesterConfig {
                backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(10),
                close_removed_after: Duration::from_millis(30),
                ..Default::default()
            },
        }
    }

    fn prospector(
        config: ProspectorConfig,
        states: &HashMap<FileId, FileState>,
    ) -> (
        Prospector,
        BoundedReceiver<Event>,
        BoundedReceiver<RegistrarMessage>,
    ) {
        let (events_tx, events_rx) = bounded_channel::bounded(64);
        let (reg_tx, reg_rx) = bounded_channel::bounded(64);
        let p = Prospector::new(config, states, events_tx, reg_tx).unwrap();
        (p, events_rx, reg_rx)
    }

    async fn recv(rx: &mut BoundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .unwrap()
            .unwrap()
    }

    /// Shared in-memory sink for captured log output.
    #[derive(Clone, Default)]
    struct LogBuf(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuf {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuf {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_empty_match_warns_once() {
        let dir = TempDir::new().unwrap();
        let logs = LogBuf::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (mut p, _events, _reg) = prospector(config(dir.path(), StartAt::Beginning), &HashMap::new());
        let cancel = CancellationToken::new();
        p.scan(&cancel).await.unwrap();
        p.scan(&cancel).await.unwrap();
        p.scan(&cancel).await.unwrap();

        assert!(p.warned_empty);
        let output = logs.contents();
        assert_eq!(
            output.matches("No files matched the include patterns").count(),
            1,
            "log output: {}",
            output
        );
        assert!(output.contains("WARN"));
    }

    #[tokio::test]
    async fn test_new_file_read_from_beginning() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.log"), "hello\n").unwrap();

        let (mut p, mut events, reg) = prospector(config(dir.path(), StartAt::Beginning), &HashMap::new());
        let cancel = CancellationToken::new();
        p.scan(&cancel).await.unwrap();

        assert_eq!(recv(&mut events).await.line, "hello");
        match reg.try_recv() {
            Some(RegistrarMessage::Discovered(state)) => assert_eq!(state.offset, 0),
            other => panic!("expected discovery, got {:?}", other),
        }

        cancel.cancel();
        p.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_at_end_skips_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "old\n").unwrap();

        let (mut p, mut events, reg) = prospector(config(dir.path(), StartAt::End), &HashMap::new());
        let cancel = CancellationToken::new();
        p.scan(&cancel).await.unwrap();

        match reg.try_recv() {
            Some(RegistrarMessage::Discovered(state)) => assert_eq!(state.offset, 4),
            other => panic!("expected discovery, got {:?}", other),
        }

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut f, b"new\n").unwrap();

        let e = recv(&mut events).await;
        assert_eq!(e.line, "new");
        assert_eq!(e.range.offset, 4);

        cancel.cancel();
        p.shutdown().await;
    }

    #[tokio::test]
    async fn test_resumes_from_registry_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "one\ntwo\n").unwrap();
        let id = identity(&path).unwrap().unwrap();

        let mut states = HashMap::new();
        states.insert(id, FileState::new(id, 4, path.clone()));

        let (mut p, mut events, reg) = prospector(config(dir.path(), StartAt::Beginning), &states);
        let cancel = CancellationToken::new();
        p.scan(&cancel).await.unwrap();

        let e = recv(&mut events).await;
        assert_eq!(e.line, "two");
        assert_eq!(e.range.offset, 4);
        // already known, nothing to register
        assert!(reg.try_recv().is_none());

        cancel.cancel();
        p.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_harvester_per_identity() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.log"), "x\n").unwrap();

        let (mut p, _events, _reg) = prospector(config(dir.path(), StartAt::Beginning), &HashMap::new());
        let cancel = CancellationToken::new();
        p.scan(&cancel).await.unwrap();
        p.scan(&cancel).await.unwrap();
        p.scan(&cancel).await.unwrap();

        assert_eq!(p.handles.len(), 1);
        assert_eq!(p.live_harvesters(), 1);

        cancel.cancel();
        p.shutdown().await;
        assert_eq!(p.live_harvesters(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotation_harvests_both_identities() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "a1\n").unwrap();
        let old_id = identity(&path).unwrap().unwrap();

        let (mut p, mut events, _reg) = prospector(config(dir.path(), StartAt::Beginning), &HashMap::new());
        let cancel = CancellationToken::new();
        p.scan(&cancel).await.unwrap();
        assert_eq!(recv(&mut events).await.line, "a1");

        // rotated name no longer matches *.log
        fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        let mut f = fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("app.log.1"))
            .unwrap();
        std::io::Write::write_all(&mut f, b"a2\n").unwrap();
        fs::write(&path, "b1\n").unwrap();
        let new_id = identity(&path).unwrap().unwrap();

        p.scan(&cancel).await.unwrap();
        assert!(p.handle(&old_id).is_some());
        assert!(p.handle(&new_id).is_some());

        let mut lines = vec![recv(&mut events).await, recv(&mut events).await];
        lines.sort_by(|a, b| a.line.cmp(&b.line));
        assert_eq!(lines[0].line, "a2");
        assert_eq!(lines[0].file_id, old_id);
        assert_eq!(lines[1].line, "b1");
        assert_eq!(lines[1].file_id, new_id);

        // old harvester retires after the grace period and is reaped
        tokio::time::sleep(Duration::from_millis(200)).await;
        p.scan(&cancel).await.unwrap();
        assert!(p.handle(&old_id).is_none());
        assert_eq!(p.known[&old_id], Position::new(0, 6));

        cancel.cancel();
        p.shutdown().await;
    }

    #[tokio::test]
    async fn test_ignore_older_skips_stale_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.log");
        fs::write(&path, "ancient\n").unwrap();

        let mut cfg = config(dir.path(), StartAt::Beginning);
        cfg.ignore_older = Some(Duration::from_nanos(1));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (mut p, _events, reg) = prospector(cfg, &HashMap::new());
        let cancel = CancellationToken::new();
        p.scan(&cancel).await.unwrap();

        assert_eq!(p.live_harvesters(), 0);
        match reg.try_recv() {
            Some(RegistrarMessage::Discovered(state)) => assert_eq!(state.offset, 8),
            other => panic!("expected discovery, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_stops_harvesters_on_cancel() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.log"), "x\n").unwrap();

        let (p, mut events, _reg) = prospector(config(dir.path(), StartAt::Beginning), &HashMap::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(p.run(cancel.clone()));

        recv(&mut events).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // every sender is gone once the prospector returns
        assert!(events.next().await.is_none());
    }
}
