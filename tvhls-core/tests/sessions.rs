use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tempfile::TempDir;
use tokio::sync::{oneshot, watch};
use tvhls_core::{
    CatalogSource, SegmentStore, SessionError, SessionManager, SessionState, SessionsSection,
    TranscodeInvocation, TranscoderLauncher, TranscoderProcess, TranscoderSection, UpstreamRelay,
};

const CATALOG: &str = "#EXTM3U\n\
#EXTINF:-1 tvg-name=\"Demo\" tvg-logo=\"l.png\",Demo\n\
http://x/123.ts\n\
#EXTINF:-1 tvg-name=\"News\",News\n\
http://x/456.ts\n";

#[derive(Debug, Clone, Copy)]
enum Behavior {
    WriteManifest,
    Silent,
    ExitImmediately(i32),
    FailSpawn,
}

struct RecordingLauncher {
    behavior: Behavior,
    calls: Mutex<Vec<TranscodeInvocation>>,
    exits: Mutex<Vec<Option<oneshot::Sender<i32>>>>,
}

impl RecordingLauncher {
    fn build(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: Mutex::new(Vec::new()),
            exits: Mutex::new(Vec::new()),
        })
    }

    fn launches(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn invocation(&self, index: usize) -> TranscodeInvocation {
        self.calls.lock().unwrap()[index].clone()
    }

    /// Simulates the `index`-th process exiting on its own.
    fn exit(&self, index: usize, code: i32) {
        let sender = self.exits.lock().unwrap()[index].take();
        if let Some(sender) = sender {
            let _ = sender.send(code);
        }
    }
}

#[async_trait]
impl TranscoderLauncher for RecordingLauncher {
    async fn launch(
        &self,
        invocation: &TranscodeInvocation,
    ) -> io::Result<Box<dyn TranscoderProcess>> {
        // Widen the window in which a second caller could slip in.
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.calls.lock().unwrap().push(invocation.clone());

        let (tx, rx) = oneshot::channel();
        match self.behavior {
            Behavior::FailSpawn => {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such binary"));
            }
            Behavior::WriteManifest => {
                fs::write(&invocation.playlist_path, "#EXTM3U\n#EXT-X-VERSION:3\n")?;
                self.exits.lock().unwrap().push(Some(tx));
            }
            Behavior::Silent => {
                self.exits.lock().unwrap().push(Some(tx));
            }
            Behavior::ExitImmediately(code) => {
                let _ = tx.send(code);
                self.exits.lock().unwrap().push(None);
            }
        }

        Ok(Box::new(FakeProcess {
            pid: 4000 + self.launches() as u32,
            exit: rx,
            killed: false,
        }))
    }
}

struct FakeProcess {
    pid: u32,
    exit: oneshot::Receiver<i32>,
    killed: bool,
}

#[async_trait]
impl TranscoderProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        if self.killed {
            return Ok(None);
        }
        match (&mut self.exit).await {
            Ok(code) => Ok(Some(code)),
            Err(_) => Ok(None),
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.killed = true;
        Ok(())
    }
}

fn session_options() -> SessionsSection {
    SessionsSection {
        startup_timeout_seconds: 2,
        poll_interval_ms: 10,
        ..SessionsSection::default()
    }
}

fn build_manager(dir: &Path, launcher: Arc<RecordingLauncher>) -> SessionManager {
    build_manager_with(dir, launcher, session_options())
}

fn build_manager_with(
    dir: &Path,
    launcher: Arc<RecordingLauncher>,
    options: SessionsSection,
) -> SessionManager {
    let catalog = dir.join("channels.txt");
    fs::write(&catalog, CATALOG).unwrap();
    let relay = UpstreamRelay::with_client(reqwest::Client::new(), "http://127.0.0.1:3000");
    SessionManager::new(
        CatalogSource::new(catalog),
        relay,
        SegmentStore::new(dir.join("hls")),
        launcher,
        TranscoderSection::default(),
        options,
    )
}

async fn wait_until_inactive(manager: &SessionManager, channel_id: &str) {
    for _ in 0..200 {
        if manager.get(channel_id).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("channel {channel_id} still active");
}

#[tokio::test]
async fn concurrent_requests_spawn_a_single_process() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::Silent);
    let manager = Arc::new(build_manager(dir.path(), Arc::clone(&launcher)));

    let requests = (0..8).map(|_| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.ensure_session("123").await })
    });
    let sessions: Vec<_> = join_all(requests)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(launcher.launches(), 1);
    assert!(sessions
        .iter()
        .all(|session| Arc::ptr_eq(session, &sessions[0])));
    assert_eq!(manager.list_active_channels().await, vec!["123".to_string()]);
}

#[tokio::test]
async fn transcoder_reads_from_the_relay() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::WriteManifest);
    let manager = build_manager(dir.path(), Arc::clone(&launcher));

    let first = manager.ensure_session("123").await.unwrap();
    let second = manager.ensure_session("123").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(launcher.launches(), 1);

    let invocation = launcher.invocation(0);
    assert_eq!(
        invocation.input_url,
        "http://127.0.0.1:3000/proxy?url=http%3A%2F%2Fx%2F123.ts"
    );
    assert_eq!(first.source_url(), "http://x/123.ts");
    assert_eq!(first.pid(), Some(4001));
    assert!(invocation
        .playlist_path
        .ends_with(Path::new("hls").join("123").join("index.m3u8")));
}

#[tokio::test]
async fn exited_process_frees_the_channel() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::Silent);
    let manager = build_manager(dir.path(), Arc::clone(&launcher));

    let first = manager.ensure_session("123").await.unwrap();
    launcher.exit(0, 1);
    wait_until_inactive(&manager, "123").await;
    assert_eq!(first.state(), SessionState::Failed);
    assert_eq!(first.exit_code(), Some(1));

    let second = manager.ensure_session("123").await.unwrap();
    assert_eq!(launcher.launches(), 2);
    assert_ne!(first.session_id(), second.session_id());
    assert!(second.is_live());
}

#[tokio::test]
async fn spawn_failure_leaves_no_entry() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::FailSpawn);
    let manager = build_manager(dir.path(), Arc::clone(&launcher));

    let err = manager.ensure_session("123").await.unwrap_err();
    assert!(matches!(err, SessionError::Spawn { ref channel_id, .. } if channel_id == "123"));
    assert!(manager.list_active_channels().await.is_empty());
    assert!(manager.sessions().await.is_empty());
}

#[tokio::test]
async fn unknown_and_unsafe_ids_are_not_found() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::Silent);
    let manager = build_manager(dir.path(), Arc::clone(&launcher));

    for id in ["999", "../123", ""] {
        let err = manager.ensure_session(id).await.unwrap_err();
        assert!(matches!(err, SessionError::ChannelNotFound { .. }), "{id}");
    }
    assert_eq!(launcher.launches(), 0);
    assert!(!dir.path().join("hls").join("999").exists());
}

#[tokio::test]
async fn missing_catalog_is_reported() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::Silent);
    let manager = build_manager(dir.path(), Arc::clone(&launcher));
    fs::remove_file(dir.path().join("channels.txt")).unwrap();

    let err = manager.ensure_session("123").await.unwrap_err();
    assert!(matches!(err, SessionError::Catalog(_)));
}

#[tokio::test]
async fn open_channel_waits_for_the_manifest() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::WriteManifest);
    let manager = build_manager(dir.path(), Arc::clone(&launcher));

    let playlist = manager.open_channel("123").await.unwrap();
    assert_eq!(
        fs::read_to_string(&playlist).unwrap(),
        "#EXTM3U\n#EXT-X-VERSION:3\n"
    );
    let session = manager.get("123").await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);

    let summaries = manager.sessions().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].state, SessionState::Ready);
    assert_eq!(summaries[0].pid, Some(4001));
}

#[tokio::test]
async fn stale_manifest_is_removed_before_spawn() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::Silent);
    let manager = build_manager(dir.path(), Arc::clone(&launcher));
    let channel_dir = dir.path().join("hls").join("123");
    fs::create_dir_all(&channel_dir).unwrap();
    fs::write(channel_dir.join("index.m3u8"), "#EXTM3U\n").unwrap();

    let session = manager.ensure_session("123").await.unwrap();
    assert!(!session.playlist_path().exists());

    let err = manager
        .await_ready(&session, Duration::from_millis(80))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::StartupTimeout { .. }));
}

#[tokio::test]
async fn startup_timeout_stops_the_process() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::Silent);
    let manager = build_manager(dir.path(), Arc::clone(&launcher));

    let session = manager.ensure_session("456").await.unwrap();
    let err = manager
        .await_ready(&session, Duration::from_millis(100))
        .await
        .unwrap_err();
    match err {
        SessionError::StartupTimeout { channel_id, timeout } => {
            assert_eq!(channel_id, "456");
            assert_eq!(timeout, Duration::from_millis(100));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(manager.list_active_channels().await.is_empty());
}

#[tokio::test]
async fn early_exit_is_reported_before_timeout() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::ExitImmediately(1));
    let manager = build_manager(dir.path(), Arc::clone(&launcher));

    let session = manager.ensure_session("123").await.unwrap();
    let err = manager
        .await_ready(&session, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::SessionExited {
            exit_code: Some(1),
            ..
        }
    ));
    wait_until_inactive(&manager, "123").await;
}

#[tokio::test]
async fn idle_sessions_are_reaped() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::WriteManifest);
    let manager = build_manager(dir.path(), Arc::clone(&launcher));

    manager.open_channel("123").await.unwrap();
    assert!(manager.reap_idle_after(Duration::from_secs(3600)).await.is_empty());

    let reaped = manager.reap_idle_after(Duration::ZERO).await;
    assert_eq!(reaped, vec!["123".to_string()]);
    assert!(manager.list_active_channels().await.is_empty());

    // A fresh session is well within the configured idle timeout.
    manager.ensure_session("456").await.unwrap();
    assert!(manager.reap_idle().await.is_empty());
    assert_eq!(manager.list_active_channels().await, vec!["456".to_string()]);
}

#[tokio::test]
async fn stop_and_shutdown_clear_the_registry() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::Silent);
    let manager = build_manager(dir.path(), Arc::clone(&launcher));

    let first = manager.ensure_session("123").await.unwrap();
    let second = manager.ensure_session("456").await.unwrap();
    assert_eq!(
        manager.list_active_channels().await,
        vec!["123".to_string(), "456".to_string()]
    );

    assert!(manager.stop_session("123").await);
    assert!(!manager.stop_session("123").await);
    assert_eq!(first.state(), SessionState::Stopped);

    manager.shutdown().await;
    assert_eq!(second.state(), SessionState::Stopped);
    assert!(manager.list_active_channels().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn idle_reaper_loop_runs_until_shutdown() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::Silent);
    let manager = Arc::new(build_manager_with(
        dir.path(),
        Arc::clone(&launcher),
        SessionsSection {
            idle_timeout_seconds: 2,
            reap_interval_seconds: 1,
            ..session_options()
        },
    ));
    let session = manager.ensure_session("123").await.unwrap();

    let (stop_tx, stop_rx) = watch::channel(false);
    let reaper = tokio::spawn(Arc::clone(&manager).run_idle_reaper(stop_rx));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(session.is_live());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(manager.list_active_channels().await.is_empty());

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), reaper)
        .await
        .expect("reaper should stop on shutdown")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn disabled_reaper_returns_immediately() {
    let dir = TempDir::new().unwrap();
    let launcher = RecordingLauncher::build(Behavior::Silent);
    let manager = Arc::new(build_manager_with(
        dir.path(),
        launcher,
        SessionsSection {
            idle_timeout_seconds: 0,
            ..session_options()
        },
    ));
    let (_stop_tx, stop_rx) = watch::channel(false);
    tokio::time::timeout(Duration::from_secs(1), manager.run_idle_reaper(stop_rx))
        .await
        .expect("disabled reaper should not loop");
}
