use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl SessionState {
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Ready)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Failed => "failed",
            SessionState::Stopped => "stopped",
        };
        write!(f, "{}", label)
    }
}

/// One channel's transcoder run. Shared between the registry, the exit
/// monitor and any request waiting on it.
pub struct Session {
    channel_id: String,
    session_id: Uuid,
    source_url: String,
    output_dir: PathBuf,
    playlist_path: PathBuf,
    started_at: DateTime<Utc>,
    pid: OnceLock<u32>,
    exit_code: OnceLock<Option<i32>>,
    state: watch::Sender<SessionState>,
    last_access: Mutex<Instant>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    stop_requested: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("channel_id", &self.channel_id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        channel_id: &str,
        source_url: &str,
        output_dir: PathBuf,
        playlist_path: PathBuf,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            channel_id: channel_id.to_string(),
            session_id: Uuid::new_v4(),
            source_url: source_url.to_string(),
            output_dir,
            playlist_path,
            started_at: Utc::now(),
            pid: OnceLock::new(),
            exit_code: OnceLock::new(),
            state,
            last_access: Mutex::new(Instant::now()),
            stop: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn playlist_path(&self) -> &Path {
        &self.playlist_path
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied().flatten()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    pub fn idle_for(&self) -> Duration {
        let last = *self
            .last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        last.elapsed()
    }

    pub(crate) fn touch(&self) {
        *self
            .last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub(crate) fn attach(&self, pid: Option<u32>, stop: oneshot::Sender<()>) {
        if let Some(pid) = pid {
            let _ = self.pid.set(pid);
        }
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop);
    }

    /// Starting -> Ready. Returns `true` on the first transition only.
    pub(crate) fn mark_ready(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Starting {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn finish(&self, exit_code: Option<i32>) -> SessionState {
        let _ = self.exit_code.set(exit_code);
        let final_state = if self.stop_requested.load(Ordering::SeqCst) || exit_code == Some(0) {
            SessionState::Stopped
        } else {
            SessionState::Failed
        };
        self.state.send_replace(final_state);
        final_state
    }

    /// Signals the exit monitor to kill the process. Idempotent.
    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let sender = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    pub(crate) async fn wait_terminal(&self) {
        let mut receiver = self.subscribe();
        let _ = receiver.wait_for(|state| state.is_terminal()).await;
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            channel_id: self.channel_id.clone(),
            session_id: self.session_id,
            state: self.state(),
            started_at: self.started_at,
            pid: self.pid(),
            source_url: self.source_url.clone(),
            output_dir: self.output_dir.clone(),
            idle_seconds: self.idle_for().as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub channel_id: String,
    pub session_id: Uuid,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub source_url: String,
    pub output_dir: PathBuf,
    pub idle_seconds: u64,
}
