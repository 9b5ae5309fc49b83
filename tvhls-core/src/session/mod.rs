//! On-demand transcoding sessions, one per channel.
//!
//! The registry is the only shared mutable state. Every check-then-spawn runs
//! under its lock, and the exit monitor removes a session under the same lock,
//! so at most one live transcoder exists per channel id.
//!
//! Catalog lookups run before the lock is taken. Output directory preparation,
//! stale manifest removal and the spawn itself stay inside it, so cold starts
//! of different channels still queue behind one another for that short span.

mod error;
mod types;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogSource;
use crate::config::{SessionsSection, TranscoderSection};
use crate::relay::UpstreamRelay;
use crate::segments::SegmentStore;
use crate::transcoder::{TranscodeInvocation, TranscoderLauncher, TranscoderProcess};

pub use error::{SessionError, SessionResult};
pub use types::{Session, SessionState, SessionSummary};

pub type SessionHandle = Arc<Session>;

type Registry = Arc<Mutex<HashMap<String, SessionHandle>>>;

pub struct SessionManager {
    catalog: CatalogSource,
    relay: UpstreamRelay,
    store: SegmentStore,
    launcher: Arc<dyn TranscoderLauncher>,
    transcoder: TranscoderSection,
    options: SessionsSection,
    registry: Registry,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("catalog", &self.catalog)
            .field("store", &self.store)
            .field("transcoder", &self.transcoder)
            .field("options", &self.options)
            .finish()
    }
}

impl SessionManager {
    pub fn new(
        catalog: CatalogSource,
        relay: UpstreamRelay,
        store: SegmentStore,
        launcher: Arc<dyn TranscoderLauncher>,
        transcoder: TranscoderSection,
        options: SessionsSection,
    ) -> Self {
        Self {
            catalog,
            relay,
            store,
            launcher,
            transcoder,
            options,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn catalog(&self) -> &CatalogSource {
        &self.catalog
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    /// Returns the live session for `channel_id`, starting one if needed.
    pub async fn ensure_session(&self, channel_id: &str) -> SessionResult<SessionHandle> {
        validate_channel_id(channel_id)?;

        if let Some(session) = self.live_session(channel_id).await {
            return Ok(session);
        }

        // The catalog read happens outside the registry lock; the entry is
        // re-checked once the lock is held again.
        let record = self.catalog.resolve(channel_id).await?.ok_or_else(|| {
            SessionError::ChannelNotFound {
                channel_id: channel_id.to_string(),
            }
        })?;

        let mut registry = self.registry.lock().await;
        if let Some(session) = registry.get(channel_id) {
            if session.is_live() {
                session.touch();
                debug!(channel_id, session_id = %session.session_id(), "session started concurrently");
                return Ok(Arc::clone(session));
            }
            registry.remove(channel_id);
        }

        let output_dir = self
            .store
            .prepare_channel(channel_id)
            .await
            .map_err(|source| SessionError::Io {
                path: self.store.channel_dir(channel_id),
                source,
            })?;
        if self
            .store
            .remove_playlist(channel_id)
            .await
            .map_err(|source| SessionError::Io {
                path: self.store.playlist_path(channel_id),
                source,
            })?
        {
            debug!(channel_id, "removed stale manifest");
        }

        let input_url = self.relay.local_url(&record.url);
        let invocation =
            TranscodeInvocation::new(&self.transcoder, &self.store, channel_id, &input_url);
        let session = Arc::new(Session::new(
            channel_id,
            &record.url,
            output_dir,
            invocation.playlist_path.clone(),
        ));
        registry.insert(channel_id.to_string(), Arc::clone(&session));

        let process = match self.launcher.launch(&invocation).await {
            Ok(process) => process,
            Err(source) => {
                registry.remove(channel_id);
                error!(channel_id, %source, command = %invocation.command_line(), "failed to spawn transcoder");
                return Err(SessionError::Spawn {
                    channel_id: channel_id.to_string(),
                    command: invocation.command_line(),
                    source,
                });
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        session.attach(process.pid(), stop_tx);
        tokio::spawn(monitor_exit(
            Arc::clone(&self.registry),
            Arc::clone(&session),
            process,
            stop_rx,
        ));

        info!(
            channel_id,
            session_id = %session.session_id(),
            pid = ?session.pid(),
            input = %input_url,
            "transcoder started"
        );
        Ok(session)
    }

    async fn live_session(&self, channel_id: &str) -> Option<SessionHandle> {
        let registry = self.registry.lock().await;
        let session = registry.get(channel_id).filter(|session| session.is_live())?;
        session.touch();
        debug!(channel_id, session_id = %session.session_id(), "reusing session");
        Some(Arc::clone(session))
    }

    /// Polls for the session manifest until it exists, the process dies or
    /// `timeout` elapses. A timed-out session is stopped.
    pub async fn await_ready(
        &self,
        session: &SessionHandle,
        timeout: Duration,
    ) -> SessionResult<PathBuf> {
        session.touch();
        let deadline = Instant::now() + timeout;
        let mut state = session.subscribe();
        let mut ticker = tokio::time::interval(self.options.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let playlist = session.playlist_path();
            if tokio::fs::try_exists(playlist).await.unwrap_or(false) {
                if session.mark_ready() {
                    info!(
                        channel_id = session.channel_id(),
                        session_id = %session.session_id(),
                        "session ready"
                    );
                }
                return Ok(playlist.to_path_buf());
            }

            if state.borrow_and_update().is_terminal() {
                return Err(SessionError::SessionExited {
                    channel_id: session.channel_id().to_string(),
                    exit_code: session.exit_code(),
                });
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = state.changed() => {}
                _ = sleep_until(deadline) => {
                    warn!(
                        channel_id = session.channel_id(),
                        session_id = %session.session_id(),
                        ?timeout,
                        "manifest did not appear in time, stopping transcoder"
                    );
                    self.stop(session).await;
                    return Err(SessionError::StartupTimeout {
                        channel_id: session.channel_id().to_string(),
                        timeout,
                    });
                }
            }
        }
    }

    /// `ensure_session` followed by `await_ready` with the configured bound.
    pub async fn open_channel(&self, channel_id: &str) -> SessionResult<PathBuf> {
        let session = self.ensure_session(channel_id).await?;
        self.await_ready(&session, self.options.startup_timeout())
            .await
    }

    pub async fn get(&self, channel_id: &str) -> Option<SessionHandle> {
        self.registry.lock().await.get(channel_id).cloned()
    }

    pub async fn list_active_channels(&self) -> Vec<String> {
        let registry = self.registry.lock().await;
        let mut channels: Vec<String> = registry.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let registry = self.registry.lock().await;
        let mut summaries: Vec<SessionSummary> =
            registry.values().map(|session| session.summary()).collect();
        summaries.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        summaries
    }

    /// Stops the session for `channel_id`. Returns `false` when none is running.
    pub async fn stop_session(&self, channel_id: &str) -> bool {
        let Some(session) = self.get(channel_id).await else {
            return false;
        };
        self.stop(&session).await;
        true
    }

    /// Kills the process and waits until its monitor has cleaned the registry.
    async fn stop(&self, session: &SessionHandle) {
        session.request_stop();
        session.wait_terminal().await;
    }

    pub async fn reap_idle(&self) -> Vec<String> {
        match self.options.idle_timeout() {
            Some(idle) => self.reap_idle_after(idle).await,
            None => Vec::new(),
        }
    }

    /// Stops every session nobody has touched for at least `idle`.
    pub async fn reap_idle_after(&self, idle: Duration) -> Vec<String> {
        let candidates: Vec<SessionHandle> = {
            let registry = self.registry.lock().await;
            registry
                .values()
                .filter(|session| session.idle_for() >= idle)
                .cloned()
                .collect()
        };

        let mut reaped = Vec::with_capacity(candidates.len());
        for session in candidates {
            info!(
                channel_id = session.channel_id(),
                session_id = %session.session_id(),
                idle_seconds = session.idle_for().as_secs(),
                "stopping idle session"
            );
            self.stop(&session).await;
            reaped.push(session.channel_id().to_string());
        }
        reaped
    }

    pub async fn run_idle_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.options.idle_timeout().is_none() {
            debug!("idle reaper disabled");
            return;
        }
        let mut ticker = tokio::time::interval(self.options.reap_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reap_idle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("idle reaper stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Stops every running session.
    pub async fn shutdown(&self) {
        let sessions: Vec<SessionHandle> = {
            let registry = self.registry.lock().await;
            registry.values().cloned().collect()
        };
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "stopping all sessions");
        join_all(sessions.iter().map(|session| self.stop(session))).await;
    }
}

async fn monitor_exit(
    registry: Registry,
    session: SessionHandle,
    mut process: Box<dyn TranscoderProcess>,
    stop: oneshot::Receiver<()>,
) {
    let outcome = tokio::select! {
        status = process.wait() => status,
        _ = stop => {
            if let Err(error) = process.kill().await {
                warn!(channel_id = session.channel_id(), %error, "failed to kill transcoder");
            }
            process.wait().await
        }
    };
    let exit_code = match outcome {
        Ok(code) => code,
        Err(error) => {
            warn!(channel_id = session.channel_id(), %error, "failed to wait on transcoder");
            None
        }
    };

    let mut registry = registry.lock().await;
    let owned = registry
        .get(session.channel_id())
        .is_some_and(|current| current.session_id() == session.session_id());
    if owned {
        registry.remove(session.channel_id());
    }
    let state = session.finish(exit_code);
    drop(registry);

    info!(
        channel_id = session.channel_id(),
        session_id = %session.session_id(),
        exit_code = ?exit_code,
        %state,
        "transcoder exited"
    );
}

/// Channel ids double as directory names, so only a conservative alphabet
/// is accepted.
fn validate_channel_id(channel_id: &str) -> SessionResult<()> {
    let valid = !channel_id.is_empty()
        && channel_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SessionError::ChannelNotFound {
            channel_id: channel_id.to_string(),
        })
    }
}
