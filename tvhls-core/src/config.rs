use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// Extra segments of slack the sweeper keeps on top of the live window.
const RETENTION_MARGIN_SEGMENTS: u64 = 2;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct TvhlsConfig {
    pub server: ServerSection,
    pub paths: PathsSection,
    pub transcoder: TranscoderSection,
    pub sessions: SessionsSection,
    pub sweeper: SweeperSection,
    pub relay: RelaySection,
}

impl TvhlsConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.catalog)
    }

    pub fn hls_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.hls_dir)
    }

    pub fn public_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.public_dir)
    }

    /// Rejects combinations that would let the sweeper eat a live window.
    pub fn validate(&self) -> Result<()> {
        let transcoder = &self.transcoder;
        if transcoder.segment_seconds == 0 || transcoder.list_size == 0 {
            return Err(ConfigError::Invalid(
                "transcoder.segment_seconds and transcoder.list_size must be positive".into(),
            ));
        }
        if self.sweeper.interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "sweeper.interval_seconds must be positive".into(),
            ));
        }
        if self.sessions.poll_interval_ms == 0 || self.sessions.startup_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "sessions.poll_interval_ms and sessions.startup_timeout_seconds must be positive"
                    .into(),
            ));
        }
        let minimum = transcoder.min_retention_seconds();
        if self.sweeper.retention_seconds <= minimum {
            return Err(ConfigError::Invalid(format!(
                "sweeper.retention_seconds ({}) must exceed {} (segment_seconds x (list_size + {}))",
                self.sweeper.retention_seconds, minimum, RETENTION_MARGIN_SEGMENTS
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
    /// Base URL the transcoder uses to reach the relay. Derived from `port` when unset.
    pub relay_base_url: Option<String>,
    /// How long open connections may keep draining after sessions are stopped.
    pub drain_timeout_seconds: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 3000,
            relay_base_url: None,
            drain_timeout_seconds: 5,
        }
    }
}

impl ServerSection {
    pub fn relay_base_url(&self) -> String {
        match &self.relay_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://127.0.0.1:{}", self.port),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub base_dir: String,
    pub catalog: String,
    pub hls_dir: String,
    pub public_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: ".".into(),
            catalog: "channels.txt".into(),
            hls_dir: "hls".into(),
            public_dir: "public".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscoderSection {
    pub ffmpeg: String,
    pub log_level: String,
    pub segment_seconds: u64,
    pub list_size: u64,
    pub delete_segments: bool,
    pub segment_base_url: String,
}

impl Default for TranscoderSection {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            log_level: "warning".into(),
            segment_seconds: 5,
            list_size: 6,
            delete_segments: true,
            segment_base_url: "/hls".into(),
        }
    }
}

impl TranscoderSection {
    pub fn min_retention_seconds(&self) -> u64 {
        self.segment_seconds * (self.list_size + RETENTION_MARGIN_SEGMENTS)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    pub startup_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    /// Zero disables the idle reaper.
    pub idle_timeout_seconds: u64,
    pub reap_interval_seconds: u64,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            startup_timeout_seconds: 30,
            poll_interval_ms: 500,
            idle_timeout_seconds: 300,
            reap_interval_seconds: 30,
        }
    }
}

impl SessionsSection {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_seconds > 0).then(|| Duration::from_secs(self.idle_timeout_seconds))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweeperSection {
    pub interval_seconds: u64,
    pub retention_seconds: u64,
}

impl Default for SweeperSection {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            retention_seconds: 60,
        }
    }
}

impl SweeperSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub user_agent: String,
    pub connect_timeout_seconds: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            user_agent: concat!("tvhls-relay/", env!("CARGO_PKG_VERSION")).into(),
            connect_timeout_seconds: 10,
        }
    }
}

impl RelaySection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// Loads and validates `tvhls.toml`. A relative `paths.base_dir` is anchored
/// at the directory holding the config file.
pub fn load_tvhls_config<P: AsRef<Path>>(path: P) -> Result<TvhlsConfig> {
    let path = path.as_ref();
    let mut config: TvhlsConfig = load_toml(path)?;
    if Path::new(&config.paths.base_dir).is_relative() {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        config.paths.base_dir = parent
            .join(&config.paths.base_dir)
            .to_string_lossy()
            .to_string();
    }
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
