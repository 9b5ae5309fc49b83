use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info};

use crate::config::TranscoderSection;
use crate::segments::SegmentStore;

/// Fully resolved transcoder command for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeInvocation {
    pub channel_id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub input_url: String,
    pub output_dir: PathBuf,
    pub playlist_path: PathBuf,
}

impl TranscodeInvocation {
    pub fn new(
        config: &TranscoderSection,
        store: &SegmentStore,
        channel_id: &str,
        input_url: &str,
    ) -> Self {
        let output_dir = store.channel_dir(channel_id);
        let playlist_path = store.playlist_path(channel_id);
        let segment_pattern = store.segment_pattern(channel_id);

        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            config.log_level.clone(),
            "-i".to_string(),
            input_url.to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            config.segment_seconds.to_string(),
            "-hls_list_size".to_string(),
            config.list_size.to_string(),
        ];
        if config.delete_segments {
            args.push("-hls_flags".to_string());
            args.push("delete_segments".to_string());
        }
        if !config.segment_base_url.is_empty() {
            args.push("-hls_base_url".to_string());
            args.push(format!(
                "{}/{}/",
                config.segment_base_url.trim_end_matches('/'),
                channel_id
            ));
        }
        args.push("-hls_segment_filename".to_string());
        args.push(segment_pattern.to_string_lossy().to_string());
        args.push(playlist_path.to_string_lossy().to_string());

        Self {
            channel_id: channel_id.to_string(),
            program: PathBuf::from(&config.ffmpeg),
            args,
            input_url: input_url.to_string(),
            output_dir,
            playlist_path,
        }
    }

    pub fn command_line(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

/// A running transcoder the session manager can wait on or kill.
#[async_trait]
pub trait TranscoderProcess: Send {
    fn pid(&self) -> Option<u32>;
    /// Resolves when the process exits, yielding its exit code if it had one.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
    async fn kill(&mut self) -> io::Result<()>;
}

#[async_trait]
pub trait TranscoderLauncher: Send + Sync {
    async fn launch(
        &self,
        invocation: &TranscodeInvocation,
    ) -> io::Result<Box<dyn TranscoderProcess>>;
}

/// Spawns the real ffmpeg binary and forwards its stderr to the log.
#[derive(Debug, Default)]
pub struct SystemTranscoderLauncher;

#[async_trait]
impl TranscoderLauncher for SystemTranscoderLauncher {
    async fn launch(
        &self,
        invocation: &TranscodeInvocation,
    ) -> io::Result<Box<dyn TranscoderProcess>> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(invocation.channel_id.clone(), stderr));
        }
        Ok(Box::new(ChildProcess { child }))
    }
}

async fn forward_stderr(channel_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => info!(target: "tvhls::ffmpeg", channel_id = %channel_id, "{line}"),
            Ok(None) => break,
            Err(error) => {
                debug!(channel_id = %channel_id, %error, "stopped reading transcoder stderr");
                break;
            }
        }
    }
}

struct ChildProcess {
    child: Child,
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.child.id())
            .finish()
    }
}

#[async_trait]
impl TranscoderProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        match self.child.kill().await {
            Err(error) if error.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}
