use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tvhls_core::{
    load_tvhls_config, CatalogSource, ChannelRecord, SegmentStore, SweepReport, TvhlsConfig,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] tvhls_core::ConfigError),
    #[error("catalog error: {0}")]
    Catalog(#[from] tvhls_core::CatalogError),
    #[error("server error: {0}")]
    Server(#[from] tvhls_core::ServerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("health check failed: {0}")]
    HealthCheck(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "On-demand live TV to HLS gateway", long_about = None)]
pub struct Cli {
    /// Path to tvhls.toml
    #[arg(long, default_value = "configs/tvhls.toml")]
    pub config: PathBuf,
    /// Listening port (overrides server.port)
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
    /// Alternate channel catalog
    #[arg(long)]
    pub catalog: Option<PathBuf>,
    /// Alternate HLS output directory
    #[arg(long)]
    pub hls_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the HTTP server until ctrl-c
    Serve,
    /// Lists the channels parsed from the catalog
    Channels,
    /// Runs a single sweep of stale segments
    Sweep,
    /// Runs integrity checks
    #[command(name = "health")]
    #[command(subcommand)]
    Health(HealthCommands),
    /// Prints shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum HealthCommands {
    /// Checks config, catalog, output directories and the transcoder binary
    Check,
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        let bin_name = command.get_name().to_string();
        clap_complete::generate(*shell, &mut command, bin_name, &mut std::io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Serve => {
            info!(
                config = %context.config_path.display(),
                port = context.config.server.port,
                "starting tvhls"
            );
            tvhls_core::serve(context.config.clone()).await?;
        }
        Commands::Channels => {
            let list = context.channels().await?;
            render(&list, cli.format)?;
        }
        Commands::Sweep => {
            let result = context.sweep().await?;
            render(&result, cli.format)?;
        }
        Commands::Health(HealthCommands::Check) => {
            let report = context.health_check().await;
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::HealthCheck(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: TvhlsConfig,
    config_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut config = load_tvhls_config(&config_path)?;

        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(catalog) = &cli.catalog {
            config.paths.catalog = absolute(catalog)?.to_string_lossy().to_string();
        }
        if let Some(hls_dir) = &cli.hls_dir {
            config.paths.hls_dir = absolute(hls_dir)?.to_string_lossy().to_string();
        }

        Ok(Self {
            config,
            config_path,
        })
    }

    async fn channels(&self) -> Result<ChannelList> {
        let source = CatalogSource::new(self.config.catalog_path());
        let rows = source.load().await?;
        Ok(ChannelList {
            catalog: source.path().to_path_buf(),
            rows,
        })
    }

    async fn sweep(&self) -> Result<SweepResult> {
        let store = SegmentStore::new(self.config.hls_dir());
        let retention = self.config.sweeper.retention();
        let swept_at = Utc::now();
        let report = tokio::task::spawn_blocking(move || store.sweep(retention))
            .await
            .map_err(|err| AppError::Io(std::io::Error::other(err)))?;
        Ok(SweepResult {
            hls_dir: self.config.hls_dir(),
            retention_seconds: retention.as_secs(),
            swept_at,
            report,
        })
    }

    async fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(check_path("tvhls.toml", &self.config_path));
        results.push(self.check_catalog().await);
        results.push(check_directory("hls_dir", &self.config.hls_dir()));
        results.push(check_directory("public_dir", &self.config.public_dir()));
        results.push(check_transcoder(&self.config.transcoder.ffmpeg));
        results
    }

    async fn check_catalog(&self) -> HealthEntry {
        let source = CatalogSource::new(self.config.catalog_path());
        match source.load().await {
            Ok(records) if records.is_empty() => HealthEntry::warn(
                "catalog",
                format!("{} has no channels", source.path().display()),
            ),
            Ok(records) => {
                let unresolvable = records.iter().filter(|record| record.id.is_empty()).count();
                let detail = format!(
                    "{} channels in {} ({} without id)",
                    records.len(),
                    source.path().display(),
                    unresolvable
                );
                if unresolvable > 0 {
                    HealthEntry::warn("catalog", detail)
                } else {
                    HealthEntry::ok("catalog", detail)
                }
            }
            Err(err) => HealthEntry::error("catalog", err.to_string()),
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn check_path(name: &str, path: &Path) -> HealthEntry {
    if path.exists() {
        HealthEntry::ok(name, format!("{}", path.display()))
    } else {
        HealthEntry::error(name, format!("{path} missing", path = path.display()))
    }
}

fn check_directory(name: &str, path: &Path) -> HealthEntry {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
        Ok(_) => HealthEntry::error(
            name,
            format!("{path} is not a directory", path = path.display()),
        ),
        Err(_) => HealthEntry::warn(
            name,
            format!("{path} not found", path = path.display()),
        ),
    }
}

fn check_transcoder(program: &str) -> HealthEntry {
    let status = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => HealthEntry::ok("ffmpeg", program.to_string()),
        Ok(status) => HealthEntry::error(
            "ffmpeg",
            format!("{program} -version exited with {status}"),
        ),
        Err(err) => HealthEntry::error("ffmpeg", format!("{program}: {err}")),
    }
}

#[derive(Debug, Serialize)]
pub struct ChannelList {
    pub catalog: PathBuf,
    pub rows: Vec<ChannelRecord>,
}

impl DisplayFallback for ChannelList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return format!("No channels in {}", self.catalog.display());
        }
        let mut lines = vec![format!("{:<10} {:<32} URL", "ID", "NAME")];
        for row in &self.rows {
            let id = if row.id.is_empty() { "-" } else { &row.id };
            lines.push(format!("{:<10} {:<32} {}", id, row.name, row.url));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SweepResult {
    pub hls_dir: PathBuf,
    pub retention_seconds: u64,
    pub swept_at: DateTime<Utc>,
    pub report: SweepReport,
}

impl DisplayFallback for SweepResult {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Swept {} at {}: scanned {}, removed {}, failures {} (retention {}s)",
            self.hls_dir.display(),
            self.swept_at.to_rfc3339(),
            self.report.scanned,
            self.report.removed.len(),
            self.report.failures,
            self.retention_seconds
        )];
        for path in &self.report.removed {
            lines.push(format!("  - {}", path.display()));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(HealthEntry::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!(
            "[{status}] {name}: {detail}",
            status = self.status,
            name = self.name,
            detail = self.detail
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    const CATALOG: &str = "#EXTM3U\n#EXTINF:-1 tvg-name=\"Demo\" tvg-logo=\"l.png\",Demo\nhttp://x/123.ts\n#EXTINF:-1 tvg-name=\"Radio\",Radio\nhttp://x/radio.mp3\n";

    fn prepare_test_context(command: Commands) -> Result<(TempDir, AppContext)> {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let configs_dir = root.join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::copy("../configs/tvhls.toml", configs_dir.join("tvhls.toml")).unwrap();
        fs::write(root.join("channels.txt"), CATALOG).unwrap();
        fs::create_dir_all(root.join("hls")).unwrap();

        let cli = Cli {
            config: configs_dir.join("tvhls.toml"),
            port: Some(4100),
            catalog: None,
            hls_dir: None,
            format: OutputFormat::Json,
            command,
        };
        let context = AppContext::new(&cli)?;
        Ok((temp, context))
    }

    #[test]
    fn overrides_apply_on_top_of_config() {
        let (_temp, context) = prepare_test_context(Commands::Channels).unwrap();
        assert_eq!(context.config.server.port, 4100);
        assert_eq!(
            context.config.server.relay_base_url(),
            "http://127.0.0.1:4100"
        );
    }

    #[tokio::test]
    async fn channel_listing_reads_catalog() {
        let (_temp, context) = prepare_test_context(Commands::Channels).unwrap();
        let list = context.channels().await.unwrap();
        assert_eq!(list.rows.len(), 2);
        assert_eq!(list.rows[0].id, "123");
        assert_eq!(list.rows[1].id, "");
        assert!(list.display().contains("Demo"));
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_files() {
        let (temp, context) = prepare_test_context(Commands::Sweep).unwrap();
        let channel_dir = temp.path().join("hls/123");
        fs::create_dir_all(&channel_dir).unwrap();
        let stale = channel_dir.join("index1.ts");
        let fresh = channel_dir.join("index2.ts");
        fs::write(&stale, b"old").unwrap();
        fs::write(&fresh, b"new").unwrap();
        let old = SystemTime::now() - Duration::from_secs(600);
        fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let result = context.sweep().await.unwrap();
        assert_eq!(result.report.scanned, 2);
        assert_eq!(result.report.removed.len(), 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn health_flags_missing_transcoder() {
        let (_temp, mut context) = prepare_test_context(Commands::Health(HealthCommands::Check)).unwrap();
        context.config.transcoder.ffmpeg = "/nonexistent/tvhls/ffmpeg".into();
        let report = context.health_check().await;
        let ffmpeg = report.iter().find(|entry| entry.name == "ffmpeg").unwrap();
        assert!(matches!(ffmpeg.status, CheckStatus::Error));
        let catalog = report.iter().find(|entry| entry.name == "catalog").unwrap();
        assert!(matches!(catalog.status, CheckStatus::Warn));
    }
}
