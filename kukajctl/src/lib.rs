use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

use kukaj_core::{
    load_downloader_config, ChromiumSession, DownloadRequest, DownloaderConfig, ExtractionPolicy,
    FfmpegRemuxer, JobEvent, JobLock, OutputKind, ResourceMonitor, StateBroadcaster,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] kukaj_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("download failed: {0}")]
    Job(#[from] kukaj_core::JobError),
    #[error("remux setup failed: {0}")]
    Remux(#[from] kukaj_core::RemuxError),
    #[error("one or more health checks failed")]
    HealthFailed,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Kukaj download orchestrator", long_about = None)]
pub struct Cli {
    /// Path to downloader.toml
    #[arg(long, default_value = "configs/downloader.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Suppress progress events while a download runs
    #[arg(long)]
    pub quiet: bool,
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
    /// Download a video or its playlist from a kukaj page
    Download(DownloadArgs),
    /// Show the effective configuration
    Status,
    /// Sample host resource pressure
    Probe,
    /// Verify external tools and directories
    Health,
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Page URL, any mirror domain of the kukaj family
    pub url: String,
    /// Output file name; derived from the page path when omitted
    #[arg(long)]
    pub name: Option<String>,
    /// What to produce
    #[arg(long, value_enum, default_value_t = OutputKindArg::Media)]
    pub kind: OutputKindArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputKindArg {
    /// Remux the stream into an mp4 file
    Media,
    /// Save the captured m3u8 playlist
    Manifest,
}

impl From<OutputKindArg> for OutputKind {
    fn from(kind: OutputKindArg) -> Self {
        match kind {
            OutputKindArg::Media => OutputKind::RemuxedMedia,
            OutputKindArg::Manifest => OutputKind::Manifest,
        }
    }
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(args.shell, &mut command, name, &mut std::io::stdout());
        return Ok(());
    }

    let config = load_downloader_config(&cli.config)?;
    let runtime = tokio::runtime::Runtime::new()?;

    match &cli.command {
        Commands::Download(args) => {
            let report = runtime.block_on(download(&config, args, cli.quiet))?;
            render(&report, cli.format)
        }
        Commands::Status => {
            let report = gather_status(&config);
            render(&report, cli.format)
        }
        Commands::Probe => {
            let report = runtime.block_on(probe(&config));
            render(&report, cli.format)
        }
        Commands::Health => {
            let report = runtime.block_on(health_check(&config));
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::HealthFailed);
            }
            Ok(())
        }
        Commands::Completions(_) => unreachable!("handled above"),
    }
}

async fn download(
    config: &DownloaderConfig,
    args: &DownloadArgs,
    quiet: bool,
) -> Result<DownloadReport> {
    let config = Arc::new(config.clone());
    let lock = Arc::new(JobLock::new(config.lock.staleness()));
    let monitor = Arc::new(ResourceMonitor::system(config.resources.clone()));
    let session = Arc::new(ChromiumSession::new(config.browser.clone()));
    let remuxer = Arc::new(FfmpegRemuxer::new(&config.remux)?);
    let broadcaster = Arc::new(StateBroadcaster::new());

    let policy = ExtractionPolicy::new(
        Arc::clone(&config),
        lock,
        monitor,
        session,
        remuxer,
        Arc::clone(&broadcaster),
    );

    let printer = if quiet {
        None
    } else {
        Some(tokio::spawn(print_events(Arc::clone(&broadcaster))))
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let request = DownloadRequest {
        url: args.url.clone(),
        output_kind: args.kind.into(),
        output_name: args.name.clone(),
    };
    let result = policy.run(request, cancel_rx).await;

    if let Some(printer) = printer {
        if let Err(err) = printer.await {
            warn!(error = %err, "event printer task failed");
        }
    }

    let manifest = result?;
    Ok(DownloadReport {
        manifest_url: manifest.manifest_url,
        source: manifest.source,
        output: manifest.output_path.display().to_string(),
    })
}

async fn print_events(broadcaster: Arc<StateBroadcaster>) {
    let (_, mut receiver) = broadcaster.subscribe();
    loop {
        match receiver.recv().await {
            Ok(JobEvent::StatusChanged { status, .. }) => {
                eprintln!("-> {status}");
            }
            Ok(JobEvent::SourceAttempted { attempt, .. }) => {
                eprintln!(
                    "   source {} via {}: {:?}",
                    attempt.source, attempt.strategy, attempt.outcome
                );
            }
            Ok(JobEvent::ManifestCaptured { manifest_urls, .. }) => {
                for manifest_url in &manifest_urls {
                    eprintln!("   manifest {manifest_url}");
                }
            }
            Ok(JobEvent::CaptureMissed { error_count, .. }) => {
                eprintln!("   no manifest yet (miss {error_count})");
            }
            Ok(JobEvent::Finished { status, message, .. }) => {
                match message {
                    Some(message) => eprintln!("-> {status}: {message}"),
                    None => eprintln!("-> {status}"),
                }
                break;
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn gather_status(config: &DownloaderConfig) -> StatusReport {
    let constrained = config.runtime.is_constrained_host();
    StatusReport {
        constrained_host: constrained,
        job_deadline_seconds: config.runtime.job_deadline_seconds,
        lock_staleness_seconds: config.lock.staleness_seconds,
        primary_source: config.selection.primary_source.clone(),
        fallback_source: config.selection.fallback_source.clone(),
        strategy_timeout_seconds: config.selection.strategy_timeout(constrained).as_secs(),
        downloads_dir: config.output.downloads_dir.clone(),
        ffmpeg: config.remux.ffmpeg.clone(),
        browser: config.browser.executable_path.clone(),
    }
}

async fn probe(config: &DownloaderConfig) -> ProbeReport {
    let monitor = ResourceMonitor::system(config.resources.clone());
    match monitor.check_admission().await {
        Ok(sample) => ProbeReport {
            admitted: true,
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            disk_percent: sample.disk_percent,
            degraded: sample.degraded,
            veto: None,
        },
        Err(err) => ProbeReport {
            admitted: false,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            disk_percent: 0.0,
            degraded: false,
            veto: Some(err.to_string()),
        },
    }
}

async fn health_check(config: &DownloaderConfig) -> Vec<HealthEntry> {
    let mut entries = Vec::new();

    let ffmpeg = tokio::process::Command::new(&config.remux.ffmpeg)
        .arg("-version")
        .output()
        .await;
    entries.push(match ffmpeg {
        Ok(output) if output.status.success() => {
            HealthEntry::ok("ffmpeg", "responds to -version")
        }
        Ok(output) => HealthEntry::error("ffmpeg", format!("exited with {}", output.status)),
        Err(err) => HealthEntry::error("ffmpeg", format!("not runnable: {err}")),
    });

    entries.push(if binary_available(&config.browser.executable_path) {
        HealthEntry::ok("browser", "executable found")
    } else {
        HealthEntry::error(
            "browser",
            format!("{} not found", config.browser.executable_path),
        )
    });

    let downloads = Path::new(&config.output.downloads_dir);
    entries.push(match tokio::fs::create_dir_all(downloads).await {
        Ok(()) => HealthEntry::ok("downloads_dir", downloads.display().to_string()),
        Err(err) => HealthEntry::error("downloads_dir", format!("not writable: {err}")),
    });

    entries
}

fn binary_available(name: &str) -> bool {
    let candidate = Path::new(name);
    if candidate.is_absolute() || name.contains('/') {
        return candidate.exists();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(name).exists())
        })
        .unwrap_or(false)
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
            println!("{json}");
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
pub struct DownloadReport {
    pub manifest_url: String,
    pub source: String,
    pub output: String,
}

impl DisplayFallback for DownloadReport {
    fn display(&self) -> String {
        format!(
            "saved {output}\n  source   {source}\n  manifest {manifest}",
            output = self.output,
            source = self.source,
            manifest = self.manifest_url,
        )
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub constrained_host: bool,
    pub job_deadline_seconds: u64,
    pub lock_staleness_seconds: u64,
    pub primary_source: String,
    pub fallback_source: String,
    pub strategy_timeout_seconds: u64,
    pub downloads_dir: String,
    pub ffmpeg: String,
    pub browser: String,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "host             {}", if self.constrained_host { "constrained" } else { "unconstrained" });
        let _ = writeln!(out, "job deadline     {}s", self.job_deadline_seconds);
        let _ = writeln!(out, "lock staleness   {}s", self.lock_staleness_seconds);
        let _ = writeln!(out, "sources          {} (fallback {})", self.primary_source, self.fallback_source);
        let _ = writeln!(out, "strategy timeout {}s", self.strategy_timeout_seconds);
        let _ = writeln!(out, "downloads dir    {}", self.downloads_dir);
        let _ = writeln!(out, "ffmpeg           {}", self.ffmpeg);
        let _ = write!(out, "browser          {}", self.browser);
        out
    }
}

#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub admitted: bool,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub degraded: bool,
    pub veto: Option<String>,
}

impl DisplayFallback for ProbeReport {
    fn display(&self) -> String {
        if let Some(veto) = &self.veto {
            return format!("veto: {veto}");
        }
        if self.degraded {
            return "degraded: probe failed, admission would still pass".to_string();
        }
        format!(
            "cpu {:.1}%  memory {:.1}%  disk {:.1}%  (admitted)",
            self.cpu_percent, self.memory_percent, self.disk_percent
        )
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Error,
}

impl HealthEntry {
    fn ok(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn error(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| {
                let marker = match entry.status {
                    CheckStatus::Ok => "ok  ",
                    CheckStatus::Error => "FAIL",
                };
                format!("{marker} {name}: {detail}", name = entry.name, detail = entry.detail)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
