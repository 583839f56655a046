use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RemuxSection;

pub type RemuxResult<T> = Result<T, RemuxError>;

#[derive(Debug, Error)]
pub enum RemuxError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ffmpeg exited with {status}: {stderr}")]
    Ffmpeg { status: String, stderr: String },
    #[error("playlist error: {0}")]
    Playlist(String),
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> io::Result<Output> {
        Command::new(program).args(args).output().await
    }
}

/// Turns a captured playlist URL into a local media file.
#[async_trait]
pub trait Remuxer: Send + Sync {
    async fn remux(&self, manifest_url: &str, output: &Path) -> RemuxResult<()>;

    /// Writes the playlist itself to disk instead of remuxing it.
    async fn save_manifest(&self, manifest_url: &str, output: &Path) -> RemuxResult<()>;
}

/// Copies the stream into an mp4 container without re-encoding. When
/// ffmpeg cannot read the playlist (hostile CDN headers, expiring
/// segment tokens) the segment fallback fetches the pieces over HTTP and
/// concatenates them directly.
pub struct FfmpegRemuxer {
    ffmpeg: PathBuf,
    segment_fallback: bool,
    executor: Arc<dyn CommandExecutor>,
    http: reqwest::Client,
}

impl FfmpegRemuxer {
    pub fn new(config: &RemuxSection) -> RemuxResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            ffmpeg: PathBuf::from(&config.ffmpeg),
            segment_fallback: config.segment_fallback,
            executor: Arc::new(SystemCommandExecutor),
            http,
        })
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    async fn run_ffmpeg(&self, manifest_url: &str, output: &Path) -> RemuxResult<()> {
        let args = vec![
            "-i".to_string(),
            manifest_url.to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-bsf:a".to_string(),
            "aac_adtstoasc".to_string(),
            "-y".to_string(),
            output.display().to_string(),
        ];
        debug!(ffmpeg = %self.ffmpeg.display(), url = manifest_url, "starting remux");
        let result = self.executor.run(&self.ffmpeg, &args).await?;
        if result.status.success() {
            info!(output = %output.display(), "remux complete");
            Ok(())
        } else {
            Err(RemuxError::Ffmpeg {
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            })
        }
    }

    async fn download_segments(&self, manifest_url: &str, output: &Path) -> RemuxResult<()> {
        let base = Url::parse(manifest_url)
            .map_err(|err| RemuxError::Playlist(format!("bad manifest url: {err}")))?;
        let playlist = self.fetch_text(&base).await?;
        let mut segments = parse_segment_uris(&playlist);

        // A master playlist points at variant playlists; follow the first.
        if segments.iter().any(|uri| uri.contains(".m3u8")) {
            let variant_uri = segments
                .iter()
                .find(|uri| uri.contains(".m3u8"))
                .cloned()
                .ok_or_else(|| RemuxError::Playlist("empty master playlist".into()))?;
            let variant_url = base
                .join(&variant_uri)
                .map_err(|err| RemuxError::Playlist(format!("bad variant uri: {err}")))?;
            let variant = self.fetch_text(&variant_url).await?;
            segments = parse_segment_uris(&variant)
                .into_iter()
                .map(|uri| resolve_segment(&variant_url, &uri))
                .collect::<Result<_, _>>()?;
        } else {
            segments = segments
                .into_iter()
                .map(|uri| resolve_segment(&base, &uri))
                .collect::<Result<_, _>>()?;
        }

        if segments.is_empty() {
            return Err(RemuxError::Playlist("playlist contains no segments".into()));
        }

        info!(count = segments.len(), "fetching segments directly");
        let mut file = tokio::fs::File::create(output).await?;
        for segment in &segments {
            let bytes = self
                .http
                .get(segment.clone())
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            file.write_all(&bytes).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn fetch_text(&self, url: &Url) -> RemuxResult<String> {
        Ok(self
            .http
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?)
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn remux(&self, manifest_url: &str, output: &Path) -> RemuxResult<()> {
        match self.run_ffmpeg(manifest_url, output).await {
            Ok(()) => Ok(()),
            Err(err) if self.segment_fallback => {
                warn!(error = %err, "ffmpeg remux failed, trying segment fallback");
                self.download_segments(manifest_url, output).await
            }
            Err(err) => Err(err),
        }
    }

    async fn save_manifest(&self, manifest_url: &str, output: &Path) -> RemuxResult<()> {
        let url = Url::parse(manifest_url)
            .map_err(|err| RemuxError::Playlist(format!("bad manifest url: {err}")))?;
        let playlist = self.fetch_text(&url).await?;
        tokio::fs::write(output, playlist).await?;
        info!(output = %output.display(), "manifest saved");
        Ok(())
    }
}

fn parse_segment_uris(playlist: &str) -> Vec<String> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn resolve_segment(base: &Url, uri: &str) -> RemuxResult<String> {
    base.join(uri)
        .map(|url| url.to_string())
        .map_err(|err| RemuxError::Playlist(format!("bad segment uri {uri}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use tempfile::tempdir;

    type RecordedCalls = Arc<Mutex<Vec<(PathBuf, Vec<String>)>>>;

    struct RecordingExecutor {
        calls: RecordedCalls,
        exit_code: i32,
    }

    impl RecordingExecutor {
        fn build(exit_code: i32) -> (Arc<dyn CommandExecutor>, RecordedCalls) {
            let calls: RecordedCalls = Arc::new(Mutex::new(Vec::new()));
            let executor: Arc<dyn CommandExecutor> = Arc::new(Self {
                calls: Arc::clone(&calls),
                exit_code,
            });
            (executor, calls)
        }
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn run(&self, program: &Path, args: &[String]) -> io::Result<Output> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_path_buf(), args.to_vec()));
            Ok(Output {
                status: ExitStatus::from_raw(self.exit_code),
                stdout: Vec::new(),
                stderr: b"ffmpeg said no".to_vec(),
            })
        }
    }

    fn section(segment_fallback: bool) -> RemuxSection {
        RemuxSection {
            ffmpeg: "ffmpeg".into(),
            segment_fallback,
            request_timeout_seconds: 5,
        }
    }

    #[tokio::test]
    async fn ffmpeg_receives_copy_remux_arguments() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("episode.mp4");
        let (executor, calls) = RecordingExecutor::build(0);
        let remuxer = FfmpegRemuxer::new(&section(false))
            .unwrap()
            .with_executor(executor);

        remuxer
            .remux("https://cdn.example/stream.m3u8", &output)
            .await
            .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (program, args) = &calls[0];
        assert_eq!(program, &PathBuf::from("ffmpeg"));
        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "https://cdn.example/stream.m3u8");
        assert!(args.contains(&"copy".to_string()));
        assert!(args.contains(&"aac_adtstoasc".to_string()));
        assert_eq!(args.last(), Some(&output.display().to_string()));
    }

    #[tokio::test]
    async fn ffmpeg_failure_without_fallback_surfaces_stderr() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("episode.mp4");
        let (executor, _) = RecordingExecutor::build(256);
        let remuxer = FfmpegRemuxer::new(&section(false))
            .unwrap()
            .with_executor(executor);

        let err = remuxer
            .remux("https://cdn.example/stream.m3u8", &output)
            .await
            .unwrap_err();
        match err {
            RemuxError::Ffmpeg { stderr, .. } => assert!(stderr.contains("ffmpeg said no")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn playlist_parsing_skips_directives_and_blanks() {
        let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n\nseg0.ts\n#EXTINF:6.0,\nseg1.ts\n";
        assert_eq!(parse_segment_uris(playlist), vec!["seg0.ts", "seg1.ts"]);
    }

    #[test]
    fn segment_uris_resolve_against_playlist_base() {
        let base = Url::parse("https://cdn.example/hls/stream.m3u8").unwrap();
        assert_eq!(
            resolve_segment(&base, "seg0.ts").unwrap(),
            "https://cdn.example/hls/seg0.ts"
        );
        assert_eq!(
            resolve_segment(&base, "https://other.example/seg0.ts").unwrap(),
            "https://other.example/seg0.ts"
        );
    }
}
