use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DownloaderConfig {
    pub runtime: RuntimeSection,
    pub lock: LockSection,
    pub resources: ResourcesSection,
    pub selection: SelectionSection,
    pub extraction: ExtractionSection,
    pub browser: BrowserSection,
    pub remux: RemuxSection,
    pub output: OutputSection,
}

impl DownloaderConfig {
    /// Cross-field checks that deserialization alone cannot express.
    fn validate(&self) -> std::result::Result<(), String> {
        if self.selection.primary_source.trim().is_empty() {
            return Err("selection.primary_source must not be empty".into());
        }
        if self.selection.fallback_source.trim().is_empty() {
            return Err("selection.fallback_source must not be empty".into());
        }
        if self
            .selection
            .primary_source
            .eq_ignore_ascii_case(&self.selection.fallback_source)
        {
            return Err(format!(
                "selection.fallback_source {:?} must differ from the primary source",
                self.selection.fallback_source
            ));
        }
        if self.extraction.capture_backoff_seconds.is_empty() {
            return Err("extraction.capture_backoff_seconds must list at least one delay".into());
        }
        Ok(())
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.output.downloads_dir).join(path)
        }
    }
}

/// Host-class detection used to tighten timeouts on small ARM boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostClass {
    Auto,
    Constrained,
    Unconstrained,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSection {
    pub host_class: HostClass,
    pub job_deadline_seconds: u64,
}

impl RuntimeSection {
    pub fn job_deadline(&self) -> Duration {
        Duration::from_secs(self.job_deadline_seconds)
    }

    /// Resolves `host_class = "auto"` against the build target architecture.
    pub fn is_constrained_host(&self) -> bool {
        match self.host_class {
            HostClass::Constrained => true,
            HostClass::Unconstrained => false,
            HostClass::Auto => {
                let arch = std::env::consts::ARCH;
                arch.contains("arm") || arch.contains("aarch64")
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockSection {
    pub staleness_seconds: u64,
}

impl LockSection {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourcesSection {
    pub cpu_limit_percent: f64,
    pub memory_limit_percent: f64,
    pub disk_limit_percent: f64,
    pub sample_timeout_ms: u64,
    pub disk_path: String,
}

impl ResourcesSection {
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectionSection {
    /// Label of the preferred source button on the player page.
    pub primary_source: String,
    /// Label of the alternate source used for the single fallback switch.
    pub fallback_source: String,
    pub strategy_timeout_seconds: u64,
    pub constrained_strategy_timeout_seconds: u64,
    pub settle_seconds: u64,
    pub extended_wait_seconds: u64,
}

impl SelectionSection {
    pub fn strategy_timeout(&self, constrained: bool) -> Duration {
        if constrained {
            Duration::from_secs(self.constrained_strategy_timeout_seconds)
        } else {
            Duration::from_secs(self.strategy_timeout_seconds)
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_seconds)
    }

    pub fn extended_wait(&self) -> Duration {
        Duration::from_secs(self.extended_wait_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionSection {
    /// Backoff schedule between failed manifest-capture attempts.
    pub capture_backoff_seconds: Vec<u64>,
}

impl ExtractionSection {
    pub fn backoff_for_attempt(&self, failed_attempts: u32) -> Duration {
        let index = (failed_attempts.max(1) - 1) as usize;
        let seconds = self
            .capture_backoff_seconds
            .get(index)
            .or_else(|| self.capture_backoff_seconds.last())
            .copied()
            .unwrap_or(1);
        Duration::from_secs(seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserSection {
    pub executable_path: String,
    pub headless: bool,
    pub sandbox: bool,
    pub mute_audio: bool,
    pub viewport: [u32; 2],
    pub user_agent: String,
    pub navigation_timeout_seconds: u64,
}

impl BrowserSection {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemuxSection {
    pub ffmpeg: String,
    pub segment_fallback: bool,
    pub request_timeout_seconds: u64,
}

impl RemuxSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputSection {
    pub downloads_dir: String,
}

pub fn load_downloader_config<P: AsRef<Path>>(path: P) -> Result<DownloaderConfig> {
    let path = path.as_ref();
    let config: DownloaderConfig = load_toml(path)?;
    config.validate().map_err(|detail| ConfigError::Invalid {
        path: path.to_path_buf(),
        detail,
    })?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/downloader.toml");
        let config = load_downloader_config(path).expect("config should parse");
        assert_eq!(config.lock.staleness_seconds, 600);
        assert_eq!(config.selection.primary_source, "MON");
        assert_eq!(config.selection.fallback_source, "TAP");
        assert_eq!(config.selection.constrained_strategy_timeout_seconds, 8);
        assert_eq!(config.extraction.capture_backoff_seconds, vec![1, 2]);
        assert!((config.resources.cpu_limit_percent - 85.0).abs() < f64::EPSILON);
    }

    #[test]
    fn strategy_timeout_tightens_on_constrained_hosts() {
        let section = SelectionSection {
            primary_source: "MON".into(),
            fallback_source: "TAP".into(),
            strategy_timeout_seconds: 30,
            constrained_strategy_timeout_seconds: 8,
            settle_seconds: 5,
            extended_wait_seconds: 12,
        };
        assert_eq!(section.strategy_timeout(true), Duration::from_secs(8));
        assert_eq!(section.strategy_timeout(false), Duration::from_secs(30));
    }

    #[test]
    fn matching_primary_and_fallback_sources_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/downloader.toml");
        let content = std::fs::read_to_string(fixture)
            .expect("fixture config")
            .replace("fallback_source = \"TAP\"", "fallback_source = \"MON\"");
        let path = dir.path().join("downloader.toml");
        std::fs::write(&path, content).expect("write config");

        let err = load_downloader_config(&path).expect_err("config should be rejected");
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("fallback_source"));
    }

    #[test]
    fn backoff_schedule_clamps_to_last_entry() {
        let section = ExtractionSection {
            capture_backoff_seconds: vec![1, 2],
        };
        assert_eq!(section.backoff_for_attempt(1), Duration::from_secs(1));
        assert_eq!(section.backoff_for_attempt(2), Duration::from_secs(2));
        assert_eq!(section.backoff_for_attempt(5), Duration::from_secs(2));
    }
}
