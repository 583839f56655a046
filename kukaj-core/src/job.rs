use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Hard bounds on retry behavior. Every loop that re-attempts work is
/// bounded by one of these constants so a wedged player page cannot keep
/// a job alive indefinitely.
pub const MAX_PRIMARY_STRATEGIES: u32 = 3;
pub const MAX_FALLBACK_SWITCHES: u32 = 1;
pub const MAX_SOURCE_ATTEMPTS: u32 = 4;
pub const MAX_JOB_ERRORS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the job should leave on disk when it succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Save the captured playlist itself.
    Manifest,
    /// Remux the stream into a local media container.
    RemuxedMedia,
}

impl OutputKind {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputKind::Manifest => ".m3u8",
            OutputKind::RemuxedMedia => ".mp4",
        }
    }
}

/// A single download request after admission checks have normalized it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub target: Url,
    pub output_kind: OutputKind,
    pub output_name: String,
    pub requested_at: DateTime<Utc>,
}

impl Job {
    pub fn new(target: Url, output_kind: OutputKind, output_name: String) -> Self {
        Self {
            id: JobId::new(),
            target,
            output_kind,
            output_name,
            requested_at: Utc::now(),
        }
    }
}

/// Lifecycle phases of a job. Transitions are strictly forward; a job
/// never re-enters an earlier phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Locking,
    Preparing,
    Selecting,
    Extracting,
    PostProcessing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Idle => "idle",
            JobStatus::Locking => "locking",
            JobStatus::Preparing => "preparing",
            JobStatus::Selecting => "selecting",
            JobStatus::Extracting => "extracting",
            JobStatus::PostProcessing => "post_processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

/// How a manifest URL was observed on the player page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    NetworkRequest,
    PageScript,
}

/// A playlist URL observed during extraction, with where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedUrl {
    pub url: String,
    pub method: DiscoveryMethod,
}

/// Outcome of one source-selection attempt, kept as an ordered trail for
/// diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAttempt {
    pub source: String,
    pub strategy: String,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Selected,
    TimedOut,
    NotPresent,
    Failed,
}

/// Final product of a successful extraction. `manifest_url` is the URL
/// the output was produced from; `captured` keeps the whole deduplicated
/// sweep in capture order for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestResult {
    pub manifest_url: String,
    pub method: DiscoveryMethod,
    pub source: String,
    pub output_path: PathBuf,
    pub captured: Vec<CapturedUrl>,
}

/// Stable machine-readable classification carried alongside each error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    Busy,
    ResourceExhausted,
    UnsupportedDomain,
    NavigationFailed,
    SourceNotFound,
    NoManifestFound,
    RemuxFailed,
    Cancelled,
    Timeout,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("another download is already in progress (held by job {holder})")]
    Busy { holder: JobId },
    #[error("host resources exhausted: {detail}")]
    ResourceExhausted { detail: String },
    #[error("unsupported domain: {host}")]
    UnsupportedDomain { host: String },
    #[error("navigation to {url} failed: {detail}")]
    NavigationFailed { url: String, detail: String },
    #[error("no usable video source found after {attempts} attempts")]
    SourceNotFound { attempts: u32 },
    #[error("no playlist manifest observed after {attempts} capture attempts")]
    NoManifestFound { attempts: u32 },
    #[error("remux failed: {detail}")]
    RemuxFailed { detail: String },
    #[error("job cancelled")]
    Cancelled,
    #[error("job exceeded its {limit_seconds}s deadline")]
    Timeout { limit_seconds: u64 },
}

impl JobError {
    pub fn kind(&self) -> JobErrorKind {
        match self {
            JobError::Busy { .. } => JobErrorKind::Busy,
            JobError::ResourceExhausted { .. } => JobErrorKind::ResourceExhausted,
            JobError::UnsupportedDomain { .. } => JobErrorKind::UnsupportedDomain,
            JobError::NavigationFailed { .. } => JobErrorKind::NavigationFailed,
            JobError::SourceNotFound { .. } => JobErrorKind::SourceNotFound,
            JobError::NoManifestFound { .. } => JobErrorKind::NoManifestFound,
            JobError::RemuxFailed { .. } => JobErrorKind::RemuxFailed,
            JobError::Cancelled => JobErrorKind::Cancelled,
            JobError::Timeout { .. } => JobErrorKind::Timeout,
        }
    }
}

pub type JobResult<T> = std::result::Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_classify_terminal_phases() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Extracting.is_terminal());
        assert!(!JobStatus::Idle.is_terminal());
    }

    #[test]
    fn error_kinds_round_trip_through_variants() {
        let err = JobError::NoManifestFound { attempts: 3 };
        assert_eq!(err.kind(), JobErrorKind::NoManifestFound);
        let err = JobError::Busy {
            holder: JobId::new(),
        };
        assert_eq!(err.kind(), JobErrorKind::Busy);
    }

    #[test]
    fn output_kind_extensions() {
        assert_eq!(OutputKind::Manifest.extension(), ".m3u8");
        assert_eq!(OutputKind::RemuxedMedia.extension(), ".mp4");
    }

    #[test]
    fn retry_bounds_are_consistent() {
        assert_eq!(
            MAX_SOURCE_ATTEMPTS,
            MAX_PRIMARY_STRATEGIES + MAX_FALLBACK_SWITCHES
        );
    }
}
