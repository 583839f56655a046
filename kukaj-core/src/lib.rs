pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod lock;
pub mod policy;
pub mod remux;
pub mod resources;
pub mod select;
pub mod session;
pub mod urls;

pub use config::{load_downloader_config, DownloaderConfig, HostClass};
pub use error::{ConfigError, Result};
pub use events::{JobEvent, JobStatusView, StateBroadcaster};
pub use job::{
    AttemptOutcome, CapturedUrl, DiscoveryMethod, Job, JobError, JobErrorKind, JobId, JobResult,
    JobStatus, ManifestResult, OutputKind, SourceAttempt, MAX_FALLBACK_SWITCHES, MAX_JOB_ERRORS,
    MAX_PRIMARY_STRATEGIES, MAX_SOURCE_ATTEMPTS,
};
pub use lock::JobLock;
pub use policy::{DownloadRequest, ExtractionPolicy};
pub use remux::{CommandExecutor, FfmpegRemuxer, RemuxError, RemuxResult, Remuxer};
pub use resources::{ResourceMonitor, ResourceProbe, ResourceSample, SystemResourceProbe};
pub use select::SourceSelector;
pub use session::{
    ChromiumSession, PageHandle, PageSession, SelectionStrategy, SessionError, SessionResult,
    VideoSource,
};
pub use urls::{normalize_target_url, suggest_output_name};
