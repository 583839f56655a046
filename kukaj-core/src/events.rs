use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::job::{CapturedUrl, JobErrorKind, JobId, JobStatus, SourceAttempt};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Progress notifications emitted while a job runs. Slow subscribers lose
/// the oldest events rather than stalling the pipeline; the snapshot view
/// always reflects the latest state regardless of what was missed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    StatusChanged {
        job: JobId,
        status: JobStatus,
        at: DateTime<Utc>,
    },
    SourceAttempted {
        job: JobId,
        attempt: SourceAttempt,
    },
    ManifestCaptured {
        job: JobId,
        manifest_urls: Vec<String>,
    },
    CaptureMissed {
        job: JobId,
        error_count: u32,
    },
    Finished {
        job: JobId,
        status: JobStatus,
        error: Option<JobErrorKind>,
        message: Option<String>,
    },
}

/// Point-in-time summary handed to late joiners so they never have to
/// replay the event history.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job: Option<JobId>,
    pub status: JobStatus,
    pub target: Option<String>,
    pub attempts: Vec<SourceAttempt>,
    pub manifest_urls: Vec<String>,
    pub error_count: u32,
    pub error: Option<JobErrorKind>,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for JobStatusView {
    fn default() -> Self {
        Self {
            job: None,
            status: JobStatus::Idle,
            target: None,
            attempts: Vec::new(),
            manifest_urls: Vec::new(),
            error_count: 0,
            error: None,
            message: None,
            updated_at: Utc::now(),
        }
    }
}

pub struct StateBroadcaster {
    sender: broadcast::Sender<JobEvent>,
    snapshot: RwLock<JobStatusView>,
}

impl Default for StateBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StateBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender,
            snapshot: RwLock::new(JobStatusView::default()),
        }
    }

    /// Returns the current snapshot together with a live event receiver.
    /// The snapshot is taken before subscription so a joiner sees at worst
    /// a duplicate, never a gap.
    pub fn subscribe(&self) -> (JobStatusView, broadcast::Receiver<JobEvent>) {
        let receiver = self.sender.subscribe();
        (self.snapshot(), receiver)
    }

    pub fn snapshot(&self) -> JobStatusView {
        self.read_snapshot().clone()
    }

    pub fn job_started(&self, job: JobId, target: &str) {
        let mut view = self.write_snapshot();
        *view = JobStatusView {
            job: Some(job),
            status: JobStatus::Idle,
            target: Some(target.to_string()),
            ..JobStatusView::default()
        };
        drop(view);
        self.publish(JobEvent::StatusChanged {
            job,
            status: JobStatus::Idle,
            at: Utc::now(),
        });
    }

    pub fn status_changed(&self, job: JobId, status: JobStatus) {
        let at = Utc::now();
        {
            let mut view = self.write_snapshot();
            view.job = Some(job);
            view.status = status;
            view.updated_at = at;
        }
        debug!(%job, %status, "job status changed");
        self.publish(JobEvent::StatusChanged { job, status, at });
    }

    pub fn source_attempted(&self, job: JobId, attempt: SourceAttempt) {
        {
            let mut view = self.write_snapshot();
            view.attempts.push(attempt.clone());
            view.updated_at = Utc::now();
        }
        self.publish(JobEvent::SourceAttempted { job, attempt });
    }

    pub fn manifest_captured(&self, job: JobId, captured: &[CapturedUrl]) {
        let manifest_urls: Vec<String> = captured.iter().map(|entry| entry.url.clone()).collect();
        {
            let mut view = self.write_snapshot();
            view.manifest_urls = manifest_urls.clone();
            view.updated_at = Utc::now();
        }
        self.publish(JobEvent::ManifestCaptured { job, manifest_urls });
    }

    pub fn capture_missed(&self, job: JobId, error_count: u32) {
        {
            let mut view = self.write_snapshot();
            view.error_count = error_count;
            view.updated_at = Utc::now();
        }
        self.publish(JobEvent::CaptureMissed { job, error_count });
    }

    /// Terminal notification for a job turned away at admission. The
    /// snapshot still belongs to whichever job holds the lock, so only
    /// the event goes out.
    pub fn rejected(&self, job: JobId, error: JobErrorKind, message: String) {
        self.publish(JobEvent::Finished {
            job,
            status: JobStatus::Failed,
            error: Some(error),
            message: Some(message),
        });
    }

    pub fn finished(
        &self,
        job: JobId,
        status: JobStatus,
        error: Option<JobErrorKind>,
        message: Option<String>,
    ) {
        {
            let mut view = self.write_snapshot();
            view.job = Some(job);
            view.status = status;
            view.error = error;
            view.message = message.clone();
            view.updated_at = Utc::now();
        }
        self.publish(JobEvent::Finished {
            job,
            status,
            error,
            message,
        });
    }

    fn publish(&self, event: JobEvent) {
        // No receivers is fine; events exist for observers, not control flow.
        let _ = self.sender.send(event);
    }

    fn read_snapshot(&self) -> std::sync::RwLockReadGuard<'_, JobStatusView> {
        match self.snapshot.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_snapshot(&self) -> std::sync::RwLockWriteGuard<'_, JobStatusView> {
        match self.snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::AttemptOutcome;

    #[tokio::test]
    async fn subscribers_receive_status_changes() {
        let broadcaster = StateBroadcaster::new();
        let job = JobId::new();
        let (_, mut receiver) = broadcaster.subscribe();

        broadcaster.status_changed(job, JobStatus::Locking);
        match receiver.recv().await.unwrap() {
            JobEvent::StatusChanged { status, .. } => assert_eq!(status, JobStatus::Locking),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_joiners_get_current_snapshot() {
        let broadcaster = StateBroadcaster::new();
        let job = JobId::new();
        broadcaster.job_started(job, "https://serial.kukaj.fi/show/S01E01");
        broadcaster.status_changed(job, JobStatus::Extracting);
        broadcaster.source_attempted(
            job,
            SourceAttempt {
                source: "MON".into(),
                strategy: "direct_control".into(),
                outcome: AttemptOutcome::Selected,
                duration_ms: 40,
            },
        );

        let (snapshot, _) = broadcaster.subscribe();
        assert_eq!(snapshot.job, Some(job));
        assert_eq!(snapshot.status, JobStatus::Extracting);
        assert_eq!(snapshot.attempts.len(), 1);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_does_not_fail() {
        let broadcaster = StateBroadcaster::new();
        broadcaster.status_changed(JobId::new(), JobStatus::Preparing);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let broadcaster = StateBroadcaster::new();
        let job = JobId::new();
        let (_, mut receiver) = broadcaster.subscribe();

        for _ in 0..(EVENT_CHANNEL_CAPACITY + 8) {
            broadcaster.status_changed(job, JobStatus::Extracting);
        }

        match receiver.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejection_events_leave_the_active_snapshot_alone() {
        let broadcaster = StateBroadcaster::new();
        let active = JobId::new();
        broadcaster.job_started(active, "https://film.kukaj.fi/matrix");
        broadcaster.status_changed(active, JobStatus::Extracting);

        let (_, mut receiver) = broadcaster.subscribe();
        let turned_away = JobId::new();
        broadcaster.rejected(
            turned_away,
            JobErrorKind::Busy,
            "another download is already in progress".into(),
        );

        let snapshot = broadcaster.snapshot();
        assert_eq!(snapshot.job, Some(active));
        assert_eq!(snapshot.status, JobStatus::Extracting);
        assert!(snapshot.error.is_none());

        match receiver.recv().await.unwrap() {
            JobEvent::Finished { job, status, .. } => {
                assert_eq!(job, turned_away);
                assert_eq!(status, JobStatus::Failed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn capture_misses_accumulate_in_the_snapshot() {
        let broadcaster = StateBroadcaster::new();
        let job = JobId::new();
        broadcaster.job_started(job, "https://film.kukaj.fi/matrix");
        broadcaster.capture_missed(job, 1);
        broadcaster.capture_missed(job, 2);
        assert_eq!(broadcaster.snapshot().error_count, 2);
    }

    #[tokio::test]
    async fn captured_manifests_are_listed_in_order() {
        let broadcaster = StateBroadcaster::new();
        let job = JobId::new();
        broadcaster.manifest_captured(
            job,
            &[
                CapturedUrl {
                    url: "https://cdn.example/master.m3u8".into(),
                    method: crate::job::DiscoveryMethod::NetworkRequest,
                },
                CapturedUrl {
                    url: "https://cdn.example/variant.m3u8".into(),
                    method: crate::job::DiscoveryMethod::PageScript,
                },
            ],
        );
        let snapshot = broadcaster.snapshot();
        assert_eq!(
            snapshot.manifest_urls,
            vec![
                "https://cdn.example/master.m3u8",
                "https://cdn.example/variant.m3u8"
            ]
        );
    }

    #[tokio::test]
    async fn finished_records_error_in_snapshot() {
        let broadcaster = StateBroadcaster::new();
        let job = JobId::new();
        broadcaster.finished(
            job,
            JobStatus::Failed,
            Some(JobErrorKind::NoManifestFound),
            Some("no playlist observed".into()),
        );
        let snapshot = broadcaster.snapshot();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.error, Some(JobErrorKind::NoManifestFound));
    }
}
