use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::DownloaderConfig;
use crate::events::StateBroadcaster;
use crate::job::{
    Job, JobError, JobErrorKind, JobId, JobResult, JobStatus, ManifestResult, OutputKind,
    MAX_JOB_ERRORS,
};
use crate::lock::JobLock;
use crate::remux::Remuxer;
use crate::resources::ResourceMonitor;
use crate::select::SourceSelector;
use crate::session::{PageHandle, PageSession};
use crate::urls;

/// What a caller hands in. The output name is optional; a missing one is
/// derived from the page path.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub output_kind: OutputKind,
    pub output_name: Option<String>,
}

/// Drives one download from admission to a terminal state. Exactly one
/// job runs at a time; the lock is released and a single terminal event
/// is emitted on every exit path.
pub struct ExtractionPolicy {
    config: Arc<DownloaderConfig>,
    lock: Arc<JobLock>,
    monitor: Arc<ResourceMonitor>,
    session: Arc<dyn PageSession>,
    remuxer: Arc<dyn Remuxer>,
    broadcaster: Arc<StateBroadcaster>,
}

impl ExtractionPolicy {
    pub fn new(
        config: Arc<DownloaderConfig>,
        lock: Arc<JobLock>,
        monitor: Arc<ResourceMonitor>,
        session: Arc<dyn PageSession>,
        remuxer: Arc<dyn Remuxer>,
        broadcaster: Arc<StateBroadcaster>,
    ) -> Self {
        Self {
            config,
            lock,
            monitor,
            session,
            remuxer,
            broadcaster,
        }
    }

    pub fn broadcaster(&self) -> Arc<StateBroadcaster> {
        Arc::clone(&self.broadcaster)
    }

    pub async fn run(
        &self,
        request: DownloadRequest,
        cancel: watch::Receiver<bool>,
    ) -> JobResult<ManifestResult> {
        let target = match urls::normalize_target_url(&request.url) {
            Ok(target) => target,
            Err(err) => {
                self.broadcaster
                    .rejected(JobId::new(), err.kind(), err.to_string());
                return Err(err);
            }
        };
        let output_name = match request.output_name {
            Some(name) => name,
            None => urls::suggest_output_name(&target, request.output_kind),
        };
        let job = Job::new(target, request.output_kind, output_name);
        info!(job = %job.id, target = %job.target, "download requested");

        let result = self.execute(&job, cancel).await;
        match &result {
            Ok(manifest) => {
                self.broadcaster.finished(
                    job.id,
                    JobStatus::Succeeded,
                    None,
                    Some(manifest.output_path.display().to_string()),
                );
            }
            // A busy rejection never owned the snapshot; the running
            // job's view must survive it.
            Err(err) if err.kind() == JobErrorKind::Busy => {
                warn!(job = %job.id, error = %err, "download rejected");
                self.broadcaster.rejected(job.id, err.kind(), err.to_string());
            }
            Err(err) => {
                warn!(job = %job.id, error = %err, "download failed");
                self.broadcaster.finished(
                    job.id,
                    JobStatus::Failed,
                    Some(err.kind()),
                    Some(err.to_string()),
                );
            }
        }
        result
    }

    async fn execute(
        &self,
        job: &Job,
        mut cancel: watch::Receiver<bool>,
    ) -> JobResult<ManifestResult> {
        self.lock.try_acquire(job.id)?;
        // The snapshot switches over only once this job holds the lock.
        self.broadcaster.job_started(job.id, job.target.as_str());
        self.transition(job, JobStatus::Locking);

        let result = self.locked_phases(job, &mut cancel).await;

        if !self.lock.release(job.id) {
            warn!(job = %job.id, "lock was no longer held at release");
        }
        result
    }

    async fn locked_phases(
        &self,
        job: &Job,
        cancel: &mut watch::Receiver<bool>,
    ) -> JobResult<ManifestResult> {
        // Resource rejection belongs to the admission boundary; Preparing
        // is only announced for admitted jobs.
        self.monitor.check_admission().await?;
        ensure_live(cancel)?;
        self.transition(job, JobStatus::Preparing);

        let page = self
            .session
            .open(&job.target)
            .await
            .map_err(|err| JobError::NavigationFailed {
                url: job.target.to_string(),
                detail: err.to_string(),
            })?;

        // The deadline bounds the page-driving future only; the handle
        // stays out here so close runs even when the deadline fires.
        let deadline = self.config.runtime.job_deadline();
        let bounded =
            tokio::time::timeout(deadline, self.drive_page(job, page.as_ref(), cancel)).await;
        let result = match bounded {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout {
                limit_seconds: deadline.as_secs(),
            }),
        };

        if let Err(err) = page.close().await {
            warn!(job = %job.id, error = %err, "page close failed");
        }
        result
    }

    async fn drive_page(
        &self,
        job: &Job,
        page: &dyn PageHandle,
        cancel: &mut watch::Receiver<bool>,
    ) -> JobResult<ManifestResult> {
        let constrained = self.config.runtime.is_constrained_host();
        let mut selector = SourceSelector::new(page, &self.config.selection, constrained);
        let mut emitted = 0;

        self.transition(job, JobStatus::Selecting);
        ensure_live(cancel)?;
        let selection = selector.select_primary().await;
        self.emit_attempts(job, &selector, &mut emitted);
        let mut active_source = selection?;

        self.transition(job, JobStatus::Extracting);
        sleep_or_cancel(self.config.selection.settle_delay(), cancel).await?;

        let mut error_count: u32 = 0;
        let (manifest, captured) = loop {
            ensure_live(cancel)?;
            let captured = page
                .captured_urls()
                .await
                .map_err(|err| JobError::NavigationFailed {
                    url: job.target.to_string(),
                    detail: format!("capture sweep failed: {err}"),
                })?;
            if let Some(first) = captured.first().cloned() {
                self.broadcaster.manifest_captured(job.id, &captured);
                break (first, captured);
            }

            // One switch to the alternate source, and only after the very
            // first empty sweep.
            if error_count == 0 {
                if let Some(fallback) = selector.switch_to_fallback().await? {
                    self.emit_attempts(job, &selector, &mut emitted);
                    active_source = fallback;
                    sleep_or_cancel(self.config.selection.settle_delay(), cancel).await?;
                    error_count += 1;
                    self.broadcaster.capture_missed(job.id, error_count);
                    continue;
                }
                self.emit_attempts(job, &selector, &mut emitted);
            }

            error_count += 1;
            self.broadcaster.capture_missed(job.id, error_count);
            if error_count > MAX_JOB_ERRORS {
                return Err(JobError::NoManifestFound {
                    attempts: error_count,
                });
            }
            sleep_or_cancel(
                self.config.extraction.backoff_for_attempt(error_count),
                cancel,
            )
            .await?;
        };

        self.transition(job, JobStatus::PostProcessing);
        ensure_live(cancel)?;
        let output_path = self.config.resolve_path(&job.output_name);
        let remux_result = match job.output_kind {
            OutputKind::Manifest => self.remuxer.save_manifest(&manifest.url, &output_path).await,
            OutputKind::RemuxedMedia => self.remuxer.remux(&manifest.url, &output_path).await,
        };
        remux_result.map_err(|err| JobError::RemuxFailed {
            detail: err.to_string(),
        })?;

        Ok(ManifestResult {
            manifest_url: manifest.url,
            method: manifest.method,
            source: active_source.label,
            output_path,
            captured,
        })
    }

    fn transition(&self, job: &Job, status: JobStatus) {
        self.broadcaster.status_changed(job.id, status);
    }

    fn emit_attempts(&self, job: &Job, selector: &SourceSelector<'_>, already: &mut usize) {
        let attempts = selector.attempts();
        for attempt in &attempts[*already..] {
            self.broadcaster.source_attempted(job.id, attempt.clone());
        }
        *already = attempts.len();
    }
}

fn ensure_live(cancel: &watch::Receiver<bool>) -> JobResult<()> {
    if *cancel.borrow() {
        Err(JobError::Cancelled)
    } else {
        Ok(())
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &mut watch::Receiver<bool>) -> JobResult<()> {
    ensure_live(cancel)?;
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return Ok(()),
            changed = cancel.changed() => {
                if changed.is_err() {
                    // Sender dropped; nobody can cancel us anymore.
                    sleep.as_mut().await;
                    return Ok(());
                }
                ensure_live(cancel)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobErrorKind;

    #[test]
    fn request_without_name_derives_one_later() {
        let request = DownloadRequest {
            url: "https://film.kukaj.fi/matrix".into(),
            output_kind: OutputKind::RemuxedMedia,
            output_name: None,
        };
        assert!(request.output_name.is_none());
    }

    #[tokio::test]
    async fn ensure_live_reports_cancellation() {
        let (sender, receiver) = watch::channel(false);
        assert!(ensure_live(&receiver).is_ok());
        sender.send(true).unwrap();
        assert_eq!(
            ensure_live(&receiver).unwrap_err().kind(),
            JobErrorKind::Cancelled
        );
    }

    #[tokio::test]
    async fn sleep_or_cancel_wakes_on_cancellation() {
        let (sender, mut receiver) = watch::channel(false);
        let waiter = tokio::spawn(async move {
            sleep_or_cancel(Duration::from_secs(60), &mut receiver).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sender.send(true).unwrap();
        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err().kind(), JobErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_or_cancel_completes_when_sender_stays_quiet() {
        let (_sender, mut receiver) = watch::channel(false);
        sleep_or_cancel(Duration::from_secs(1), &mut receiver)
            .await
            .unwrap();
    }
}
