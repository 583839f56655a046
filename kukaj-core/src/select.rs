use std::time::Duration;

use tracing::{info, warn};

use crate::config::SelectionSection;
use crate::job::{
    AttemptOutcome, JobError, JobResult, SourceAttempt, MAX_PRIMARY_STRATEGIES,
    MAX_SOURCE_ATTEMPTS,
};
use crate::session::{PageHandle, SelectionStrategy, VideoSource};

/// Walks the strategy ladder against the player page. Every activation
/// attempt lands in the trail, capped at `MAX_SOURCE_ATTEMPTS` across the
/// primary ladder and the single fallback switch.
pub struct SourceSelector<'a> {
    page: &'a dyn PageHandle,
    config: &'a SelectionSection,
    constrained: bool,
    attempts: Vec<SourceAttempt>,
    fallback_used: bool,
}

impl<'a> SourceSelector<'a> {
    pub fn new(page: &'a dyn PageHandle, config: &'a SelectionSection, constrained: bool) -> Self {
        Self {
            page,
            config,
            constrained,
            attempts: Vec::new(),
            fallback_used: false,
        }
    }

    pub fn attempts(&self) -> &[SourceAttempt] {
        &self.attempts
    }

    pub fn into_attempts(self) -> Vec<SourceAttempt> {
        self.attempts
    }

    /// Tries each strategy once against the preferred source. Exhausting
    /// the ladder is terminal; the fallback source is reserved for the
    /// case where activation worked but no manifest appeared.
    pub async fn select_primary(&mut self) -> JobResult<VideoSource> {
        let label = self.config.primary_source.clone();
        let source = match self.find_source(&label).await? {
            Some(source) => source,
            None => {
                self.record(
                    &label,
                    SelectionStrategy::DirectControl,
                    AttemptOutcome::NotPresent,
                    Duration::ZERO,
                );
                return Err(JobError::SourceNotFound {
                    attempts: self.attempts.len() as u32,
                });
            }
        };

        for strategy in SelectionStrategy::ORDER {
            debug_assert!(self.attempts.len() < MAX_PRIMARY_STRATEGIES as usize);
            if self.activate(&source, strategy).await {
                return Ok(source);
            }
        }

        Err(JobError::SourceNotFound {
            attempts: self.attempts.len() as u32,
        })
    }

    /// One-shot switch to the alternate source after an empty capture.
    /// Returns `Ok(None)` when the switch is unavailable or did not take.
    pub async fn switch_to_fallback(&mut self) -> JobResult<Option<VideoSource>> {
        if self.fallback_used || self.attempts.len() >= MAX_SOURCE_ATTEMPTS as usize {
            return Ok(None);
        }
        self.fallback_used = true;

        let label = self.config.fallback_source.clone();
        let source = match self.find_source(&label).await? {
            Some(source) => source,
            None => {
                self.record(
                    &label,
                    SelectionStrategy::DirectControl,
                    AttemptOutcome::NotPresent,
                    Duration::ZERO,
                );
                return Ok(None);
            }
        };

        info!(source = %source.label, "switching to fallback source");
        if self.activate(&source, SelectionStrategy::DirectControl).await {
            Ok(Some(source))
        } else {
            Ok(None)
        }
    }

    async fn activate(&mut self, source: &VideoSource, strategy: SelectionStrategy) -> bool {
        let timeout = self.strategy_timeout(strategy);
        let started = std::time::Instant::now();
        let outcome = self.page.select_source(source, strategy, timeout).await;
        let elapsed = started.elapsed();
        match outcome {
            Ok(true) => {
                self.record(&source.label, strategy, AttemptOutcome::Selected, elapsed);
                true
            }
            Ok(false) => {
                self.record(&source.label, strategy, AttemptOutcome::TimedOut, elapsed);
                false
            }
            Err(err) => {
                warn!(
                    source = %source.label,
                    strategy = strategy.label(),
                    error = %err,
                    "source activation failed"
                );
                self.record(&source.label, strategy, AttemptOutcome::Failed, elapsed);
                false
            }
        }
    }

    async fn find_source(&self, label: &str) -> JobResult<Option<VideoSource>> {
        let sources = self
            .page
            .available_sources()
            .await
            .map_err(|err| JobError::NavigationFailed {
                url: String::new(),
                detail: format!("listing sources failed: {err}"),
            })?;
        Ok(sources
            .into_iter()
            .find(|source| source.label.eq_ignore_ascii_case(label)))
    }

    fn strategy_timeout(&self, strategy: SelectionStrategy) -> Duration {
        let base = self.config.strategy_timeout(self.constrained);
        match strategy {
            SelectionStrategy::ExtendedWait => base + self.config.extended_wait(),
            _ => base,
        }
    }

    fn record(
        &mut self,
        source: &str,
        strategy: SelectionStrategy,
        outcome: AttemptOutcome,
        duration: Duration,
    ) {
        self.attempts.push(SourceAttempt {
            source: source.to_string(),
            strategy: strategy.label().to_string(),
            outcome,
            duration_ms: duration.as_millis() as u64,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::job::{CapturedUrl, JobErrorKind};
    use crate::session::{SessionError, SessionResult};

    /// Scripted page: each `select_source` call pops the next response.
    struct ScriptedPage {
        sources: Vec<VideoSource>,
        responses: Mutex<Vec<SessionResult<bool>>>,
        calls: Mutex<Vec<(String, SelectionStrategy)>>,
    }

    impl ScriptedPage {
        fn new(sources: Vec<&str>, responses: Vec<SessionResult<bool>>) -> Self {
            Self {
                sources: sources
                    .into_iter()
                    .map(|label| VideoSource {
                        label: label.to_string(),
                        href: Some(format!("/source/{label}")),
                    })
                    .collect(),
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, SelectionStrategy)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageHandle for ScriptedPage {
        async fn available_sources(&self) -> SessionResult<Vec<VideoSource>> {
            Ok(self.sources.clone())
        }

        async fn select_source(
            &self,
            source: &VideoSource,
            strategy: SelectionStrategy,
            _timeout: Duration,
        ) -> SessionResult<bool> {
            self.calls
                .lock()
                .unwrap()
                .push((source.label.clone(), strategy));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(false)
            } else {
                responses.remove(0)
            }
        }

        async fn captured_urls(&self) -> SessionResult<Vec<CapturedUrl>> {
            Ok(Vec::new())
        }

        async fn close(self: Box<Self>) -> SessionResult<()> {
            Ok(())
        }
    }

    fn config() -> SelectionSection {
        SelectionSection {
            primary_source: "MON".into(),
            fallback_source: "TAP".into(),
            strategy_timeout_seconds: 30,
            constrained_strategy_timeout_seconds: 8,
            settle_seconds: 5,
            extended_wait_seconds: 12,
        }
    }

    #[tokio::test]
    async fn first_strategy_success_stops_the_ladder() {
        let page = ScriptedPage::new(vec!["MON", "TAP"], vec![Ok(true)]);
        let section = config();
        let mut selector = SourceSelector::new(&page, &section, false);

        let source = selector.select_primary().await.unwrap();
        assert_eq!(source.label, "MON");
        assert_eq!(selector.attempts().len(), 1);
        assert_eq!(selector.attempts()[0].outcome, AttemptOutcome::Selected);
        assert_eq!(page.calls().len(), 1);
    }

    #[tokio::test]
    async fn ladder_advances_through_strategies_in_order() {
        let page = ScriptedPage::new(vec!["MON"], vec![Ok(false), Ok(false), Ok(true)]);
        let section = config();
        let mut selector = SourceSelector::new(&page, &section, false);

        selector.select_primary().await.unwrap();
        let calls = page.calls();
        assert_eq!(
            calls
                .iter()
                .map(|(_, strategy)| *strategy)
                .collect::<Vec<_>>(),
            SelectionStrategy::ORDER.to_vec()
        );
    }

    #[tokio::test]
    async fn exhausted_ladder_fails_with_three_attempts_and_no_fallback() {
        let page = ScriptedPage::new(vec!["MON", "TAP"], vec![Ok(false), Ok(false), Ok(false)]);
        let section = config();
        let mut selector = SourceSelector::new(&page, &section, false);

        let err = selector.select_primary().await.unwrap_err();
        assert_eq!(err.kind(), JobErrorKind::SourceNotFound);
        assert_eq!(selector.attempts().len(), 3);
        // Only the primary source was ever touched.
        assert!(page.calls().iter().all(|(label, _)| label == "MON"));
    }

    #[tokio::test]
    async fn activation_errors_count_as_failed_attempts() {
        let page = ScriptedPage::new(
            vec!["MON"],
            vec![
                Err(SessionError::Script("button vanished".into())),
                Ok(true),
            ],
        );
        let section = config();
        let mut selector = SourceSelector::new(&page, &section, false);

        selector.select_primary().await.unwrap();
        assert_eq!(selector.attempts()[0].outcome, AttemptOutcome::Failed);
        assert_eq!(selector.attempts()[1].outcome, AttemptOutcome::Selected);
    }

    #[tokio::test]
    async fn missing_primary_source_records_not_present() {
        let page = ScriptedPage::new(vec!["TAP"], vec![]);
        let section = config();
        let mut selector = SourceSelector::new(&page, &section, false);

        let err = selector.select_primary().await.unwrap_err();
        assert_eq!(err.kind(), JobErrorKind::SourceNotFound);
        assert_eq!(selector.attempts().len(), 1);
        assert_eq!(selector.attempts()[0].outcome, AttemptOutcome::NotPresent);
        assert!(page.calls().is_empty());
    }

    #[tokio::test]
    async fn fallback_switch_happens_at_most_once() {
        let page = ScriptedPage::new(vec!["MON", "TAP"], vec![Ok(true), Ok(true), Ok(true)]);
        let section = config();
        let mut selector = SourceSelector::new(&page, &section, false);

        selector.select_primary().await.unwrap();
        let first = selector.switch_to_fallback().await.unwrap();
        assert_eq!(first.map(|source| source.label), Some("TAP".to_string()));
        let second = selector.switch_to_fallback().await.unwrap();
        assert!(second.is_none());
        assert!(selector.attempts().len() <= MAX_SOURCE_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn fallback_absent_from_menu_is_not_an_error() {
        let page = ScriptedPage::new(vec!["MON"], vec![Ok(true)]);
        let section = config();
        let mut selector = SourceSelector::new(&page, &section, false);

        selector.select_primary().await.unwrap();
        let switched = selector.switch_to_fallback().await.unwrap();
        assert!(switched.is_none());
        assert_eq!(
            selector.attempts().last().map(|attempt| attempt.outcome),
            Some(AttemptOutcome::NotPresent)
        );
    }
}
