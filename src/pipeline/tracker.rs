use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::PipelineProgress;
use crate::backend::InterviewBackend;
use crate::{log_info, log_warn};

const ENABLE_LOGS: bool = true;

const FETCH_TIMEOUT_SECS: u64 = 10;

/// What the tracker currently knows. Last good progress survives failed polls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineView {
    pub progress: Option<PipelineProgress>,
    pub last_error: Option<String>,
    pub polled_at: Option<DateTime<Utc>>,
    pub polls: u32,
    pub settled: bool,
}

pub struct PipelineTracker {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    view_tx: watch::Sender<PipelineView>,
}

impl Default for PipelineTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineTracker {
    pub fn new() -> Self {
        let (view_tx, _) = watch::channel(PipelineView::default());
        Self {
            handle: None,
            cancel_token: None,
            view_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineView> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> PipelineView {
        self.view_tx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn start(
        &mut self,
        application_id: String,
        backend: Arc<dyn InterviewBackend>,
        poll_every: Duration,
    ) -> Result<()> {
        if self.is_running() {
            bail!("pipeline tracker already running");
        }
        if application_id.trim().is_empty() {
            bail!("application id is empty");
        }

        self.view_tx.send_replace(PipelineView::default());

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            application_id,
            backend,
            poll_every.max(Duration::from_secs(1)),
            cancel_token.clone(),
            self.view_tx.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("pipeline poll task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

async fn poll_loop(
    application_id: String,
    backend: Arc<dyn InterviewBackend>,
    poll_every: Duration,
    cancel_token: CancellationToken,
    view_tx: watch::Sender<PipelineView>,
) {
    let mut ticker = time::interval(poll_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let fetched = time::timeout(
                    Duration::from_secs(FETCH_TIMEOUT_SECS),
                    backend.fetch_pipeline(&application_id),
                )
                .await;

                let mut settled = false;
                view_tx.send_modify(|view| {
                    view.polls += 1;
                    view.polled_at = Some(Utc::now());
                    match fetched {
                        Ok(Ok(progress)) => {
                            view.settled = progress.is_settled();
                            view.progress = Some(progress);
                            view.last_error = None;
                        }
                        Ok(Err(err)) => {
                            log_warn!("pipeline poll for {application_id} failed: {err}");
                            view.last_error = Some(err.user_message());
                        }
                        Err(_) => {
                            log_warn!(
                                "pipeline poll for {application_id} timed out (> {FETCH_TIMEOUT_SECS}s)"
                            );
                            view.last_error = Some("The server is taking too long to respond.".into());
                        }
                    }
                    settled = view.settled;
                });

                if settled {
                    log_info!("pipeline for {application_id} settled; polling stops");
                    break;
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("pipeline tracker for {application_id} shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::BackendError,
        pipeline::{InterviewStageStatus, StageProgress},
        testing::FakeBackend,
    };

    fn progress(status: InterviewStageStatus) -> PipelineProgress {
        PipelineProgress {
            application_id: "a1".into(),
            stages: vec![StageProgress {
                name: "Technical".into(),
                status,
                scheduled_at: None,
            }],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_pipeline_settles() {
        let backend = Arc::new(FakeBackend::default());
        backend.queue_pipeline(Ok(progress(InterviewStageStatus::Scheduled)));
        backend.queue_pipeline(Err(BackendError::Transport("reset".into())));
        backend.queue_pipeline(Ok(progress(InterviewStageStatus::Completed)));

        let mut tracker = PipelineTracker::new();
        let mut rx = tracker.subscribe();
        tracker
            .start("a1".into(), backend.clone(), Duration::from_secs(5))
            .unwrap();

        let view = rx.wait_for(|v| v.settled).await.unwrap().clone();
        assert_eq!(view.polls, 3);
        assert!(view.last_error.is_none());
        assert_eq!(
            view.progress.unwrap().stages[0].status,
            InterviewStageStatus::Completed
        );

        tracker.stop().await.unwrap();
        assert!(!tracker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_keeps_last_progress() {
        let backend = Arc::new(FakeBackend::default());
        backend.queue_pipeline(Ok(progress(InterviewStageStatus::InProgress)));
        backend.queue_pipeline(Err(BackendError::Status {
            status: 503,
            message: "Maintenance in progress".into(),
        }));

        let mut tracker = PipelineTracker::new();
        let mut rx = tracker.subscribe();
        tracker
            .start("a1".into(), backend, Duration::from_secs(5))
            .unwrap();

        let view = rx.wait_for(|v| v.polls == 2).await.unwrap().clone();
        assert_eq!(view.last_error.as_deref(), Some("Maintenance in progress"));
        assert!(view.progress.is_some());
        assert!(!view.settled);

        tracker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_blank_application_and_double_start() {
        let backend = Arc::new(FakeBackend::default());
        let mut tracker = PipelineTracker::new();
        assert!(tracker
            .start(" ".into(), backend.clone(), Duration::from_secs(5))
            .is_err());

        tracker
            .start("a1".into(), backend.clone(), Duration::from_secs(60))
            .unwrap();
        assert!(tracker
            .start("a1".into(), backend, Duration::from_secs(60))
            .is_err());
        tracker.stop().await.unwrap();
    }
}
