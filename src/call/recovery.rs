use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time;

use crate::{backend::InterviewBackend, call_info, call_warn, db::Database};

const ENABLE_LOGS: bool = true;

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Total attempts across runs before a submission is abandoned.
    pub max_attempts: u32,
    pub tries_per_run: u32,
    pub base_delay: Duration,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            tries_per_run: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub acknowledged: Vec<String>,
    pub still_pending: Vec<String>,
    pub abandoned: Vec<String>,
}

/// Re-sends end-call reports that were journaled but never acknowledged,
/// e.g. because the process died mid-upload. Each retry carries the original
/// session id, so the backend sees the same call again rather than a new one.
pub struct SubmissionRecovery {
    db: Database,
    backend: Arc<dyn InterviewBackend>,
    options: RecoveryOptions,
    rng: StdRng,
}

impl SubmissionRecovery {
    pub fn new(db: Database, backend: Arc<dyn InterviewBackend>, options: RecoveryOptions) -> Self {
        Self {
            db,
            backend,
            options,
            rng: StdRng::from_entropy(),
        }
    }

    /// Exponential backoff with up to 50% jitter.
    fn backoff(&mut self, try_index: u32) -> Duration {
        let base = self.options.base_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << try_index.min(6));
        let jitter = if exp > 1 {
            self.rng.gen_range(0..=exp / 2)
        } else {
            0
        };
        Duration::from_millis(exp + jitter)
    }

    pub async fn run(&mut self) -> Result<RecoveryReport> {
        let pending = self
            .db
            .list_pending_submissions()
            .await
            .context("failed to list pending submissions")?;

        let mut report = RecoveryReport::default();
        for record in pending {
            let session_id = record.session_id.clone();

            if record.attempts >= self.options.max_attempts {
                call_warn!(session_id, "giving up after {} attempts", record.attempts);
                self.db
                    .mark_submission_abandoned(&session_id, Utc::now())
                    .await?;
                report.abandoned.push(session_id);
                continue;
            }

            let submission = record.to_submission();
            let mut attempts = record.attempts;
            let mut tries = 0;
            let outcome = loop {
                tries += 1;
                match self.backend.end_call(&submission).await {
                    Ok(receipt) => break Ok(receipt),
                    Err(err) => {
                        attempts += 1;
                        self.db
                            .record_submission_failure(&session_id, &err.to_string(), Utc::now())
                            .await?;
                        if !err.is_retryable()
                            || attempts >= self.options.max_attempts
                            || tries >= self.options.tries_per_run
                        {
                            break Err(err);
                        }
                        let delay = self.backoff(tries - 1);
                        call_warn!(session_id, "resubmission failed ({err}); next try in {delay:?}");
                        time::sleep(delay).await;
                    }
                }
            };

            match outcome {
                Ok(receipt) => {
                    self.db
                        .mark_submission_acknowledged(&session_id, receipt.recording_url, Utc::now())
                        .await?;
                    call_info!(session_id, "pending end-call acknowledged");
                    report.acknowledged.push(session_id);
                }
                Err(err) if !err.is_retryable() || attempts >= self.options.max_attempts => {
                    call_warn!(session_id, "abandoning end-call: {err}");
                    self.db
                        .mark_submission_abandoned(&session_id, Utc::now())
                        .await?;
                    report.abandoned.push(session_id);
                }
                Err(_) => report.still_pending.push(session_id),
            }
        }

        Ok(report)
    }
}
