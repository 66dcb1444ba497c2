pub mod backend;
pub mod call;
mod cli;
pub mod db;
pub mod media;
pub mod pipeline;
pub mod recording;
pub mod settings;
pub mod sfu;
mod utils;

#[cfg(test)]
mod testing;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use backend::{http::HttpBackend, InterviewBackend, ScheduleRequest};
use call::{RecoveryOptions, SubmissionRecovery};
use cli::{CliArgs, Command};
use db::{Database, SubmissionState};
use pipeline::{render, tracker::PipelineTracker};
use settings::{AppSettings, SettingsStore};

pub fn run() -> Result<()> {
    let args = CliArgs::parse();
    let store = SettingsStore::new(args.config.clone())?;
    let settings = store.snapshot();

    let level = if args.debug || settings.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    // RUST_LOG still wins per module
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(dispatch(args.command, &store, settings))
}

async fn dispatch(command: Command, store: &SettingsStore, settings: AppSettings) -> Result<()> {
    match command {
        Command::Track {
            application_id,
            once,
        } => {
            let backend = backend_from(&settings)?;
            if once {
                let progress = backend
                    .fetch_pipeline(&application_id)
                    .await
                    .map_err(|err| anyhow::anyhow!(err.user_message()))?;
                print!("{}", render(&progress));
                return Ok(());
            }
            track(application_id, backend, &settings).await
        }
        Command::Recover { max_attempts } => {
            let backend = backend_from(&settings)?;
            let journal_path = store.journal_path();
            let db = Database::new(journal_path.clone())
                .with_context(|| format!("failed to open journal {}", journal_path.display()))?;
            if !db.has_pending().await? {
                println!("nothing to recover in {}", db.path().display());
                return Ok(());
            }

            let options = RecoveryOptions {
                max_attempts,
                ..RecoveryOptions::default()
            };
            let report = SubmissionRecovery::new(db.clone(), backend, options)
                .run()
                .await?;
            println!(
                "acknowledged: {}, still pending: {}, abandoned: {}",
                report.acknowledged.len(),
                report.still_pending.len(),
                report.abandoned.len()
            );
            for id in &report.still_pending {
                println!("  pending  {id}");
            }
            for id in &report.abandoned {
                println!("  abandoned  {id}");
            }

            let acknowledged_total = db.count_submissions(SubmissionState::Acknowledged).await?;
            info!("journal holds {acknowledged_total} acknowledged submission(s)");
            Ok(())
        }
        Command::Schedule {
            application_id,
            at,
            minutes,
            kind,
        } => {
            let backend = backend_from(&settings)?;
            let request = ScheduleRequest {
                application_id,
                scheduled_at: at,
                duration_minutes: minutes,
                kind: kind.into(),
            };
            let scheduled = backend
                .schedule_interview(&request)
                .await
                .map_err(|err| anyhow::anyhow!(err.user_message()))?;
            println!(
                "Scheduled interview {} at {}",
                scheduled.interview_id,
                scheduled.scheduled_at.to_rfc3339()
            );
            if let Some(url) = scheduled.meeting_url {
                println!("Meeting link: {url}");
            }
            Ok(())
        }
        Command::Config { write } => {
            println!("{}", serde_json::to_string_pretty(&settings.redacted())?);
            if write {
                store.persist()?;
                info!("settings written to {}", store.path().display());
            }
            Ok(())
        }
        #[cfg(feature = "native-capture")]
        Command::MicCheck { seconds, out } => mic_check(&settings, seconds, out).await,
    }
}

fn backend_from(settings: &AppSettings) -> Result<Arc<dyn InterviewBackend>> {
    let backend = HttpBackend::new(&settings.backend)
        .with_context(|| format!("invalid backend settings for {}", settings.backend.base_url))?;
    Ok(Arc::new(backend))
}

async fn track(
    application_id: String,
    backend: Arc<dyn InterviewBackend>,
    settings: &AppSettings,
) -> Result<()> {
    let mut tracker = PipelineTracker::new();
    let mut views = tracker.subscribe();
    tracker.start(
        application_id,
        backend,
        Duration::from_secs(settings.tracker.poll_interval_secs),
    )?;

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                if let Some(progress) = &view.progress {
                    print!("{}", render(progress));
                }
                if let Some(err) = &view.last_error {
                    warn!("{err}");
                }
                if view.settled {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    tracker.stop().await
}

#[cfg(feature = "native-capture")]
async fn mic_check(settings: &AppSettings, seconds: u64, out: std::path::PathBuf) -> Result<()> {
    use media::{native::CpalCapture, MediaCapture, MediaConstraints};
    use recording::RecordingBuffer;

    let mut capture = CpalCapture::new(settings.call.slice());
    let stream = capture.request_access(&MediaConstraints::audio_only()).await?;
    let buffer = RecordingBuffer::new();
    buffer.open();

    let recorder = capture.start_recording(&stream, buffer.sink())?;
    info!("recording {seconds}s from the default microphone");
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    capture.stop(recorder).await?;
    buffer.seal();
    capture.release(&stream);

    let format = capture.recording_format();
    let Some(artifact) = buffer.finalize(&format) else {
        anyhow::bail!("no audio was captured");
    };
    std::fs::write(&out, &artifact.bytes)
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!(
        "{} chunk(s), {} bytes of {} written to {}",
        artifact.chunk_count,
        artifact.len(),
        artifact.mime_type,
        out.display()
    );
    Ok(())
}
