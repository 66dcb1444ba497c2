use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    clock::{Clock, SystemClock},
    error::CallError,
    state::{
        CallEvent, CallSession, CallSnapshot, CallStatus, ChatMessage, Effect, JoinCredentials,
        ParticipantRole,
    },
};
use crate::{
    backend::{EndCallSubmission, InterviewBackend, MeetingCredentials},
    call_debug, call_error, call_info, call_warn,
    db::Database,
    media::{MediaCapture, MediaConstraints, MediaStreamHandle, RecorderHandle},
    settings::CallSettings,
    sfu::{AppCredential, RoomState, SfuClient, SfuEvent, SfuSession},
};

const ENABLE_LOGS: bool = true;

pub struct CallOptions {
    pub constraints: MediaConstraints,
    pub tick_interval: Duration,
    pub clock: Arc<dyn Clock>,
    /// Outbox for end-call submissions. Without it a crash mid-upload loses the call report.
    pub journal: Option<Database>,
}

impl CallOptions {
    pub fn from_settings(settings: &CallSettings) -> Self {
        Self {
            constraints: settings.constraints(),
            ..Self::default()
        }
    }

    pub fn with_journal(mut self, journal: Database) -> Self {
        self.journal = Some(journal);
        self
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            constraints: MediaConstraints::default(),
            tick_interval: Duration::from_secs(1),
            clock: Arc::new(SystemClock),
            journal: None,
        }
    }
}

/// Asks the backend for the room of an interview. Interviewers open the
/// meeting, candidates join it.
pub async fn open_meeting(
    backend: &dyn InterviewBackend,
    interview_id: &str,
    role: ParticipantRole,
) -> Result<MeetingCredentials, CallError> {
    if interview_id.trim().is_empty() {
        return Err(CallError::Config("interview id is empty".into()));
    }

    let result = match role {
        ParticipantRole::Interviewer => backend.start_meeting(interview_id).await,
        ParticipantRole::Candidate => backend.join_meeting(interview_id).await,
    };

    result.map_err(|err| {
        if err.is_retryable() {
            CallError::Connection(err.user_message())
        } else {
            CallError::Config(err.user_message())
        }
    })
}

struct Inner {
    session: CallSession,
    media: Box<dyn MediaCapture>,
    sfu: SfuSession,
    stream: Option<MediaStreamHandle>,
    recorder: Option<RecorderHandle>,
    pending_submit: Option<EndCallSubmission>,
    end_prompt_open: bool,
    closed: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.media.release(&stream);
        }
    }
}

struct Pump {
    events: Option<mpsc::UnboundedReceiver<SfuEvent>>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    session_id: String,
    inner: Mutex<Inner>,
    backend: Arc<dyn InterviewBackend>,
    journal: Option<Database>,
    clock: Arc<dyn Clock>,
    app: AppCredential,
    constraints: MediaConstraints,
    tick_interval: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Pump>,
    snapshot_tx: watch::Sender<CallSnapshot>,
}

/// Drives one [`CallSession`] against the media, SFU and backend adapters.
///
/// Every public operation locks the session, dispatches an event and runs the
/// returned effects in order. The lock is released while the end-call upload
/// is in flight so that SFU events and `teardown` are not blocked by the
/// network.
#[derive(Clone)]
pub struct CallController {
    shared: Arc<Shared>,
}

impl CallController {
    pub fn new(
        mut session: CallSession,
        app: AppCredential,
        media: Box<dyn MediaCapture>,
        sfu: Box<dyn SfuClient>,
        backend: Arc<dyn InterviewBackend>,
        options: CallOptions,
    ) -> Self {
        session.set_recording_format(media.recording_format());

        let mut sfu = SfuSession::new(sfu);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        sfu.subscribe(events_tx);

        let (snapshot_tx, _) = watch::channel(session.snapshot(options.clock.now(), false));

        Self {
            shared: Arc::new(Shared {
                session_id: session.session_id().to_string(),
                inner: Mutex::new(Inner {
                    session,
                    media,
                    sfu,
                    stream: None,
                    recorder: None,
                    pending_submit: None,
                    end_prompt_open: false,
                    closed: false,
                }),
                backend,
                journal: options.journal,
                clock: options.clock,
                app,
                constraints: options.constraints,
                tick_interval: options.tick_interval,
                ticker: Mutex::new(None),
                pump: Mutex::new(Pump {
                    events: Some(events_rx),
                    token: CancellationToken::new(),
                    handle: None,
                }),
                snapshot_tx,
            }),
        }
    }

    /// New session for a meeting issued by the backend.
    pub fn for_meeting(
        meeting: &MeetingCredentials,
        role: ParticipantRole,
        media: Box<dyn MediaCapture>,
        sfu: Box<dyn SfuClient>,
        backend: Arc<dyn InterviewBackend>,
        options: CallOptions,
    ) -> Self {
        let session = CallSession::new(
            Uuid::new_v4().to_string(),
            &meeting.interview_id,
            role,
            meeting.scheduled_at,
        );
        Self::new(session, meeting.app.clone(), media, sfu, backend, options)
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        let inner = self.shared.inner.lock().await;
        self.shared.snapshot_of(&inner)
    }

    pub async fn start(&self, credentials: JoinCredentials) -> Result<CallSnapshot, CallError> {
        let shared = &self.shared;
        shared.ensure_pump().await;

        let mut inner = shared.inner.lock().await;
        shared.ensure_open(&inner, "start")?;
        call_info!(shared.session_id, "starting call in room {}", credentials.room_id);
        shared.step(&mut inner, CallEvent::Start(credentials)).await?;
        shared.settle(&inner)
    }

    pub async fn retry(&self) -> Result<CallSnapshot, CallError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        shared.ensure_open(&inner, "retry")?;
        call_info!(shared.session_id, "retrying connection");
        shared.step(&mut inner, CallEvent::Retry).await?;
        shared.settle(&inner)
    }

    /// First half of the two-step end: opens the confirmation prompt.
    pub async fn request_end(&self) -> Result<CallSnapshot, CallError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        shared.ensure_open(&inner, "request_end")?;
        inner.session.ensure_can_end()?;
        inner.end_prompt_open = true;
        shared.publish(&inner);
        Ok(shared.snapshot_of(&inner))
    }

    pub async fn cancel_end(&self) -> CallSnapshot {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        inner.end_prompt_open = false;
        shared.publish(&inner);
        shared.snapshot_of(&inner)
    }

    /// Ends the call and uploads the report. On a failed upload the call is
    /// back in `connected` and this returns [`CallError::Submission`].
    pub async fn confirm_end(&self) -> Result<CallSnapshot, CallError> {
        let shared = &self.shared;
        let submission = {
            let mut inner = shared.inner.lock().await;
            shared.ensure_open(&inner, "confirm_end")?;
            inner.end_prompt_open = false;
            shared.begin_end(&mut inner, CallEvent::EndRequested).await?
        };
        shared.submit(submission).await
    }

    /// Adapter failure the call cannot recover from, such as a lost media track.
    pub async fn report_fatal(&self, reason: &str) -> Result<CallSnapshot, CallError> {
        self.shared.report_fatal(reason).await
    }

    pub async fn send_message(&self, text: &str) -> Result<(), CallError> {
        let shared = &self.shared;
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let mut inner = shared.inner.lock().await;
        shared.ensure_open(&inner, "send_message")?;
        let status = inner.session.status();
        if status != CallStatus::Connected {
            return Err(CallError::InvalidTransition {
                from: status,
                event: "send_message",
            });
        }

        inner
            .sfu
            .send_message(text)
            .await
            .map_err(|err| CallError::Connection(err.to_string()))?;
        let now = shared.clock.now();
        inner.session.record_outgoing_chat(text.to_string(), now);
        shared.publish(&inner);
        Ok(())
    }

    /// Closes the call surface. Everything acquired is released and nothing
    /// is submitted; an upload already in flight is left to finish on its own.
    pub async fn teardown(&self) {
        let shared = &self.shared;
        shared.stop_pump().await;
        shared.stop_ticker().await;

        let mut inner = shared.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.end_prompt_open = false;

        match inner.session.status() {
            CallStatus::Ended => {}
            CallStatus::Ending => call_warn!(
                shared.session_id,
                "closed while the end-call upload is in flight; the journal keeps it for recovery"
            ),
            status => call_warn!(
                shared.session_id,
                "closed while {status}; discarding {} recorded chunk(s) without submitting",
                inner.session.recording().chunk_count()
            ),
        }

        shared.stop_recorder(&mut inner).await;
        inner.session.recording().seal();
        shared.release_media(&mut inner);
        inner.sfu.release().await;
        shared.publish(&inner);
    }
}

impl Shared {
    fn snapshot_of(&self, inner: &Inner) -> CallSnapshot {
        inner
            .session
            .snapshot(self.clock.now(), inner.end_prompt_open)
    }

    fn publish(&self, inner: &Inner) {
        self.snapshot_tx.send_replace(self.snapshot_of(inner));
    }

    fn ensure_open(&self, inner: &Inner, event: &'static str) -> Result<(), CallError> {
        if inner.closed {
            return Err(CallError::InvalidTransition {
                from: inner.session.status(),
                event,
            });
        }
        Ok(())
    }

    /// Snapshot, or the session's error as a [`CallError`].
    fn settle(&self, inner: &Inner) -> Result<CallSnapshot, CallError> {
        let snapshot = self.snapshot_of(inner);
        match (snapshot.status, snapshot.error_cause) {
            (CallStatus::Error, Some(cause)) => Err(CallError::from_cause(
                cause,
                snapshot.notice.clone().unwrap_or_default(),
            )),
            _ => Ok(snapshot),
        }
    }

    async fn step(self: &Arc<Self>, inner: &mut Inner, event: CallEvent) -> Result<(), CallError> {
        let now = self.clock.now();
        let effects = inner.session.dispatch(event, now)?;
        self.drive(inner, effects).await;
        self.publish(inner);
        Ok(())
    }

    /// Runs effects in order. An effect that reports back an adapter outcome
    /// replaces whatever is left of its batch with the effects of that outcome.
    async fn drive(self: &Arc<Self>, inner: &mut Inner, effects: Vec<Effect>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            let events = self.run_effect(inner, effect).await;
            if events.is_empty() {
                continue;
            }

            queue.clear();
            for event in events {
                let name = event.name();
                match inner.session.dispatch(event, self.clock.now()) {
                    Ok(next) => queue.extend(next),
                    Err(err) => call_warn!(self.session_id, "dropped {name}: {err}"),
                }
            }
        }
    }

    async fn run_effect(self: &Arc<Self>, inner: &mut Inner, effect: Effect) -> Vec<CallEvent> {
        match effect {
            Effect::Connect(credentials) => return self.connect(inner, &credentials).await,
            Effect::Publish => {
                let Some(stream) = inner.stream.clone() else {
                    return vec![CallEvent::PublishFailed("no local media stream".into())];
                };
                if let Err(err) = inner.sfu.publish(&stream).await {
                    return vec![CallEvent::PublishFailed(err.to_string())];
                }
                call_info!(self.session_id, "connected; local stream {} published", stream.id);
            }
            Effect::StartTimer => self.spawn_ticker().await,
            Effect::StopTimer => self.stop_ticker().await,
            Effect::StartRecording => self.start_recorder(inner),
            Effect::StopRecording => self.stop_recorder(inner).await,
            Effect::ReleaseMedia => self.release_media(inner),
            Effect::LeaveRoom => inner.sfu.leave().await,
            Effect::Submit(submission) => inner.pending_submit = Some(submission),
            Effect::ReacquireMedia => self.reacquire_media(inner).await,
            Effect::Dispose => {
                self.stop_pump().await;
                inner.sfu.release().await;
            }
        }
        Vec::new()
    }

    async fn connect(&self, inner: &mut Inner, credentials: &JoinCredentials) -> Vec<CallEvent> {
        if let Err(err) = inner.sfu.init(&self.app).await {
            return vec![CallEvent::JoinFailed(err.to_string())];
        }
        if let Err(err) = inner
            .sfu
            .join(
                &credentials.room_id,
                &credentials.token,
                &credentials.participant_id,
            )
            .await
        {
            return vec![CallEvent::JoinFailed(err.to_string())];
        }

        let mut events = vec![CallEvent::RoomJoined];
        match self.acquire_media(inner).await {
            Ok(()) => events.push(CallEvent::MediaReady),
            Err(reason) => events.push(CallEvent::MediaDenied(reason)),
        }
        events
    }

    async fn acquire_media(&self, inner: &mut Inner) -> Result<(), String> {
        if inner.stream.is_some() {
            return Ok(());
        }
        let stream = inner
            .media
            .request_access(&self.constraints)
            .await
            .map_err(|err| err.to_string())?;
        call_debug!(
            self.session_id,
            "media stream {} acquired (audio: {}, video: {})",
            stream.id,
            stream.audio,
            stream.video
        );
        inner.stream = Some(stream);
        // adapters may only know sample rate and channels once the device is open
        let format = inner.media.recording_format();
        inner.session.set_recording_format(format);
        Ok(())
    }

    fn release_media(&self, inner: &mut Inner) {
        if let Some(stream) = inner.stream.take() {
            inner.media.release(&stream);
            call_debug!(self.session_id, "media stream {} released", stream.id);
        }
    }

    fn start_recorder(&self, inner: &mut Inner) {
        if inner.recorder.is_some() {
            return;
        }
        let Some(stream) = inner.stream.clone() else {
            call_warn!(self.session_id, "no media stream to record");
            return;
        };
        let sink = inner.session.recording().sink();
        match inner.media.start_recording(&stream, sink) {
            Ok(recorder) => inner.recorder = Some(recorder),
            Err(err) => call_error!(self.session_id, "recorder failed to start: {err}"),
        }
    }

    async fn stop_recorder(&self, inner: &mut Inner) {
        if let Some(recorder) = inner.recorder.take() {
            if let Err(err) = inner.media.stop(recorder).await {
                call_warn!(self.session_id, "recorder did not stop cleanly: {err}");
            }
        }
    }

    /// After a failed upload: media, publish and recorder come back so the
    /// call can go on.
    async fn reacquire_media(&self, inner: &mut Inner) {
        if let Err(reason) = self.acquire_media(inner).await {
            call_warn!(self.session_id, "could not re-acquire media: {reason}");
            return;
        }
        if let Some(stream) = inner.stream.clone() {
            if let Err(err) = inner.sfu.publish(&stream).await {
                call_warn!(self.session_id, "re-publish failed: {err}");
            }
        }
        self.start_recorder(inner);
    }

    async fn spawn_ticker(self: &Arc<Self>) {
        let mut guard = self.ticker.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }

        let shared = Arc::downgrade(self);
        let every = self.tick_interval;
        *guard = Some(tokio::spawn(async move {
            let mut interval = time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if !shared.on_tick().await {
                    break;
                }
            }
        }));
    }

    async fn stop_ticker(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    async fn on_tick(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.session.status() != CallStatus::Connected {
            return false;
        }
        if inner
            .session
            .dispatch(CallEvent::Tick, self.clock.now())
            .is_ok()
        {
            self.publish(&inner);
        }
        true
    }

    async fn ensure_pump(self: &Arc<Self>) {
        let mut pump = self.pump.lock().await;
        let Some(mut events) = pump.events.take() else {
            return;
        };

        let token = pump.token.clone();
        let shared: Weak<Shared> = Arc::downgrade(self);
        pump.handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        let Some(shared) = shared.upgrade() else {
                            break;
                        };
                        shared.handle_sfu_event(event).await;
                    }
                }
            }
        }));
    }

    async fn stop_pump(&self) {
        let mut pump = self.pump.lock().await;
        pump.token.cancel();
        pump.events = None;
        pump.handle = None;
    }

    async fn handle_sfu_event(self: &Arc<Self>, event: SfuEvent) {
        match event {
            SfuEvent::RoomStateChanged { state, error_code } => match state {
                RoomState::Reconnecting => {
                    call_warn!(self.session_id, "room reconnecting (code {error_code:?})");
                    self.apply(CallEvent::RoomReconnecting).await;
                }
                RoomState::Connected => self.apply(CallEvent::RoomRestored).await,
                RoomState::Disconnected => {
                    let reason = match error_code {
                        Some(code) => format!("room disconnected with code {code}"),
                        None => "room disconnected".to_string(),
                    };
                    if let Err(err) = self.report_fatal(&reason).await {
                        call_warn!(self.session_id, "after {reason}: {err}");
                    }
                }
            },
            SfuEvent::ParticipantJoined { participant_id } => {
                self.apply(CallEvent::RemoteJoined(participant_id)).await
            }
            SfuEvent::ParticipantLeft { participant_id } => {
                self.apply(CallEvent::RemoteLeft(participant_id)).await
            }
            SfuEvent::RemoteStreamAdded { stream_id } => {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return;
                }
                if let Err(err) = inner.sfu.play_remote(&stream_id).await {
                    call_warn!(self.session_id, "cannot play remote stream {stream_id}: {err}");
                }
            }
            SfuEvent::RemoteStreamRemoved { stream_id } => {
                let mut inner = self.inner.lock().await;
                if let Err(err) = inner.sfu.stop_remote(&stream_id).await {
                    call_debug!(self.session_id, "stop of remote stream {stream_id} failed: {err}");
                }
            }
            SfuEvent::Message {
                from,
                text,
                sent_at,
            } => {
                self.apply(CallEvent::ChatReceived(ChatMessage {
                    from,
                    text,
                    sent_at,
                    local: false,
                }))
                .await
            }
            SfuEvent::Quality(sample) => {
                call_debug!(
                    self.session_id,
                    "quality stream={:?} rtt={:?}ms loss={:?} level={:?}",
                    sample.stream_id,
                    sample.rtt_ms,
                    sample.packet_loss,
                    sample.level
                );
            }
        }
    }

    /// Dispatches an adapter event. Events that no longer fit the current
    /// status are expected around transitions and only logged.
    async fn apply(self: &Arc<Self>, event: CallEvent) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        if let Err(err) = self.step(&mut inner, event).await {
            call_debug!(self.session_id, "ignored adapter event: {err}");
        }
    }

    async fn report_fatal(self: &Arc<Self>, reason: &str) -> Result<CallSnapshot, CallError> {
        let submission = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Ok(self.snapshot_of(&inner));
            }
            match inner.session.status() {
                CallStatus::Connected => {
                    call_error!(self.session_id, "fatal adapter error: {reason}");
                    inner.end_prompt_open = false;
                    self.begin_end(&mut inner, CallEvent::FatalAdapterError(reason.into()))
                        .await?
                }
                CallStatus::Connecting => {
                    self.step(&mut inner, CallEvent::JoinFailed(reason.into()))
                        .await?;
                    return self.settle(&inner);
                }
                status => {
                    call_debug!(self.session_id, "fatal error while {status} ignored: {reason}");
                    return Ok(self.snapshot_of(&inner));
                }
            }
        };
        self.submit(submission).await
    }

    /// Stops the recorder while the gate is still open so the final slice is
    /// kept, then moves the session to `ending`.
    async fn begin_end(
        self: &Arc<Self>,
        inner: &mut Inner,
        event: CallEvent,
    ) -> Result<EndCallSubmission, CallError> {
        inner.session.ensure_can_end()?;
        self.stop_recorder(inner).await;
        self.step(inner, event).await?;
        inner
            .pending_submit
            .take()
            .ok_or_else(|| CallError::Submission("no end-call report was prepared".into()))
    }

    async fn submit(self: &Arc<Self>, submission: EndCallSubmission) -> Result<CallSnapshot, CallError> {
        let session_id = submission.session_id.as_str();

        if let Some(journal) = &self.journal {
            if let Err(err) = journal
                .upsert_pending_submission(&submission, self.clock.now())
                .await
            {
                call_warn!(session_id, "journal write failed, submitting anyway: {err:#}");
            }
        }

        call_info!(
            session_id,
            "submitting end-call: {}s, quality {}, {} chunk(s)",
            submission.duration_seconds,
            submission.connection_quality.as_str(),
            submission.recording.as_ref().map_or(0, |r| r.chunk_count)
        );
        let outcome = self.backend.end_call(&submission).await;

        let mut inner = self.inner.lock().await;
        match outcome {
            Ok(receipt) => {
                if let Some(journal) = &self.journal {
                    if let Err(err) = journal
                        .mark_submission_acknowledged(session_id, receipt.recording_url, self.clock.now())
                        .await
                    {
                        call_warn!(session_id, "journal acknowledgement failed: {err:#}");
                    }
                }
                self.step(&mut inner, CallEvent::SubmissionAcknowledged)
                    .await?;
                call_info!(session_id, "call ended");
                Ok(self.snapshot_of(&inner))
            }
            Err(err) => {
                if let Some(journal) = &self.journal {
                    if let Err(journal_err) = journal
                        .record_submission_failure(session_id, &err.to_string(), self.clock.now())
                        .await
                    {
                        call_warn!(session_id, "journal failure record failed: {journal_err:#}");
                    }
                }

                let message = err.user_message();
                if inner.closed {
                    call_warn!(
                        session_id,
                        "end-call failed after the surface closed, left pending: {err}"
                    );
                    return Err(CallError::Submission(message));
                }

                call_warn!(session_id, "end-call failed, call resumes: {err}");
                self.step(&mut inner, CallEvent::SubmissionFailed(message.clone()))
                    .await?;
                Err(CallError::Submission(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::{
        backend::{BackendError, ConnectionQuality},
        call::ErrorCause,
        db::SubmissionState,
        recording::RecordingFormat,
        testing::{FakeBackend, FakeMedia, FakeSfu, ManualClock},
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap()
    }

    fn creds() -> JoinCredentials {
        JoinCredentials::new("r1", "t1", "p1")
    }

    struct Harness {
        controller: CallController,
        sfu: FakeSfu,
        media: FakeMedia,
        backend: Arc<FakeBackend>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(journal: Option<Database>) -> Harness {
        harness_for(
            CallSession::new("s-1", "i-1", ParticipantRole::Interviewer, None),
            journal,
        )
    }

    fn harness_for(session: CallSession, journal: Option<Database>) -> Harness {
        let sfu = FakeSfu::default();
        let media = FakeMedia::default();
        let backend = Arc::new(FakeBackend::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let mut options = CallOptions {
            clock: clock.clone(),
            ..CallOptions::default()
        };
        if let Some(db) = journal {
            options = options.with_journal(db);
        }

        let controller = CallController::new(
            session,
            AppCredential {
                app_id: "app".into(),
                server: None,
            },
            Box::new(media.clone()),
            Box::new(sfu.clone()),
            backend.clone(),
            options,
        );

        Harness {
            controller,
            sfu,
            media,
            backend,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(None)
    }

    fn calls(sfu: &FakeSfu) -> Vec<String> {
        sfu.calls().lock().unwrap().clone()
    }

    async fn wait_for(
        controller: &CallController,
        predicate: impl FnMut(&CallSnapshot) -> bool,
    ) -> CallSnapshot {
        let mut rx = controller.subscribe();
        let snapshot = time::timeout(Duration::from_secs(2), rx.wait_for(predicate))
            .await
            .expect("snapshot in time")
            .expect("controller alive")
            .clone();
        snapshot
    }

    #[tokio::test]
    async fn start_joins_publishes_and_records() {
        let h = harness();
        assert!(!h.media.emit_chunk(b"early"));

        let snapshot = h.controller.start(creds()).await.unwrap();

        assert_eq!(snapshot.status, CallStatus::Connected);
        assert_eq!(snapshot.started_at, Some(t0()));
        assert_eq!(calls(&h.sfu), ["init", "join:r1", "publish:1"]);
        assert!(h.media.emit_chunk(b"chunk"));
        assert_eq!(h.controller.snapshot().await.chunk_count, 1);

        h.controller.teardown().await;
    }

    #[tokio::test]
    async fn blank_credentials_touch_no_adapter() {
        let h = harness();
        let err = h
            .controller
            .start(JoinCredentials::new("r1", "", "p1"))
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Config(_)));
        assert!(!err.is_retryable());
        assert!(calls(&h.sfu).is_empty());
        assert_eq!(h.media.acquired(), 0);
    }

    #[tokio::test]
    async fn denied_media_errors_then_retry_connects() {
        let h = harness();
        h.media.deny_next("NotAllowedError");

        let err = h.controller.start(creds()).await.unwrap_err();
        assert!(matches!(err, CallError::Permission(_)));

        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.status, CallStatus::Error);
        assert_eq!(snapshot.error_cause, Some(ErrorCause::MediaDenied));
        assert_eq!(calls(&h.sfu), ["init", "join:r1", "leave:r1"]);

        let snapshot = h.controller.retry().await.unwrap();
        assert_eq!(snapshot.status, CallStatus::Connected);

        h.controller.teardown().await;
    }

    #[tokio::test]
    async fn join_failed_errors_then_retry_connects() {
        let h = harness();
        h.sfu.fail_next_join("timeout");

        let err = h.controller.start(creds()).await.unwrap_err();
        assert!(matches!(err, CallError::Connection(_)));
        assert!(err.is_retryable());

        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.status, CallStatus::Error);
        assert_eq!(snapshot.error_cause, Some(ErrorCause::JoinFailed));
        assert_eq!(h.media.acquired(), 0);
        assert_eq!(calls(&h.sfu), ["init", "join_failed:r1"]);

        let snapshot = h.controller.retry().await.unwrap();
        assert_eq!(snapshot.status, CallStatus::Connected);
        assert_eq!(snapshot.connection_quality, ConnectionQuality::Fair);
        assert_eq!(calls(&h.sfu)[2..], ["join:r1", "publish:1"]);

        h.controller.teardown().await;
    }

    #[tokio::test]
    async fn fatal_error_while_connecting_counts_as_join_failure() {
        let mut session = CallSession::new("s-1", "i-1", ParticipantRole::Interviewer, None);
        session.dispatch(CallEvent::Start(creds()), t0()).unwrap();
        assert_eq!(session.status(), CallStatus::Connecting);
        let h = harness_for(session, None);

        let err = h.controller.report_fatal("sdk crashed").await.unwrap_err();
        assert!(matches!(err, CallError::Connection(_)));
        assert_eq!(
            h.controller.snapshot().await.error_cause,
            Some(ErrorCause::JoinFailed)
        );
        assert!(h.backend.submissions().is_empty());

        let snapshot = h.controller.retry().await.unwrap();
        assert_eq!(snapshot.status, CallStatus::Connected);

        h.controller.teardown().await;
    }

    #[tokio::test]
    async fn upload_uses_format_known_after_device_opens() {
        let h = harness();
        h.media.format_on_access(RecordingFormat::new(
            "audio/L16;rate=48000;channels=1",
            "pcm",
        ));

        h.controller.start(creds()).await.unwrap();
        h.media.emit_chunk(b"pcm");
        h.controller.confirm_end().await.unwrap();

        let submissions = h.backend.submissions();
        let recording = submissions[0].recording.as_ref().unwrap();
        assert_eq!(recording.mime_type, "audio/L16;rate=48000;channels=1");
        assert_eq!(recording.file_name, "recording.pcm");
    }

    #[tokio::test]
    async fn publish_failure_moves_connected_to_error() {
        let h = harness();
        h.sfu.fail_next_publish("ice failed");

        let err = h.controller.start(creds()).await.unwrap_err();
        assert!(matches!(err, CallError::Connection(_)));

        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.error_cause, Some(ErrorCause::PublishFailed));
        assert!(!h.media.is_recording());
        assert_eq!(h.media.live_streams(), 0);
    }

    #[tokio::test]
    async fn failed_upload_resumes_call_and_retry_sends_identical_report() {
        let h = harness();
        h.controller.start(creds()).await.unwrap();
        h.media.emit_chunk(b"one");
        h.media.emit_chunk(b"two");
        h.media.queue_final_chunk(b"three");
        h.clock.advance(chrono::Duration::seconds(125));
        h.backend.queue_end_call(Err(BackendError::Status {
            status: 503,
            message: "Server busy, try again.".into(),
        }));

        let prompt = h.controller.request_end().await.unwrap();
        assert!(prompt.end_prompt_open);

        let err = h.controller.confirm_end().await.unwrap_err();
        assert_eq!(err, CallError::Submission("Server busy, try again.".into()));

        let resumed = h.controller.snapshot().await;
        assert_eq!(resumed.status, CallStatus::Connected);
        assert_eq!(resumed.elapsed_ms, 125_000);
        assert_eq!(resumed.submit_failures, 1);
        assert_eq!(resumed.notice.as_deref(), Some("Server busy, try again."));
        assert!(h.media.is_recording());
        assert_eq!(h.media.acquired(), 2);

        let ended = h.controller.confirm_end().await.unwrap();
        assert_eq!(ended.status, CallStatus::Ended);

        let submissions = h.backend.submissions();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[0], submissions[1]);
        assert_eq!(submissions[1].duration_seconds, 125);
        let recording = submissions[1].recording.as_ref().unwrap();
        assert_eq!(recording.chunk_count, 3);
        assert_eq!(recording.bytes, b"onetwothree");

        let log = calls(&h.sfu);
        assert_eq!(log[log.len() - 2..], ["leave:r1", "destroy"]);
        assert_eq!(h.media.live_streams(), 0);
    }

    #[tokio::test]
    async fn time_after_resume_extends_the_next_report() {
        let h = harness();
        h.controller.start(creds()).await.unwrap();
        h.media.emit_chunk(b"one");
        h.media.emit_chunk(b"two");
        h.media.queue_final_chunk(b"three");
        h.clock.advance(chrono::Duration::seconds(125));
        h.backend
            .queue_end_call(Err(BackendError::Transport("connection reset".into())));
        h.controller.confirm_end().await.unwrap_err();

        h.clock.advance(chrono::Duration::seconds(10));
        assert!(h.media.emit_chunk(b"four"));
        assert_eq!(h.controller.snapshot().await.elapsed_ms, 135_000);

        h.controller.confirm_end().await.unwrap();

        let submissions = h.backend.submissions();
        assert_eq!(submissions[0].duration_seconds, 125);
        assert_eq!(submissions[1].duration_seconds, 135);
        assert_eq!(submissions[1].session_id, submissions[0].session_id);
        let recording = submissions[1].recording.as_ref().unwrap();
        assert_eq!(recording.chunk_count, 4);
        assert_eq!(recording.bytes, b"onetwothreefour");
    }

    #[tokio::test]
    async fn journal_tracks_submission_until_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("journal.sqlite3")).unwrap();
        let h = harness_with(Some(db.clone()));

        h.controller.start(creds()).await.unwrap();
        h.backend
            .queue_end_call(Err(BackendError::Transport("connection reset".into())));
        h.controller.confirm_end().await.unwrap_err();

        let pending = db.get_submission("s-1").await.unwrap().unwrap();
        assert_eq!(pending.state, SubmissionState::Pending);
        assert_eq!(pending.attempts, 1);

        h.controller.confirm_end().await.unwrap();
        let record = db.get_submission("s-1").await.unwrap().unwrap();
        assert_eq!(record.state, SubmissionState::Acknowledged);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn second_end_is_rejected_once_ended() {
        let h = harness();
        h.controller.start(creds()).await.unwrap();
        h.controller.confirm_end().await.unwrap();

        assert!(matches!(
            h.controller.confirm_end().await,
            Err(CallError::InvalidTransition { .. })
        ));
        assert_eq!(h.backend.submissions().len(), 1);
    }

    #[tokio::test]
    async fn room_disconnect_ends_call_with_poor_quality() {
        let h = harness();
        h.controller.start(creds()).await.unwrap();
        h.clock.advance(chrono::Duration::seconds(40));

        assert!(h.sfu.emit(SfuEvent::RoomStateChanged {
            state: RoomState::Disconnected,
            error_code: Some(4001),
        }));

        let ended = wait_for(&h.controller, |s| s.status == CallStatus::Ended).await;
        assert_eq!(ended.final_duration_ms, Some(40_000));

        let submissions = h.backend.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].connection_quality, ConnectionQuality::Poor);
    }

    #[tokio::test]
    async fn reconnect_marks_call_fair() {
        let h = harness();
        h.controller.start(creds()).await.unwrap();

        h.sfu.emit(SfuEvent::RoomStateChanged {
            state: RoomState::Reconnecting,
            error_code: None,
        });
        wait_for(&h.controller, |s| s.room_reconnecting).await;
        h.sfu.emit(SfuEvent::RoomStateChanged {
            state: RoomState::Connected,
            error_code: None,
        });
        let restored = wait_for(&h.controller, |s| !s.room_reconnecting).await;
        assert_eq!(restored.connection_quality, ConnectionQuality::Fair);

        h.controller.confirm_end().await.unwrap();
        assert_eq!(
            h.backend.submissions()[0].connection_quality,
            ConnectionQuality::Fair
        );
    }

    #[tokio::test]
    async fn remote_streams_play_once_and_chat_is_logged() {
        let h = harness();
        h.controller.start(creds()).await.unwrap();

        h.sfu.emit(SfuEvent::RemoteStreamAdded {
            stream_id: "s9".into(),
        });
        h.sfu.emit(SfuEvent::RemoteStreamAdded {
            stream_id: "s9".into(),
        });
        h.sfu.emit(SfuEvent::ParticipantJoined {
            participant_id: "cand".into(),
        });
        h.sfu.emit(SfuEvent::Message {
            from: "cand".into(),
            text: "hi".into(),
            sent_at: t0(),
        });

        let snapshot = wait_for(&h.controller, |s| !s.chat.is_empty()).await;
        assert!(snapshot.remote_connected);
        assert_eq!(
            calls(&h.sfu).iter().filter(|c| *c == "play:s9").count(),
            1
        );

        h.controller.send_message("  hello  ").await.unwrap();
        let chat = h.controller.snapshot().await.chat;
        assert_eq!(chat.len(), 2);
        assert!(chat[1].local);
        assert!(calls(&h.sfu).contains(&"send:r1:hello".to_string()));

        h.controller.teardown().await;
    }

    #[tokio::test]
    async fn teardown_releases_everything_once_and_skips_submission() {
        let h = harness();
        h.controller.start(creds()).await.unwrap();
        h.media.emit_chunk(b"lost");

        h.controller.teardown().await;
        h.controller.teardown().await;

        let log = calls(&h.sfu);
        assert_eq!(log.iter().filter(|c| *c == "destroy").count(), 1);
        assert_eq!(log[log.len() - 2..], ["leave:r1", "destroy"]);
        assert_eq!(h.media.released(), 1);
        assert!(!h.media.is_recording());
        assert!(h.backend.submissions().is_empty());
        assert!(!h.media.emit_chunk(b"late"));
        assert!(h.controller.start(creds()).await.is_err());
    }

    #[tokio::test]
    async fn end_prompt_can_be_dismissed() {
        let h = harness();
        assert!(h.controller.request_end().await.is_err());

        h.controller.start(creds()).await.unwrap();
        assert!(h.controller.request_end().await.unwrap().end_prompt_open);
        assert!(!h.controller.cancel_end().await.end_prompt_open);
        assert_eq!(h.controller.snapshot().await.status, CallStatus::Connected);

        h.controller.teardown().await;
    }

    #[test]
    fn options_follow_call_settings() {
        let settings = CallSettings {
            capture_video: false,
            ..CallSettings::default()
        };
        let options = CallOptions::from_settings(&settings);
        assert_eq!(options.constraints, MediaConstraints::audio_only());
        assert!(options.journal.is_none());
    }

    #[tokio::test]
    async fn open_meeting_picks_endpoint_by_role() {
        let backend = FakeBackend::default();
        assert!(matches!(
            open_meeting(&backend, "i-1", ParticipantRole::Candidate).await,
            Err(CallError::Config(_))
        ));

        backend.set_meeting(MeetingCredentials {
            interview_id: "i-1".into(),
            room_id: "r1".into(),
            token: "t1".into(),
            participant_id: "p1".into(),
            app: AppCredential {
                app_id: "app".into(),
                server: None,
            },
            scheduled_at: None,
        });
        let meeting = open_meeting(&backend, "i-1", ParticipantRole::Interviewer)
            .await
            .unwrap();

        assert_eq!(JoinCredentials::from(&meeting), creds());
        assert_eq!(backend.meeting_requests(), ["join:i-1", "start:i-1"]);

        let controller = CallController::for_meeting(
            &meeting,
            ParticipantRole::Interviewer,
            Box::new(FakeMedia::default()),
            Box::new(FakeSfu::default()),
            Arc::new(backend),
            CallOptions::default(),
        );
        assert!(Uuid::parse_str(controller.session_id()).is_ok());
        let snapshot = controller.start((&meeting).into()).await.unwrap();
        assert_eq!(snapshot.interview_id, "i-1");
        assert_eq!(snapshot.status, CallStatus::Connected);
        controller.teardown().await;
    }
}
