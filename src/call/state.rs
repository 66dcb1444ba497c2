use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{CallError, ErrorCause};
use crate::{
    backend::{ConnectionQuality, EndCallSubmission, MeetingCredentials},
    call_warn,
    recording::{RecordingBuffer, RecordingFormat},
};

const ENABLE_LOGS: bool = true;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ParticipantRole {
    Interviewer,
    Candidate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CallStatus {
    Idle,
    Connecting,
    Connected,
    Ending,
    Ended,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Ending => "ending",
            CallStatus::Ended => "ended",
            CallStatus::Error => "error",
        }
    }
}

impl Default for CallStatus {
    fn default() -> Self {
        CallStatus::Idle
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Room credentials issued by the backend for one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCredentials {
    pub room_id: String,
    pub token: String,
    pub participant_id: String,
}

impl JoinCredentials {
    pub fn new(
        room_id: impl Into<String>,
        token: impl Into<String>,
        participant_id: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            token: token.into(),
            participant_id: participant_id.into(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        let missing: Vec<&str> = [
            ("room id", &self.room_id),
            ("token", &self.token),
            ("participant id", &self.participant_id),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing {}", missing.join(", ")))
        }
    }
}

impl From<&MeetingCredentials> for JoinCredentials {
    fn from(meeting: &MeetingCredentials) -> Self {
        Self::new(&meeting.room_id, &meeting.token, &meeting.participant_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub from: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    pub local: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Start(JoinCredentials),
    RoomJoined,
    MediaReady,
    MediaDenied(String),
    JoinFailed(String),
    PublishFailed(String),
    Retry,
    Tick,
    RemoteJoined(String),
    RemoteLeft(String),
    RoomReconnecting,
    RoomRestored,
    ChatReceived(ChatMessage),
    EndRequested,
    FatalAdapterError(String),
    SubmissionAcknowledged,
    SubmissionFailed(String),
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::Start(_) => "start",
            CallEvent::RoomJoined => "room_joined",
            CallEvent::MediaReady => "media_ready",
            CallEvent::MediaDenied(_) => "media_denied",
            CallEvent::JoinFailed(_) => "join_failed",
            CallEvent::PublishFailed(_) => "publish_failed",
            CallEvent::Retry => "retry",
            CallEvent::Tick => "tick",
            CallEvent::RemoteJoined(_) => "remote_joined",
            CallEvent::RemoteLeft(_) => "remote_left",
            CallEvent::RoomReconnecting => "room_reconnecting",
            CallEvent::RoomRestored => "room_restored",
            CallEvent::ChatReceived(_) => "chat_received",
            CallEvent::EndRequested => "end_requested",
            CallEvent::FatalAdapterError(_) => "fatal_adapter_error",
            CallEvent::SubmissionAcknowledged => "submission_acknowledged",
            CallEvent::SubmissionFailed(_) => "submission_failed",
        }
    }
}

/// Side effects requested by a transition, executed in order by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Connect(JoinCredentials),
    Publish,
    StartTimer,
    StartRecording,
    StopTimer,
    StopRecording,
    ReleaseMedia,
    LeaveRoom,
    Submit(EndCallSubmission),
    ReacquireMedia,
    Dispose,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub session_id: String,
    pub interview_id: String,
    pub role: ParticipantRole,
    pub status: CallStatus,
    pub error_cause: Option<ErrorCause>,
    pub started_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub final_duration_ms: Option<u64>,
    pub remote_connected: bool,
    pub room_reconnecting: bool,
    pub chunk_count: usize,
    pub connection_quality: ConnectionQuality,
    pub submit_in_flight: bool,
    pub submit_failures: u32,
    pub notice: Option<String>,
    pub chat: Vec<ChatMessage>,
    pub end_prompt_open: bool,
}

/// One interview call from first connect to the acknowledged end-call upload.
///
/// All state changes go through [`CallSession::dispatch`]. Elapsed time is
/// `elapsed_baseline_ms + (now - anchor)` while connected; the baseline only
/// becomes non-zero when a failed submission returns the call to `connected`.
#[derive(Debug)]
pub struct CallSession {
    session_id: String,
    interview_id: String,
    role: ParticipantRole,
    scheduled_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    status: CallStatus,
    history: Vec<CallStatus>,
    credentials: Option<JoinCredentials>,
    error_cause: Option<ErrorCause>,
    room_joined: bool,
    media_ready: bool,
    remote_participants: BTreeSet<String>,
    room_reconnecting: bool,
    degraded: bool,
    fatal_end: bool,
    elapsed_baseline_ms: u64,
    anchor: Option<DateTime<Utc>>,
    final_duration_ms: Option<u64>,
    submit_in_flight: bool,
    submit_failures: u32,
    recording: RecordingBuffer,
    format: RecordingFormat,
    chat: Vec<ChatMessage>,
    notice: Option<String>,
}

impl CallSession {
    pub fn new(
        session_id: impl Into<String>,
        interview_id: impl Into<String>,
        role: ParticipantRole,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            interview_id: interview_id.into(),
            role,
            scheduled_at,
            started_at: None,
            status: CallStatus::Idle,
            history: vec![CallStatus::Idle],
            credentials: None,
            error_cause: None,
            room_joined: false,
            media_ready: false,
            remote_participants: BTreeSet::new(),
            room_reconnecting: false,
            degraded: false,
            fatal_end: false,
            elapsed_baseline_ms: 0,
            anchor: None,
            final_duration_ms: None,
            submit_in_flight: false,
            submit_failures: 0,
            recording: RecordingBuffer::new(),
            format: RecordingFormat::default(),
            chat: Vec::new(),
            notice: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn history(&self) -> &[CallStatus] {
        &self.history
    }

    pub fn error_cause(&self) -> Option<ErrorCause> {
        self.error_cause
    }

    pub fn credentials(&self) -> Option<&JoinCredentials> {
        self.credentials.as_ref()
    }

    pub fn recording(&self) -> &RecordingBuffer {
        &self.recording
    }

    pub fn set_recording_format(&mut self, format: RecordingFormat) {
        self.format = format;
    }

    pub fn final_duration_ms(&self) -> Option<u64> {
        self.final_duration_ms
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn set_notice(&mut self, notice: impl Into<String>) {
        self.notice = Some(notice.into());
    }

    pub fn record_outgoing_chat(&mut self, text: String, now: DateTime<Utc>) {
        let from = self
            .credentials
            .as_ref()
            .map(|c| c.participant_id.clone())
            .unwrap_or_default();
        self.chat.push(ChatMessage {
            from,
            text,
            sent_at: now,
            local: true,
        });
    }

    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        match (self.status, self.anchor) {
            (CallStatus::Connected, Some(anchor)) => {
                let running = (now - anchor).num_milliseconds().max(0) as u64;
                self.elapsed_baseline_ms.saturating_add(running)
            }
            _ => self.final_duration_ms.unwrap_or(self.elapsed_baseline_ms),
        }
    }

    /// Three-bucket heuristic kept for backend compatibility.
    pub fn connection_quality(&self) -> ConnectionQuality {
        if self.fatal_end {
            ConnectionQuality::Poor
        } else if self.degraded {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Good
        }
    }

    /// Whether an end-call may begin now.
    pub fn ensure_can_end(&self) -> Result<(), CallError> {
        if self.status != CallStatus::Connected || self.submit_in_flight {
            return Err(CallError::InvalidTransition {
                from: self.status,
                event: CallEvent::EndRequested.name(),
            });
        }
        Ok(())
    }

    pub fn snapshot(&self, now: DateTime<Utc>, end_prompt_open: bool) -> CallSnapshot {
        CallSnapshot {
            session_id: self.session_id.clone(),
            interview_id: self.interview_id.clone(),
            role: self.role,
            status: self.status,
            error_cause: self.error_cause,
            started_at: self.started_at,
            scheduled_at: self.scheduled_at,
            elapsed_ms: self.elapsed_ms(now),
            final_duration_ms: self.final_duration_ms,
            remote_connected: !self.remote_participants.is_empty(),
            room_reconnecting: self.room_reconnecting,
            chunk_count: self.recording.chunk_count(),
            connection_quality: self.connection_quality(),
            submit_in_flight: self.submit_in_flight,
            submit_failures: self.submit_failures,
            notice: self.notice.clone(),
            chat: self.chat.clone(),
            end_prompt_open,
        }
    }

    pub fn dispatch(
        &mut self,
        event: CallEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, CallError> {
        use CallStatus as S;

        let effects = match (self.status, event) {
            (S::Idle, CallEvent::Start(credentials)) => match credentials.validate() {
                Err(reason) => self.fail(ErrorCause::InvalidConfig, &reason),
                Ok(()) => {
                    self.credentials = Some(credentials.clone());
                    self.enter(S::Connecting);
                    vec![Effect::Connect(credentials)]
                }
            },
            (S::Connecting, CallEvent::RoomJoined) => {
                self.room_joined = true;
                self.try_connect(now)
            }
            (S::Connecting, CallEvent::MediaReady) => {
                self.media_ready = true;
                self.try_connect(now)
            }
            (S::Connecting, CallEvent::MediaDenied(reason)) => {
                self.fail(ErrorCause::MediaDenied, &reason)
            }
            (S::Connecting, CallEvent::JoinFailed(reason)) => {
                self.fail(ErrorCause::JoinFailed, &reason)
            }
            (S::Connected, CallEvent::PublishFailed(reason)) => {
                self.fail(ErrorCause::PublishFailed, &reason)
            }
            (S::Error, CallEvent::Retry) => self.retry()?,
            (S::Connected, CallEvent::Tick) => Vec::new(),
            (S::Connecting | S::Connected | S::Ending, CallEvent::RemoteJoined(participant)) => {
                self.remote_participants.insert(participant);
                Vec::new()
            }
            (S::Connecting | S::Connected | S::Ending, CallEvent::RemoteLeft(participant)) => {
                self.remote_participants.remove(&participant);
                Vec::new()
            }
            (S::Connected, CallEvent::RoomReconnecting) => {
                self.room_reconnecting = true;
                self.degraded = true;
                self.notice = Some("Connection unstable, reconnecting...".into());
                Vec::new()
            }
            (S::Connected, CallEvent::RoomRestored) => {
                if self.room_reconnecting {
                    self.room_reconnecting = false;
                    self.notice = None;
                }
                Vec::new()
            }
            (S::Connecting | S::Connected | S::Ending, CallEvent::ChatReceived(message)) => {
                self.chat.push(message);
                Vec::new()
            }
            (S::Connected, CallEvent::EndRequested) if !self.submit_in_flight => {
                self.begin_ending(now)
            }
            (S::Connected, CallEvent::FatalAdapterError(reason)) if !self.submit_in_flight => {
                self.fatal_end = true;
                self.notice = Some(format!("The call was interrupted ({reason}). Saving what was recorded."));
                self.begin_ending(now)
            }
            (S::Ending, CallEvent::SubmissionAcknowledged) => {
                self.submit_in_flight = false;
                self.notice = None;
                self.enter(S::Ended);
                vec![Effect::Dispose]
            }
            (S::Ending, CallEvent::SubmissionFailed(message)) => self.resume_after_failed_submit(now, message),
            (from, event) => {
                return Err(CallError::InvalidTransition {
                    from,
                    event: event.name(),
                })
            }
        };

        Ok(effects)
    }

    fn enter(&mut self, status: CallStatus) {
        self.status = status;
        self.history.push(status);
    }

    fn try_connect(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        if !(self.room_joined && self.media_ready) {
            return Vec::new();
        }

        self.started_at = Some(now);
        self.anchor = Some(now);
        self.elapsed_baseline_ms = 0;
        self.final_duration_ms = None;
        self.notice = None;
        self.recording.open();
        self.enter(CallStatus::Connected);
        vec![Effect::Publish, Effect::StartTimer, Effect::StartRecording]
    }

    fn fail(&mut self, cause: ErrorCause, reason: &str) -> Vec<Effect> {
        let had_resources = self.status != CallStatus::Idle;

        self.error_cause = Some(cause);
        self.degraded = true;
        self.room_joined = false;
        self.media_ready = false;
        self.room_reconnecting = false;
        self.anchor = None;
        self.recording.seal();
        self.notice = Some(cause.user_message().to_string());
        self.enter(CallStatus::Error);
        call_warn!(self.session_id, "entered error ({}): {reason}", cause.as_str());

        if had_resources {
            vec![
                Effect::StopTimer,
                Effect::StopRecording,
                Effect::ReleaseMedia,
                Effect::LeaveRoom,
            ]
        } else {
            Vec::new()
        }
    }

    fn retry(&mut self) -> Result<Vec<Effect>, CallError> {
        let cause = self.error_cause.unwrap_or(ErrorCause::InvalidConfig);
        if !cause.is_retryable() {
            return Err(CallError::Config(
                "credentials are invalid; reopen the interview from a fresh invite".into(),
            ));
        }
        let Some(credentials) = self.credentials.clone() else {
            return Err(CallError::Config("no credentials to retry with".into()));
        };

        self.error_cause = None;
        self.notice = None;
        self.enter(CallStatus::Connecting);
        Ok(vec![Effect::Connect(credentials)])
    }

    fn begin_ending(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        let final_ms = self.elapsed_ms(now);

        self.final_duration_ms = Some(final_ms);
        self.elapsed_baseline_ms = final_ms;
        self.anchor = None;
        self.room_reconnecting = false;
        self.recording.seal();
        self.submit_in_flight = true;
        self.enter(CallStatus::Ending);

        let submission = EndCallSubmission {
            session_id: self.session_id.clone(),
            interview_id: self.interview_id.clone(),
            duration_seconds: final_ms / 1000,
            connection_quality: self.connection_quality(),
            recording: self.recording.finalize(&self.format),
        };

        vec![
            Effect::StopTimer,
            Effect::ReleaseMedia,
            Effect::Submit(submission),
        ]
    }

    fn resume_after_failed_submit(&mut self, now: DateTime<Utc>, message: String) -> Vec<Effect> {
        self.submit_in_flight = false;
        self.submit_failures += 1;
        // continue from the frozen duration, not from zero
        self.elapsed_baseline_ms = self.final_duration_ms.take().unwrap_or(self.elapsed_baseline_ms);
        self.anchor = Some(now);
        self.recording.open();
        self.notice = Some(message);
        self.enter(CallStatus::Connected);
        vec![Effect::StartTimer, Effect::ReacquireMedia]
    }
}
