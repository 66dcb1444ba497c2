//! Hiring-platform REST backend, as seen from the interview client.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    pipeline::PipelineProgress,
    recording::RecordingArtifact,
    sfu::AppCredential,
};

pub use http::HttpBackend;

pub const DEFAULT_FAILURE_MESSAGE: &str = "Something went wrong. Please try again.";
const UNREACHABLE_MESSAGE: &str = "Could not reach the server. Check your connection and try again.";
const MAX_FRIENDLY_LEN: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Good,
    Fair,
    Poor,
}

impl ConnectionQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionQuality::Good => "good",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Poor => "poor",
        }
    }
}

impl std::str::FromStr for ConnectionQuality {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "good" => Ok(ConnectionQuality::Good),
            "fair" => Ok(ConnectionQuality::Fair),
            "poor" => Ok(ConnectionQuality::Poor),
            other => Err(format!("unknown connection quality '{other}'")),
        }
    }
}

/// Everything needed to join the SFU room of one interview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingCredentials {
    pub interview_id: String,
    pub room_id: String,
    pub token: String,
    pub participant_id: String,
    pub app: AppCredential,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterviewKind {
    Video,
    Telephonic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub application_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub kind: InterviewKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledInterview {
    pub interview_id: String,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub meeting_url: Option<String>,
}

/// Final report of a call. `session_id` is the idempotency key: retries of the
/// same call always carry the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndCallSubmission {
    pub session_id: String,
    pub interview_id: String,
    pub duration_seconds: u64,
    pub connection_quality: ConnectionQuality,
    pub recording: Option<RecordingArtifact>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndCallReceipt {
    #[serde(default)]
    pub call_session_id: Option<String>,
    #[serde(default)]
    pub recording_url: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Transport(_) => true,
            BackendError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            BackendError::InvalidRequest(_) | BackendError::InvalidResponse(_) => false,
        }
    }

    /// Short text that can be shown to the user as is.
    pub fn user_message(&self) -> String {
        match self {
            BackendError::Transport(_) => UNREACHABLE_MESSAGE.to_string(),
            BackendError::Status { message, .. } => {
                if is_presentable(message) {
                    message.trim().to_string()
                } else {
                    DEFAULT_FAILURE_MESSAGE.to_string()
                }
            }
            BackendError::InvalidRequest(_) | BackendError::InvalidResponse(_) => {
                DEFAULT_FAILURE_MESSAGE.to_string()
            }
        }
    }
}

/// Pulls a human readable message out of an error body.
///
/// Looks at `message`, `error` and `detail` (string or first string of an
/// array). Returns `None` when nothing presentable is found.
pub fn friendly_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["message", "error", "detail"]
        .iter()
        .filter_map(|key| match value.get(*key)? {
            serde_json::Value::String(text) => Some(text.clone()),
            serde_json::Value::Array(items) => items
                .iter()
                .find_map(|item| item.as_str().map(str::to_string)),
            _ => None,
        })
        .map(|text| text.trim().to_string())
        .find(|text| is_presentable(text))
}

fn is_presentable(text: &str) -> bool {
    let text = text.trim();
    !text.is_empty()
        && text.len() <= MAX_FRIENDLY_LEN
        && !text.contains('<')
        && !text.contains("Traceback")
        && !text.contains('\n')
}

#[async_trait]
pub trait InterviewBackend: Send + Sync {
    async fn start_meeting(&self, interview_id: &str) -> Result<MeetingCredentials, BackendError>;

    async fn join_meeting(&self, interview_id: &str) -> Result<MeetingCredentials, BackendError>;

    async fn schedule_interview(
        &self,
        request: &ScheduleRequest,
    ) -> Result<ScheduledInterview, BackendError>;

    async fn end_call(&self, submission: &EndCallSubmission)
        -> Result<EndCallReceipt, BackendError>;

    async fn fetch_pipeline(&self, application_id: &str)
        -> Result<PipelineProgress, BackendError>;
}
