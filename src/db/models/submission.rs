//! Journal rows for end-call submissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    backend::{ConnectionQuality, EndCallSubmission},
    recording::RecordingArtifact,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SubmissionState {
    /// Local cleanup is done; the backend has not acknowledged yet.
    Pending,
    Acknowledged,
    /// Gave up after too many attempts. Kept for manual inspection.
    Abandoned,
}

impl SubmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionState::Pending => "Pending",
            SubmissionState::Acknowledged => "Acknowledged",
            SubmissionState::Abandoned => "Abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub session_id: String,
    pub interview_id: String,
    pub duration_seconds: u64,
    pub connection_quality: ConnectionQuality,
    pub recording: Option<RecordingArtifact>,
    pub state: SubmissionState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub recording_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubmissionRecord {
    pub fn to_submission(&self) -> EndCallSubmission {
        EndCallSubmission {
            session_id: self.session_id.clone(),
            interview_id: self.interview_id.clone(),
            duration_seconds: self.duration_seconds,
            connection_quality: self.connection_quality,
            recording: self.recording.clone(),
        }
    }
}
