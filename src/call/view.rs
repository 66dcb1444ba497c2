use serde::Serialize;

use super::state::{CallSnapshot, CallStatus, ChatMessage, ParticipantRole};

const END_PROMPT: &str = "End the interview for everyone? The recording will be uploaded.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatLine {
    pub from: String,
    pub text: String,
    pub time: String,
    pub mine: bool,
}

impl From<&ChatMessage> for ChatLine {
    fn from(message: &ChatMessage) -> Self {
        Self {
            from: if message.local {
                "You".to_string()
            } else {
                message.from.clone()
            },
            text: message.text.clone(),
            time: message.sent_at.format("%H:%M").to_string(),
            mine: message.local,
        }
    }
}

/// What the interview screen shows for a snapshot. Pure projection, no state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallView {
    pub status_label: String,
    pub timer: String,
    pub remote_label: String,
    pub remote_connected: bool,
    pub can_end: bool,
    pub can_retry: bool,
    pub can_close: bool,
    pub busy: bool,
    pub end_prompt: Option<String>,
    pub notice: Option<String>,
    pub chat: Vec<ChatLine>,
}

impl CallView {
    pub fn from_snapshot(snapshot: &CallSnapshot) -> Self {
        let remote = match snapshot.role {
            ParticipantRole::Interviewer => "Candidate",
            ParticipantRole::Candidate => "Interviewer",
        };

        let status_label = match snapshot.status {
            CallStatus::Idle => "Ready to join".to_string(),
            CallStatus::Connecting => "Connecting...".to_string(),
            CallStatus::Connected if snapshot.room_reconnecting => "Reconnecting...".to_string(),
            CallStatus::Connected if !snapshot.remote_connected => {
                format!("Waiting for the {}", remote.to_lowercase())
            }
            CallStatus::Connected => "In call".to_string(),
            CallStatus::Ending => "Ending call and saving the recording...".to_string(),
            CallStatus::Ended => "Call ended".to_string(),
            CallStatus::Error => "Call failed".to_string(),
        };

        let remote_label = if snapshot.remote_connected {
            format!("{remote} connected")
        } else {
            format!("{remote} not connected")
        };

        let can_end = snapshot.status == CallStatus::Connected && !snapshot.submit_in_flight;
        let can_retry = snapshot.status == CallStatus::Error
            && snapshot.error_cause.is_some_and(|cause| cause.is_retryable());

        Self {
            status_label,
            timer: format_elapsed(snapshot.elapsed_ms),
            remote_label,
            remote_connected: snapshot.remote_connected,
            can_end,
            can_retry,
            can_close: !snapshot.submit_in_flight,
            busy: matches!(snapshot.status, CallStatus::Connecting | CallStatus::Ending),
            end_prompt: (snapshot.end_prompt_open && can_end).then(|| END_PROMPT.to_string()),
            notice: snapshot.notice.clone(),
            chat: snapshot.chat.iter().map(ChatLine::from).collect(),
        }
    }
}

/// `MM:SS`, or `H:MM:SS` past the hour.
pub fn format_elapsed(elapsed_ms: u64) -> String {
    let total = elapsed_ms / 1000;
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}
