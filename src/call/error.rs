use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::CallStatus;

/// Why a session sits in the `error` state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    InvalidConfig,
    MediaDenied,
    JoinFailed,
    PublishFailed,
}

impl ErrorCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCause::InvalidConfig => "invalid_config",
            ErrorCause::MediaDenied => "media_denied",
            ErrorCause::JoinFailed => "join_failed",
            ErrorCause::PublishFailed => "publish_failed",
        }
    }

    /// Invalid credentials need a fresh invite; everything else can re-enter `connecting`.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCause::InvalidConfig)
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCause::InvalidConfig => {
                "This interview link is invalid or has expired. Please reopen it from your invitation."
            }
            ErrorCause::MediaDenied => {
                "Camera or microphone access was blocked. Allow access and try again."
            }
            ErrorCause::JoinFailed => "Could not connect to the interview room. Please try again.",
            ErrorCause::PublishFailed => {
                "Your audio and video could not be shared with the room. Please try again."
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("invalid call configuration: {0}")]
    Config(String),
    #[error("media permission error: {0}")]
    Permission(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("end-call submission failed: {0}")]
    Submission(String),
    #[error("cannot handle {event} while {from}")]
    InvalidTransition {
        from: CallStatus,
        event: &'static str,
    },
}

impl CallError {
    pub fn from_cause(cause: ErrorCause, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match cause {
            ErrorCause::InvalidConfig => CallError::Config(detail),
            ErrorCause::MediaDenied => CallError::Permission(detail),
            ErrorCause::JoinFailed | ErrorCause::PublishFailed => CallError::Connection(detail),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::Permission(_) | CallError::Connection(_) | CallError::Submission(_)
        )
    }

    /// Short text for the interview surface. Submission errors already carry
    /// a reduced backend message.
    pub fn user_message(&self) -> String {
        match self {
            CallError::Config(_) => ErrorCause::InvalidConfig.user_message().to_string(),
            CallError::Permission(_) => ErrorCause::MediaDenied.user_message().to_string(),
            CallError::Connection(_) => ErrorCause::JoinFailed.user_message().to_string(),
            CallError::Submission(message) => {
                format!("The call could not be ended: {message} You can try ending it again.")
            }
            CallError::InvalidTransition { .. } => "That action isn't available right now.".into(),
        }
    }
}
