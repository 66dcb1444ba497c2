//! Vendor-neutral SFU client surface.
//!
//! A vendor SDK binding implements [`SfuClient`]; the call controller only ever
//! talks to it through a per-call [`SfuSession`].

pub mod session;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::MediaStreamHandle;

pub use session::SfuSession;

/// Application credential for the SFU vendor, issued by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppCredential {
    pub app_id: String,
    #[serde(default)]
    pub server: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySample {
    pub stream_id: Option<String>,
    pub rtt_ms: Option<u32>,
    pub packet_loss: Option<f32>,
    pub level: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SfuEvent {
    RoomStateChanged {
        state: RoomState,
        error_code: Option<i32>,
    },
    ParticipantJoined {
        participant_id: String,
    },
    ParticipantLeft {
        participant_id: String,
    },
    RemoteStreamAdded {
        stream_id: String,
    },
    RemoteStreamRemoved {
        stream_id: String,
    },
    Message {
        from: String,
        text: String,
        sent_at: DateTime<Utc>,
    },
    Quality(QualitySample),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SfuError {
    #[error("sfu client is not initialised")]
    NotInitialised,
    #[error("sfu client was destroyed")]
    Destroyed,
    #[error("failed to join room {room_id}: {reason}")]
    JoinFailed { room_id: String, reason: String },
    #[error("failed to publish local stream: {0}")]
    PublishFailed(String),
    #[error("sfu request failed: {0}")]
    Request(String),
}

/// Capability set of the SFU vendor SDK.
///
/// `leave_room` must run before `destroy`, otherwise the vendor keeps the
/// remote seat allocated. [`SfuSession`] enforces that ordering.
#[async_trait]
pub trait SfuClient: Send {
    async fn init(&mut self, credential: &AppCredential) -> Result<(), SfuError>;

    async fn join_room(
        &mut self,
        room_id: &str,
        token: &str,
        participant_id: &str,
    ) -> Result<(), SfuError>;

    async fn publish(&mut self, stream: &MediaStreamHandle) -> Result<(), SfuError>;

    fn subscribe_to_remote(&mut self, events: mpsc::UnboundedSender<SfuEvent>);

    async fn play_remote(&mut self, stream_id: &str) -> Result<(), SfuError>;

    async fn stop_remote(&mut self, stream_id: &str) -> Result<(), SfuError>;

    async fn send_message(&mut self, room_id: &str, text: &str) -> Result<(), SfuError>;

    async fn leave_room(&mut self, room_id: &str) -> Result<(), SfuError>;

    async fn destroy(&mut self);
}
