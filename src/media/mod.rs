//! Local media capture: device access and time-sliced recording.

#[cfg(feature = "native-capture")]
pub mod native;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recording::{ChunkSink, RecordingFormat};

pub const DEFAULT_SLICE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::audio_video()
    }
}

/// An acquired set of local tracks. Must be handed back to [`MediaCapture::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStreamHandle {
    pub id: u64,
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderHandle {
    pub id: u64,
    pub stream_id: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("no capture device available: {0}")]
    DeviceUnavailable(String),
    #[error("recorder already active for stream {0}")]
    RecorderBusy(u64),
    #[error("recorder failed: {0}")]
    Recorder(String),
}

/// Microphone/camera access and local recording for one call session.
///
/// `stop` must push the buffered remainder into the sink before it returns,
/// and `release` must tolerate being called for a stream that is already
/// released.
#[async_trait]
pub trait MediaCapture: Send {
    async fn request_access(
        &mut self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStreamHandle, MediaError>;

    fn start_recording(
        &mut self,
        stream: &MediaStreamHandle,
        sink: ChunkSink,
    ) -> Result<RecorderHandle, MediaError>;

    async fn stop(&mut self, recorder: RecorderHandle) -> Result<(), MediaError>;

    fn release(&mut self, stream: &MediaStreamHandle);

    fn recording_format(&self) -> RecordingFormat;
}
