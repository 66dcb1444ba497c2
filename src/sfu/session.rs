use std::collections::HashSet;

use log::{debug, warn};
use tokio::sync::mpsc;

use super::{AppCredential, SfuClient, SfuError, SfuEvent};
use crate::media::MediaStreamHandle;

/// One SFU client per call session, disposed together with it.
///
/// Tracks what has been acquired so that `release` can run from any exit path
/// any number of times: leave the room if joined, then destroy once.
pub struct SfuSession {
    client: Box<dyn SfuClient>,
    initialised: bool,
    joined_room: Option<String>,
    published_stream: Option<u64>,
    playing: HashSet<String>,
    destroyed: bool,
}

impl SfuSession {
    pub fn new(client: Box<dyn SfuClient>) -> Self {
        Self {
            client,
            initialised: false,
            joined_room: None,
            published_stream: None,
            playing: HashSet::new(),
            destroyed: false,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.joined_room.is_some()
    }

    pub fn joined_room(&self) -> Option<&str> {
        self.joined_room.as_deref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn subscribe(&mut self, events: mpsc::UnboundedSender<SfuEvent>) {
        self.client.subscribe_to_remote(events);
    }

    pub async fn init(&mut self, credential: &AppCredential) -> Result<(), SfuError> {
        if self.destroyed {
            return Err(SfuError::Destroyed);
        }
        if self.initialised {
            return Ok(());
        }
        self.client.init(credential).await?;
        self.initialised = true;
        Ok(())
    }

    pub async fn join(
        &mut self,
        room_id: &str,
        token: &str,
        participant_id: &str,
    ) -> Result<(), SfuError> {
        if self.destroyed {
            return Err(SfuError::Destroyed);
        }
        if !self.initialised {
            return Err(SfuError::NotInitialised);
        }
        if self.joined_room.as_deref() == Some(room_id) {
            return Ok(());
        }
        self.leave().await;

        self.client.join_room(room_id, token, participant_id).await?;
        self.joined_room = Some(room_id.to_string());
        Ok(())
    }

    pub async fn publish(&mut self, stream: &MediaStreamHandle) -> Result<(), SfuError> {
        if self.joined_room.is_none() {
            return Err(SfuError::PublishFailed("not in a room".into()));
        }
        self.client.publish(stream).await?;
        self.published_stream = Some(stream.id);
        Ok(())
    }

    pub async fn play_remote(&mut self, stream_id: &str) -> Result<(), SfuError> {
        if !self.playing.insert(stream_id.to_string()) {
            return Ok(());
        }
        if let Err(err) = self.client.play_remote(stream_id).await {
            self.playing.remove(stream_id);
            return Err(err);
        }
        Ok(())
    }

    pub async fn stop_remote(&mut self, stream_id: &str) -> Result<(), SfuError> {
        if !self.playing.remove(stream_id) {
            return Ok(());
        }
        self.client.stop_remote(stream_id).await
    }

    pub async fn send_message(&mut self, text: &str) -> Result<(), SfuError> {
        let Some(room_id) = self.joined_room.clone() else {
            return Err(SfuError::Request("not in a room".into()));
        };
        self.client.send_message(&room_id, text).await
    }

    /// Leaves the current room. No-op when not joined.
    pub async fn leave(&mut self) {
        let Some(room_id) = self.joined_room.take() else {
            return;
        };
        self.published_stream = None;
        self.playing.clear();
        if let Err(err) = self.client.leave_room(&room_id).await {
            warn!("leaving room {room_id} failed: {err}");
        }
    }

    /// Leaves the room and destroys the client. Safe to call repeatedly.
    pub async fn release(&mut self) {
        self.leave().await;
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.client.destroy().await;
        debug!("sfu client destroyed");
    }
}

impl Drop for SfuSession {
    fn drop(&mut self) {
        if let Some(room_id) = self.joined_room.as_deref() {
            warn!("sfu session dropped while still in room {room_id}; remote seat may leak");
        }
    }
}
