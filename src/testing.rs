//! In-memory adapters shared by the unit tests.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;

use crate::{
    backend::{
        BackendError, EndCallReceipt, EndCallSubmission, InterviewBackend, MeetingCredentials,
        ScheduleRequest, ScheduledInterview,
    },
    call::Clock,
    media::{MediaCapture, MediaConstraints, MediaError, MediaStreamHandle, RecorderHandle},
    pipeline::PipelineProgress,
    recording::{ChunkSink, RecordingFormat},
    sfu::{AppCredential, SfuClient, SfuError, SfuEvent},
};

#[derive(Clone, Default)]
pub struct FakeSfu {
    calls: Arc<Mutex<Vec<String>>>,
    events: Arc<Mutex<Option<mpsc::UnboundedSender<SfuEvent>>>>,
    join_error: Arc<Mutex<Option<SfuError>>>,
    publish_error: Arc<Mutex<Option<SfuError>>>,
}

impl FakeSfu {
    pub fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        self.calls.clone()
    }

    pub fn fail_next_join(&self, reason: &str) {
        *self.join_error.lock().unwrap() = Some(SfuError::JoinFailed {
            room_id: "r1".into(),
            reason: reason.into(),
        });
    }

    pub fn fail_next_publish(&self, reason: &str) {
        *self.publish_error.lock().unwrap() = Some(SfuError::PublishFailed(reason.into()));
    }

    /// Delivers an event as if the vendor SDK raised it.
    pub fn emit(&self, event: SfuEvent) -> bool {
        match self.events.lock().unwrap().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn log(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl SfuClient for FakeSfu {
    async fn init(&mut self, _credential: &AppCredential) -> Result<(), SfuError> {
        self.log("init".into());
        Ok(())
    }

    async fn join_room(
        &mut self,
        room_id: &str,
        _token: &str,
        _participant_id: &str,
    ) -> Result<(), SfuError> {
        if let Some(err) = self.join_error.lock().unwrap().take() {
            self.log(format!("join_failed:{room_id}"));
            return Err(err);
        }
        self.log(format!("join:{room_id}"));
        Ok(())
    }

    async fn publish(&mut self, stream: &MediaStreamHandle) -> Result<(), SfuError> {
        if let Some(err) = self.publish_error.lock().unwrap().take() {
            self.log(format!("publish_failed:{}", stream.id));
            return Err(err);
        }
        self.log(format!("publish:{}", stream.id));
        Ok(())
    }

    fn subscribe_to_remote(&mut self, events: mpsc::UnboundedSender<SfuEvent>) {
        *self.events.lock().unwrap() = Some(events);
    }

    async fn play_remote(&mut self, stream_id: &str) -> Result<(), SfuError> {
        self.log(format!("play:{stream_id}"));
        Ok(())
    }

    async fn stop_remote(&mut self, stream_id: &str) -> Result<(), SfuError> {
        self.log(format!("stop:{stream_id}"));
        Ok(())
    }

    async fn send_message(&mut self, room_id: &str, text: &str) -> Result<(), SfuError> {
        self.log(format!("send:{room_id}:{text}"));
        Ok(())
    }

    async fn leave_room(&mut self, room_id: &str) -> Result<(), SfuError> {
        self.log(format!("leave:{room_id}"));
        Ok(())
    }

    async fn destroy(&mut self) {
        self.log("destroy".into());
    }
}

#[derive(Default)]
struct MediaState {
    deny: Option<String>,
    next_id: u64,
    live_streams: HashSet<u64>,
    sink: Option<ChunkSink>,
    recorder: Option<u64>,
    final_chunks: Vec<Vec<u8>>,
    acquired: u32,
    released: u32,
    device_format: Option<RecordingFormat>,
    opened_format: Option<RecordingFormat>,
}

#[derive(Clone, Default)]
pub struct FakeMedia {
    state: Arc<Mutex<MediaState>>,
}

impl FakeMedia {
    pub fn deny_next(&self, reason: &str) {
        self.state.lock().unwrap().deny = Some(reason.into());
    }

    /// Pushes a chunk through the active recorder's sink.
    pub fn emit_chunk(&self, chunk: &[u8]) -> bool {
        let state = self.state.lock().unwrap();
        match state.sink.as_ref() {
            Some(sink) => sink.push(chunk.to_vec()),
            None => false,
        }
    }

    /// Format reported once a stream has been opened, like a device that
    /// only knows its sample rate after access.
    pub fn format_on_access(&self, format: RecordingFormat) {
        self.state.lock().unwrap().device_format = Some(format);
    }

    /// Chunk flushed by the next `stop`.
    pub fn queue_final_chunk(&self, chunk: &[u8]) {
        self.state.lock().unwrap().final_chunks.push(chunk.to_vec());
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().unwrap().recorder.is_some()
    }

    pub fn acquired(&self) -> u32 {
        self.state.lock().unwrap().acquired
    }

    pub fn released(&self) -> u32 {
        self.state.lock().unwrap().released
    }

    pub fn live_streams(&self) -> usize {
        self.state.lock().unwrap().live_streams.len()
    }
}

#[async_trait]
impl MediaCapture for FakeMedia {
    async fn request_access(
        &mut self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStreamHandle, MediaError> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.deny.take() {
            return Err(MediaError::PermissionDenied(reason));
        }
        state.next_id += 1;
        state.acquired += 1;
        let id = state.next_id;
        state.live_streams.insert(id);
        if let Some(format) = state.device_format.clone() {
            state.opened_format = Some(format);
        }
        Ok(MediaStreamHandle {
            id,
            audio: constraints.audio,
            video: constraints.video,
        })
    }

    fn start_recording(
        &mut self,
        stream: &MediaStreamHandle,
        sink: ChunkSink,
    ) -> Result<RecorderHandle, MediaError> {
        let mut state = self.state.lock().unwrap();
        if state.recorder.is_some() {
            return Err(MediaError::RecorderBusy(stream.id));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.recorder = Some(id);
        state.sink = Some(sink);
        Ok(RecorderHandle {
            id,
            stream_id: stream.id,
        })
    }

    async fn stop(&mut self, recorder: RecorderHandle) -> Result<(), MediaError> {
        let mut state = self.state.lock().unwrap();
        if state.recorder != Some(recorder.id) {
            return Ok(());
        }
        let chunks = std::mem::take(&mut state.final_chunks);
        if let Some(sink) = state.sink.take() {
            for chunk in chunks {
                sink.push(chunk);
            }
        }
        state.recorder = None;
        Ok(())
    }

    fn release(&mut self, stream: &MediaStreamHandle) {
        let mut state = self.state.lock().unwrap();
        if state.live_streams.remove(&stream.id) {
            state.released += 1;
        }
    }

    fn recording_format(&self) -> RecordingFormat {
        self.state
            .lock()
            .unwrap()
            .opened_format
            .clone()
            .unwrap_or_else(RecordingFormat::webm)
    }
}

#[derive(Default)]
pub struct FakeBackend {
    pipeline: Mutex<VecDeque<Result<PipelineProgress, BackendError>>>,
    end_call_results: Mutex<VecDeque<Result<EndCallReceipt, BackendError>>>,
    submissions: Mutex<Vec<EndCallSubmission>>,
    meeting: Mutex<Option<MeetingCredentials>>,
    meeting_requests: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn queue_pipeline(&self, result: Result<PipelineProgress, BackendError>) {
        self.pipeline.lock().unwrap().push_back(result);
    }

    /// Results for upcoming `end_call`s. An empty queue acknowledges.
    pub fn queue_end_call(&self, result: Result<EndCallReceipt, BackendError>) {
        self.end_call_results.lock().unwrap().push_back(result);
    }

    pub fn submissions(&self) -> Vec<EndCallSubmission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn set_meeting(&self, meeting: MeetingCredentials) {
        *self.meeting.lock().unwrap() = Some(meeting);
    }

    pub fn meeting_requests(&self) -> Vec<String> {
        self.meeting_requests.lock().unwrap().clone()
    }

    fn meeting(&self, request: String) -> Result<MeetingCredentials, BackendError> {
        self.meeting_requests.lock().unwrap().push(request);
        self.meeting
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BackendError::Status {
                status: 404,
                message: "Interview not found.".into(),
            })
    }
}

#[async_trait]
impl InterviewBackend for FakeBackend {
    async fn start_meeting(&self, interview_id: &str) -> Result<MeetingCredentials, BackendError> {
        self.meeting(format!("start:{interview_id}"))
    }

    async fn join_meeting(&self, interview_id: &str) -> Result<MeetingCredentials, BackendError> {
        self.meeting(format!("join:{interview_id}"))
    }

    async fn schedule_interview(
        &self,
        request: &ScheduleRequest,
    ) -> Result<ScheduledInterview, BackendError> {
        Ok(ScheduledInterview {
            interview_id: format!("i-{}", request.application_id),
            scheduled_at: request.scheduled_at,
            meeting_url: None,
        })
    }

    async fn end_call(
        &self,
        submission: &EndCallSubmission,
    ) -> Result<EndCallReceipt, BackendError> {
        self.submissions.lock().unwrap().push(submission.clone());
        self.end_call_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(EndCallReceipt {
                    call_session_id: Some(submission.session_id.clone()),
                    recording_url: None,
                })
            })
    }

    async fn fetch_pipeline(
        &self,
        _application_id: &str,
    ) -> Result<PipelineProgress, BackendError> {
        self.pipeline
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Transport("no pipeline queued".into())))
    }
}

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
