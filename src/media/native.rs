//! Microphone capture over cpal.
//!
//! cpal streams are not `Send`, so each acquired stream lives on its own
//! capture thread and is driven through a command channel.

use std::{
    collections::HashMap,
    sync::{mpsc, Arc, Mutex},
    thread,
    time::Duration,
};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, info, warn};
use tokio::sync::oneshot;

use super::{MediaCapture, MediaConstraints, MediaError, MediaStreamHandle, RecorderHandle};
use crate::recording::{ChunkSink, RecordingFormat};

enum CaptureCommand {
    Start(ChunkSink),
    Stop(oneshot::Sender<()>),
    Release,
}

struct StreamWorker {
    commands: mpsc::Sender<CaptureCommand>,
    recorder: Option<u64>,
}

/// 16-bit little-endian PCM slices pushed once `slice_bytes` is reached.
struct SliceState {
    sink: Option<ChunkSink>,
    pending: Vec<u8>,
    slice_bytes: usize,
}

impl SliceState {
    fn append(&mut self, samples: impl Iterator<Item = i16>) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };
        for sample in samples {
            self.pending.extend_from_slice(&sample.to_le_bytes());
        }
        if self.pending.len() >= self.slice_bytes {
            let chunk = std::mem::take(&mut self.pending);
            sink.push(chunk);
        }
    }

    fn flush(&mut self) {
        if let Some(sink) = self.sink.take() {
            if !self.pending.is_empty() {
                sink.push(std::mem::take(&mut self.pending));
            }
        }
        self.pending.clear();
    }
}

pub struct CpalCapture {
    slice: Duration,
    next_id: u64,
    workers: HashMap<u64, StreamWorker>,
    format: RecordingFormat,
}

impl CpalCapture {
    pub fn new(slice: Duration) -> Self {
        Self {
            slice,
            next_id: 1,
            workers: HashMap::new(),
            format: RecordingFormat::new("audio/L16", "pcm"),
        }
    }
}

#[async_trait]
impl MediaCapture for CpalCapture {
    async fn request_access(
        &mut self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStreamHandle, MediaError> {
        if !constraints.audio {
            return Err(MediaError::DeviceUnavailable(
                "native capture records audio only".into(),
            ));
        }
        if constraints.video {
            warn!("native capture has no camera support; continuing audio-only");
        }

        let (command_tx, command_rx) = mpsc::channel::<CaptureCommand>();
        let (ready_tx, ready_rx) = oneshot::channel();
        let slice = self.slice;

        thread::Builder::new()
            .name("hirecall-capture".into())
            .spawn(move || capture_thread(slice, ready_tx, command_rx))
            .map_err(|err| MediaError::Recorder(err.to_string()))?;

        let (sample_rate, channels) = ready_rx
            .await
            .map_err(|_| MediaError::Recorder("capture thread exited during setup".into()))??;

        self.format = RecordingFormat::new(
            format!("audio/L16;rate={sample_rate};channels={channels}"),
            "pcm",
        );

        let id = self.next_id;
        self.next_id += 1;
        self.workers.insert(
            id,
            StreamWorker {
                commands: command_tx,
                recorder: None,
            },
        );
        info!("microphone stream {id} opened at {sample_rate} Hz, {channels} channel(s)");

        Ok(MediaStreamHandle {
            id,
            audio: true,
            video: false,
        })
    }

    fn start_recording(
        &mut self,
        stream: &MediaStreamHandle,
        sink: ChunkSink,
    ) -> Result<RecorderHandle, MediaError> {
        let worker = self
            .workers
            .get_mut(&stream.id)
            .ok_or_else(|| MediaError::Recorder(format!("stream {} is released", stream.id)))?;
        if worker.recorder.is_some() {
            return Err(MediaError::RecorderBusy(stream.id));
        }

        worker
            .commands
            .send(CaptureCommand::Start(sink))
            .map_err(|_| MediaError::Recorder("capture thread is gone".into()))?;

        let id = self.next_id;
        self.next_id += 1;
        worker.recorder = Some(id);
        Ok(RecorderHandle {
            id,
            stream_id: stream.id,
        })
    }

    async fn stop(&mut self, recorder: RecorderHandle) -> Result<(), MediaError> {
        let Some(worker) = self.workers.get_mut(&recorder.stream_id) else {
            return Ok(());
        };
        if worker.recorder != Some(recorder.id) {
            return Ok(());
        }
        worker.recorder = None;

        let (reply_tx, reply_rx) = oneshot::channel();
        worker
            .commands
            .send(CaptureCommand::Stop(reply_tx))
            .map_err(|_| MediaError::Recorder("capture thread is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| MediaError::Recorder("capture thread dropped stop reply".into()))
    }

    fn release(&mut self, stream: &MediaStreamHandle) {
        if let Some(worker) = self.workers.remove(&stream.id) {
            let _ = worker.commands.send(CaptureCommand::Release);
            info!("microphone stream {} released", stream.id);
        }
    }

    fn recording_format(&self) -> RecordingFormat {
        self.format.clone()
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        for (_, worker) in self.workers.drain() {
            let _ = worker.commands.send(CaptureCommand::Release);
        }
    }
}

type Ready = oneshot::Sender<Result<(u32, u16), MediaError>>;

fn capture_thread(slice: Duration, ready: Ready, commands: mpsc::Receiver<CaptureCommand>) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        let _ = ready.send(Err(MediaError::DeviceUnavailable(
            "no default input device".into(),
        )));
        return;
    };

    let supported = match device.default_input_config() {
        Ok(config) => config,
        Err(err) => {
            let _ = ready.send(Err(MediaError::PermissionDenied(err.to_string())));
            return;
        }
    };

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let slice_bytes =
        (sample_rate as u128 * channels as u128 * 2 * slice.as_millis() / 1000).max(2) as usize;
    let state = Arc::new(Mutex::new(SliceState {
        sink: None,
        pending: Vec::with_capacity(slice_bytes),
        slice_bytes,
    }));

    let config = supported.config();
    let on_error = |err: cpal::StreamError| error!("capture stream error: {err}");

    let built = match supported.sample_format() {
        cpal::SampleFormat::F32 => {
            let state = Arc::clone(&state);
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut guard) = state.lock() {
                        guard.append(
                            data.iter()
                                .map(|sample| (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
                        );
                    }
                },
                on_error,
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let state = Arc::clone(&state);
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut guard) = state.lock() {
                        guard.append(data.iter().copied());
                    }
                },
                on_error,
                None,
            )
        }
        other => {
            let _ = ready.send(Err(MediaError::DeviceUnavailable(format!(
                "unsupported sample format {other:?}"
            ))));
            return;
        }
    };

    let stream = match built {
        Ok(stream) => stream,
        Err(cpal::BuildStreamError::DeviceNotAvailable) => {
            let _ = ready.send(Err(MediaError::DeviceUnavailable(
                "input device disappeared".into(),
            )));
            return;
        }
        Err(err) => {
            let _ = ready.send(Err(MediaError::PermissionDenied(err.to_string())));
            return;
        }
    };
    let _ = stream.pause();

    if ready.send(Ok((sample_rate, channels))).is_err() {
        return;
    }

    while let Ok(command) = commands.recv() {
        match command {
            CaptureCommand::Start(sink) => {
                if let Ok(mut guard) = state.lock() {
                    guard.pending.clear();
                    guard.sink = Some(sink);
                }
                if let Err(err) = stream.play() {
                    error!("failed to start capture stream: {err}");
                }
            }
            CaptureCommand::Stop(reply) => {
                let _ = stream.pause();
                if let Ok(mut guard) = state.lock() {
                    guard.flush();
                }
                let _ = reply.send(());
            }
            CaptureCommand::Release => break,
        }
    }

    drop(stream);
    info!("capture thread shutting down");
}
