//! Append-only recording buffer shared between a recorder and its call session.
//!
//! The recorder writes through a [`ChunkSink`]; the call session owns the gate.
//! Chunks pushed while the gate is sealed are dropped and counted, never stored.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Container details of the chunks a recorder produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingFormat {
    pub mime_type: String,
    pub extension: String,
}

impl RecordingFormat {
    pub fn new(mime_type: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            extension: extension.into(),
        }
    }

    pub fn webm() -> Self {
        Self::new("video/webm", "webm")
    }

    pub fn file_name(&self) -> String {
        format!("recording.{}", self.extension.trim_start_matches('.'))
    }
}

impl Default for RecordingFormat {
    fn default() -> Self {
        Self::webm()
    }
}

/// The finished recording: every chunk concatenated in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingArtifact {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub file_name: String,
    pub chunk_count: usize,
}

impl RecordingArtifact {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Default)]
struct BufferInner {
    chunks: Vec<Vec<u8>>,
    open: bool,
    rejected: u64,
}

/// Ordered chunk sequence of one call session. Starts sealed.
#[derive(Debug, Clone, Default)]
pub struct RecordingBuffer {
    inner: Arc<Mutex<BufferInner>>,
}

impl RecordingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn sink(&self) -> ChunkSink {
        ChunkSink {
            buffer: self.clone(),
        }
    }

    pub fn open(&self) {
        self.lock().open = true;
    }

    pub fn seal(&self) {
        self.lock().open = false;
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn chunk_count(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn byte_len(&self) -> usize {
        self.lock().chunks.iter().map(Vec::len).sum()
    }

    /// Chunks dropped because they arrived while sealed.
    pub fn rejected(&self) -> u64 {
        self.lock().rejected
    }

    fn push(&self, chunk: Vec<u8>) -> bool {
        let mut guard = self.lock();
        if !guard.open {
            guard.rejected += 1;
            return false;
        }
        if chunk.is_empty() {
            return true;
        }
        guard.chunks.push(chunk);
        true
    }

    /// Concatenates the chunks recorded so far. `None` when nothing was recorded.
    ///
    /// Does not consume the chunks: a failed upload must be able to rebuild the
    /// same artifact on retry.
    pub fn finalize(&self, format: &RecordingFormat) -> Option<RecordingArtifact> {
        let guard = self.lock();
        if guard.chunks.is_empty() {
            return None;
        }

        let total = guard.chunks.iter().map(Vec::len).sum();
        let mut bytes = Vec::with_capacity(total);
        for chunk in &guard.chunks {
            bytes.extend_from_slice(chunk);
        }

        Some(RecordingArtifact {
            bytes,
            mime_type: format.mime_type.clone(),
            file_name: format.file_name(),
            chunk_count: guard.chunks.len(),
        })
    }
}

/// Write end handed to a recorder.
#[derive(Debug, Clone)]
pub struct ChunkSink {
    buffer: RecordingBuffer,
}

impl ChunkSink {
    /// Returns `false` if the chunk was dropped because the gate is sealed.
    pub fn push(&self, chunk: Vec<u8>) -> bool {
        self.buffer.push(chunk)
    }

    pub fn is_open(&self) -> bool {
        self.buffer.is_open()
    }
}
