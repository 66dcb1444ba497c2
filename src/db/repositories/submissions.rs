use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::{
    backend::EndCallSubmission,
    db::{
        connection::Database,
        helpers::{parse_datetime, parse_quality, parse_state, to_i64, to_u64},
        models::{SubmissionRecord, SubmissionState},
    },
    recording::RecordingArtifact,
};

const SELECT_COLUMNS: &str = "SELECT session_id, interview_id, duration_seconds, connection_quality,
        recording, recording_mime, recording_name, chunk_count, state, attempts, last_error,
        recording_url, created_at, updated_at
 FROM call_submissions";

fn row_to_record(row: &Row) -> Result<SubmissionRecord> {
    let duration_seconds: i64 = row.get("duration_seconds")?;
    let quality: String = row.get("connection_quality")?;
    let recording: Option<Vec<u8>> = row.get("recording")?;
    let recording_mime: Option<String> = row.get("recording_mime")?;
    let recording_name: Option<String> = row.get("recording_name")?;
    let chunk_count: i64 = row.get("chunk_count")?;
    let state: String = row.get("state")?;
    let attempts: i64 = row.get("attempts")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    let recording = match recording {
        Some(bytes) => Some(RecordingArtifact {
            bytes,
            mime_type: recording_mime.unwrap_or_else(|| "application/octet-stream".into()),
            file_name: recording_name.unwrap_or_else(|| "recording.bin".into()),
            chunk_count: to_u64(chunk_count, "chunk_count")? as usize,
        }),
        None => None,
    };

    Ok(SubmissionRecord {
        session_id: row.get("session_id")?,
        interview_id: row.get("interview_id")?,
        duration_seconds: to_u64(duration_seconds, "duration_seconds")?,
        connection_quality: parse_quality(&quality)?,
        recording,
        state: parse_state(&state)?,
        attempts: to_u64(attempts, "attempts")? as u32,
        last_error: row.get("last_error")?,
        recording_url: row.get("recording_url")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

impl Database {
    /// Journals a submission before it is sent. Re-journaling the same session
    /// replaces the payload but keeps the attempt count; an acknowledged
    /// session is never reopened. Returns `false` in that case.
    pub async fn upsert_pending_submission(
        &self,
        submission: &EndCallSubmission,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let record = submission.clone();
        self.execute(move |conn| {
            let (bytes, mime, name, chunks) = match record.recording {
                Some(artifact) => (
                    Some(artifact.bytes),
                    Some(artifact.mime_type),
                    Some(artifact.file_name),
                    artifact.chunk_count as u64,
                ),
                None => (None, None, None, 0),
            };
            let changed = conn.execute(
                "INSERT INTO call_submissions (session_id, interview_id, duration_seconds, connection_quality,
                     recording, recording_mime, recording_name, chunk_count, state, attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?10)
                 ON CONFLICT(session_id) DO UPDATE SET
                     interview_id = excluded.interview_id,
                     duration_seconds = excluded.duration_seconds,
                     connection_quality = excluded.connection_quality,
                     recording = excluded.recording,
                     recording_mime = excluded.recording_mime,
                     recording_name = excluded.recording_name,
                     chunk_count = excluded.chunk_count,
                     state = excluded.state,
                     updated_at = excluded.updated_at
                 WHERE call_submissions.state != 'Acknowledged'",
                params![
                    record.session_id,
                    record.interview_id,
                    to_i64(record.duration_seconds)?,
                    record.connection_quality.as_str(),
                    bytes,
                    mime,
                    name,
                    to_i64(chunks)?,
                    SubmissionState::Pending.as_str(),
                    now.to_rfc3339(),
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn record_submission_failure(
        &self,
        session_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        let error = error.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE call_submissions
                 SET attempts = attempts + 1,
                     last_error = ?1,
                     updated_at = ?2
                 WHERE session_id = ?3 AND state = 'Pending'",
                params![error, now.to_rfc3339(), session_id],
            )?;
            Ok(())
        })
        .await
    }

    /// The recording blob is dropped once the backend holds it.
    pub async fn mark_submission_acknowledged(
        &self,
        session_id: &str,
        recording_url: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE call_submissions
                 SET state = ?1,
                     attempts = attempts + 1,
                     recording = NULL,
                     recording_url = ?2,
                     last_error = NULL,
                     updated_at = ?3
                 WHERE session_id = ?4",
                params![
                    SubmissionState::Acknowledged.as_str(),
                    recording_url,
                    now.to_rfc3339(),
                    session_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_submission_abandoned(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE call_submissions SET state = ?1, updated_at = ?2
                 WHERE session_id = ?3 AND state = 'Pending'",
                params![SubmissionState::Abandoned.as_str(), now.to_rfc3339(), session_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_submission(&self, session_id: &str) -> Result<Option<SubmissionRecord>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let sql = format!("{SELECT_COLUMNS} WHERE session_id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![session_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_record(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn list_pending_submissions(&self) -> Result<Vec<SubmissionRecord>> {
        self.execute(move |conn| {
            let sql = format!("{SELECT_COLUMNS} WHERE state = 'Pending' ORDER BY created_at ASC, rowid ASC");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
        .await
    }

    pub async fn count_submissions(&self, state: SubmissionState) -> Result<u64> {
        self.execute(move |conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT COUNT(*) FROM call_submissions WHERE state = ?1",
                    params![state.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            to_u64(count.unwrap_or(0), "count")
        })
        .await
    }
}
