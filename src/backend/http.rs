use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;

use super::{
    friendly_message, BackendError, EndCallReceipt, EndCallSubmission, InterviewBackend,
    MeetingCredentials, ScheduleRequest, ScheduledInterview, DEFAULT_FAILURE_MESSAGE,
};
use crate::{pipeline::PipelineProgress, settings::BackendSettings};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const CSRF_HEADER: &str = "X-CSRFToken";

#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    csrf_token: Option<String>,
}

impl HttpBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self, BackendError> {
        let base_url = settings.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(BackendError::InvalidRequest("backend base url is empty".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            auth_token: settings.auth_token.clone().filter(|t| !t.trim().is_empty()),
            csrf_token: settings.csrf_token.clone().filter(|t| !t.trim().is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(csrf) = &self.csrf_token {
            request = request.header(CSRF_HEADER, csrf);
        }
        request
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = friendly_message(&body).unwrap_or_else(|| {
                debug!("unpresentable error body ({} bytes) for status {status}", body.len());
                DEFAULT_FAILURE_MESSAGE.to_string()
            });
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }
}

fn end_call_form(submission: &EndCallSubmission) -> Result<Form, BackendError> {
    let mut form = Form::new()
        .text("call_session_id", submission.session_id.clone())
        .text("interview_id", submission.interview_id.clone())
        .text("duration_seconds", submission.duration_seconds.to_string())
        .text(
            "connection_quality",
            submission.connection_quality.as_str().to_string(),
        );

    if let Some(recording) = &submission.recording {
        let part = Part::bytes(recording.bytes.clone())
            .file_name(recording.file_name.clone())
            .mime_str(&recording.mime_type)
            .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;
        form = form.part("recording_file", part);
    }

    Ok(form)
}

#[async_trait]
impl InterviewBackend for HttpBackend {
    async fn start_meeting(&self, interview_id: &str) -> Result<MeetingCredentials, BackendError> {
        let url = self.url(&format!("/api/interviews/{interview_id}/meeting/start"));
        self.send_json(self.client.post(url)).await
    }

    async fn join_meeting(&self, interview_id: &str) -> Result<MeetingCredentials, BackendError> {
        let url = self.url(&format!("/api/interviews/{interview_id}/meeting/join"));
        self.send_json(self.client.post(url)).await
    }

    async fn schedule_interview(
        &self,
        request: &ScheduleRequest,
    ) -> Result<ScheduledInterview, BackendError> {
        if request.application_id.trim().is_empty() {
            return Err(BackendError::InvalidRequest("application id is empty".into()));
        }
        let url = self.url("/api/interviews/schedule");
        self.send_json(self.client.post(url).json(request)).await
    }

    async fn end_call(
        &self,
        submission: &EndCallSubmission,
    ) -> Result<EndCallReceipt, BackendError> {
        if submission.session_id.trim().is_empty() {
            return Err(BackendError::InvalidRequest("call session id is empty".into()));
        }

        let form = end_call_form(submission)?;
        let url = self.url("/api/meetings/end-call");
        let request = self
            .client
            .post(url)
            .header(IDEMPOTENCY_HEADER, submission.session_id.as_str())
            .multipart(form);

        let receipt: EndCallReceipt = self.send_json(request).await?;
        if let Some(echoed) = receipt.call_session_id.as_deref() {
            if echoed != submission.session_id {
                warn!(
                    "end-call ack echoed session {echoed}, expected {}",
                    submission.session_id
                );
            }
        }
        Ok(receipt)
    }

    async fn fetch_pipeline(
        &self,
        application_id: &str,
    ) -> Result<PipelineProgress, BackendError> {
        let url = self.url(&format!("/api/applications/{application_id}/pipeline"));
        self.send_json(self.client.get(url)).await
    }
}
