//! HTTP client for the backend: session creation, chunk upload, end-call
//! and report retrieval.

use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::config::SessionKind;
use crate::error::BackendError;
use crate::media::MediaChunk;

#[derive(Debug, Clone, PartialEq)]
pub enum ReportStatus {
    Processing,
    Ready(serde_json::Value),
    NotFound,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    session_id: String,
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base: String,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn upload_url(&self, kind: SessionKind, session_id: &str, participant_id: &str) -> String {
        match kind {
            SessionKind::Call => format!("{}/upload/{}/{}", self.base, session_id, participant_id),
            SessionKind::Practice => format!("{}/api/scenario/upload/{}", self.base, session_id),
        }
    }

    pub fn end_url(&self, kind: SessionKind, session_id: &str) -> String {
        match kind {
            SessionKind::Call => format!("{}/end_call/{}", self.base, session_id),
            SessionKind::Practice => format!("{}/api/scenario/end/{}", self.base, session_id),
        }
    }

    pub fn report_url(&self, kind: SessionKind, session_id: &str) -> String {
        match kind {
            SessionKind::Call => format!("{}/api/report/{}", self.base, session_id),
            SessionKind::Practice => format!("{}/api/scenario/report/{}", self.base, session_id),
        }
    }

    pub async fn create_session(&self) -> Result<String, BackendError> {
        let resp = self
            .http
            .post(format!("{}/create_session", self.base))
            .send()
            .await?;
        let created: SessionCreated = check(resp)?.json().await?;
        log::info!("Created session {}", created.session_id);
        Ok(created.session_id)
    }

    pub async fn start_practice(&self, scenario_id: &str) -> Result<String, BackendError> {
        let resp = self
            .http
            .post(format!("{}/api/scenario/start", self.base))
            .json(&serde_json::json!({ "scenario_id": scenario_id }))
            .send()
            .await?;
        let created: SessionCreated = check(resp)?.json().await?;
        log::info!("Started practice session {} for {}", created.session_id, scenario_id);
        Ok(created.session_id)
    }

    /// One multipart POST: `file` plus the zero-based `chunk_index`.
    pub async fn upload_chunk(
        &self,
        kind: SessionKind,
        session_id: &str,
        participant_id: &str,
        chunk: &MediaChunk,
    ) -> Result<(), BackendError> {
        // Build multipart form
        let file = Part::bytes(chunk.data.to_vec())
            .file_name(format!("chunk-{}", chunk.index))
            .mime_str(&chunk.mime_type)?;
        let form = Form::new()
            .part("file", file)
            .text("chunk_index", chunk.index.to_string());

        // Send to the per-participant endpoint
        let resp = self
            .http
            .post(self.upload_url(kind, session_id, participant_id))
            .multipart(form)
            .send()
            .await?;
        check(resp)?;
        Ok(())
    }

    /// Tell the backend the session is over. No body.
    pub async fn end_session(&self, kind: SessionKind, session_id: &str) -> Result<(), BackendError> {
        let resp = self.http.post(self.end_url(kind, session_id)).send().await?;
        check(resp)?;
        Ok(())
    }

    pub async fn fetch_report(
        &self,
        kind: SessionKind,
        session_id: &str,
    ) -> Result<ReportStatus, BackendError> {
        let resp = self.http.get(self.report_url(kind, session_id)).send().await?;
        // 202 while analysis runs
        match resp.status() {
            StatusCode::ACCEPTED => Ok(ReportStatus::Processing),
            StatusCode::NOT_FOUND => Ok(ReportStatus::NotFound),
            s if s.is_success() => Ok(ReportStatus::Ready(resp.json().await?)),
            s => Err(BackendError::Status(s.as_u16())),
        }
    }

    /// Poll until the report is ready. `Ok(None)` when polls run out.
    pub async fn wait_for_report(
        &self,
        kind: SessionKind,
        session_id: &str,
        interval: Duration,
        max_polls: u32,
    ) -> Result<Option<serde_json::Value>, BackendError> {
        for poll in 1..=max_polls {
            match self.fetch_report(kind, session_id).await? {
                ReportStatus::Ready(report) => return Ok(Some(report)),
                ReportStatus::NotFound => return Err(BackendError::NotFound),
                ReportStatus::Processing => {
                    log::debug!("Report for {} still processing (poll {})", session_id, poll);
                    tokio::time::sleep(interval).await;
                }
            }
        }
        Ok(None)
    }
}

/// Path of the page the UI navigates to once a session is over.
pub fn report_page(kind: SessionKind, session_id: &str) -> String {
    match kind {
        SessionKind::Call => format!("/report/{}", session_id),
        SessionKind::Practice => format!("/scenario_report/{}", session_id),
    }
}

fn check(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    match resp.status() {
        StatusCode::NOT_FOUND => Err(BackendError::NotFound),
        s if s.is_success() => Ok(resp),
        s => Err(BackendError::Status(s.as_u16())),
    }
}
