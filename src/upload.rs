//! Chunk uploads, decoupled from recording.
//!
//! Each chunk gets its own task, so a slow or failing upload never holds up
//! the next one or the recorder feeding the queue.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::backend::BackendClient;
use crate::config::{RetryPolicy, SessionKind};
use crate::error::BackendError;
use crate::media::MediaChunk;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: Vec<u64>,
    pub failed: Vec<u64>,
}

#[derive(Clone)]
pub struct ChunkUploader {
    backend: BackendClient,
    kind: SessionKind,
    session_id: Arc<str>,
    participant_id: Arc<str>,
    policy: RetryPolicy,
}

impl ChunkUploader {
    pub fn new(
        backend: BackendClient,
        kind: SessionKind,
        session_id: &str,
        participant_id: &str,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            kind,
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            policy,
        }
    }

    /// Upload one chunk, retrying transient failures with backoff. The
    /// chunk keeps its index on every attempt.
    pub async fn upload(&self, chunk: &MediaChunk) -> Result<(), BackendError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .backend
                .upload_chunk(self.kind, &self.session_id, &self.participant_id, chunk)
                .await
            {
                Ok(()) => {
                    log::debug!(
                        "Uploaded chunk {} ({} bytes) for {}/{}",
                        chunk.index,
                        chunk.data.len(),
                        self.session_id,
                        self.participant_id
                    );
                    return Ok(());
                }
                Err(e) if attempt < max_attempts && is_retryable(&e) => {
                    let delay = self.policy.delay_for(attempt);
                    log::warn!(
                        "Upload of chunk {} failed (attempt {}/{}): {}, retrying in {:?}",
                        chunk.index,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain `chunks` until the recorder drops its sender, then wait for
    /// uploads still in flight.
    pub fn spawn(self, chunks: mpsc::UnboundedReceiver<MediaChunk>) -> JoinHandle<UploadSummary> {
        tokio::spawn(self.run(chunks))
    }

    async fn run(self, mut chunks: mpsc::UnboundedReceiver<MediaChunk>) -> UploadSummary {
        let mut tasks: JoinSet<(u64, Result<(), BackendError>)> = JoinSet::new();
        let mut summary = UploadSummary::default();

        // Spawn an upload per chunk, reaping finished ones as we go
        loop {
            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => {
                        let uploader = self.clone();
                        tasks.spawn(async move {
                            let result = uploader.upload(&chunk).await;
                            (chunk.index, result)
                        });
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    record(&mut summary, joined);
                }
            }
        }

        // Recorder is done; wait for the stragglers
        while let Some(joined) = tasks.join_next().await {
            record(&mut summary, joined);
        }

        summary.uploaded.sort_unstable();
        summary.failed.sort_unstable();
        log::info!(
            "Uploads finished for {}/{}: {} ok, {} failed {:?}",
            self.session_id,
            self.participant_id,
            summary.uploaded.len(),
            summary.failed.len(),
            summary.failed
        );
        summary
    }
}

fn record(
    summary: &mut UploadSummary,
    joined: Result<(u64, Result<(), BackendError>), tokio::task::JoinError>,
) {
    match joined {
        Ok((index, Ok(()))) => summary.uploaded.push(index),
        Ok((index, Err(e))) => {
            log::error!("Chunk {} dropped: {}", index, e);
            summary.failed.push(index);
        }
        Err(e) => log::error!("Upload task panicked: {}", e),
    }
}

/// Server rejections of the request itself are permanent; everything else
/// may succeed on another attempt.
fn is_retryable(e: &BackendError) -> bool {
    match e {
        BackendError::Http(_) => true,
        BackendError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
        BackendError::NotFound => false,
    }
}
