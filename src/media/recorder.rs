//! Time-sliced recording of the local stream.

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};

use super::capture::{CaptureBackend, CaptureDevice};
use super::types::{LocalStream, MediaChunk, MediaFrame};
use crate::config::RecorderConfig;
use crate::error::MediaError;

pub struct ChunkRecorder {
    mime_type: String,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<u64>>,
}

impl ChunkRecorder {
    /// Start recording `stream`, handing every finalized segment to `chunks`
    /// as soon as its timeslice elapses.
    pub fn start(
        stream: &LocalStream,
        backend: &dyn CaptureBackend,
        config: &RecorderConfig,
        chunks: mpsc::UnboundedSender<MediaChunk>,
    ) -> Result<Self, MediaError> {
        let frames = stream
            .subscribe()
            .ok_or_else(|| MediaError::Capture("stream already stopped".into()))?;
        let device = open_device(backend, &config.preferred_mime_type)?;
        let mime_type = device.mime_type().to_string();
        let (stop_tx, stop_rx) = oneshot::channel();

        log::info!(
            "Recording stream {} as {} in {:?} slices",
            stream.id(),
            mime_type,
            config.timeslice
        );

        let task = tokio::spawn(record(frames, device, config.timeslice, chunks, stop_rx));

        Ok(Self {
            mime_type,
            stop_tx: Some(stop_tx),
            task: Some(task),
        })
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn is_active(&self) -> bool {
        self.stop_tx.is_some() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Request a stop. The final segment is flushed in the background; the
    /// caller does not wait for it. Returns false if already stopped.
    pub fn stop(&mut self) -> bool {
        match self.stop_tx.take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Stop and wait for the final flush. Returns the number of chunks.
    pub async fn finish(mut self) -> u64 {
        self.stop();
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                log::error!("Recorder task failed: {}", e);
                0
            }),
            None => 0,
        }
    }
}

/// Try the preferred encoding, then the backend default. Exactly one
/// fallback attempt.
fn open_device(
    backend: &dyn CaptureBackend,
    preferred: &str,
) -> Result<Box<dyn CaptureDevice>, MediaError> {
    match backend.open(Some(preferred)) {
        Ok(device) => Ok(device),
        Err(e) => {
            log::warn!("Preferred encoding {} rejected ({}), using default", preferred, e);
            backend.open(None)
        }
    }
}

async fn record(
    mut frames: broadcast::Receiver<MediaFrame>,
    mut device: Box<dyn CaptureDevice>,
    timeslice: Duration,
    chunks: mpsc::UnboundedSender<MediaChunk>,
    mut stop_rx: oneshot::Receiver<()>,
) -> u64 {
    let mut ticker = interval_at(Instant::now() + timeslice, timeslice);
    let mut next_index = 0u64;

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => emit(device.as_mut(), &chunks, &mut next_index),
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if let Err(e) = device.write(&frame) {
                        log::warn!("Dropping frame from {}: {}", frame.track_id, e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Recorder lagged, {} frames lost", skipped);
                }
                Err(RecvError::Closed) => {
                    log::info!("Local stream ended, finishing recording");
                    break;
                }
            },
        }
    }

    emit(device.as_mut(), &chunks, &mut next_index);
    log::info!("Recording stopped after {} chunks", next_index);
    next_index
}

fn emit(
    device: &mut dyn CaptureDevice,
    chunks: &mpsc::UnboundedSender<MediaChunk>,
    next_index: &mut u64,
) {
    let data = device.flush();
    if data.is_empty() {
        return;
    }

    let chunk = MediaChunk {
        index: *next_index,
        data,
        mime_type: device.mime_type().to_string(),
    };
    *next_index += 1;

    log::debug!("Chunk {} finalized: {} bytes", chunk.index, chunk.data.len());
    if chunks.send(chunk).is_err() {
        log::warn!("Uploader gone, chunk {} lost", *next_index - 1);
    }
}
