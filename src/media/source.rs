//! Where local media comes from. `SyntheticSource` generates timed frames
//! for headless runs and tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::broadcast;

use super::types::{LocalStream, LocalTrack, MediaFrame, TrackKind, FRAME_CHANNEL_CAPACITY};
use crate::error::MediaError;

/// Opus TOC + payload for a 20 ms silent frame.
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];
pub const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

/// Acquires the local participant's media. Failure here is fatal to
/// starting a session.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// Device-less source emitting Opus silence, for headless clients and tests.
pub struct SyntheticSource {
    frame_interval: Duration,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            frame_interval: OPUS_FRAME_DURATION,
        }
    }

    pub fn with_frame_interval(frame_interval: Duration) -> Self {
        Self {
            frame_interval: frame_interval.max(Duration::from_millis(1)),
        }
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for SyntheticSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        if constraints.video {
            return Err(MediaError::Unavailable("synthetic source has no camera".into()));
        }
        if !constraints.audio {
            return Err(MediaError::Unavailable("no tracks requested".into()));
        }

        let track = LocalTrack::new(TrackKind::Audio);
        let (tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let stream = LocalStream::new(vec![track.clone()], tx.clone());

        let interval = self.frame_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let payload = Bytes::from_static(&OPUS_SILENCE_FRAME);
            let mut produced = 0u64;
            loop {
                ticker.tick().await;
                if track.is_stopped() {
                    break;
                }
                // No subscribers yet is fine; frames are simply dropped.
                let _ = tx.send(MediaFrame {
                    track_id: track.id().to_string(),
                    kind: track.kind(),
                    data: payload.clone(),
                    duration: interval,
                });
                produced += 1;
            }
            log::debug!("Synthetic track {} stopped after {} frames", track.id(), produced);
        });

        log::info!("Acquired synthetic stream {}", stream.id());
        Ok(stream)
    }
}
