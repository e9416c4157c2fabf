//! Local media: streams, tracks, frames and the chunks cut from them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Frames buffered per subscriber before a slow consumer starts lagging.
pub const FRAME_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// One encoded sample produced by a local track.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub track_id: String,
    pub kind: TrackKind,
    pub data: Bytes,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: format!("{}-{}", kind, Uuid::new_v4().simple()),
            kind,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Locally captured media: a set of tracks plus the frame fan-out every
/// consumer (peer connection, recorder) subscribes to.
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
    frames: Option<broadcast::Sender<MediaFrame>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>, frames: broadcast::Sender<MediaFrame>) -> Self {
        Self {
            id: format!("stream-{}", Uuid::new_v4().simple()),
            tracks,
            frames: Some(frames),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// `None` once the stream has been stopped.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<MediaFrame>> {
        self.frames.as_ref().map(|tx| tx.subscribe())
    }

    pub fn is_active(&self) -> bool {
        self.frames.is_some() && self.tracks.iter().any(|t| !t.is_stopped())
    }

    /// Stop every track and release the fan-out. Subscribers observe the
    /// channel closing once the producer exits too.
    pub fn stop_tracks(&mut self) {
        for track in &self.tracks {
            track.stop();
        }
        self.frames = None;
    }
}

impl std::fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A finalized recording segment. `index` is assigned in capture order,
/// starting at 0, scoped to one (session, participant) pair.
#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub index: u64,
    pub data: Bytes,
    pub mime_type: String,
}
