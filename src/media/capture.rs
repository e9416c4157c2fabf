//! Capture devices turn a frame sequence into recording segments.
//!
//! The built-in device writes a length-delimited container: one record per
//! frame, `[kind u8][duration_us u32 BE][payload]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::types::{MediaFrame, TrackKind};
use crate::error::MediaError;

pub const FRAMED_MIME_TYPE: &str = "application/x-callcapture-frames";
const RECORD_HEADER_SIZE: usize = 5;

pub trait CaptureDevice: Send {
    fn mime_type(&self) -> &str;

    fn write(&mut self, frame: &MediaFrame) -> Result<(), MediaError>;

    /// Finalize the current segment. Empty when nothing was captured.
    fn flush(&mut self) -> Bytes;
}

pub trait CaptureBackend: Send + Sync {
    /// Open a device for `mime_type`, or the backend default for `None`.
    fn open(&self, mime_type: Option<&str>) -> Result<Box<dyn CaptureDevice>, MediaError>;
}

pub struct FramedCaptureBackend {
    supported: Vec<String>,
}

impl FramedCaptureBackend {
    pub fn new() -> Self {
        Self {
            supported: vec![FRAMED_MIME_TYPE.to_string()],
        }
    }

    pub fn with_supported(supported: Vec<String>) -> Self {
        Self { supported }
    }
}

impl Default for FramedCaptureBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for FramedCaptureBackend {
    fn open(&self, mime_type: Option<&str>) -> Result<Box<dyn CaptureDevice>, MediaError> {
        let mime = match mime_type {
            Some(m) if self.supported.iter().any(|s| s == m) => m.to_string(),
            Some(m) => return Err(MediaError::UnsupportedEncoding(m.to_string())),
            None => FRAMED_MIME_TYPE.to_string(),
        };
        Ok(Box::new(FramedCapture::new(mime)))
    }
}

pub struct FramedCapture {
    mime_type: String,
    codec: LengthDelimitedCodec,
    buffer: BytesMut,
}

impl FramedCapture {
    pub fn new(mime_type: String) -> Self {
        Self {
            mime_type,
            codec: LengthDelimitedCodec::new(),
            buffer: BytesMut::new(),
        }
    }
}

impl CaptureDevice for FramedCapture {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn write(&mut self, frame: &MediaFrame) -> Result<(), MediaError> {
        // Header: kind + duration
        let mut record = BytesMut::with_capacity(RECORD_HEADER_SIZE + frame.data.len());
        record.put_u8(match frame.kind {
            TrackKind::Audio => 0,
            TrackKind::Video => 1,
        });
        record.put_u32(frame.duration.as_micros().min(u32::MAX as u128) as u32);
        record.extend_from_slice(&frame.data);

        // Length prefix
        self.codec
            .encode(record.freeze(), &mut self.buffer)
            .map_err(|e| MediaError::Capture(e.to_string()))
    }

    fn flush(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }
}

/// Split a segment written by [`FramedCapture`] back into frames.
pub fn decode_segment(segment: &[u8]) -> Result<Vec<(TrackKind, Duration, Bytes)>, MediaError> {
    let mut codec = LengthDelimitedCodec::new();
    let mut src = BytesMut::from(segment);
    let mut frames = Vec::new();

    while let Some(mut record) = codec
        .decode(&mut src)
        .map_err(|e| MediaError::Capture(e.to_string()))?
    {
        if record.len() < RECORD_HEADER_SIZE {
            return Err(MediaError::Capture("truncated frame record".into()));
        }
        let kind = match record.get_u8() {
            0 => TrackKind::Audio,
            1 => TrackKind::Video,
            other => return Err(MediaError::Capture(format!("unknown track kind {}", other))),
        };
        let duration = Duration::from_micros(record.get_u32() as u64);
        frames.push((kind, duration, record.freeze()));
    }

    // A partial record means the segment was cut short
    if !src.is_empty() {
        return Err(MediaError::Capture(format!("{} trailing bytes", src.len())));
    }
    Ok(frames)
}
