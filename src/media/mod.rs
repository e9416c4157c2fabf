pub mod capture;
pub mod recorder;
pub mod source;
pub mod types;

pub use capture::{CaptureBackend, CaptureDevice, FramedCaptureBackend, FRAMED_MIME_TYPE};
pub use recorder::ChunkRecorder;
pub use source::{MediaConstraints, MediaSource, SyntheticSource};
pub use types::*;
