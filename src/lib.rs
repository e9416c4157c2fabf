pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod media;
pub mod relay;
pub mod rtc;
pub mod upload;

pub use backend::{report_page, BackendClient, ReportStatus};
pub use config::{ClientConfig, RecorderConfig, RetryPolicy, SessionKind};
pub use controller::{CallController, CallHandle, CallOutcome, CallStatus};
pub use error::{BackendError, CallError, MediaError, PeerError, SignalingError};
pub use relay::RelayState;
pub use upload::{ChunkUploader, UploadSummary};
