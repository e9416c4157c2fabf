mod common;

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    routing::post,
    Router,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use callcapture::media::MediaChunk;
use callcapture::{BackendClient, ChunkUploader, SessionKind};
use common::fast_retry;

/// Upload attempts per chunk index, as seen by the server.
type Attempts = Arc<Mutex<HashMap<u64, u32>>>;

/// Index 1 always fails with 503, index 3 is rejected with 400, the rest
/// succeed.
async fn flaky_upload(
    State(attempts): State<Attempts>,
    Path((_session, _participant)): Path<(String, String)>,
    mut multipart: Multipart,
) -> StatusCode {
    let mut index = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("chunk_index") {
            index = field.text().await.ok().and_then(|t| t.parse::<u64>().ok());
        }
    }
    let Some(index) = index else {
        return StatusCode::BAD_REQUEST;
    };
    *attempts.lock().entry(index).or_default() += 1;
    match index {
        1 => StatusCode::SERVICE_UNAVAILABLE,
        3 => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    }
}

async fn spawn_flaky_backend() -> (String, Attempts) {
    let attempts: Attempts = Arc::default();
    let app = Router::new()
        .route("/upload/:session_id/:participant_id", post(flaky_upload))
        .with_state(attempts.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), attempts)
}

fn chunk(index: u64) -> MediaChunk {
    MediaChunk {
        index,
        data: Bytes::from(vec![index as u8; 64]),
        mime_type: "application/octet-stream".into(),
    }
}

#[tokio::test]
async fn failed_chunks_do_not_hold_up_later_ones() {
    let (server, attempts) = spawn_flaky_backend().await;
    let uploader = ChunkUploader::new(
        BackendClient::new(&server).unwrap(),
        SessionKind::Call,
        "s1",
        "p1",
        fast_retry(),
    );
    let (tx, rx) = mpsc::unbounded_channel();
    let summary = uploader.spawn(rx);

    for index in 0..5 {
        tx.send(chunk(index)).unwrap();
    }
    drop(tx);

    let summary = tokio::time::timeout(Duration::from_secs(10), summary)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.uploaded, vec![0, 2, 4]);
    assert_eq!(summary.failed, vec![1, 3]);

    let attempts = attempts.lock();
    // Transient failures use the whole budget, client errors give up at once.
    assert_eq!(attempts[&1], 3);
    assert_eq!(attempts[&3], 1);
    assert_eq!(attempts[&0], 1);
}

#[tokio::test]
async fn unreachable_backend_drops_chunk_after_retries() {
    // Nothing listens on the discard port.
    let uploader = ChunkUploader::new(
        BackendClient::new("http://127.0.0.1:9").unwrap(),
        SessionKind::Call,
        "s1",
        "p1",
        fast_retry(),
    );
    let err = uploader.upload(&chunk(7)).await.unwrap_err();
    assert!(matches!(err, callcapture::BackendError::Http(_)));
}
