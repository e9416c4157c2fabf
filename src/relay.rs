//! Development backend: signaling relay, chunk sink, end-call and report
//! endpoints. Keeps everything in memory; analysis is not performed, the
//! report only lists what was received.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Multipart, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::config::SessionKind;
use crate::rtc::SignalMessage;

pub const MAX_PARTICIPANTS: usize = 2;
pub const SESSION_FULL_CODE: u16 = 4000;
pub const DEFAULT_ANALYSIS_DELAY: Duration = Duration::from_secs(1);

/// Practice uploads carry no participant in the path.
const PRACTICE_PARTICIPANT: &str = "practice";

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub index: u64,
    pub size: usize,
    pub received_at: DateTime<Utc>,
}

struct SessionEntry {
    kind: SessionKind,
    scenario_id: Option<String>,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    ready_at: Option<Instant>,
    chunks: BTreeMap<String, Vec<ChunkRecord>>,
    sockets: Vec<(u64, mpsc::UnboundedSender<Message>)>,
}

impl SessionEntry {
    fn new(kind: SessionKind, scenario_id: Option<String>) -> Self {
        Self {
            kind,
            scenario_id,
            created_at: Utc::now(),
            ended_at: None,
            ready_at: None,
            chunks: BTreeMap::new(),
            sockets: Vec::new(),
        }
    }

    fn report(&self, session_id: &str) -> serde_json::Value {
        let participants: serde_json::Map<String, serde_json::Value> = self
            .chunks
            .iter()
            .map(|(participant, records)| {
                let mut indices: Vec<u64> = records.iter().map(|r| r.index).collect();
                indices.sort_unstable();
                indices.dedup();
                let bytes: usize = records.iter().map(|r| r.size).sum();
                let last_received = records.iter().map(|r| r.received_at).max();
                (
                    participant.clone(),
                    json!({
                        "chunks": indices,
                        "bytes": bytes,
                        "gaps": find_gaps(&indices),
                        "last_received_at": last_received.map(|t| t.to_rfc3339()),
                    }),
                )
            })
            .collect();

        json!({
            "session_id": session_id,
            "kind": self.kind,
            "scenario_id": self.scenario_id,
            "created_at": self.created_at.to_rfc3339(),
            "ended_at": self.ended_at.map(|t| t.to_rfc3339()),
            "participants": participants,
        })
    }
}

/// Indices missing from `0..=max`. `indices` must be sorted.
pub fn find_gaps(indices: &[u64]) -> Vec<u64> {
    let mut gaps = Vec::new();
    let mut expected = 0;
    for &index in indices {
        gaps.extend(expected..index);
        expected = index + 1;
    }
    gaps
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Session not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match self {
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
pub struct RelayState {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    next_socket: Arc<AtomicU64>,
    analysis_delay: Duration,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(DEFAULT_ANALYSIS_DELAY)
    }
}

impl RelayState {
    pub fn new(analysis_delay: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_socket: Arc::new(AtomicU64::new(1)),
            analysis_delay,
        }
    }

    pub fn create_session(&self, kind: SessionKind, scenario_id: Option<String>) -> String {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        self.sessions
            .write()
            .insert(id.clone(), SessionEntry::new(kind, scenario_id));
        log::info!("Created {:?} session {}", kind, id);
        id
    }

    /// Received chunk indices for one participant, in arrival order.
    pub fn chunk_indices(&self, session_id: &str, participant_id: &str) -> Vec<u64> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(|s| s.chunks.get(participant_id))
            .map(|records| records.iter().map(|r| r.index).collect())
            .unwrap_or_default()
    }

    pub fn connected_sockets(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .get(session_id)
            .map_or(0, |s| s.sockets.len())
    }

    fn exists(&self, kind: SessionKind, session_id: &str) -> bool {
        self.sessions
            .read()
            .get(session_id)
            .is_some_and(|s| s.kind == kind)
    }

    fn attach(&self, session_id: &str, tx: mpsc::UnboundedSender<Message>) -> Option<u64> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(session_id)?;
        if session.sockets.len() >= MAX_PARTICIPANTS {
            return None;
        }
        let socket_id = self.next_socket.fetch_add(1, Ordering::Relaxed);
        session.sockets.push((socket_id, tx));
        Some(socket_id)
    }

    /// Remove a socket and tell whoever is left.
    fn detach(&self, session_id: &str, socket_id: u64) {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(session_id) else {
            return;
        };
        session.sockets.retain(|(id, _)| *id != socket_id);
        // Notify remaining participants
        if let Some(text) = encode(&SignalMessage::PeerLeft) {
            for (_, tx) in &session.sockets {
                let _ = tx.send(Message::Text(text.clone()));
            }
        }
    }

    fn relay(&self, session_id: &str, from: u64, text: String) {
        let sessions = self.sessions.read();
        let Some(session) = sessions.get(session_id) else {
            return;
        };
        for (id, tx) in &session.sockets {
            if *id != from {
                let _ = tx.send(Message::Text(text.clone()));
            }
        }
    }

    fn record_chunk(
        &self,
        kind: SessionKind,
        session_id: &str,
        participant_id: &str,
        index: u64,
        size: usize,
    ) -> Result<(), RelayError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .filter(|s| s.kind == kind)
            .ok_or(RelayError::NotFound)?;
        session
            .chunks
            .entry(participant_id.to_string())
            .or_default()
            .push(ChunkRecord {
                index,
                size,
                received_at: Utc::now(),
            });
        Ok(())
    }

    fn end(&self, kind: SessionKind, session_id: &str) -> Result<(), RelayError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .filter(|s| s.kind == kind)
            .ok_or(RelayError::NotFound)?;
        // First end starts the analysis clock
        if session.ended_at.is_none() {
            session.ended_at = Some(Utc::now());
            session.ready_at = Some(Instant::now() + self.analysis_delay);
        }
        if let Some(text) = encode(&SignalMessage::SessionEnded) {
            for (_, tx) in &session.sockets {
                let _ = tx.send(Message::Text(text.clone()));
            }
        }
        Ok(())
    }

    fn report(&self, kind: SessionKind, session_id: &str) -> Response {
        let sessions = self.sessions.read();
        let session = match sessions.get(session_id).filter(|s| s.kind == kind) {
            Some(session) => session,
            None => return not_found(),
        };
        match session.ready_at {
            None => not_found(),
            Some(ready_at) if Instant::now() < ready_at => {
                (StatusCode::ACCEPTED, Json(json!({ "status": "processing" }))).into_response()
            }
            Some(_) => Json(session.report(session_id)).into_response(),
        }
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "status": "not_found" }))).into_response()
}

fn encode(msg: &SignalMessage) -> Option<String> {
    serde_json::to_string(msg)
        .map_err(|e| log::error!("Failed to encode {}: {}", msg.kind(), e))
        .ok()
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Calls
        .route("/create_session", post(create_session))
        .route("/ws/:session_id", get(websocket_handler))
        .route("/upload/:session_id/:participant_id", post(upload_call_chunk))
        .route("/end_call/:session_id", post(end_call))
        .route("/api/report/:session_id", get(call_report))
        // Practice scenarios
        .route("/api/scenario/start", post(start_scenario))
        .route("/api/scenario/upload/:session_id", post(upload_practice_chunk))
        .route("/api/scenario/end/:session_id", post(end_practice))
        .route("/api/scenario/report/:session_id", get(practice_report))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: RelayState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Relay listening on http://{}", addr);
    }
    axum::serve(listener, router(state)).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "callcapture-relay" }))
}

async fn create_session(State(state): State<RelayState>) -> Json<serde_json::Value> {
    let session_id = state.create_session(SessionKind::Call, None);
    Json(json!({ "session_id": session_id }))
}

#[derive(Deserialize)]
struct StartScenario {
    scenario_id: String,
}

async fn start_scenario(
    State(state): State<RelayState>,
    Json(req): Json<StartScenario>,
) -> Json<serde_json::Value> {
    let session_id = state.create_session(SessionKind::Practice, Some(req.scenario_id.clone()));
    Json(json!({ "session_id": session_id, "scenario_id": req.scenario_id }))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<RelayState>,
) -> Response {
    if !state.exists(SessionKind::Call, &session_id) {
        return not_found();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(socket: WebSocket, session_id: String, state: RelayState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Two participants per call, no more
    let Some(socket_id) = state.attach(&session_id, tx) else {
        log::warn!("Session {} full, rejecting socket", session_id);
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: SESSION_FULL_CODE,
                reason: "Session full".into(),
            })))
            .await;
        return;
    };
    log::info!("Socket {} joined session {}", socket_id, session_id);

    // Outgoing: relayed frames and server notices
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Incoming: relay text frames verbatim to the other socket
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => state.relay(&session_id, socket_id, text),
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.detach(&session_id, socket_id);
    writer.abort();
    log::info!("Socket {} left session {}", socket_id, session_id);
}

/// Pull `file` and `chunk_index` out of an upload form.
async fn read_chunk(mut multipart: Multipart) -> Result<(u64, usize), RelayError> {
    let mut index = None;
    let mut size = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::BadRequest(e.to_string()))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| RelayError::BadRequest(e.to_string()))?;
                size = Some(data.len());
            }
            Some("chunk_index") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| RelayError::BadRequest(e.to_string()))?;
                let parsed = text
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| RelayError::BadRequest(format!("chunk_index: {}", e)))?;
                index = Some(parsed);
            }
            _ => {}
        }
    }
    match (index, size) {
        (Some(index), Some(size)) => Ok((index, size)),
        (None, _) => Err(RelayError::BadRequest("missing chunk_index".into())),
        (_, None) => Err(RelayError::BadRequest("missing file".into())),
    }
}

async fn upload_call_chunk(
    State(state): State<RelayState>,
    Path((session_id, participant_id)): Path<(String, String)>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, RelayError> {
    if !state.exists(SessionKind::Call, &session_id) {
        return Err(RelayError::NotFound);
    }
    let (index, size) = read_chunk(multipart).await?;
    state.record_chunk(SessionKind::Call, &session_id, &participant_id, index, size)?;
    log::info!("Chunk {} ({} bytes) from {}/{}", index, size, session_id, participant_id);
    Ok(Json(json!({ "status": "chunk_received", "size": size })))
}

async fn upload_practice_chunk(
    State(state): State<RelayState>,
    Path(session_id): Path<String>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, RelayError> {
    if !state.exists(SessionKind::Practice, &session_id) {
        return Err(RelayError::NotFound);
    }
    let (index, size) = read_chunk(multipart).await?;
    state.record_chunk(SessionKind::Practice, &session_id, PRACTICE_PARTICIPANT, index, size)?;
    log::info!("Practice chunk {} ({} bytes) for {}", index, size, session_id);
    Ok(Json(json!({ "status": "chunk_received", "size": size })))
}

async fn end_call(
    State(state): State<RelayState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, RelayError> {
    state.end(SessionKind::Call, &session_id)?;
    log::info!("Session {} ended, report pending", session_id);
    Ok(Json(json!({ "status": "processing_started" })))
}

async fn end_practice(
    State(state): State<RelayState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, RelayError> {
    state.end(SessionKind::Practice, &session_id)?;
    log::info!("Practice session {} ended, report pending", session_id);
    Ok(Json(json!({ "status": "processing_started" })))
}

async fn call_report(State(state): State<RelayState>, Path(session_id): Path<String>) -> Response {
    state.report(SessionKind::Call, &session_id)
}

async fn practice_report(
    State(state): State<RelayState>,
    Path(session_id): Path<String>,
) -> Response {
    state.report(SessionKind::Practice, &session_id)
}
