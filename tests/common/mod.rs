#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;

use callcapture::config::{ClientConfig, RecorderConfig, RetryPolicy, SessionKind};
use callcapture::error::PeerError;
use callcapture::media::{LocalStream, LocalTrack, TrackKind};
use callcapture::relay::{self, RelayState};
use callcapture::rtc::{
    IceCandidate, PeerTransport, RemoteTrack, SdpType, SessionDescription, TransportEvent,
    TransportEvents, TransportFactory,
};

/// What every fake transport built by one factory did.
#[derive(Default, Debug)]
pub struct FakeStats {
    pub created: usize,
    pub closed: usize,
    pub remote_candidates: Vec<String>,
    pub rollbacks: usize,
}

/// Stand-in for the peer-connection black box. Descriptions carry the
/// local track list so the other side can "receive" those tracks when it
/// applies the description.
pub struct FakeTransport {
    name: String,
    events: TransportEvents,
    stats: Arc<Mutex<FakeStats>>,
    tracks: Vec<(TrackKind, String, String)>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    seen_remote_tracks: Vec<String>,
    candidates_sent: u32,
}

impl FakeTransport {
    fn describe(&self, sdp_type: SdpType) -> SessionDescription {
        let mut sdp = format!("v=fake\r\no={}\r\n", self.name);
        for (kind, id, stream) in &self.tracks {
            sdp.push_str(&format!("a=track:{} {} {}\r\n", kind, id, stream));
        }
        SessionDescription { sdp_type, sdp }
    }
}

fn parse_tracks(sdp: &str) -> Option<Vec<RemoteTrack>> {
    let mut lines = sdp.lines();
    if lines.next()? != "v=fake" {
        return None;
    }
    let mut tracks = Vec::new();
    for line in lines {
        let Some(rest) = line.strip_prefix("a=track:") else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let kind = match parts.next()? {
            "audio" => TrackKind::Audio,
            "video" => TrackKind::Video,
            _ => return None,
        };
        tracks.push(RemoteTrack {
            id: parts.next()?.to_string(),
            stream_id: parts.next()?.to_string(),
            kind,
        });
    }
    Some(tracks)
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&mut self, track: &LocalTrack, stream: &LocalStream) -> Result<(), PeerError> {
        self.tracks
            .push((track.kind(), track.id().to_string(), stream.id().to_string()));
        self.events.emit(TransportEvent::NegotiationNeeded);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        Ok(self.describe(SdpType::Offer))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError> {
        match &self.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => Ok(self.describe(SdpType::Answer)),
            _ => Err(PeerError::InvalidState("no remote offer".into())),
        }
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        self.local = Some(desc);
        self.candidates_sent += 1;
        self.events.emit(TransportEvent::IceCandidate(Some(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.candidates_sent,
                40000 + self.candidates_sent
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })));
        self.events.emit(TransportEvent::IceCandidate(None));
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        let tracks = parse_tracks(&desc.sdp)
            .ok_or_else(|| PeerError::InvalidState("unparseable description".into()))?;
        self.remote = Some(desc);
        for track in tracks {
            if !self.seen_remote_tracks.contains(&track.id) {
                self.seen_remote_tracks.push(track.id.clone());
                self.events.emit(TransportEvent::RemoteTrack(track));
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), PeerError> {
        self.local = None;
        self.stats.lock().rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.remote.is_none() {
            return Err(PeerError::InvalidState("no remote description".into()));
        }
        self.stats.lock().remote_candidates.push(candidate.candidate);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), PeerError> {
        self.stats.lock().closed += 1;
        Ok(())
    }
}

#[derive(Clone)]
pub struct FakeFactory {
    name: String,
    pub stats: Arc<Mutex<FakeStats>>,
    latest: Arc<Mutex<Option<TransportEvents>>>,
}

impl FakeFactory {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stats: Arc::new(Mutex::new(FakeStats::default())),
            latest: Arc::new(Mutex::new(None)),
        }
    }

    /// Raise `event` as if the most recently created transport reported it.
    pub fn emit_on_latest(&self, event: TransportEvent) -> bool {
        match self.latest.lock().as_ref() {
            Some(events) => events.emit(event),
            None => false,
        }
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self, events: TransportEvents) -> Result<Box<dyn PeerTransport>, PeerError> {
        self.stats.lock().created += 1;
        *self.latest.lock() = Some(events.clone());
        Ok(Box::new(FakeTransport {
            name: self.name.clone(),
            events,
            stats: self.stats.clone(),
            tracks: Vec::new(),
            local: None,
            remote: None,
            seen_remote_tracks: Vec::new(),
            candidates_sent: 0,
        }))
    }
}

/// Run the development relay on an ephemeral localhost port.
pub async fn spawn_relay(analysis_delay: Duration) -> (String, RelayState) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = RelayState::new(analysis_delay);
    let served = state.clone();
    tokio::spawn(async move {
        relay::serve(listener, served).await.unwrap();
    });
    (format!("http://{}", addr), state)
}

/// TCP pass-through to the relay whose connections can all be cut at once,
/// like a flaky network between one client and the backend.
pub struct Link {
    connections: Arc<Mutex<Vec<AbortHandle>>>,
}

impl Link {
    /// Drop every connection currently carried. New ones still get through.
    pub fn cut(&self) -> usize {
        let connections = std::mem::take(&mut *self.connections.lock());
        for connection in &connections {
            connection.abort();
        }
        connections.len()
    }
}

pub async fn spawn_link(upstream_url: &str) -> (String, Link) {
    let upstream = upstream_url.trim_start_matches("http://").to_string();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(Mutex::new(Vec::new()));
    let tracked = connections.clone();
    tokio::spawn(async move {
        while let Ok((mut inbound, _)) = listener.accept().await {
            let upstream = upstream.clone();
            let task = tokio::spawn(async move {
                if let Ok(mut outbound) = TcpStream::connect(&upstream).await {
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                }
            });
            tracked.lock().push(task.abort_handle());
        }
    });
    (format!("http://{}", addr), Link { connections })
}

/// Poll `done` until it holds, panicking after ten seconds.
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
    }
}

pub fn test_config(server_url: &str, participant: &str, kind: SessionKind) -> ClientConfig {
    ClientConfig {
        server_url: server_url.to_string(),
        session_kind: kind,
        participant_id: Some(participant.to_string()),
        recorder: RecorderConfig {
            timeslice: Duration::from_millis(400),
            ..RecorderConfig::default()
        },
        upload_retry: fast_retry(),
        signaling_retry: RetryPolicy::no_retry(),
        negotiation_timeout: None,
        ice_servers: Vec::new(),
    }
}
