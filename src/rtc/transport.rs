//! Peer-connection port and its webrtc-rs implementation.
//!
//! The session logic only sees [`PeerTransport`] commands and the
//! [`TransportEvent`]s the transport pushes back; ICE, DTLS and RTP stay
//! inside the adapter.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8},
        APIBuilder,
    },
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_server::RTCIceServer},
    media::Sample,
    peer_connection::{
        configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        RTCPeerConnection,
    },
    rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

use super::types::{ConnectionState, IceCandidate, RemoteTrack, SdpType, SessionDescription};
use crate::error::PeerError;
use crate::media::{LocalStream, LocalTrack, TrackKind};

#[derive(Debug, Clone)]
pub enum TransportEvent {
    NegotiationNeeded,
    /// `None` marks the end of local gathering.
    IceCandidate(Option<IceCandidate>),
    RemoteTrack(RemoteTrack),
    ConnectionState(ConnectionState),
}

/// Event sink handed to a transport, tagged with the generation of the
/// session that owns it so late events from a replaced connection can be
/// told apart.
#[derive(Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

#[async_trait]
pub trait PeerTransport: Send {
    async fn add_track(&mut self, track: &LocalTrack, stream: &LocalStream) -> Result<(), PeerError>;
    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), PeerError>;
    /// Abandon a local offer that has not been answered.
    async fn rollback(&mut self) -> Result<(), PeerError>;
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn close(&mut self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, events: TransportEvents) -> Result<Box<dyn PeerTransport>, PeerError>;
}

pub struct WebRtcTransportFactory {
    ice_servers: Vec<String>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, events: TransportEvents) -> Result<Box<dyn PeerTransport>, PeerError> {
        // Create media engine
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // Create interceptor registry
        let mut registry = webrtc::interceptor::registry::Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: if self.ice_servers.is_empty() {
                vec![]
            } else {
                vec![RTCIceServer {
                    urls: self.ice_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        wire_callbacks(&pc, events);

        Ok(Box::new(WebRtcTransport {
            pc,
            forwarders: Vec::new(),
        }))
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, events: TransportEvents) {
    let generation = events.generation();

    let ev = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        ev.emit(TransportEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let ev = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let ev = ev.clone();
        Box::pin(async move {
            match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => {
                        ev.emit(TransportEvent::IceCandidate(Some(IceCandidate::from(init))));
                    }
                    Err(e) => log::warn!("Failed to serialize local candidate: {}", e),
                },
                None => {
                    ev.emit(TransportEvent::IceCandidate(None));
                }
            }
        })
    }));

    let ev = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let ev = ev.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            log::info!(
                "Connection {} received {} track: {}",
                generation,
                kind,
                track.codec().capability.mime_type
            );
            ev.emit(TransportEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            }));

            // Drain RTP so the receive buffers keep moving.
            let mut packets = 0u64;
            while track.read_rtp().await.is_ok() {
                packets += 1;
                if packets % 500 == 0 {
                    log::info!("Remote {} track: {} packets", kind, packets);
                }
            }
        })
    }));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        log::info!("Connection {} state: {}", generation, state);
        let mapped = match state {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        };
        events.emit(TransportEvent::ConnectionState(mapped));
        Box::pin(async {})
    }));
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    forwarders: Vec<JoinHandle<()>>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&mut self, track: &LocalTrack, stream: &LocalStream) -> Result<(), PeerError> {
        let codec = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            codec,
            track.id().to_owned(),
            stream.id().to_owned(),
        ));

        let rtp_sender = self
            .pc
            .add_track(Arc::clone(&rtc_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Read incoming RTCP so interceptors keep working.
        self.forwarders.push(tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        }));

        let Some(mut frames) = stream.subscribe() else {
            return Err(PeerError::Transport("local stream already stopped".into()));
        };
        let track_id = track.id().to_owned();
        self.forwarders.push(tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) if frame.track_id == track_id => {
                        let sample = Sample {
                            data: frame.data,
                            duration: frame.duration,
                            ..Default::default()
                        };
                        if let Err(e) = rtc_track.write_sample(&sample).await {
                            log::error!("Failed to write sample on {}: {}", track_id, e);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => log::warn!("Track {} skipped {} frames", track_id, n),
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        Ok(from_rtc(self.pc.create_offer(None).await?))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError> {
        Ok(from_rtc(self.pc.create_answer(None).await?))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), PeerError> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(rollback).await?;
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), PeerError> {
        for task in self.forwarders.drain(..) {
            task.abort();
        }
        self.pc.close().await?;
        Ok(())
    }
}

fn from_rtc(desc: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Offer,
    };
    SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    Ok(match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback
        }
    })
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}
