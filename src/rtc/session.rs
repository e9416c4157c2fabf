//! One peer connection's negotiation state machine.
//!
//! Out-of-turn messages are ignored rather than treated as errors: signaling
//! order is only guaranteed per direction, so an answer can race a
//! renegotiation and candidates can arrive before the description they
//! belong to.

use tokio::time::{Duration, Instant};

use super::signaling::SignalingSender;
use super::transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};
use super::types::{ConnectionState, IceCandidate, PeerState, RemoteStream, SessionDescription, SignalMessage};
use crate::error::PeerError;
use crate::media::LocalStream;

/// Offer/answer position of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// First remote track arrived.
    Connected(RemoteStream),
    StateChanged(PeerState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAction {
    Offered,
    /// We re-sent our own join so the other side drives the offer.
    Announced,
    Ignored,
}

/// The side with the lexicographically smaller participant id offers.
pub fn should_offer_to(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

pub struct PeerSession {
    local_id: String,
    remote_id: Option<String>,
    generation: u64,
    transport: Option<Box<dyn PeerTransport>>,
    signaling: SignalingSender,
    state: PeerState,
    phase: Phase,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    negotiation_queued: bool,
    may_offer: bool,
    announced: bool,
    remote_stream: Option<RemoteStream>,
    negotiation_started: Option<Instant>,
}

impl PeerSession {
    /// Create the connection and attach every local track.
    pub async fn open(
        factory: &dyn TransportFactory,
        events: TransportEvents,
        stream: &LocalStream,
        signaling: SignalingSender,
        local_id: &str,
    ) -> Result<Self, PeerError> {
        let generation = events.generation();
        let mut transport = factory.create(events).await?;
        for track in stream.tracks() {
            if let Err(e) = transport.add_track(track, stream).await {
                if let Err(close_err) = transport.close().await {
                    log::warn!("Error closing half-built peer connection: {}", close_err);
                }
                return Err(e);
            }
        }
        log::info!(
            "Peer session {} opened with {} local track(s)",
            generation,
            stream.tracks().len()
        );

        Ok(Self {
            local_id: local_id.to_string(),
            remote_id: None,
            generation,
            transport: Some(transport),
            signaling,
            state: PeerState::New,
            phase: Phase::Stable,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            negotiation_queued: false,
            may_offer: false,
            announced: false,
            remote_stream: None,
            negotiation_started: None,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn remote_participant(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// A `join` arrived from `remote_id`: offer if we win the tie-break,
    /// otherwise answer with our own join once so the other side offers.
    pub async fn on_remote_join(&mut self, remote_id: &str) -> JoinAction {
        if remote_id == self.local_id || self.state.is_terminal() {
            return JoinAction::Ignored;
        }
        if let Some(current) = self.remote_id.as_deref() {
            if current != remote_id && self.state != PeerState::New {
                log::warn!("Ignoring join from {} while paired with {}", remote_id, current);
                return JoinAction::Ignored;
            }
        }
        self.remote_id = Some(remote_id.to_string());

        if should_offer_to(&self.local_id, remote_id) {
            self.may_offer = true;
            if self.state == PeerState::New && self.phase == Phase::Stable {
                self.make_offer().await;
                return JoinAction::Offered;
            }
        } else if self.state == PeerState::New && !self.announced {
            self.announced = true;
            self.signaling.send(SignalMessage::Join {
                participant_id: self.local_id.clone(),
            });
            return JoinAction::Announced;
        }
        JoinAction::Ignored
    }

    pub async fn handle_offer(&mut self, offer: SessionDescription) {
        if self.state.is_terminal() || self.transport.is_none() {
            return;
        }

        if self.phase == Phase::HaveLocalOffer {
            let keep_ours = self
                .remote_id
                .as_deref()
                .map_or(true, |remote| should_offer_to(&self.local_id, remote));
            if keep_ours {
                log::info!("Offer glare: keeping our offer, ignoring remote one");
                return;
            }
            log::info!("Offer glare: rolling back our offer");
            if let Some(transport) = self.transport.as_mut() {
                if let Err(e) = transport.rollback().await {
                    log::warn!("Rollback failed: {}", e);
                    return;
                }
            }
            self.phase = Phase::Stable;
            self.negotiation_queued = true;
        }

        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.set_remote_description(offer).await {
            log::warn!("Rejected remote offer: {}", e);
            return;
        }
        self.remote_description_set = true;
        self.phase = Phase::HaveRemoteOffer;
        self.enter_negotiating();
        self.flush_candidates().await;

        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let answer = match transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("Failed to create answer: {}", e);
                return;
            }
        };
        if let Err(e) = transport.set_local_description(answer.clone()).await {
            log::warn!("Failed to apply local answer: {}", e);
            return;
        }
        self.phase = Phase::Stable;
        // Local tracks ride along in the answer.
        self.negotiation_queued = false;
        self.signaling.send(SignalMessage::Answer { answer });
    }

    /// Only meaningful while our own offer is outstanding; a no-op otherwise.
    pub async fn handle_answer(&mut self, answer: SessionDescription) {
        if self.phase != Phase::HaveLocalOffer || self.state.is_terminal() {
            log::debug!(
                "Ignoring answer in state {:?} ({:?})",
                self.state,
                self.phase
            );
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.set_remote_description(answer).await {
            log::warn!("Rejected remote answer: {}", e);
            return;
        }
        self.remote_description_set = true;
        self.phase = Phase::Stable;
        self.flush_candidates().await;

        if self.negotiation_queued {
            self.make_offer().await;
        }
    }

    /// `None` or an empty candidate line marks end-of-candidates and is
    /// ignored. Candidates ahead of the remote description are buffered.
    pub async fn handle_candidate(&mut self, candidate: Option<IceCandidate>) {
        let Some(candidate) = candidate.filter(|c| !c.is_end_of_candidates()) else {
            log::debug!("Remote end-of-candidates");
            return;
        };
        if self.state.is_terminal() {
            return;
        }
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return;
        }
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                log::warn!("Failed to add remote candidate: {}", e);
            }
        }
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Option<PeerEvent> {
        if self.state.is_terminal() {
            return None;
        }
        match event {
            TransportEvent::NegotiationNeeded => {
                if self.may_offer && self.phase == Phase::Stable {
                    self.make_offer().await;
                } else {
                    self.negotiation_queued = true;
                }
                None
            }
            TransportEvent::IceCandidate(Some(candidate)) => {
                self.signaling.send(SignalMessage::Candidate {
                    candidate: Some(candidate),
                });
                None
            }
            TransportEvent::IceCandidate(None) => {
                log::debug!("Local candidate gathering complete");
                None
            }
            TransportEvent::RemoteTrack(track) => {
                let stream = self.remote_stream.get_or_insert_with(|| RemoteStream {
                    id: track.stream_id.clone(),
                    tracks: Vec::new(),
                });
                stream.tracks.push(track);

                if self.state == PeerState::Connected {
                    return None;
                }
                self.state = PeerState::Connected;
                self.may_offer = true;
                self.negotiation_started = None;
                log::info!(
                    "Peer session {} connected to {}",
                    self.generation,
                    self.remote_id.as_deref().unwrap_or("unknown peer")
                );
                Some(PeerEvent::Connected(stream.clone()))
            }
            TransportEvent::ConnectionState(state) => {
                let next = match state {
                    ConnectionState::Disconnected => PeerState::Disconnected,
                    ConnectionState::Failed => PeerState::Failed,
                    ConnectionState::Closed => PeerState::Closed,
                    _ => return None,
                };
                if self.state == PeerState::New {
                    return None;
                }
                self.state = next;
                Some(PeerEvent::StateChanged(next))
            }
        }
    }

    /// When a session still negotiating should give up.
    pub fn negotiation_deadline(&self, timeout: Duration) -> Option<Instant> {
        match (self.state, self.negotiation_started) {
            (PeerState::Negotiating, Some(started)) => Some(started + timeout),
            _ => None,
        }
    }

    pub fn check_timeout(&mut self, timeout: Duration) -> Option<PeerEvent> {
        let deadline = self.negotiation_deadline(timeout)?;
        if Instant::now() < deadline {
            return None;
        }
        log::warn!("Negotiation timed out after {:?}", timeout);
        self.state = PeerState::Failed;
        Some(PeerEvent::StateChanged(PeerState::Failed))
    }

    /// Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                log::warn!("Error closing peer connection: {}", e);
            }
            log::info!("Peer session {} closed", self.generation);
        }
        self.pending_candidates.clear();
        if !self.state.is_terminal() {
            self.state = PeerState::Closed;
        }
    }

    async fn make_offer(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                log::warn!("Failed to create offer: {}", e);
                return;
            }
        };
        if let Err(e) = transport.set_local_description(offer.clone()).await {
            log::warn!("Failed to apply local offer: {}", e);
            return;
        }
        self.phase = Phase::HaveLocalOffer;
        self.negotiation_queued = false;
        self.enter_negotiating();
        self.signaling.send(SignalMessage::Offer { offer });
    }

    fn enter_negotiating(&mut self) {
        if self.state == PeerState::New {
            self.state = PeerState::Negotiating;
            self.negotiation_started = Some(Instant::now());
        }
    }

    async fn flush_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_candidates);
        log::debug!("Applying {} buffered candidate(s)", pending.len());
        if let Some(transport) = self.transport.as_mut() {
            for candidate in pending {
                if let Err(e) = transport.add_ice_candidate(candidate).await {
                    log::warn!("Failed to add buffered candidate: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, MediaSource, SyntheticSource};
    use crate::rtc::signaling::Outbound;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Log {
        calls: Vec<String>,
        candidates: Vec<String>,
        reject_remote: bool,
        reject_tracks: bool,
    }

    struct ScriptedTransport {
        log: Arc<Mutex<Log>>,
    }

    #[async_trait]
    impl PeerTransport for ScriptedTransport {
        async fn add_track(&mut self, track: &crate::media::LocalTrack, _: &LocalStream) -> Result<(), PeerError> {
            let mut log = self.log.lock();
            if log.reject_tracks {
                return Err(PeerError::Transport("no sender available".into()));
            }
            log.calls.push(format!("add_track {}", track.kind()));
            Ok(())
        }
        async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
            self.log.lock().calls.push("create_offer".into());
            Ok(SessionDescription::offer("local-offer"))
        }
        async fn create_answer(&mut self) -> Result<SessionDescription, PeerError> {
            self.log.lock().calls.push("create_answer".into());
            Ok(SessionDescription::answer("local-answer"))
        }
        async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
            self.log.lock().calls.push(format!("set_local {}", desc.sdp));
            Ok(())
        }
        async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
            let mut log = self.log.lock();
            if log.reject_remote {
                return Err(PeerError::InvalidState("malformed".into()));
            }
            log.calls.push(format!("set_remote {}", desc.sdp));
            Ok(())
        }
        async fn rollback(&mut self) -> Result<(), PeerError> {
            self.log.lock().calls.push("rollback".into());
            Ok(())
        }
        async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
            self.log.lock().candidates.push(candidate.candidate);
            Ok(())
        }
        async fn close(&mut self) -> Result<(), PeerError> {
            self.log.lock().calls.push("close".into());
            Ok(())
        }
    }

    struct ScriptedFactory {
        log: Arc<Mutex<Log>>,
    }

    #[async_trait]
    impl TransportFactory for ScriptedFactory {
        async fn create(&self, _events: TransportEvents) -> Result<Box<dyn PeerTransport>, PeerError> {
            Ok(Box::new(ScriptedTransport { log: self.log.clone() }))
        }
    }

    struct Harness {
        session: PeerSession,
        log: Arc<Mutex<Log>>,
        sent: mpsc::UnboundedReceiver<Outbound>,
        _stream: LocalStream,
    }

    impl Harness {
        fn sent(&mut self) -> Vec<SignalMessage> {
            let mut out = Vec::new();
            while let Ok(Outbound::Message(msg)) = self.sent.try_recv() {
                out.push(msg);
            }
            out
        }

        fn calls(&self) -> Vec<String> {
            self.log.lock().calls.clone()
        }
    }

    async fn harness(local_id: &str) -> Harness {
        let log = Arc::new(Mutex::new(Log::default()));
        let factory = ScriptedFactory { log: log.clone() };
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let stream = SyntheticSource::new()
            .acquire(&MediaConstraints::default())
            .await
            .unwrap();
        let (signaling, sent) = SignalingSender::pipe();
        let session = PeerSession::open(
            &factory,
            TransportEvents::new(1, events_tx),
            &stream,
            signaling,
            local_id,
        )
        .await
        .unwrap();
        Harness {
            session,
            log,
            sent,
            _stream: stream,
        }
    }

    fn candidate(line: &str) -> IceCandidate {
        IceCandidate {
            candidate: line.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn smaller_id_offers() {
        assert!(should_offer_to("alice", "bob"));
        assert!(!should_offer_to("bob", "alice"));
    }

    #[tokio::test]
    async fn join_from_larger_id_triggers_offer() {
        let mut h = harness("alice").await;
        assert_eq!(h.session.on_remote_join("bob").await, JoinAction::Offered);
        assert_eq!(h.session.state(), PeerState::Negotiating);
        assert_eq!(
            h.sent(),
            vec![SignalMessage::Offer {
                offer: SessionDescription::offer("local-offer")
            }]
        );

        // A repeated join while negotiating changes nothing.
        assert_eq!(h.session.on_remote_join("bob").await, JoinAction::Ignored);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn join_from_smaller_id_reannounces_once() {
        let mut h = harness("bob").await;
        assert_eq!(h.session.on_remote_join("alice").await, JoinAction::Announced);
        assert_eq!(h.session.on_remote_join("alice").await, JoinAction::Ignored);
        assert_eq!(
            h.sent(),
            vec![SignalMessage::Join {
                participant_id: "bob".into()
            }]
        );
        assert_eq!(h.session.state(), PeerState::New);
    }

    #[tokio::test]
    async fn own_join_echo_is_ignored() {
        let mut h = harness("alice").await;
        assert_eq!(h.session.on_remote_join("alice").await, JoinAction::Ignored);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn null_candidate_is_ignored() {
        let mut h = harness("alice").await;
        h.session.handle_candidate(None).await;
        h.session.handle_candidate(Some(candidate(""))).await;
        assert_eq!(h.session.pending_candidates(), 0);
        assert!(h.log.lock().candidates.is_empty());
    }

    #[tokio::test]
    async fn early_candidates_wait_for_remote_description() {
        let mut h = harness("bob").await;
        h.session.handle_candidate(Some(candidate("c1"))).await;
        h.session.handle_candidate(Some(candidate("c2"))).await;
        assert_eq!(h.session.pending_candidates(), 2);
        assert!(h.log.lock().candidates.is_empty());

        h.session.handle_offer(SessionDescription::offer("remote-offer")).await;
        assert_eq!(h.session.pending_candidates(), 0);
        assert_eq!(h.log.lock().candidates, vec!["c1", "c2"]);

        h.session.handle_candidate(Some(candidate("c3"))).await;
        assert_eq!(h.log.lock().candidates, vec!["c1", "c2", "c3"]);
        assert_eq!(
            h.sent(),
            vec![SignalMessage::Answer {
                answer: SessionDescription::answer("local-answer")
            }]
        );
    }

    #[tokio::test]
    async fn answer_without_outstanding_offer_is_noop() {
        let mut h = harness("alice").await;
        h.session.handle_answer(SessionDescription::answer("stray")).await;
        assert_eq!(h.session.state(), PeerState::New);
        assert!(!h.calls().iter().any(|c| c.starts_with("set_remote")));

        h.session.on_remote_join("bob").await;
        h.session.handle_answer(SessionDescription::answer("remote-answer")).await;
        let connected = h
            .session
            .handle_transport_event(TransportEvent::RemoteTrack(crate::rtc::types::RemoteTrack {
                id: "bob-audio".into(),
                stream_id: "bob-stream".into(),
                kind: crate::media::TrackKind::Audio,
            }))
            .await;
        assert!(matches!(connected, Some(PeerEvent::Connected(_))));

        let before = h.calls().len();
        h.session.handle_answer(SessionDescription::answer("late duplicate")).await;
        assert_eq!(h.calls().len(), before);
        assert_eq!(h.session.state(), PeerState::Connected);
    }

    #[tokio::test]
    async fn rejected_offer_leaves_session_usable() {
        let mut h = harness("bob").await;
        h.log.lock().reject_remote = true;
        h.session.handle_offer(SessionDescription::offer("garbage")).await;
        assert_eq!(h.session.state(), PeerState::New);
        assert!(h.sent().is_empty());

        h.log.lock().reject_remote = false;
        h.session.handle_offer(SessionDescription::offer("remote-offer")).await;
        assert_eq!(h.session.state(), PeerState::Negotiating);
        assert_eq!(h.sent().len(), 1);
    }

    #[tokio::test]
    async fn glare_smaller_id_keeps_its_offer() {
        let mut h = harness("alice").await;
        h.session.on_remote_join("bob").await;
        h.sent();

        h.session.handle_offer(SessionDescription::offer("bob-offer")).await;
        assert!(!h.calls().contains(&"rollback".to_string()));
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn glare_larger_id_rolls_back_and_answers() {
        let mut h = harness("bob").await;
        h.session.on_remote_join("alice").await;
        // Renegotiation need fires after the peer is known, e.g. on reconnect.
        h.session.may_offer = true;
        h.session.handle_transport_event(TransportEvent::NegotiationNeeded).await;
        h.sent();

        h.session.handle_offer(SessionDescription::offer("alice-offer")).await;
        let calls = h.calls();
        let rollback = calls.iter().position(|c| c == "rollback").unwrap();
        let applied = calls.iter().position(|c| c == "set_remote alice-offer").unwrap();
        assert!(rollback < applied);
        assert_eq!(
            h.sent(),
            vec![SignalMessage::Answer {
                answer: SessionDescription::answer("local-answer")
            }]
        );
    }

    #[tokio::test]
    async fn negotiation_needed_before_cue_is_deferred() {
        let mut h = harness("alice").await;
        h.session.handle_transport_event(TransportEvent::NegotiationNeeded).await;
        assert!(h.sent().is_empty());
        assert_eq!(h.session.state(), PeerState::New);
    }

    #[tokio::test]
    async fn local_candidates_are_signaled() {
        let mut h = harness("alice").await;
        h.session
            .handle_transport_event(TransportEvent::IceCandidate(Some(candidate("local-1"))))
            .await;
        h.session.handle_transport_event(TransportEvent::IceCandidate(None)).await;
        assert_eq!(
            h.sent(),
            vec![SignalMessage::Candidate {
                candidate: Some(candidate("local-1"))
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_negotiation_fails_after_timeout() {
        let mut h = harness("alice").await;
        h.session.on_remote_join("bob").await;
        let timeout = Duration::from_secs(30);
        assert!(h.session.check_timeout(timeout).is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            h.session.check_timeout(timeout),
            Some(PeerEvent::StateChanged(PeerState::Failed))
        );
        assert!(h.session.negotiation_deadline(timeout).is_none());
    }

    #[tokio::test]
    async fn failed_track_setup_closes_the_connection() {
        let log = Arc::new(Mutex::new(Log {
            reject_tracks: true,
            ..Log::default()
        }));
        let factory = ScriptedFactory { log: log.clone() };
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let stream = SyntheticSource::new()
            .acquire(&MediaConstraints::default())
            .await
            .unwrap();
        let (signaling, _sent) = SignalingSender::pipe();

        let result = PeerSession::open(
            &factory,
            TransportEvents::new(1, events_tx),
            &stream,
            signaling,
            "alice",
        )
        .await;
        assert!(matches!(result, Err(PeerError::Transport(_))));
        assert_eq!(log.lock().calls, vec!["close"]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut h = harness("alice").await;
        h.session.close().await;
        h.session.close().await;
        assert_eq!(h.session.state(), PeerState::Closed);
        assert_eq!(h.calls().iter().filter(|c| *c == "close").count(), 1);
    }
}
