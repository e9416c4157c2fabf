//! Call lifecycle: owns the local stream, recorder, uploads, signaling and
//! the current peer session, and is the only place teardown happens.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backend::{report_page, BackendClient};
use crate::config::{ClientConfig, SessionKind};
use crate::error::CallError;
use crate::media::{CaptureBackend, ChunkRecorder, LocalStream, MediaConstraints, MediaSource};
use crate::rtc::{
    PeerEvent, PeerSession, PeerState, RemoteStream, SignalEvent, SignalMessage, SignalingClient,
    TransportEvent, TransportEvents, TransportFactory,
};
use crate::upload::{ChunkUploader, UploadSummary};

/// What the UI shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Connecting,
    Connected,
    PeerLeft,
    Failed,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// The backend ended the session for everyone.
    SessionEnded { report_page: String },
    /// We ended it. `backend_notified` is false if the end-call request
    /// failed; local teardown happened regardless.
    EndedLocally {
        report_page: String,
        backend_notified: bool,
    },
}

impl CallOutcome {
    pub fn report_page(&self) -> &str {
        match self {
            CallOutcome::SessionEnded { report_page } => report_page,
            CallOutcome::EndedLocally { report_page, .. } => report_page,
        }
    }
}

#[derive(Debug)]
enum Command {
    EndCall,
}

/// Cloneable remote control for a running controller.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<CallStatus>,
}

impl CallHandle {
    /// Ask the controller to end the call. False once the controller is gone.
    pub fn end_call(&self) -> bool {
        self.commands.send(Command::EndCall).is_ok()
    }

    pub fn status(&self) -> CallStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    /// Resolve once the status equals `wanted`. False if the controller
    /// went away first.
    pub async fn wait_for(&self, wanted: CallStatus) -> bool {
        let mut rx = self.status.clone();
        let reached = rx.wait_for(|s| *s == wanted).await.is_ok();
        reached
    }
}

enum Wake {
    Command(Command),
    Signal(Option<SignalEvent>),
    Transport(u64, TransportEvent),
    NegotiationDeadline,
}

pub struct CallController {
    config: ClientConfig,
    session_id: String,
    participant_id: String,
    backend: BackendClient,
    factory: Arc<dyn TransportFactory>,

    stream: Option<LocalStream>,
    recorder: Option<ChunkRecorder>,
    uploads: Option<JoinHandle<UploadSummary>>,
    signaling: Option<SignalingClient>,
    peer: Option<PeerSession>,
    remote_stream: Option<RemoteStream>,
    peer_left: bool,

    generation: u64,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    transport_rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<CallStatus>,
    torn_down: bool,
}

impl CallController {
    /// Acquire media, start recording and uploading, and for calls open the
    /// signaling channel (which announces us with a join) and the first
    /// peer session.
    ///
    /// Media acquisition failure is fatal. So is failing to open signaling
    /// the first time; anything after that is recovered in `run`.
    pub async fn start(
        config: ClientConfig,
        session_id: &str,
        media: &dyn MediaSource,
        capture: &dyn CaptureBackend,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, CallError> {
        let participant_id = config
            .participant_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let backend = BackendClient::new(config.http_base())?;

        // Acquire local media
        let mut stream = media.acquire(&MediaConstraints::default()).await?;

        // Start recording; chunks flow straight to the uploader

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let recorder = match ChunkRecorder::start(&stream, capture, &config.recorder, chunk_tx) {
            Ok(recorder) => recorder,
            Err(e) => {
                stream.stop_tracks();
                return Err(e.into());
            }
        };
        let uploads = ChunkUploader::new(
            backend.clone(),
            config.session_kind,
            session_id,
            &participant_id,
            config.upload_retry.clone(),
        )
        .spawn(chunk_rx);

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(CallStatus::Connecting);

        let mut controller = Self {
            config,
            session_id: session_id.to_string(),
            participant_id,
            backend,
            factory,
            stream: Some(stream),
            recorder: Some(recorder),
            uploads: Some(uploads),
            signaling: None,
            peer: None,
            remote_stream: None,
            peer_left: false,
            generation: 0,
            transport_tx,
            transport_rx,
            commands_tx,
            commands_rx,
            status,
            torn_down: false,
        };

        log::info!(
            "Starting {:?} session {} as {}",
            controller.config.session_kind,
            controller.session_id,
            controller.participant_id
        );

        // Calls get signaling and a first peer session
        if controller.config.session_kind == SessionKind::Call {
            if let Err(e) = controller.open_signaling().await {
                controller.teardown().await;
                return Err(e);
            }
            controller.replace_peer().await;
        }
        Ok(controller)
    }

    async fn open_signaling(&mut self) -> Result<(), CallError> {
        let url = self.config.signaling_url(&self.session_id)?;
        let client = SignalingClient::connect(
            &url,
            &self.participant_id,
            self.config.signaling_retry.clone(),
        )
        .await?;
        self.signaling = Some(client);
        Ok(())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn status(&self) -> CallStatus {
        *self.status.borrow()
    }

    pub fn handle(&self) -> CallHandle {
        CallHandle {
            commands: self.commands_tx.clone(),
            status: self.status.subscribe(),
        }
    }

    /// The remote participant's media, once connected.
    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn peer_state(&self) -> Option<PeerState> {
        self.peer.as_ref().map(|p| p.state())
    }

    pub fn recorder_mime_type(&self) -> Option<&str> {
        self.recorder.as_ref().map(|r| r.mime_type())
    }

    /// Completion of the upload pipeline. Resolves after the recorder has
    /// stopped and every in-flight upload settled.
    pub fn take_uploads(&mut self) -> Option<JoinHandle<UploadSummary>> {
        self.uploads.take()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Drive the call until it ends. Only `session-ended` and a local end
    /// call get out of this loop; peer departure and connection failures
    /// are absorbed.
    pub async fn run(&mut self) -> CallOutcome {
        loop {
            if self.torn_down {
                return CallOutcome::EndedLocally {
                    report_page: report_page(self.config.session_kind, &self.session_id),
                    backend_notified: false,
                };
            }

            let deadline = self.negotiation_deadline();
            let wake = tokio::select! {
                Some(cmd) = self.commands_rx.recv() => Wake::Command(cmd),
                ev = next_signal(&mut self.signaling) => Wake::Signal(ev),
                Some((generation, ev)) = self.transport_rx.recv() => Wake::Transport(generation, ev),
                _ = sleep_until(deadline) => Wake::NegotiationDeadline,
            };

            match wake {
                Wake::Command(Command::EndCall) => return self.end_call().await,
                Wake::Signal(Some(SignalEvent::Message(msg))) => {
                    if let Some(outcome) = self.handle_signal(msg).await {
                        return outcome;
                    }
                }
                Wake::Signal(Some(SignalEvent::Reconnected)) => self.rejoin().await,
                Wake::Signal(Some(SignalEvent::Closed { reason })) => {
                    log::warn!("Signaling for {} closed: {}", self.session_id, reason);
                    self.signaling = None;
                    if self.status() != CallStatus::Connected {
                        self.set_status(CallStatus::Failed);
                    }
                }
                Wake::Signal(None) => {
                    self.signaling = None;
                }
                Wake::Transport(generation, ev) => self.handle_transport(generation, ev).await,
                Wake::NegotiationDeadline => {
                    let timeout = self.config.negotiation_timeout;
                    let event = self
                        .peer
                        .as_mut()
                        .zip(timeout)
                        .and_then(|(peer, timeout)| peer.check_timeout(timeout));
                    if let Some(event) = event {
                        self.handle_peer_event(event).await;
                    }
                }
            }
        }
    }

    async fn handle_signal(&mut self, msg: SignalMessage) -> Option<CallOutcome> {
        log::debug!("Signal {} for {}", msg.kind(), self.session_id);
        match msg {
            SignalMessage::Join { participant_id } => {
                if participant_id == self.participant_id {
                    return None;
                }
                // A join from the participant we are connected to means it
                // lost its channel and started over.
                let rejoined = self.peer.as_ref().is_some_and(|peer| {
                    peer.state() == PeerState::Connected
                        && peer.remote_participant() == Some(participant_id.as_str())
                });
                if rejoined {
                    log::info!("{} rejoined session {}", participant_id, self.session_id);
                    self.set_status(CallStatus::Connecting);
                    self.replace_peer().await;
                } else {
                    self.ensure_fresh_peer().await;
                }
                if let Some(peer) = self.peer.as_mut() {
                    peer.on_remote_join(&participant_id).await;
                }
            }
            SignalMessage::Offer { offer } => {
                self.ensure_fresh_peer().await;
                if let Some(peer) = self.peer.as_mut() {
                    peer.handle_offer(offer).await;
                }
            }
            SignalMessage::Answer { answer } => {
                if let Some(peer) = self.peer.as_mut() {
                    peer.handle_answer(answer).await;
                }
            }
            SignalMessage::Candidate { candidate } => {
                if let Some(peer) = self.peer.as_mut() {
                    peer.handle_candidate(candidate).await;
                }
            }
            SignalMessage::PeerLeft => {
                log::info!("Remote participant left session {}", self.session_id);
                self.peer_left = true;
                self.set_status(CallStatus::PeerLeft);
            }
            SignalMessage::SessionEnded => {
                log::info!("Session {} ended by backend", self.session_id);
                self.teardown().await;
                return Some(CallOutcome::SessionEnded {
                    report_page: report_page(self.config.session_kind, &self.session_id),
                });
            }
        }
        None
    }

    /// Signaling came back after a drop. The other side was told we left
    /// and will pair a new connection with our join, so ours starts over too.
    async fn rejoin(&mut self) {
        log::info!("Signaling for {} restored, renegotiating", self.session_id);
        if !self.peer_left {
            self.set_status(CallStatus::Connecting);
        }
        self.replace_peer().await;
    }

    async fn handle_transport(&mut self, generation: u64, ev: TransportEvent) {
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        if peer.generation() != generation {
            log::debug!("Dropping event from stale peer session {}", generation);
            return;
        }
        if let Some(event) = peer.handle_transport_event(ev).await {
            self.handle_peer_event(event).await;
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected(stream) => {
                log::info!(
                    "Session {} connected, remote stream {} with {} track(s)",
                    self.session_id,
                    stream.id,
                    stream.tracks.len()
                );
                self.remote_stream = Some(stream);
                self.peer_left = false;
                self.set_status(CallStatus::Connected);
            }
            PeerEvent::StateChanged(state) if state.is_terminal() => {
                log::warn!("Peer connection for {} went {:?}, dropping it", self.session_id, state);
                self.drop_peer().await;
                if !self.peer_left {
                    let status = if state == PeerState::Failed {
                        CallStatus::Failed
                    } else {
                        CallStatus::Connecting
                    };
                    self.set_status(status);
                }
            }
            PeerEvent::StateChanged(_) => {}
        }
    }

    /// Make sure the next negotiation runs on a usable peer session: a new
    /// one if there is none, the old one died, or its participant left.
    async fn ensure_fresh_peer(&mut self) {
        let stale = match self.peer.as_ref() {
            None => true,
            Some(peer) => peer.state().is_terminal() || self.peer_left,
        };
        if stale {
            self.replace_peer().await;
        }
    }

    async fn replace_peer(&mut self) {
        self.drop_peer().await;
        self.peer_left = false;

        let (Some(stream), Some(signaling)) = (self.stream.as_ref(), self.signaling.as_ref()) else {
            return;
        };
        self.generation += 1;
        let events = TransportEvents::new(self.generation, self.transport_tx.clone());
        match PeerSession::open(
            self.factory.as_ref(),
            events,
            stream,
            signaling.sender(),
            &self.participant_id,
        )
        .await
        {
            Ok(peer) => self.peer = Some(peer),
            Err(e) => log::error!("Failed to open peer connection for {}: {}", self.session_id, e),
        }
    }

    async fn drop_peer(&mut self) {
        if let Some(mut peer) = self.peer.take() {
            peer.close().await;
        }
        self.remote_stream = None;
    }

    fn negotiation_deadline(&self) -> Option<Instant> {
        let timeout = self.config.negotiation_timeout?;
        self.peer.as_ref()?.negotiation_deadline(timeout)
    }

    /// Tell the backend, then tear down whether or not that worked.
    pub async fn end_call(&mut self) -> CallOutcome {
        let backend_notified = match self
            .backend
            .end_session(self.config.session_kind, &self.session_id)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                log::warn!("End-call request for {} failed: {}", self.session_id, e);
                false
            }
        };
        self.teardown().await;
        CallOutcome::EndedLocally {
            report_page: report_page(self.config.session_kind, &self.session_id),
            backend_notified,
        }
    }

    /// Release everything the call holds: recorder, peer connection, local
    /// tracks, signaling. Idempotent.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        log::info!("Tearing down session {}", self.session_id);

        // Stop recorder
        if let Some(mut recorder) = self.recorder.take() {
            recorder.stop();
        }

        // Close peer connection
        self.drop_peer().await;

        // Stop local tracks
        if let Some(mut stream) = self.stream.take() {
            stream.stop_tracks();
        }

        // Close signaling
        if let Some(mut signaling) = self.signaling.take() {
            signaling.close();
        }
        self.set_status(CallStatus::Ended);
    }

    fn set_status(&self, status: CallStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            log::info!("Call status: {:?} -> {:?}", current, status);
            *current = status;
            true
        });
    }
}

async fn next_signal(signaling: &mut Option<SignalingClient>) -> Option<SignalEvent> {
    match signaling {
        Some(client) => client.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
