//! WebSocket signaling client

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::types::SignalMessage;
use crate::config::RetryPolicy;
use crate::error::SignalingError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub enum Outbound {
    Message(SignalMessage),
    Close,
}

#[derive(Debug)]
pub enum SignalEvent {
    Message(SignalMessage),
    /// The channel dropped and came back with our join re-sent. The relay
    /// told the other side we left, so whatever was negotiated before is
    /// void and the owner has to start a fresh peer connection.
    Reconnected,
    Closed { reason: String },
}

/// What gets re-sent after a reconnect. Only the join: descriptions and
/// candidates belong to a pairing the relay has already torn down.
#[derive(Default)]
struct RejoinLog {
    join: Option<SignalMessage>,
    dropped: usize,
}

impl RejoinLog {
    fn record(&mut self, msg: &SignalMessage) {
        if let SignalMessage::Join { .. } = msg {
            self.join = Some(msg.clone());
        }
    }

    fn messages(&self) -> Vec<SignalMessage> {
        self.join.iter().cloned().collect()
    }
}

/// Cloneable, fire-and-forget handle onto the outbound side of the channel.
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
    rejoin: Arc<Mutex<RejoinLog>>,
}

impl SignalingSender {
    fn new(tx: mpsc::UnboundedSender<Outbound>, open: Arc<AtomicBool>) -> Self {
        Self {
            tx,
            open,
            rejoin: Arc::new(Mutex::new(RejoinLog::default())),
        }
    }

    /// An always-open sender whose messages land on the returned receiver,
    /// for wiring sessions together in-process.
    pub fn pipe() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, Arc::new(AtomicBool::new(true))), rx)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Queue `msg`. Silently dropped while the channel is not open.
    pub fn send(&self, msg: SignalMessage) {
        let mut rejoin = self.rejoin.lock();
        rejoin.record(&msg);
        if !self.is_open() {
            rejoin.dropped += 1;
            log::debug!("Signaling not open, dropping {}", msg.kind());
            return;
        }
        drop(rejoin);
        if self.tx.send(Outbound::Message(msg)).is_err() {
            log::debug!("Signaling task gone, message dropped");
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Outbound::Close);
    }
}

pub struct SignalingClient {
    sender: SignalingSender,
    events: mpsc::UnboundedReceiver<SignalEvent>,
    task: Option<JoinHandle<()>>,
}

impl SignalingClient {
    /// Open the channel at `url` and announce `participant_id` with a join.
    pub async fn connect(
        url: &str,
        participant_id: &str,
        policy: RetryPolicy,
    ) -> Result<Self, SignalingError> {
        let (ws, _) = connect_async(url).await?;
        log::info!("Signaling connected: {}", url);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let sender = SignalingSender::new(out_tx, open.clone());

        sender.send(SignalMessage::Join {
            participant_id: participant_id.to_string(),
        });

        let task = tokio::spawn(run_connection(
            url.to_string(),
            ws,
            out_rx,
            ev_tx,
            open,
            sender.rejoin.clone(),
            policy,
        ));

        Ok(Self {
            sender,
            events: ev_rx,
            task: Some(task),
        })
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub fn send(&self, msg: SignalMessage) {
        self.sender.send(msg);
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    /// Next inbound event, in arrival order. `None` once the connection
    /// task has exited and every event was consumed.
    pub async fn recv(&mut self) -> Option<SignalEvent> {
        self.events.recv().await
    }

    /// Idempotent; safe on a channel that never opened or already dropped.
    pub fn close(&mut self) {
        if self.task.take().is_some() {
            log::info!("Closing signaling channel");
        }
        self.sender.close();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

enum Disconnect {
    Local,
    Remote(String),
    Error(String),
}

async fn run_connection(
    url: String,
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<SignalEvent>,
    open: Arc<AtomicBool>,
    rejoin: Arc<Mutex<RejoinLog>>,
    policy: RetryPolicy,
) {
    loop {
        match pump(&mut ws, &mut outbound, &events).await {
            Disconnect::Local => {
                let _ = ws.close(None).await;
                log::debug!("Signaling closed locally");
                break;
            }
            Disconnect::Remote(reason) => {
                log::info!("Signaling closed by server: {}", reason);
                let _ = events.send(SignalEvent::Closed { reason });
                break;
            }
            Disconnect::Error(e) => {
                open.store(false, Ordering::SeqCst);
                log::warn!("Signaling transport error: {}", e);

                let Some(mut fresh) = reconnect(&url, &policy, &mut outbound).await else {
                    let _ = events.send(SignalEvent::Closed {
                        reason: format!("transport error: {}", e),
                    });
                    break;
                };

                // Announce ourselves again on the new socket.
                let (backlog, dropped) = {
                    let mut rejoin = rejoin.lock();
                    (rejoin.messages(), std::mem::take(&mut rejoin.dropped))
                };
                if dropped > 0 {
                    log::info!("{} signaling message(s) dropped while offline", dropped);
                }
                let mut rejoined = true;
                for msg in backlog {
                    if let Err(e) = send_json(&mut fresh, &msg).await {
                        log::warn!("Rejoin failed: {}", e);
                        rejoined = false;
                        break;
                    }
                }
                ws = fresh;
                if rejoined {
                    open.store(true, Ordering::SeqCst);
                    let _ = events.send(SignalEvent::Reconnected);
                }
            }
        }
    }
    open.store(false, Ordering::SeqCst);
}

async fn pump(
    ws: &mut WsStream,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    events: &mpsc::UnboundedSender<SignalEvent>,
) -> Disconnect {
    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Message(msg)) => match send_json(ws, &msg).await {
                    Ok(()) => {}
                    // Unencodable messages are dropped; the socket is fine.
                    Err(SignalingError::Encode(e)) => {
                        log::error!("Failed to encode {}: {}", msg.kind(), e);
                    }
                    Err(e) => return Disconnect::Error(e.to_string()),
                },
                Some(Outbound::Close) | None => return Disconnect::Local,
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(msg) => {
                        if events.send(SignalEvent::Message(msg)).is_err() {
                            return Disconnect::Local;
                        }
                    }
                    Err(e) => log::warn!("Ignoring malformed signaling message: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "no reason".to_string());
                    return Disconnect::Remote(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Disconnect::Error(e.to_string()),
                None => return Disconnect::Error("stream ended".into()),
            },
        }
    }
}

async fn send_json(ws: &mut WsStream, msg: &SignalMessage) -> Result<(), SignalingError> {
    let json = serde_json::to_string(msg)?;
    ws.send(Message::Text(json)).await?;
    Ok(())
}

/// Reconnect with backoff. `max_attempts` counts the original connection,
/// so a policy of one attempt never reconnects. Gives up early when the
/// owner closes the channel.
async fn reconnect(
    url: &str,
    policy: &RetryPolicy,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Option<WsStream> {
    let retries = policy.max_attempts.saturating_sub(1);
    for attempt in 1..=retries {
        let delay = policy.delay_for(attempt);
        log::info!("Reconnecting signaling in {:?} (attempt {}/{})", delay, attempt, retries);

        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                out = outbound.recv() => match out {
                    // Offline; the fresh peer connection renegotiates.
                    Some(Outbound::Message(_)) => {}
                    Some(Outbound::Close) | None => return None,
                },
            }
        }

        match connect_async(url).await {
            Ok((ws, _)) => {
                log::info!("Signaling reconnected after {} attempt(s)", attempt);
                return Some(ws);
            }
            Err(e) => log::warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }
    None
}
