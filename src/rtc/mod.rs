pub mod session;
pub mod signaling;
pub mod transport;
pub mod types;

pub use session::{should_offer_to, JoinAction, PeerEvent, PeerSession};
pub use signaling::{Outbound, SignalEvent, SignalingClient, SignalingSender};
pub use transport::{
    PeerTransport, TransportEvent, TransportEvents, TransportFactory, WebRtcTransport,
    WebRtcTransportFactory,
};
pub use types::*;
