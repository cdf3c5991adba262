pub mod relay;
pub mod websocket;

use crate::engine::IceCandidate;

pub use relay::{MessageRelay, RelaySignalingChannel, RemoteCommand, RemoteCommandHandler};
pub use websocket::{ServerState, WebSocketSignalingServer};

/// Transport for one offer, its trickle candidates and the returning answer.
///
/// Every method is idempotent and non-blocking. Sends are best-effort:
/// delivery failures are logged by the channel and never reach the caller.
pub trait SignalingChannel: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn send_offer(&self, sdp: &str);
    fn send_candidate(&self, candidate: &IceCandidate);
}

/// Receives what a channel decodes from its remote side.
pub trait SignalingDelegate: Send + Sync {
    fn on_answer(&self, sdp: String);
    fn on_candidate(&self, candidate: IceCandidate);
}

/// Receives listening-socket and connection events from the WebSocket server.
pub trait ServerStateObserver: Send + Sync {
    fn on_state_change(&self, state: &ServerState);
}
