pub mod config;
pub mod engine;
pub mod error;
mod logging;
pub mod peer;
pub mod router;
pub mod session;
pub mod signaling;
pub mod source;

pub use config::{IceServer, SessionConfig, SignalingMode, load_config};
pub use engine::{
    EncodingParams, IceCandidate, IceConnectionState, MediaEngine, PeerConnection, PeerEvent,
    PeerEventSink, VideoFrame,
};
pub use error::{ErrorKind, PublishError};
pub use session::{Publisher, ServerStatus, SessionState};
