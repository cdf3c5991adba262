//! Seam between the session and the media engine that does the actual
//! encoding, packetization and ICE transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::source::Rotation;

/// Connectivity state reported by the engine's ICE agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// A trickle ICE candidate in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub sdp: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(sdp: impl Into<String>, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_mid,
            sdp_mline_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    IceState(IceConnectionState),
    Candidate(IceCandidate),
}

/// Callback the engine invokes for every peer event. It may be called from
/// any thread.
pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// Numeric limits passed through to the outgoing video sender.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodingParams {
    pub max_bitrate_bps: u32,
    pub min_bitrate_bps: u32,
    pub max_framerate_fps: u32,
    pub scale_resolution_down_by: Option<f64>,
}

/// One encoded video frame (H.264 Annex-B access unit).
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Bytes,
    /// Capture time relative to the start of the stream
    pub timestamp: Duration,
    pub duration: Duration,
    pub rotation: Rotation,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a fresh peer connection. `events` receives ICE state changes
    /// and locally gathered candidates for this connection only.
    async fn create_peer(&self, events: PeerEventSink) -> anyhow::Result<Arc<dyn PeerConnection>>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach the outgoing video track as send-only.
    async fn add_video_track(&self) -> anyhow::Result<()>;
    /// Create an offer that receives neither audio nor video.
    async fn create_offer(&self) -> anyhow::Result<String>;
    async fn set_local_offer(&self, sdp: &str) -> anyhow::Result<()>;
    async fn set_remote_answer(&self, sdp: &str) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    async fn apply_encoding(&self, params: &EncodingParams) -> anyhow::Result<()>;
    async fn write_frame(&self, frame: VideoFrame) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}
