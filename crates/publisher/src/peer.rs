//! [`MediaEngine`] over webrtc-rs: one send-only H.264 video track per peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine as RtcMediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::IceServer;
use crate::engine::{
    EncodingParams, IceCandidate, IceConnectionState, MediaEngine, PeerConnection, PeerEvent,
    PeerEventSink, VideoFrame,
};
use crate::logging;

/// Bumped for every peer so log lines from overlapping sessions can be told
/// apart.
static PEER_GENERATION: AtomicU64 = AtomicU64::new(0);

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Creates webrtc-rs peer connections with a fixed ICE server list.
pub struct WebRtcEngine {
    ice_servers: Vec<IceServer>,
}

impl WebRtcEngine {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_peer(&self, events: PeerEventSink) -> anyhow::Result<Arc<dyn PeerConnection>> {
        let peer = WebRtcPeer::new(&self.ice_servers, events)
            .await
            .context("Failed to create WebRTC peer")?;
        Ok(Arc::new(peer))
    }
}

pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    clock: Mutex<SampleClock>,
    generation: u64,
}

impl WebRtcPeer {
    pub async fn new(ice_servers: &[IceServer], events: PeerEventSink) -> anyhow::Result<Self> {
        let mut media_engine = RtcMediaEngine::default();

        // H.264 only. Viewers negotiating VP8 would get no video.
        let h264_feedback = vec![
            RTCPFeedback {
                typ: "goog-remb".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "ccm".into(),
                parameter: "fir".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "pli".into(),
            },
            RTCPFeedback {
                typ: "transport-cc".into(),
                parameter: "".into(),
            },
        ];
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: H264_FMTP.to_string(),
                    rtcp_feedback: h264_feedback,
                },
                payload_type: 125,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: H264_FMTP.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "vidcast".to_string(),
        ));

        let generation = PEER_GENERATION.fetch_add(1, Ordering::Relaxed) + 1;
        // webrtc-rs invokes callbacks on its own tasks; carry our dispatcher.
        let dispatch = logging::current();

        let ice_events = Arc::clone(&events);
        let ice_dispatch = dispatch.clone();
        peer_connection.on_ice_connection_state_change(Box::new(move |state| {
            tracing::dispatcher::with_default(&ice_dispatch, || {
                debug!(generation, ?state, "ICE connection state changed");
                if let Some(state) = map_ice_state(state) {
                    ice_events(PeerEvent::IceState(state));
                }
            });
            Box::pin(async {})
        }));

        let candidate_events = Arc::clone(&events);
        let candidate_dispatch = dispatch.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            tracing::dispatcher::with_default(&candidate_dispatch, || {
                let Some(c) = candidate else {
                    debug!(generation, "ICE gathering finished");
                    return;
                };
                match c.to_json() {
                    Ok(json) => candidate_events(PeerEvent::Candidate(IceCandidate::new(
                        json.candidate,
                        json.sdp_mid,
                        json.sdp_mline_index,
                    ))),
                    Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                }
            });
            Box::pin(async {})
        }));

        let gathering_dispatch = dispatch.clone();
        peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
            tracing::dispatcher::with_default(&gathering_dispatch, || {
                debug!(generation, ?state, "ICE gathering state changed");
            });
            Box::pin(async {})
        }));

        let signaling_dispatch = dispatch;
        peer_connection.on_signaling_state_change(Box::new(move |state| {
            tracing::dispatcher::with_default(&signaling_dispatch, || {
                debug!(generation, ?state, "Signaling state changed");
            });
            Box::pin(async {})
        }));

        info!(generation, "WebRTC peer connection created");

        Ok(Self {
            peer_connection,
            video_track,
            clock: Mutex::new(SampleClock::new(0)),
            generation,
        })
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn log_sdp(label: &'static str, sdp: &str) {
    for line in sdp.lines() {
        if line.starts_with("m=")
            || line.starts_with("a=rtpmap:")
            || line.starts_with("a=fmtp:")
            || line.starts_with("a=group:")
            || line.starts_with("a=mid:")
            || line.starts_with("a=sendonly")
        {
            debug!(sdp_line = line, "{label} SDP");
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_video_track(&self) -> anyhow::Result<()> {
        let transceiver = self
            .peer_connection
            .add_transceiver_from_track(
                Arc::clone(&self.video_track) as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .context("Failed to add video transceiver")?;

        // RTCP must be read for the interceptors (NACK, REMB) to run.
        let sender = transceiver.sender().await;
        let generation = self.generation;
        logging::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                trace!(generation, count = packets.len(), "RTCP received");
            }
        });
        Ok(())
    }

    async fn create_offer(&self) -> anyhow::Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        log_sdp("Offer", &offer.sdp);
        Ok(offer.sdp)
    }

    async fn set_local_offer(&self, sdp: &str) -> anyhow::Result<()> {
        let offer =
            RTCSessionDescription::offer(sdp.to_string()).context("Failed to parse SDP offer")?;
        self.peer_connection
            .set_local_description(offer)
            .await
            .context("Failed to set local description")?;
        Ok(())
    }

    async fn set_remote_answer(&self, sdp: &str) -> anyhow::Result<()> {
        log_sdp("Answer", sdp);
        let answer =
            RTCSessionDescription::answer(sdp.to_string()).context("Failed to parse SDP answer")?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .context("Failed to set remote description")?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        debug!(candidate = %candidate.sdp, "Adding remote ICE candidate");
        let init = RTCIceCandidateInit {
            candidate: candidate.sdp,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")?;
        Ok(())
    }

    async fn apply_encoding(&self, params: &EncodingParams) -> anyhow::Result<()> {
        // Frames reach this track already encoded, so these limits belong to
        // whoever encodes them. The framerate cap is only watched here.
        self.clock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_max_fps(params.max_framerate_fps);
        info!(
            generation = self.generation,
            max_bitrate_bps = params.max_bitrate_bps,
            min_bitrate_bps = params.min_bitrate_bps,
            max_framerate_fps = params.max_framerate_fps,
            scale_resolution_down_by = ?params.scale_resolution_down_by,
            "Encoding parameters applied"
        );
        Ok(())
    }

    async fn write_frame(&self, frame: VideoFrame) -> anyhow::Result<()> {
        let tick = self
            .clock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tick(frame.timestamp, frame.duration);
        if tick.exceeded_cap {
            warn!(
                generation = self.generation,
                interval = ?tick.duration,
                "Source is running above the framerate cap, sending every frame anyway"
            );
        }
        let duration = tick.duration;
        self.video_track
            .write_sample(&webrtc::media::Sample {
                data: frame.data,
                duration,
                ..Default::default()
            })
            .await
            .context("Failed to write video sample")?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;
        info!(generation = self.generation, "Peer connection closed");
        Ok(())
    }
}

/// Turns frame timestamps into sample durations. Frames are already encoded,
/// so none is ever dropped: a missing frame would corrupt every frame that
/// references it until the next IDR. Running above the cap is only reported.
#[derive(Debug)]
pub(crate) struct SampleClock {
    min_interval: Option<Duration>,
    last: Option<Duration>,
    over_cap: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Tick {
    pub duration: Duration,
    /// Set on the first frame of a stretch above the cap.
    pub exceeded_cap: bool,
}

impl SampleClock {
    pub(crate) fn new(max_fps: u32) -> Self {
        let mut clock = Self {
            min_interval: None,
            last: None,
            over_cap: false,
        };
        clock.set_max_fps(max_fps);
        clock
    }

    /// 0 disables the cap.
    pub(crate) fn set_max_fps(&mut self, max_fps: u32) {
        self.min_interval =
            (max_fps > 0).then(|| Duration::from_nanos(1_000_000_000 / u64::from(max_fps)));
        self.over_cap = false;
    }

    pub(crate) fn tick(&mut self, timestamp: Duration, fallback: Duration) -> Tick {
        // No previous frame, or the source restarted its clock.
        let Some(last) = self.last.replace(timestamp).filter(|&last| timestamp > last) else {
            return Tick {
                duration: fallback,
                exceeded_cap: false,
            };
        };
        let elapsed = timestamp - last;

        // 10% tolerance so jittery sources at exactly the cap are not reported.
        let over = self
            .min_interval
            .is_some_and(|min| elapsed < min.mul_f64(0.9));
        let exceeded_cap = over && !self.over_cap;
        self.over_cap = over;
        Tick {
            duration: elapsed,
            exceeded_cap,
        }
    }
}
