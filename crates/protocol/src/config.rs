use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which signaling channel the binary wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingModeKind {
    /// Built-in WebSocket server with offer/candidate replay
    #[default]
    Websocket,
    /// Remote peer reached through a message relay supplied by the host app
    Relay,
    /// The embedding application moves offers and candidates itself
    Custom,
}

impl std::str::FromStr for SignalingModeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "websocket" | "ws" => Ok(Self::Websocket),
            "relay" => Ok(Self::Relay),
            "custom" => Ok(Self::Custom),
            other => Err(format!(
                "unknown signaling mode '{other}' (expected websocket, relay or custom)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    #[serde(default)]
    pub mode: SignalingModeKind,
    /// Bind address of the WebSocket signaling server
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Listen port of the WebSocket signaling server (0 = pick any free port)
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Upper encoding bitrate in bits per second
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate_bps: u32,
    /// Lower encoding bitrate in bits per second
    #[serde(default = "default_min_bitrate")]
    pub min_bitrate_bps: u32,
    /// Frames above this rate are dropped before the encoder
    #[serde(default = "default_max_framerate")]
    pub max_framerate_fps: u32,
    /// Resolution divisor applied by the sender (unset = full resolution)
    pub scale_resolution_down_by: Option<f64>,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// When false, the library emits no diagnostics at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            mode: SignalingModeKind::default(),
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            max_bitrate_bps: default_max_bitrate(),
            min_bitrate_bps: default_min_bitrate(),
            max_framerate_fps: default_max_framerate(),
            scale_resolution_down_by: None,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_level(),
        }
    }
}

impl PublisherConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the publisher should not
    /// start) or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Bitrate ---
        if self.video.max_bitrate_bps < self.video.min_bitrate_bps {
            issues.push(format!(
                "ERROR: video.max_bitrate_bps ({}) is below video.min_bitrate_bps ({}).",
                self.video.max_bitrate_bps, self.video.min_bitrate_bps
            ));
        }
        if self.video.max_bitrate_bps > 100_000_000 {
            issues.push(format!(
                "WARNING: video.max_bitrate_bps is {} ({} Mbps), which is unusually high \
                 for a single camera stream.",
                self.video.max_bitrate_bps,
                self.video.max_bitrate_bps / 1_000_000
            ));
        }

        // --- Framerate ---
        if self.video.max_framerate_fps == 0 || self.video.max_framerate_fps > 240 {
            issues.push(format!(
                "ERROR: video.max_framerate_fps must be between 1 and 240, got {}.",
                self.video.max_framerate_fps
            ));
        }

        // --- Downscale ---
        if let Some(scale) = self.video.scale_resolution_down_by {
            if scale.is_nan() || scale < 1.0 {
                issues.push(format!(
                    "ERROR: video.scale_resolution_down_by must be at least 1.0, got {scale}."
                ));
            }
        }

        // --- Signaling ---
        if self.signaling.mode == SignalingModeKind::Relay {
            issues.push(
                "WARNING: signaling.mode = \"relay\" needs a message relay supplied by the \
                 embedding application; the standalone binary cannot provide one."
                    .to_string(),
            );
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'.",
                    url
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_bitrate() -> u32 {
    50_000_000
}
fn default_min_bitrate() -> u32 {
    1_000_000
}
fn default_max_framerate() -> u32 {
    30
}
fn default_true() -> bool {
    true
}
fn default_level() -> String {
    "info".to_string()
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
