use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::engine::EncodingParams;
use crate::signaling::relay::MessageRelay;

pub use vidcast_protocol::{
    IceConfig, LoggingConfig, PublisherConfig, SignalingConfig, SignalingModeKind, VideoConfig,
};

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub fn load_config(path: &Path) -> Result<PublisherConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(PublisherConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: PublisherConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// How offers, answers and candidates travel between this publisher and its
/// viewers.
#[derive(Clone, Default)]
pub enum SignalingMode {
    /// Built-in WebSocket server on `SessionConfig::port`.
    #[default]
    LocalWebSocket,
    /// A remote peer reached through a store-and-forward message relay.
    RelayChannel(Arc<dyn MessageRelay>),
    /// No channel: the caller reads the offer and candidates from the
    /// session's observables and delivers answers itself.
    Custom,
}

impl fmt::Debug for SignalingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalWebSocket => f.write_str("LocalWebSocket"),
            Self::RelayChannel(_) => f.write_str("RelayChannel(..)"),
            Self::Custom => f.write_str("Custom"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Immutable per-session settings, fixed when the session is built.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_bitrate_bps: u32,
    pub min_bitrate_bps: u32,
    pub max_framerate_fps: u32,
    pub scale_resolution_down_by: Option<f64>,
    /// Bind address and port of the WebSocket channel
    pub bind: String,
    pub port: u16,
    pub ice_servers: Vec<IceServer>,
    pub logging_enabled: bool,
    pub signaling: SignalingMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_publisher_config(&PublisherConfig::default(), SignalingMode::default())
    }
}

impl SessionConfig {
    pub fn from_publisher_config(config: &PublisherConfig, signaling: SignalingMode) -> Self {
        let mut ice_servers = Vec::new();
        if !config.ice.stun_urls.is_empty() {
            ice_servers.push(IceServer {
                urls: config.ice.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if !config.ice.turn_urls.is_empty() {
            ice_servers.push(IceServer {
                urls: config.ice.turn_urls.clone(),
                username: config.ice.turn_username.clone(),
                credential: config.ice.turn_credential.clone(),
            });
        }

        Self {
            max_bitrate_bps: config.video.max_bitrate_bps,
            min_bitrate_bps: config.video.min_bitrate_bps,
            max_framerate_fps: config.video.max_framerate_fps,
            scale_resolution_down_by: config.video.scale_resolution_down_by,
            bind: config.signaling.bind.clone(),
            port: config.signaling.port,
            ice_servers,
            logging_enabled: config.logging.enabled,
            signaling,
        }
    }

    pub fn encoding(&self) -> EncodingParams {
        EncodingParams {
            max_bitrate_bps: self.max_bitrate_bps,
            min_bitrate_bps: self.min_bitrate_bps,
            max_framerate_fps: self.max_framerate_fps,
            scale_resolution_down_by: self.scale_resolution_down_by,
        }
    }
}
