pub mod annexb;
pub mod camera;
pub mod external;
pub mod h264;

use tokio::sync::{mpsc, watch};

use crate::engine::VideoFrame;
use crate::error::PublishError;

pub use annexb::AnnexBFileSource;
pub use camera::{CameraFrameSource, CameraOptions, CaptureDevice, RawFrame};
pub use external::ExternalFrameSource;

/// Where a source delivers frames. Sources `try_send` and drop on a full
/// channel so a slow encoder never stalls capture.
pub type FrameSink = mpsc::Sender<VideoFrame>;

pub trait FrameSource: Send + Sync {
    fn start(&self, sink: FrameSink) -> Result<(), PublishError>;
    fn stop(&self);
    fn is_running(&self) -> bool;

    /// Camera controls, when the source is a controllable camera.
    fn camera(&self) -> Option<&dyn CameraControl> {
        None
    }
}

/// Device controls of a camera source. Reconfiguration runs on the source's
/// media I/O thread, one request at a time.
pub trait CameraControl: Send + Sync {
    /// Flip between front and back.
    fn switch_position(&self);
    fn set_mirrored(&self, mirrored: bool);
    /// Switch the back camera's optical type, blocking until the device is
    /// reconfigured or the wait times out. Returns the active type on
    /// success, `None` on rejection, failure or timeout.
    fn select_optical_type(&self, optical: OpticalType) -> Option<OpticalType>;
    /// Cycle to the next available back optical type.
    fn next_optical_type(&self) -> Option<OpticalType>;
    fn set_orientation(&self, orientation: Orientation);
    fn status(&self) -> watch::Receiver<CameraStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraPosition {
    Front,
    Back,
}

impl CameraPosition {
    pub fn flipped(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpticalType {
    WideAngle,
    Telephoto,
    UltraWide,
}

impl OpticalType {
    pub const ALL: [OpticalType; 3] = [Self::WideAngle, Self::Telephoto, Self::UltraWide];

    /// Identifier used on the wire.
    pub fn raw(self) -> &'static str {
        match self {
            Self::WideAngle => "wide_angle",
            Self::Telephoto => "telephoto",
            Self::UltraWide => "ultra_wide",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::WideAngle => "Wide",
            Self::Telephoto => "Telephoto",
            Self::UltraWide => "Ultra Wide",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.raw() == raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Orientation {
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
    FaceUp,
    FaceDown,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

/// Frame rotation for a camera position and device orientation. `None` for
/// orientations that carry no rotation (face up/down, unknown); callers fall
/// back to portrait.
pub fn rotation_for(position: CameraPosition, orientation: Orientation) -> Option<Rotation> {
    use CameraPosition::*;
    use Orientation::*;
    match (position, orientation) {
        (_, Portrait) => Some(Rotation::Deg90),
        (_, PortraitUpsideDown) => Some(Rotation::Deg270),
        (Front, LandscapeLeft) => Some(Rotation::Deg180),
        (Front, LandscapeRight) => Some(Rotation::Deg0),
        (Back, LandscapeLeft) => Some(Rotation::Deg0),
        (Back, LandscapeRight) => Some(Rotation::Deg180),
        (_, FaceUp | FaceDown | Unknown) => None,
    }
}

/// Observable camera state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraStatus {
    pub position: CameraPosition,
    pub optical_type: OpticalType,
    pub available_back_types: Vec<OpticalType>,
    pub mirrored: bool,
    pub orientation: Orientation,
}
