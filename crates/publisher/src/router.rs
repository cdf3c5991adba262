//! Maps a frame source's capabilities to the control operations that are
//! valid for it. Camera operations on a source without camera control are
//! warned about and ignored.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

use crate::source::{CameraControl, CameraStatus, FrameSource, OpticalType, Orientation};

#[derive(Clone)]
pub struct CapabilityRouter {
    source: Arc<dyn FrameSource>,
}

impl CapabilityRouter {
    pub fn new(source: Arc<dyn FrameSource>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &Arc<dyn FrameSource> {
        &self.source
    }

    pub fn has_camera(&self) -> bool {
        self.source.camera().is_some()
    }

    fn camera(&self, operation: &str) -> Option<&dyn CameraControl> {
        let camera = self.source.camera();
        if camera.is_none() {
            warn!(operation, "Frame source has no camera control, ignoring");
        }
        camera
    }

    /// Flip between the front and back camera.
    pub fn switch_frame_source(&self) {
        if let Some(camera) = self.camera("switch_frame_source") {
            camera.switch_position();
        }
    }

    pub fn set_mirrored(&self, mirrored: bool) {
        if let Some(camera) = self.camera("set_mirrored") {
            camera.set_mirrored(mirrored);
        }
    }

    /// Blocks until the camera is reconfigured or the switch times out.
    pub fn select_optical_type(&self, optical: OpticalType) -> Option<OpticalType> {
        self.camera("select_optical_type")?.select_optical_type(optical)
    }

    pub fn switch_to_next_optical_type(&self) -> Option<OpticalType> {
        self.camera("switch_to_next_optical_type")?
            .next_optical_type()
    }

    pub fn set_orientation(&self, orientation: Orientation) {
        if let Some(camera) = self.camera("set_orientation") {
            camera.set_orientation(orientation);
        }
    }

    /// Camera state, or `None` for sources without camera control.
    pub fn camera_status(&self) -> Option<watch::Receiver<CameraStatus>> {
        self.source.camera().map(|c| c.status())
    }
}
