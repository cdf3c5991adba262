use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{FrameSink, FrameSource};
use crate::engine::VideoFrame;
use crate::error::PublishError;

/// Frame source fed by the host application, for frames produced elsewhere
/// (a screen grabber, a file decoder, an upstream pipeline).
#[derive(Default)]
pub struct ExternalFrameSource {
    sink: Mutex<Option<FrameSink>>,
}

impl ExternalFrameSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand one encoded frame to the session. Frames pushed while the source
    /// is stopped, or while the session is behind, are dropped.
    pub fn push_frame(&self, frame: VideoFrame) {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = sink.as_ref() else {
            warn!("Frame pushed while external source is stopped, dropping");
            return;
        };
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => trace!("Frame sink full, dropping frame"),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Frame sink closed, external source stopped");
                *sink = None;
            }
        }
    }
}

impl FrameSource for ExternalFrameSource {
    fn start(&self, sink: FrameSink) -> Result<(), PublishError> {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn is_running(&self) -> bool {
        self.sink
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}
