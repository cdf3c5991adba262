use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::h264;
use super::{FrameSink, FrameSource, Rotation};
use crate::engine::VideoFrame;
use crate::error::PublishError;
use crate::logging;

/// Loops an H.264 Annex B elementary stream from disk, one access unit per
/// frame interval. Useful for testing viewers without a camera.
pub struct AnnexBFileSource {
    path: PathBuf,
    units: Arc<Vec<Bytes>>,
    frame_duration: Duration,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AnnexBFileSource {
    pub fn open(path: impl AsRef<Path>, fps: u32) -> Result<Self, PublishError> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path).map_err(|e| {
            PublishError::DeviceNotFound(format!("failed to read {}: {e}", path.display()))
        })?;

        let units = h264::split_access_units(&data);
        if units.is_empty() {
            return Err(PublishError::DeviceInputCreationFailed(format!(
                "{} contains no H.264 access units",
                path.display()
            )));
        }

        let idr_count = units.iter().filter(|u| h264::contains_idr(u)).count();
        if idr_count == 0 {
            warn!(path = %path.display(), "Stream has no IDR frame, viewers may never decode it");
        }
        let profile = h264::scan_nals(&data)
            .into_iter()
            .find(|n| n.nal_type == h264::NAL_SPS)
            .and_then(|n| h264::sps_profile_level(&data[n.payload..n.end]));
        if let Some((profile_idc, level_idc)) = profile {
            if profile_idc != 66 {
                warn!(
                    profile_idc,
                    "Stream is not Baseline profile, the negotiated codec is Constrained Baseline"
                );
            }
            debug!(profile_idc, level_idc, "Stream SPS");
        }

        let fps = fps.max(1);
        info!(
            path = %path.display(),
            frames = units.len(),
            idr_frames = idr_count,
            fps,
            "Loaded Annex B stream"
        );

        Ok(Self {
            path,
            units: Arc::new(units),
            frame_duration: Duration::from_nanos(1_000_000_000 / u64::from(fps)),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    pub fn frame_count(&self) -> usize {
        self.units.len()
    }
}

impl FrameSource for AnnexBFileSource {
    fn start(&self, sink: FrameSink) -> Result<(), PublishError> {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let units = Arc::clone(&self.units);
        let running = Arc::clone(&self.running);
        let frame_duration = self.frame_duration;
        running.store(true, Ordering::Release);
        debug!(path = %self.path.display(), "Starting file playback");

        *task = Some(logging::spawn(async move {
            play(units, frame_duration, sink).await;
            running.store(false, Ordering::Release);
        }));
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
            debug!(path = %self.path.display(), "File playback stopped");
        }
        self.running.store(false, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for AnnexBFileSource {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn play(units: Arc<Vec<Bytes>>, frame_duration: Duration, sink: FrameSink) {
    let mut ticker = tokio::time::interval(frame_duration);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut timestamp = Duration::ZERO;

    for unit in units.iter().cycle() {
        ticker.tick().await;
        let frame = VideoFrame {
            data: unit.clone(),
            timestamp,
            duration: frame_duration,
            rotation: Rotation::Deg0,
        };
        timestamp += frame_duration;
        match sink.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => trace!("Frame sink full, dropping frame"),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Frame sink closed, ending file playback");
                return;
            }
        }
    }
}
