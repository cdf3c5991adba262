//! Camera frame source backed by a platform capture device.
//!
//! The device is owned by a dedicated media I/O thread. Every control
//! request is a [`Command`] on that thread's channel, so reconfigurations run
//! one at a time and each one commits or rolls back before the next starts.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use super::{
    CameraControl, CameraPosition, CameraStatus, FrameSink, FrameSource, OpticalType,
    Orientation, Rotation, rotation_for,
};
use crate::engine::VideoFrame;
use crate::error::PublishError;
use crate::logging;

/// Upper bound on how long an optical-type switch blocks its caller.
pub const OPTICAL_SWITCH_TIMEOUT: Duration = Duration::from_secs(2);
const START_TIMEOUT: Duration = Duration::from_secs(5);
/// How long one device poll waits for a frame before checking for commands.
const FRAME_POLL: Duration = Duration::from_millis(20);
const DEFAULT_FRAME_DURATION: Duration = Duration::from_nanos(1_000_000_000 / 30);

/// One encoded frame as the device delivers it.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub timestamp: Duration,
}

/// Platform camera capture. Implementations are driven from a single thread.
pub trait CaptureDevice: Send + 'static {
    /// Optical types the back camera offers, in preference order.
    fn back_optical_types(&self) -> Vec<OpticalType>;
    /// Point capture at the given camera. `DeviceNotFound` when no such
    /// camera exists, `DeviceInputCreationFailed` when it cannot be opened.
    fn configure(
        &mut self,
        position: CameraPosition,
        optical: OpticalType,
    ) -> Result<(), PublishError>;
    fn set_mirrored(&mut self, mirrored: bool);
    fn start_capture(&mut self) -> Result<(), PublishError>;
    fn stop_capture(&mut self);
    /// Wait up to `timeout` for the next frame.
    fn next_frame(&mut self, timeout: Duration) -> Option<RawFrame>;
}

#[derive(Debug, Clone, Copy)]
pub struct CameraOptions {
    pub position: CameraPosition,
    pub optical_type: OpticalType,
    pub mirrored: bool,
    pub orientation: Orientation,
}

impl Default for CameraOptions {
    fn default() -> Self {
        Self {
            position: CameraPosition::Back,
            optical_type: OpticalType::WideAngle,
            mirrored: false,
            orientation: Orientation::Portrait,
        }
    }
}

enum Command {
    Start {
        sink: FrameSink,
        reply: std_mpsc::Sender<Result<(), PublishError>>,
    },
    Stop,
    SwitchPosition,
    SetMirrored(bool),
    SelectOptical {
        optical: OpticalType,
        /// The caller has given up after this; a request still queued then is skipped.
        deadline: Instant,
        reply: std_mpsc::Sender<Option<OpticalType>>,
    },
    SetOrientation(Orientation),
    Shutdown,
}

pub struct CameraFrameSource {
    commands: std_mpsc::Sender<Command>,
    status: watch::Receiver<CameraStatus>,
    running: Arc<AtomicBool>,
    worker: ThreadId,
    select_timeout: Duration,
}

impl CameraFrameSource {
    pub fn new<D: CaptureDevice>(device: D, options: CameraOptions) -> Result<Self, PublishError> {
        let available = device.back_optical_types();
        let mut optical = options.optical_type;
        if options.position == CameraPosition::Front {
            optical = OpticalType::WideAngle;
        } else if !available.contains(&optical) {
            optical = available.first().copied().unwrap_or(OpticalType::WideAngle);
        }

        let status = CameraStatus {
            position: options.position,
            optical_type: optical,
            available_back_types: available,
            mirrored: options.mirrored,
            orientation: options.orientation,
        };
        let (status_tx, status_rx) = watch::channel(status);
        let (commands, command_rx) = std_mpsc::channel();
        let running = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            device,
            status_tx,
            running: Arc::clone(&running),
            sink: None,
            position: options.position,
            optical,
            back_optical: if options.position == CameraPosition::Back {
                optical
            } else {
                OpticalType::WideAngle
            },
            mirrored: options.mirrored,
            orientation: options.orientation,
            last_timestamp: None,
            warned_rotations: HashSet::new(),
        };

        let dispatch = logging::current();
        let handle = std::thread::Builder::new()
            .name("media-io".into())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || worker.run(command_rx))
            })
            .map_err(|e| {
                PublishError::DeviceInputCreationFailed(format!(
                    "failed to spawn media I/O thread: {e}"
                ))
            })?;

        Ok(Self {
            commands,
            status: status_rx,
            running,
            worker: handle.thread().id(),
            select_timeout: OPTICAL_SWITCH_TIMEOUT,
        })
    }

    /// Override the bounded wait used by [`CameraControl::select_optical_type`].
    pub fn with_select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }

    fn on_worker_thread(&self) -> bool {
        std::thread::current().id() == self.worker
    }

    fn send(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            warn!("Media I/O thread has exited, camera command dropped");
            return false;
        }
        true
    }
}

impl Drop for CameraFrameSource {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl FrameSource for CameraFrameSource {
    fn start(&self, sink: FrameSink) -> Result<(), PublishError> {
        if self.on_worker_thread() {
            return Err(PublishError::DeviceInputCreationFailed(
                "camera cannot be started from its own media I/O thread".into(),
            ));
        }
        let (reply, reply_rx) = std_mpsc::channel();
        if !self.send(Command::Start { sink, reply }) {
            return Err(PublishError::DeviceInputCreationFailed(
                "media I/O thread is not running".into(),
            ));
        }
        reply_rx.recv_timeout(START_TIMEOUT).unwrap_or_else(|_| {
            Err(PublishError::DeviceInputCreationFailed(
                "camera did not start in time".into(),
            ))
        })
    }

    fn stop(&self) {
        self.send(Command::Stop);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn camera(&self) -> Option<&dyn CameraControl> {
        Some(self)
    }
}

impl CameraControl for CameraFrameSource {
    fn switch_position(&self) {
        self.send(Command::SwitchPosition);
    }

    fn set_mirrored(&self, mirrored: bool) {
        self.send(Command::SetMirrored(mirrored));
    }

    /// A request that times out while still queued never runs. One the I/O
    /// thread has already begun completes, and its outcome shows up only in
    /// [`CameraStatus`].
    fn select_optical_type(&self, optical: OpticalType) -> Option<OpticalType> {
        if self.on_worker_thread() {
            warn!(?optical, "Optical type switch requested on the media I/O thread, rejecting");
            return None;
        }

        let status = self.status.borrow().clone();
        if status.position != CameraPosition::Back {
            warn!(?optical, "Optical type can only be selected on the back camera");
            return None;
        }
        if !status.available_back_types.contains(&optical) {
            warn!(?optical, available = ?status.available_back_types, "Optical type not available");
            return None;
        }
        if status.optical_type == optical {
            return Some(optical);
        }

        let (reply, reply_rx) = std_mpsc::channel();
        let deadline = Instant::now() + self.select_timeout;
        if !self.send(Command::SelectOptical {
            optical,
            deadline,
            reply,
        }) {
            return None;
        }
        match reply_rx.recv_timeout(self.select_timeout) {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    ?optical,
                    timeout_ms = self.select_timeout.as_millis() as u64,
                    "Timed out waiting for optical type switch"
                );
                None
            }
        }
    }

    fn next_optical_type(&self) -> Option<OpticalType> {
        let status = self.status.borrow().clone();
        if status.position != CameraPosition::Back {
            warn!("Optical type cycling is only available on the back camera");
            return None;
        }
        let available = &status.available_back_types;
        if available.len() <= 1 {
            debug!("Back camera offers a single optical type, nothing to cycle");
            return None;
        }
        let current = available
            .iter()
            .position(|t| *t == status.optical_type)
            .unwrap_or(0);
        let next = available[(current + 1) % available.len()];
        self.select_optical_type(next)
    }

    fn set_orientation(&self, orientation: Orientation) {
        self.send(Command::SetOrientation(orientation));
    }

    fn status(&self) -> watch::Receiver<CameraStatus> {
        self.status.clone()
    }
}

struct Worker<D> {
    device: D,
    status_tx: watch::Sender<CameraStatus>,
    running: Arc<AtomicBool>,
    sink: Option<FrameSink>,
    position: CameraPosition,
    optical: OpticalType,
    /// Optical type to restore when returning to the back camera
    back_optical: OpticalType,
    mirrored: bool,
    orientation: Orientation,
    last_timestamp: Option<Duration>,
    warned_rotations: HashSet<(CameraPosition, Orientation)>,
}

impl<D: CaptureDevice> Worker<D> {
    fn run(mut self, commands: std_mpsc::Receiver<Command>) {
        debug!("Media I/O thread started");
        loop {
            let command = if self.sink.is_some() {
                match commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(std_mpsc::TryRecvError::Empty) => None,
                    Err(std_mpsc::TryRecvError::Disconnected) => break,
                }
            } else {
                match commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                }
            };

            match command {
                Some(Command::Shutdown) => break,
                Some(command) => self.handle(command),
                None => self.pump_frame(),
            }
        }
        self.halt();
        debug!("Media I/O thread exiting");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start { sink, reply } => {
                let _ = reply.send(self.start(sink));
            }
            Command::Stop => {
                if self.sink.is_some() {
                    info!("Camera capture stopped");
                }
                self.halt();
            }
            Command::SwitchPosition => {
                let target = self.position.flipped();
                let optical = match target {
                    CameraPosition::Front => OpticalType::WideAngle,
                    CameraPosition::Back => self.back_optical,
                };
                if let Err(e) = self.reconfigure(target, optical) {
                    warn!(?target, "Camera switch failed: {e}");
                } else {
                    info!(position = ?target, ?optical, "Camera switched");
                }
            }
            Command::SetMirrored(mirrored) => {
                self.mirrored = mirrored;
                self.apply_mirroring();
                self.publish();
            }
            Command::SelectOptical {
                optical,
                deadline,
                reply,
            } => {
                if Instant::now() >= deadline {
                    debug!(?optical, "Optical type switch expired while queued, skipping");
                    return;
                }
                let _ = reply.send(self.select_optical(optical));
            }
            Command::SetOrientation(orientation) => {
                self.orientation = orientation;
                self.publish();
            }
            Command::Shutdown => {}
        }
    }

    fn start(&mut self, sink: FrameSink) -> Result<(), PublishError> {
        if self.sink.is_some() {
            debug!("Camera already capturing, replacing frame sink");
            self.sink = Some(sink);
            return Ok(());
        }
        self.device.configure(self.position, self.optical)?;
        self.apply_mirroring();
        self.device.start_capture()?;
        self.sink = Some(sink);
        self.last_timestamp = None;
        self.running.store(true, Ordering::Release);
        info!(position = ?self.position, optical = ?self.optical, "Camera capture started");
        Ok(())
    }

    fn halt(&mut self) {
        if self.sink.take().is_some() {
            self.device.stop_capture();
        }
        self.running.store(false, Ordering::Release);
    }

    fn select_optical(&mut self, optical: OpticalType) -> Option<OpticalType> {
        if self.position != CameraPosition::Back {
            warn!(?optical, "Camera moved off the back position, optical switch rejected");
            return None;
        }
        if !self.status_tx.borrow().available_back_types.contains(&optical) {
            return None;
        }
        if self.optical == optical {
            return Some(optical);
        }
        match self.reconfigure(CameraPosition::Back, optical) {
            Ok(()) => {
                info!(?optical, "Optical type switched");
                Some(optical)
            }
            Err(e) => {
                warn!(?optical, "Optical type switch failed: {e}");
                None
            }
        }
    }

    /// Commit a new device configuration, or restore the previous one.
    fn reconfigure(
        &mut self,
        position: CameraPosition,
        optical: OpticalType,
    ) -> Result<(), PublishError> {
        match self.device.configure(position, optical) {
            Ok(()) => {
                self.position = position;
                self.optical = optical;
                if position == CameraPosition::Back {
                    self.back_optical = optical;
                }
                self.apply_mirroring();
                self.publish();
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.device.configure(self.position, self.optical) {
                    error!("Camera rollback failed: {rollback}");
                } else {
                    self.apply_mirroring();
                }
                Err(e)
            }
        }
    }

    /// Mirroring is only applied by the device on the front camera.
    fn apply_mirroring(&mut self) {
        let mirrored = self.mirrored && self.position == CameraPosition::Front;
        self.device.set_mirrored(mirrored);
    }

    fn publish(&self) {
        let (position, optical, mirrored, orientation) =
            (self.position, self.optical, self.mirrored, self.orientation);
        self.status_tx.send_modify(|status| {
            status.position = position;
            status.optical_type = optical;
            status.mirrored = mirrored;
            status.orientation = orientation;
        });
    }

    fn rotation(&mut self) -> Rotation {
        rotation_for(self.position, self.orientation).unwrap_or_else(|| {
            if self
                .warned_rotations
                .insert((self.position, self.orientation))
            {
                warn!(
                    position = ?self.position,
                    orientation = ?self.orientation,
                    "No rotation for orientation, assuming portrait"
                );
            }
            Rotation::Deg90
        })
    }

    fn pump_frame(&mut self) {
        let Some(raw) = self.device.next_frame(FRAME_POLL) else {
            return;
        };
        let duration = match self.last_timestamp {
            Some(last) if raw.timestamp > last => raw.timestamp - last,
            _ => DEFAULT_FRAME_DURATION,
        };
        self.last_timestamp = Some(raw.timestamp);

        let frame = VideoFrame {
            data: raw.data,
            timestamp: raw.timestamp,
            duration,
            rotation: self.rotation(),
        };
        let Some(sink) = &self.sink else {
            return;
        };
        match sink.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => trace!("Frame sink full, dropping frame"),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Frame sink closed, stopping capture");
                self.halt();
            }
        }
    }
}
