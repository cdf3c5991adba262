//! Session orchestrator: one publishing session from `start()` to `stop()`.
//!
//! [`Publisher`] is a cheap handle. All session state lives in a single
//! control task that owns the peer connection and the signaling channel;
//! caller requests, engine callbacks and inbound signaling are all messages
//! to that task, so observable state is only ever written from one place.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use vidcast_protocol::RelayEvent;

use crate::config::{SessionConfig, SignalingMode};
use crate::engine::{
    IceCandidate, IceConnectionState, MediaEngine, PeerConnection, PeerEvent, PeerEventSink,
    VideoFrame,
};
use crate::error::{ErrorKind, PublishError};
use crate::logging;
use crate::router::CapabilityRouter;
use crate::signaling::{
    RelaySignalingChannel, RemoteCommand, RemoteCommandHandler, ServerState, ServerStateObserver,
    SignalingChannel, SignalingDelegate, WebSocketSignalingServer,
};
use crate::source::{CameraStatus, FrameSource, OpticalType, Orientation};

/// Frames buffered between the source and the media engine. Sources drop
/// frames when this is full.
const FRAME_QUEUE: usize = 8;
const CANDIDATE_EVENTS: usize = 64;

/// Connectivity of the current session, following the engine's ICE state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<IceConnectionState> for SessionState {
    fn from(state: IceConnectionState) -> Self {
        match state {
            IceConnectionState::New => Self::New,
            IceConnectionState::Checking => Self::Connecting,
            IceConnectionState::Connected | IceConnectionState::Completed => Self::Connected,
            IceConnectionState::Disconnected => Self::Disconnected,
            IceConnectionState::Failed => Self::Failed,
            IceConnectionState::Closed => Self::Closed,
        }
    }
}

/// Public status of the WebSocket signaling server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    /// The session does not use the WebSocket channel
    NotApplicable,
    Idle,
    Starting,
    Listening(u16),
    Stopped,
    Failed(String),
    ClientConnected(SocketAddr),
    ClientDisconnected(SocketAddr),
}

impl From<&ServerState> for ServerStatus {
    fn from(state: &ServerState) -> Self {
        match state {
            ServerState::Idle => Self::Idle,
            ServerState::Starting => Self::Starting,
            ServerState::Listening(port) => Self::Listening(*port),
            ServerState::Stopped => Self::Stopped,
            ServerState::Failed(reason) => Self::Failed(reason.clone()),
            ServerState::ClientConnected(addr) => Self::ClientConnected(*addr),
            ServerState::ClientDisconnected(addr) => Self::ClientDisconnected(*addr),
        }
    }
}

enum Command {
    Start,
    Stop,
    ApplyAnswer(String),
    ApplyCandidate(IceCandidate),
    Shutdown(oneshot::Sender<()>),
    #[cfg(test)]
    Barrier(oneshot::Sender<()>),
}

enum Event {
    Peer { generation: u64, event: PeerEvent },
    Answer(String),
    RemoteCandidate(IceCandidate),
    Server(ServerState),
    Remote(RemoteCommand),
}

/// Receives channel callbacks and turns them into control-task events. The
/// channels hold it weakly; the control task owns it.
struct Inbox {
    events: mpsc::UnboundedSender<Event>,
}

impl Inbox {
    fn post(&self, event: Event) {
        if self.events.send(event).is_err() {
            trace!("Session control task gone, event dropped");
        }
    }
}

impl SignalingDelegate for Inbox {
    fn on_answer(&self, sdp: String) {
        self.post(Event::Answer(sdp));
    }

    fn on_candidate(&self, candidate: IceCandidate) {
        self.post(Event::RemoteCandidate(candidate));
    }
}

impl ServerStateObserver for Inbox {
    fn on_state_change(&self, state: &ServerState) {
        self.post(Event::Server(state.clone()));
    }
}

impl RemoteCommandHandler for Inbox {
    fn on_remote_command(&self, command: RemoteCommand) {
        self.post(Event::Remote(command));
    }
}

/// The signaling channel picked from [`SignalingMode`].
enum ActiveChannel {
    WebSocket(Arc<WebSocketSignalingServer>),
    Relay(Arc<RelaySignalingChannel>),
    /// The caller relays artifacts itself.
    Custom,
}

impl ActiveChannel {
    fn get(&self) -> Option<&dyn SignalingChannel> {
        match self {
            Self::WebSocket(server) => Some(server.as_ref()),
            Self::Relay(relay) => Some(relay.as_ref()),
            Self::Custom => None,
        }
    }
}

/// Handle to a publishing session.
///
/// Control operations are fire-and-forget: they are queued to the session's
/// control task and their outcome shows up on the observables
/// ([`state`](Self::state), [`last_error`](Self::last_error), ...). The
/// exception is optical-type selection, which blocks for its result.
pub struct Publisher {
    commands: mpsc::UnboundedSender<Command>,
    router: CapabilityRouter,
    relay: Option<Arc<RelaySignalingChannel>>,
    state: watch::Receiver<SessionState>,
    last_error: watch::Receiver<Option<PublishError>>,
    local_offer: watch::Receiver<Option<String>>,
    server_status: watch::Receiver<ServerStatus>,
    candidates: Option<broadcast::Sender<IceCandidate>>,
    logging_enabled: bool,
    task: JoinHandle<()>,
}

impl Publisher {
    /// Build a session and spawn its control task. Must be called from
    /// within a Tokio runtime. Nothing is negotiated until [`start`](Self::start).
    pub fn new(
        config: SessionConfig,
        engine: Arc<dyn MediaEngine>,
        source: Arc<dyn FrameSource>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inbox = Arc::new(Inbox {
            events: events_tx.clone(),
        });
        let delegate = Arc::downgrade(&inbox) as Weak<dyn SignalingDelegate>;
        let router = CapabilityRouter::new(source);

        let (channel, relay, initial_server, candidates) = match &config.signaling {
            SignalingMode::LocalWebSocket => {
                let observer = Arc::downgrade(&inbox) as Weak<dyn ServerStateObserver>;
                let server = Arc::new(WebSocketSignalingServer::new(
                    config.bind.clone(),
                    config.port,
                    delegate,
                    observer,
                ));
                (ActiveChannel::WebSocket(server), None, ServerStatus::Idle, None)
            }
            SignalingMode::RelayChannel(transport) => {
                let handler = Arc::downgrade(&inbox) as Weak<dyn RemoteCommandHandler>;
                let relay = Arc::new(RelaySignalingChannel::new(
                    Arc::clone(transport),
                    delegate,
                    handler,
                ));
                (
                    ActiveChannel::Relay(Arc::clone(&relay)),
                    Some(relay),
                    ServerStatus::NotApplicable,
                    None,
                )
            }
            SignalingMode::Custom => {
                let (tx, _) = broadcast::channel(CANDIDATE_EVENTS);
                (
                    ActiveChannel::Custom,
                    None,
                    ServerStatus::NotApplicable,
                    Some(tx),
                )
            }
        };

        let (state_tx, state) = watch::channel(SessionState::New);
        let (error_tx, last_error) = watch::channel(None);
        let (offer_tx, local_offer) = watch::channel(None);
        let (server_tx, server_status) = watch::channel(initial_server);

        let logging_enabled = config.logging_enabled;
        let orchestrator = Orchestrator {
            config,
            engine,
            router: router.clone(),
            channel,
            peer: None,
            generation: 0,
            local_committed: false,
            manual_stop: false,
            pump: None,
            events_tx,
            state_tx,
            error_tx,
            offer_tx,
            server_tx,
            candidates_tx: candidates.clone(),
            announced: None,
            _inbox: inbox,
        };
        let task = logging::spawn_with(logging_enabled, orchestrator.run(command_rx, events_rx));

        Self {
            commands,
            router,
            relay,
            state,
            last_error,
            local_offer,
            server_status,
            candidates,
            logging_enabled,
            task,
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            logging::scoped(self.logging_enabled, || {
                warn!("Session control task has exited, command dropped");
            });
        }
    }

    /// Start the signaling channel, negotiate a new peer connection and
    /// begin sending frames. Ignored while a peer connection exists.
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// Tear the session down. Safe to call repeatedly.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Apply a viewer's answer. Rejected until the local offer is committed.
    pub fn apply_answer(&self, sdp: impl Into<String>) {
        self.send(Command::ApplyAnswer(sdp.into()));
    }

    /// Apply a remote trickle candidate. Accepted before the answer.
    pub fn apply_candidate(&self, candidate: IceCandidate) {
        self.send(Command::ApplyCandidate(candidate));
    }

    /// Flip between the front and back camera.
    pub fn switch_frame_source(&self) {
        logging::scoped(self.logging_enabled, || self.router.switch_frame_source());
    }

    pub fn set_mirrored(&self, mirrored: bool) {
        logging::scoped(self.logging_enabled, || self.router.set_mirrored(mirrored));
    }

    /// Switch the back camera's optical type, blocking the calling thread
    /// until the device is reconfigured (at most two seconds). Returns the
    /// active type, or `None` if the type is unavailable, the switch failed
    /// or timed out. From async code, call it through `spawn_blocking`.
    pub fn select_optical_type(&self, optical: OpticalType) -> Option<OpticalType> {
        logging::scoped(self.logging_enabled, || {
            self.router.select_optical_type(optical)
        })
    }

    /// Cycle to the next available back optical type. Blocks like
    /// [`select_optical_type`](Self::select_optical_type).
    pub fn switch_to_next_optical_type(&self) -> Option<OpticalType> {
        logging::scoped(self.logging_enabled, || {
            self.router.switch_to_next_optical_type()
        })
    }

    pub fn set_orientation(&self, orientation: Orientation) {
        logging::scoped(self.logging_enabled, || {
            self.router.set_orientation(orientation)
        });
    }

    /// Feed one inbound relay event. Only meaningful in relay mode.
    pub fn handle_relay_event(&self, event: RelayEvent) {
        logging::scoped(self.logging_enabled, || match &self.relay {
            Some(relay) => relay.handle_event(event),
            None => warn!(event = %event.name, "Relay event received outside relay mode, ignoring"),
        });
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Most recent error that ended or failed the session, cleared when the
    /// connection recovers or the session is stopped.
    pub fn last_error(&self) -> watch::Receiver<Option<PublishError>> {
        self.last_error.clone()
    }

    /// The committed local offer while a session is running.
    pub fn local_offer(&self) -> watch::Receiver<Option<String>> {
        self.local_offer.clone()
    }

    pub fn server_status(&self) -> watch::Receiver<ServerStatus> {
        self.server_status.clone()
    }

    /// Locally gathered candidates, for callers relaying them themselves.
    /// `None` unless the session uses [`SignalingMode::Custom`].
    pub fn candidates(&self) -> Option<broadcast::Receiver<IceCandidate>> {
        self.candidates.as_ref().map(broadcast::Sender::subscribe)
    }

    /// Camera position, optical type, available back types, mirroring and
    /// orientation. `None` when the frame source is not a camera.
    pub fn camera_status(&self) -> Option<watch::Receiver<CameraStatus>> {
        self.router.camera_status()
    }

    /// Stop the session and wait for the control task to exit.
    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        let _ = self.task.await;
    }

    /// Resolves once every command sent so far, and every event queued
    /// before it, has been handled.
    #[cfg(test)]
    pub(crate) async fn settle(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Barrier(tx));
        let _ = rx.await;
    }
}

struct Orchestrator {
    config: SessionConfig,
    engine: Arc<dyn MediaEngine>,
    router: CapabilityRouter,
    channel: ActiveChannel,
    peer: Option<Arc<dyn PeerConnection>>,
    /// Bumped for every peer; events tagged with an older value are stale.
    generation: u64,
    local_committed: bool,
    manual_stop: bool,
    pump: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<Event>,
    state_tx: watch::Sender<SessionState>,
    error_tx: watch::Sender<Option<PublishError>>,
    offer_tx: watch::Sender<Option<String>>,
    server_tx: watch::Sender<ServerStatus>,
    candidates_tx: Option<broadcast::Sender<IceCandidate>>,
    /// Back optical types last sent over the relay
    announced: Option<Vec<OpticalType>>,
    _inbox: Arc<Inbox>,
}

impl Orchestrator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        let mut camera = self.router.camera_status();
        debug!(mode = ?self.config.signaling, "Session control task started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start) => self.start().await,
                    Some(Command::Stop) => self.stop().await,
                    Some(Command::ApplyAnswer(sdp)) => self.apply_answer(sdp).await,
                    Some(Command::ApplyCandidate(candidate)) => self.apply_candidate(candidate).await,
                    Some(Command::Shutdown(done)) => {
                        self.stop().await;
                        let _ = done.send(());
                        break;
                    }
                    #[cfg(test)]
                    Some(Command::Barrier(done)) => {
                        while let Ok(event) = events.try_recv() {
                            self.handle_event(event).await;
                        }
                        let _ = done.send(());
                    }
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event).await,
                changed = async {
                    match camera.as_mut() {
                        Some(rx) => rx.changed().await,
                        None => std::future::pending().await,
                    }
                } => {
                    if changed.is_err() {
                        camera = None;
                    } else {
                        self.announce_cameras();
                    }
                }
            }
        }
        debug!("Session control task exiting");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Peer { generation, event } => self.on_peer_event(generation, event),
            Event::Answer(sdp) => self.apply_answer(sdp).await,
            Event::RemoteCandidate(candidate) => self.apply_candidate(candidate).await,
            Event::Server(state) => {
                debug!(?state, "Signaling server state changed");
                self.server_tx.send_replace(ServerStatus::from(&state));
            }
            Event::Remote(command) => self.on_remote_command(command).await,
        }
    }

    async fn start(&mut self) {
        if self.peer.is_some() {
            debug!("Session already started");
            return;
        }
        self.manual_stop = false;
        self.error_tx.send_replace(None);
        self.state_tx.send_replace(SessionState::New);

        if let Some(channel) = self.channel.get() {
            channel.start();
        }

        self.generation += 1;
        let generation = self.generation;
        let events = self.events_tx.clone();
        let sink: PeerEventSink = Arc::new(move |event| {
            let _ = events.send(Event::Peer { generation, event });
        });

        let peer = match self.engine.create_peer(sink).await {
            Ok(peer) => peer,
            Err(e) => return self.fail(PublishError::setup(&e)).await,
        };
        self.peer = Some(Arc::clone(&peer));

        if let Err(e) = peer.add_video_track().await {
            return self.fail(PublishError::setup(&e)).await;
        }
        let offer = match peer.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return self.fail(PublishError::negotiation(&e)).await,
        };
        if let Err(e) = peer.set_local_offer(&offer).await {
            return self.fail(PublishError::negotiation(&e)).await;
        }
        self.local_committed = true;
        debug!(generation, bytes = offer.len(), "Local offer committed");

        let encoding = self.config.encoding();
        if let Err(e) = peer.apply_encoding(&encoding).await {
            warn!("Failed to apply encoding parameters: {e:#}");
        }

        self.offer_tx.send_replace(Some(offer.clone()));
        if let Some(channel) = self.channel.get() {
            channel.send_offer(&offer);
        }

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let source = Arc::clone(self.router.source());
        let started = logging::spawn_blocking(move || source.start(frame_tx))
            .await
            .unwrap_or_else(|e| {
                Err(PublishError::DeviceInputCreationFailed(format!(
                    "frame source start panicked: {e}"
                )))
            });
        if let Err(e) = started {
            return self.fail(e).await;
        }
        self.pump = Some(logging::spawn(pump_frames(peer, frame_rx, generation)));

        self.announced = None;
        self.announce_cameras();
        info!(generation, "Publishing session started");
    }

    /// Record a start failure and clean up as `stop()` would.
    async fn fail(&mut self, err: PublishError) {
        error!("{err}");
        self.teardown().await;
        self.error_tx.send_replace(Some(err));
    }

    async fn stop(&mut self) {
        if self.peer.is_none() && !self.router.source().is_running() {
            debug!("Session not running, nothing to stop");
            return;
        }
        // Set before the peer closes, so the ICE states it reports on the
        // way down read as expected.
        self.manual_stop = true;
        self.teardown().await;
        self.error_tx.send_replace(None);
        info!("Publishing session stopped");
    }

    async fn teardown(&mut self) {
        if let Some(channel) = self.channel.get() {
            channel.stop();
        }
        self.router.source().stop();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(peer) = self.peer.take()
            && let Err(e) = peer.close().await
        {
            warn!("Failed to close peer connection: {e:#}");
        }
        self.local_committed = false;
        self.announced = None;
        self.offer_tx.send_replace(None);
        self.state_tx.send_replace(SessionState::Closed);
    }

    async fn apply_answer(&mut self, sdp: String) {
        let Some(peer) = &self.peer else {
            warn!("Answer received without a peer connection, ignoring");
            return;
        };
        if !self.local_committed {
            warn!("Answer received before the local offer was committed, ignoring");
            return;
        }
        match peer.set_remote_answer(&sdp).await {
            Ok(()) => info!("Remote answer applied"),
            Err(e) => {
                let err = PublishError::negotiation(&e);
                warn!("{err}");
                self.error_tx.send_replace(Some(err));
            }
        }
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        let Some(peer) = &self.peer else {
            warn!(candidate = %candidate.sdp, "Candidate received without a peer connection, ignoring");
            return;
        };
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            warn!("{}", PublishError::CandidateApplyFailed(format!("{e:#}")));
        }
    }

    fn on_peer_event(&mut self, generation: u64, event: PeerEvent) {
        if generation != self.generation {
            trace!(generation, current = self.generation, "Ignoring event from an earlier peer");
            return;
        }
        if self.peer.is_none() {
            // Reported by the peer `stop()` just closed.
            match event {
                PeerEvent::IceState(state) if self.manual_stop => self.on_ice_state_after_stop(state),
                _ => trace!(generation, "Ignoring event from a closed peer"),
            }
            return;
        }
        match event {
            PeerEvent::Candidate(candidate) => self.forward_candidate(candidate),
            PeerEvent::IceState(state) => self.on_ice_state(state),
        }
    }

    fn forward_candidate(&self, candidate: IceCandidate) {
        if let Some(channel) = self.channel.get() {
            channel.send_candidate(&candidate);
        } else if let Some(tx) = &self.candidates_tx {
            // No receivers is fine: the caller may subscribe later or not at all.
            let _ = tx.send(candidate);
        }
    }

    /// The session is already `Closed`; nothing here is an error.
    fn on_ice_state_after_stop(&self, state: IceConnectionState) {
        match state {
            IceConnectionState::Disconnected | IceConnectionState::Failed => {
                debug!(?state, "ICE connection lost after a manual stop");
            }
            _ => trace!(?state, "ICE state change after a manual stop"),
        }
    }

    fn on_ice_state(&mut self, state: IceConnectionState) {
        info!(?state, "ICE connection state changed");
        self.state_tx.send_replace(SessionState::from(state));

        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                self.error_tx.send_replace(None);
                self.manual_stop = false;
            }
            IceConnectionState::Disconnected => {
                warn!("Connection lost, waiting for ICE to recover");
            }
            IceConnectionState::Failed => {
                let err = PublishError::ConnectionFailed("ICE connection failed".into());
                error!("{err}");
                self.error_tx.send_replace(Some(err));
            }
            IceConnectionState::Closed => {
                let connection_failed = self
                    .error_tx
                    .borrow()
                    .as_ref()
                    .is_some_and(|e| e.kind() == ErrorKind::ConnectionFailed);
                if connection_failed {
                    self.error_tx.send_replace(None);
                }
            }
            IceConnectionState::New | IceConnectionState::Checking => {}
        }
    }

    async fn on_remote_command(&mut self, command: RemoteCommand) {
        match command {
            RemoteCommand::Start => self.start().await,
            RemoteCommand::Stop => self.stop().await,
            RemoteCommand::Facing(position) => {
                let current = match self.router.camera_status() {
                    Some(status) => {
                        let position = status.borrow().position;
                        Some(position)
                    }
                    None => None,
                };
                match current {
                    Some(current) if current != position => self.router.switch_frame_source(),
                    Some(_) => debug!(?position, "Camera already facing requested position"),
                    None => warn!("Remote camera switch requested, but the source is not a camera"),
                }
            }
            RemoteCommand::SetMirrored(mirrored) => self.router.set_mirrored(mirrored),
            RemoteCommand::SelectOpticalType(optical) => {
                // The switch blocks; keep the control task responsive.
                let router = self.router.clone();
                logging::spawn_blocking(move || {
                    if router.select_optical_type(optical).is_none() {
                        warn!(?optical, "Remote optical type switch did not succeed");
                    }
                });
            }
        }
    }

    /// Tell a relay peer which back optical types exist, once per change.
    fn announce_cameras(&mut self) {
        let ActiveChannel::Relay(relay) = &self.channel else {
            return;
        };
        if self.peer.is_none() {
            return;
        }
        let Some(status) = self.router.camera_status() else {
            return;
        };
        let types = status.borrow().available_back_types.clone();
        if self.announced.as_ref() == Some(&types) {
            return;
        }
        relay.announce_back_cameras(&types);
        self.announced = Some(types);
    }
}

async fn pump_frames(
    peer: Arc<dyn PeerConnection>,
    mut frames: mpsc::Receiver<VideoFrame>,
    generation: u64,
) {
    let mut written = 0u64;
    let mut failures = 0u64;
    while let Some(frame) = frames.recv().await {
        match peer.write_frame(frame).await {
            Ok(()) => written += 1,
            Err(e) => {
                failures += 1;
                if failures == 1 || failures % 100 == 0 {
                    warn!(generation, failures, "Failed to write frame: {e:#}");
                }
            }
        }
    }
    debug!(generation, written, failures, "Frame pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ExternalFrameSource;
    use crate::source::camera::tests::FakeDevice;
    use crate::source::{CameraFrameSource, CameraOptions, CameraPosition};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use vidcast_protocol::{SdpChunk, relay_event};

    #[derive(Default)]
    struct FakePeer {
        calls: Mutex<Vec<String>>,
        fail_offer: bool,
        fail_answer: bool,
        /// Reports Disconnected then Failed while closing, as a real peer may.
        ice_fails_on_close: bool,
        events: Mutex<Option<PeerEventSink>>,
    }

    impl FakePeer {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerConnection for FakePeer {
        async fn add_video_track(&self) -> anyhow::Result<()> {
            self.record("add_video_track");
            Ok(())
        }
        async fn create_offer(&self) -> anyhow::Result<String> {
            self.record("create_offer");
            if self.fail_offer {
                anyhow::bail!("no codecs");
            }
            Ok("v=0 o1".into())
        }
        async fn set_local_offer(&self, sdp: &str) -> anyhow::Result<()> {
            self.record(format!("set_local_offer {sdp}"));
            Ok(())
        }
        async fn set_remote_answer(&self, sdp: &str) -> anyhow::Result<()> {
            self.record(format!("set_remote_answer {sdp}"));
            if self.fail_answer {
                anyhow::bail!("bad answer");
            }
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
            self.record(format!("add_ice_candidate {}", candidate.sdp));
            Ok(())
        }
        async fn apply_encoding(&self, params: &crate::EncodingParams) -> anyhow::Result<()> {
            self.record(format!("apply_encoding {}", params.max_bitrate_bps));
            Ok(())
        }
        async fn write_frame(&self, frame: VideoFrame) -> anyhow::Result<()> {
            self.record(format!("write_frame {}", frame.timestamp.as_millis()));
            Ok(())
        }
        async fn close(&self) -> anyhow::Result<()> {
            self.record("close");
            if self.ice_fails_on_close
                && let Some(events) = self.events.lock().unwrap().as_ref()
            {
                events(PeerEvent::IceState(IceConnectionState::Disconnected));
                events(PeerEvent::IceState(IceConnectionState::Failed));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeEngine {
        peers: Mutex<Vec<(Arc<FakePeer>, PeerEventSink)>>,
        fail_create: AtomicBool,
        fail_offer: bool,
        fail_answer: bool,
        ice_fails_on_close: bool,
    }

    impl FakeEngine {
        fn peer(&self, index: usize) -> Arc<FakePeer> {
            Arc::clone(&self.peers.lock().unwrap()[index].0)
        }

        fn emit(&self, index: usize, event: PeerEvent) {
            let sink = Arc::clone(&self.peers.lock().unwrap()[index].1);
            sink(event);
        }

        fn peer_count(&self) -> usize {
            self.peers.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MediaEngine for FakeEngine {
        async fn create_peer(
            &self,
            events: PeerEventSink,
        ) -> anyhow::Result<Arc<dyn PeerConnection>> {
            if self.fail_create.load(Ordering::SeqCst) {
                anyhow::bail!("engine unavailable");
            }
            let peer = Arc::new(FakePeer {
                fail_offer: self.fail_offer,
                fail_answer: self.fail_answer,
                ice_fails_on_close: self.ice_fails_on_close,
                events: Mutex::new(Some(Arc::clone(&events))),
                ..Default::default()
            });
            self.peers
                .lock()
                .unwrap()
                .push((Arc::clone(&peer), events));
            Ok(peer)
        }
    }

    struct MissingCamera;

    impl FrameSource for MissingCamera {
        fn start(&self, _sink: crate::source::FrameSink) -> Result<(), PublishError> {
            Err(PublishError::DeviceNotFound("no camera".into()))
        }
        fn stop(&self) {}
        fn is_running(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct RecordingRelay {
        sent: Mutex<Vec<RelayEvent>>,
    }

    impl crate::signaling::MessageRelay for RecordingRelay {
        fn send(&self, event: RelayEvent) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(event);
            Ok(())
        }
    }

    impl RecordingRelay {
        fn names(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.name.clone())
                .collect()
        }
    }

    fn custom_config() -> SessionConfig {
        SessionConfig {
            signaling: SignalingMode::Custom,
            ..SessionConfig::default()
        }
    }

    fn publisher_with(
        config: SessionConfig,
        engine: &Arc<FakeEngine>,
        source: Arc<dyn FrameSource>,
    ) -> Publisher {
        let engine: Arc<dyn MediaEngine> = engine.clone();
        Publisher::new(config, engine, source)
    }

    fn candidate(sdp: &str) -> IceCandidate {
        IceCandidate::new(sdp, Some("0".into()), Some(0))
    }

    fn error_kind(publisher: &Publisher) -> Option<ErrorKind> {
        let last_error = publisher.last_error();
        let kind = last_error.borrow().as_ref().map(PublishError::kind);
        kind
    }

    #[tokio::test]
    async fn start_negotiates_and_publishes_offer() {
        let engine = Arc::new(FakeEngine::default());
        let source = Arc::new(ExternalFrameSource::new());
        let publisher = publisher_with(custom_config(), &engine, source.clone());

        publisher.start();
        publisher.start();
        publisher.settle().await;

        assert_eq!(engine.peer_count(), 1);
        assert_eq!(
            engine.peer(0).calls(),
            vec![
                "add_video_track",
                "create_offer",
                "set_local_offer v=0 o1",
                "apply_encoding 50000000",
            ]
        );
        assert_eq!(publisher.local_offer().borrow().as_deref(), Some("v=0 o1"));
        assert_eq!(*publisher.server_status().borrow(), ServerStatus::NotApplicable);
        assert!(source.is_running());
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn frames_reach_the_peer() {
        let engine = Arc::new(FakeEngine::default());
        let source = Arc::new(ExternalFrameSource::new());
        let publisher = publisher_with(custom_config(), &engine, source.clone());
        publisher.start();
        publisher.settle().await;

        source.push_frame(VideoFrame {
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            timestamp: Duration::from_millis(40),
            duration: Duration::from_millis(33),
            rotation: crate::source::Rotation::Deg90,
        });

        let peer = engine.peer(0);
        for _ in 0..500 {
            if peer.calls().iter().any(|c| c == "write_frame 40") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(peer.calls().iter().any(|c| c == "write_frame 40"));
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn answer_before_offer_is_rejected() {
        let engine = Arc::new(FakeEngine::default());
        let publisher = publisher_with(
            custom_config(),
            &engine,
            Arc::new(ExternalFrameSource::new()),
        );

        publisher.apply_answer("early");
        publisher.apply_candidate(candidate("c0"));
        publisher.settle().await;
        assert_eq!(engine.peer_count(), 0);

        publisher.start();
        publisher.apply_candidate(candidate("c1"));
        publisher.apply_answer("a1");
        publisher.settle().await;
        let calls = engine.peer(0).calls();
        assert_eq!(&calls[calls.len() - 2..], ["add_ice_candidate c1", "set_remote_answer a1"]);
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn failed_offer_surfaces_negotiation_error_and_cleans_up() {
        let engine = Arc::new(FakeEngine {
            fail_offer: true,
            ..Default::default()
        });
        let source = Arc::new(ExternalFrameSource::new());
        let publisher = publisher_with(custom_config(), &engine, source.clone());

        publisher.start();
        publisher.settle().await;

        assert_eq!(error_kind(&publisher), Some(ErrorKind::NegotiationFailed));
        assert_eq!(*publisher.state().borrow(), SessionState::Closed);
        assert!(!source.is_running());
        assert_eq!(engine.peer(0).calls().last().map(String::as_str), Some("close"));

        // Nothing committed, so a late answer goes nowhere.
        publisher.apply_answer("late");
        publisher.settle().await;
        assert!(!engine.peer(0).calls().iter().any(|c| c.starts_with("set_remote_answer")));
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn engine_failure_is_session_setup_error() {
        let engine = Arc::new(FakeEngine::default());
        engine.fail_create.store(true, Ordering::SeqCst);
        let publisher = publisher_with(
            custom_config(),
            &engine,
            Arc::new(ExternalFrameSource::new()),
        );
        publisher.start();
        publisher.settle().await;
        assert_eq!(error_kind(&publisher), Some(ErrorKind::SessionSetupFailed));
        assert_eq!(*publisher.state().borrow(), SessionState::Closed);

        // A later start retries and clears the error.
        engine.fail_create.store(false, Ordering::SeqCst);
        publisher.start();
        publisher.settle().await;
        assert_eq!(error_kind(&publisher), None);
        assert_eq!(engine.peer_count(), 1);
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn missing_device_fails_start() {
        let engine = Arc::new(FakeEngine::default());
        let publisher = publisher_with(custom_config(), &engine, Arc::new(MissingCamera));
        publisher.start();
        publisher.settle().await;
        assert_eq!(error_kind(&publisher), Some(ErrorKind::DeviceNotFound));
        assert!(publisher.local_offer().borrow().is_none());
        assert_eq!(engine.peer(0).calls().last().map(String::as_str), Some("close"));
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn failed_remote_answer_keeps_session() {
        let engine = Arc::new(FakeEngine {
            fail_answer: true,
            ..Default::default()
        });
        let source = Arc::new(ExternalFrameSource::new());
        let publisher = publisher_with(custom_config(), &engine, source.clone());
        publisher.start();
        publisher.apply_answer("garbage");
        publisher.settle().await;
        assert_eq!(error_kind(&publisher), Some(ErrorKind::NegotiationFailed));
        assert!(source.is_running());
        assert!(publisher.local_offer().borrow().is_some());
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn custom_mode_publishes_candidates() {
        let engine = Arc::new(FakeEngine::default());
        let publisher = publisher_with(
            custom_config(),
            &engine,
            Arc::new(ExternalFrameSource::new()),
        );
        let mut candidates = publisher.candidates().unwrap();
        publisher.start();
        publisher.settle().await;

        engine.emit(0, PeerEvent::Candidate(candidate("c1")));
        engine.emit(0, PeerEvent::Candidate(candidate("c2")));
        publisher.settle().await;

        assert_eq!(candidates.try_recv().unwrap().sdp, "c1");
        assert_eq!(candidates.try_recv().unwrap().sdp, "c2");
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn unexpected_failure_sets_error_until_stop() {
        let engine = Arc::new(FakeEngine::default());
        let publisher = publisher_with(
            custom_config(),
            &engine,
            Arc::new(ExternalFrameSource::new()),
        );
        publisher.start();
        publisher.settle().await;

        engine.emit(0, PeerEvent::IceState(IceConnectionState::Checking));
        engine.emit(0, PeerEvent::IceState(IceConnectionState::Failed));
        publisher.settle().await;
        assert_eq!(*publisher.state().borrow(), SessionState::Failed);
        assert_eq!(error_kind(&publisher), Some(ErrorKind::ConnectionFailed));

        publisher.stop();
        publisher.settle().await;
        assert_eq!(*publisher.state().borrow(), SessionState::Closed);
        assert_eq!(error_kind(&publisher), None);
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn recovery_clears_error() {
        let engine = Arc::new(FakeEngine::default());
        let publisher = publisher_with(
            custom_config(),
            &engine,
            Arc::new(ExternalFrameSource::new()),
        );
        publisher.start();
        publisher.settle().await;

        engine.emit(0, PeerEvent::IceState(IceConnectionState::Failed));
        engine.emit(0, PeerEvent::IceState(IceConnectionState::Connected));
        publisher.settle().await;
        assert_eq!(*publisher.state().borrow(), SessionState::Connected);
        assert_eq!(error_kind(&publisher), None);

        engine.emit(0, PeerEvent::IceState(IceConnectionState::Disconnected));
        publisher.settle().await;
        assert_eq!(*publisher.state().borrow(), SessionState::Disconnected);
        assert_eq!(error_kind(&publisher), None);

        engine.emit(0, PeerEvent::IceState(IceConnectionState::Failed));
        engine.emit(0, PeerEvent::IceState(IceConnectionState::Closed));
        publisher.settle().await;
        assert_eq!(error_kind(&publisher), None);
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn events_after_stop_are_ignored() {
        let engine = Arc::new(FakeEngine::default());
        let publisher = publisher_with(
            custom_config(),
            &engine,
            Arc::new(ExternalFrameSource::new()),
        );
        let mut candidates = publisher.candidates().unwrap();
        publisher.start();
        publisher.stop();
        publisher.settle().await;

        engine.emit(0, PeerEvent::IceState(IceConnectionState::Failed));
        engine.emit(0, PeerEvent::Candidate(candidate("late")));
        publisher.settle().await;
        assert_eq!(*publisher.state().borrow(), SessionState::Closed);
        assert_eq!(error_kind(&publisher), None);
        assert!(candidates.try_recv().is_err());

        // Events from the first peer don't leak into the second session.
        publisher.start();
        publisher.settle().await;
        engine.emit(0, PeerEvent::IceState(IceConnectionState::Connected));
        publisher.settle().await;
        assert_eq!(*publisher.state().borrow(), SessionState::New);
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn failure_reported_while_stopping_is_not_an_error() {
        let engine = Arc::new(FakeEngine {
            ice_fails_on_close: true,
            ..Default::default()
        });
        let publisher = publisher_with(
            custom_config(),
            &engine,
            Arc::new(ExternalFrameSource::new()),
        );
        publisher.start();
        publisher.settle().await;
        engine.emit(0, PeerEvent::IceState(IceConnectionState::Connected));
        publisher.settle().await;

        publisher.stop();
        publisher.settle().await;
        assert_eq!(*publisher.state().borrow(), SessionState::Closed);
        assert_eq!(error_kind(&publisher), None);

        // start() clears the flag, so the next peer's failure is unexpected.
        publisher.start();
        publisher.settle().await;
        engine.emit(1, PeerEvent::IceState(IceConnectionState::Failed));
        publisher.settle().await;
        assert_eq!(error_kind(&publisher), Some(ErrorKind::ConnectionFailed));
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let engine = Arc::new(FakeEngine::default());
        let publisher = publisher_with(
            custom_config(),
            &engine,
            Arc::new(ExternalFrameSource::new()),
        );
        publisher.stop();
        publisher.settle().await;
        assert_eq!(*publisher.state().borrow(), SessionState::New);

        publisher.start();
        publisher.stop();
        publisher.stop();
        publisher.settle().await;
        assert_eq!(*publisher.state().borrow(), SessionState::Closed);
        assert!(publisher.local_offer().borrow().is_none());
        let closes = engine
            .peer(0)
            .calls()
            .iter()
            .filter(|c| *c == "close")
            .count();
        assert_eq!(closes, 1);
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn camera_operations_without_camera_are_noops() {
        let engine = Arc::new(FakeEngine::default());
        let publisher = publisher_with(
            custom_config(),
            &engine,
            Arc::new(ExternalFrameSource::new()),
        );
        publisher.start();
        publisher.settle().await;
        let before = *publisher.state().borrow();

        publisher.switch_frame_source();
        publisher.set_mirrored(true);
        assert_eq!(publisher.select_optical_type(OpticalType::Telephoto), None);
        assert_eq!(publisher.switch_to_next_optical_type(), None);
        publisher.settle().await;

        assert_eq!(*publisher.state().borrow(), before);
        assert_eq!(error_kind(&publisher), None);
        assert!(publisher.camera_status().is_none());
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn websocket_mode_round_trip() {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message as WsMessage;
        use vidcast_protocol::{Signal, SignalingMessage};

        let engine = Arc::new(FakeEngine::default());
        let config = SessionConfig {
            bind: "127.0.0.1".into(),
            port: 0,
            ..SessionConfig::default()
        };
        let publisher = publisher_with(config, &engine, Arc::new(ExternalFrameSource::new()));
        assert_eq!(*publisher.server_status().borrow(), ServerStatus::Idle);

        publisher.start();
        publisher.settle().await;
        engine.emit(0, PeerEvent::Candidate(candidate("c1")));

        let mut status = publisher.server_status();
        let port = match tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| matches!(s, ServerStatus::Listening(_))),
        )
        .await
        .unwrap()
        .unwrap()
        .clone()
        {
            ServerStatus::Listening(port) => port,
            other => panic!("unexpected status {other:?}"),
        };

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/"))
            .await
            .unwrap();
        let mut received = Vec::new();
        while received.len() < 2 {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = msg {
                received.push(SignalingMessage::from_json(&text).unwrap().into_signal().unwrap());
            }
        }
        assert_eq!(received[0], Signal::Offer("v=0 o1".into()));
        assert!(matches!(&received[1], Signal::Candidate(c) if c.sdp == "c1"));

        let answer = SignalingMessage::answer("v=0 a1").to_json().unwrap();
        ws.send(WsMessage::Text(answer.into())).await.unwrap();

        let peer = engine.peer(0);
        for _ in 0..500 {
            publisher.settle().await;
            if peer.calls().iter().any(|c| c == "set_remote_answer v=0 a1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(peer.calls().iter().any(|c| c == "set_remote_answer v=0 a1"));

        publisher.stop();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == ServerStatus::Stopped),
        )
        .await
        .unwrap()
        .unwrap();
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn relay_mode_sends_offer_and_obeys_remote_commands() {
        let engine = Arc::new(FakeEngine::default());
        let relay = Arc::new(RecordingRelay::default());
        let device = FakeDevice::with_types(&[OpticalType::WideAngle, OpticalType::Telephoto]);
        let camera = Arc::new(CameraFrameSource::new(device, CameraOptions::default()).unwrap());
        let config = SessionConfig {
            signaling: SignalingMode::RelayChannel(relay.clone()),
            ..SessionConfig::default()
        };
        let publisher = publisher_with(config, &engine, camera.clone());

        publisher.handle_relay_event(RelayEvent::new(relay_event::STATE, "1"));
        publisher.settle().await;
        assert_eq!(engine.peer_count(), 1);
        assert!(camera.is_running());

        let names = relay.names();
        assert_eq!(names[0], relay_event::OFFER_CHUNK);
        assert!(names.contains(&relay_event::BACK_CAMERA_ALL.to_string()));
        let first = relay.sent.lock().unwrap()[0].args.clone();
        let chunk: SdpChunk = serde_json::from_str(&first).unwrap();
        assert_eq!(chunk.data, "v=0 o1");

        engine.emit(0, PeerEvent::Candidate(candidate("c1")));
        publisher.handle_relay_event(RelayEvent::new(
            relay_event::ANSWER,
            r#"{"action":"answer","sdp":"v=0 a1"}"#,
        ));
        publisher.settle().await;
        assert!(relay.names().contains(&relay_event::CANDIDATE.to_string()));
        assert!(
            engine
                .peer(0)
                .calls()
                .contains(&"set_remote_answer v=0 a1".to_string())
        );

        publisher.handle_relay_event(RelayEvent::new(relay_event::CAMERA, "1"));
        publisher.settle().await;
        let mut status = publisher.camera_status().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.position == CameraPosition::Front),
        )
        .await
        .unwrap()
        .unwrap();

        publisher.handle_relay_event(RelayEvent::new(relay_event::STATE, "0"));
        publisher.settle().await;
        assert_eq!(*publisher.state().borrow(), SessionState::Closed);

        // Remote start works again after a remote stop.
        publisher.handle_relay_event(RelayEvent::new(relay_event::STATE, "1"));
        publisher.settle().await;
        assert_eq!(engine.peer_count(), 2);
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn relay_event_outside_relay_mode_is_ignored() {
        let engine = Arc::new(FakeEngine::default());
        let publisher = publisher_with(
            custom_config(),
            &engine,
            Arc::new(ExternalFrameSource::new()),
        );
        publisher.handle_relay_event(RelayEvent::new(relay_event::STATE, "1"));
        publisher.settle().await;
        assert_eq!(engine.peer_count(), 0);
        publisher.shutdown().await;
    }
}
