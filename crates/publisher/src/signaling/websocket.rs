//! WebSocket signaling server with offer/candidate replay.
//!
//! Viewers connect to `/` and exchange [`SignalingMessage`] text frames. The
//! last offer and every candidate generated since `start()` are kept in a
//! replay buffer; a viewer that connects late receives the buffer, in
//! generation order, before any live message.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vidcast_protocol::{CandidatePayload, Signal, SignalingMessage};

use super::{ServerStateObserver, SignalingChannel, SignalingDelegate};
use crate::engine::IceCandidate;
use crate::logging;

/// Answers and candidates are small; anything larger is not a signaling frame.
const MAX_MESSAGE_SIZE: usize = 65_536;

/// How long a restart waits for the previous run to release its listener.
const PREVIOUS_RUN_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Starting,
    /// Listening on the given (actual) port
    Listening(u16),
    Stopped,
    Failed(String),
    ClientConnected(SocketAddr),
    ClientDisconnected(SocketAddr),
}

/// Replay buffer and live connections. Only ever touched under `Inner::hub`.
/// [`ServerState`] is also published while holding this lock, so a task from
/// an earlier run can never overwrite the state of a later one.
#[derive(Default)]
struct Hub {
    running: bool,
    /// Bumped on every start so tasks from an earlier run can tell they are stale.
    epoch: u64,
    offer: Option<String>,
    candidates: Vec<String>,
    connections: HashMap<u64, mpsc::UnboundedSender<String>>,
    next_connection: u64,
}

impl Hub {
    fn is_current(&self, epoch: u64) -> bool {
        self.running && self.epoch == epoch
    }

    fn clear(&mut self) {
        self.offer = None;
        self.candidates.clear();
        // Dropping the senders ends every connection task.
        self.connections.clear();
    }

    fn replay(&self) -> Vec<String> {
        self.offer
            .iter()
            .chain(self.candidates.iter())
            .cloned()
            .collect()
    }

    /// Queue `text` on every open connection, forgetting closed ones.
    fn broadcast(&mut self, text: &str) -> usize {
        self.connections
            .retain(|_, tx| tx.send(text.to_string()).is_ok());
        self.connections.len()
    }
}

struct Inner {
    bind: String,
    port: u16,
    hub: Mutex<Hub>,
    state_tx: watch::Sender<ServerState>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    /// The accept loop of the latest run; holds the listener until it ends.
    serve_task: Mutex<Option<JoinHandle<()>>>,
    delegate: Weak<dyn SignalingDelegate>,
    observer: Weak<dyn ServerStateObserver>,
}

pub struct WebSocketSignalingServer {
    inner: Arc<Inner>,
}

#[derive(Clone)]
struct ConnectionCtx {
    inner: Arc<Inner>,
    epoch: u64,
}

impl WebSocketSignalingServer {
    /// `port` 0 picks a free port; the chosen one is reported in
    /// [`ServerState::Listening`].
    pub fn new(
        bind: impl Into<String>,
        port: u16,
        delegate: Weak<dyn SignalingDelegate>,
        observer: Weak<dyn ServerStateObserver>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ServerState::Idle);
        Self {
            inner: Arc::new(Inner {
                bind: bind.into(),
                port,
                hub: Mutex::new(Hub::default()),
                state_tx,
                shutdown: Mutex::new(None),
                serve_task: Mutex::new(None),
                delegate,
                observer,
            }),
        }
    }

    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.inner.state_tx.subscribe()
    }
}

impl SignalingChannel for WebSocketSignalingServer {
    /// Clears the replay buffer and begins listening. Must be called from
    /// within a Tokio runtime. Ignored while a run is in progress. A restart
    /// binds only after the previous run has released its listener.
    fn start(&self) {
        let epoch = {
            let mut hub = self.inner.hub.lock().unwrap_or_else(|e| e.into_inner());
            if hub.running {
                debug!("WebSocket signaling server already running");
                return;
            }
            hub.clear();
            hub.running = true;
            hub.epoch += 1;
            self.inner.set_state(ServerState::Starting);
            hub.epoch
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self
            .inner
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);

        let mut serve_task = self
            .inner
            .serve_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let previous = serve_task.take();
        let inner = Arc::clone(&self.inner);
        *serve_task = Some(logging::spawn(inner.serve(epoch, shutdown_rx, previous)));
    }

    fn stop(&self) {
        let was_running = {
            let mut hub = self.inner.hub.lock().unwrap_or_else(|e| e.into_inner());
            let was_running = hub.running;
            hub.running = false;
            hub.clear();
            if was_running {
                self.inner.set_state(ServerState::Stopped);
            }
            was_running
        };

        if let Some(tx) = self
            .inner
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(());
        }

        if was_running {
            info!("WebSocket signaling server stopped");
        }
    }

    fn send_offer(&self, sdp: &str) {
        let text = match SignalingMessage::offer(sdp).to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize offer: {e}");
                return;
            }
        };

        let mut hub = self.inner.hub.lock().unwrap_or_else(|e| e.into_inner());
        if !hub.running {
            debug!("WebSocket signaling server not running, offer dropped");
            return;
        }
        hub.offer = Some(text.clone());
        let viewers = hub.broadcast(&text);
        debug!(viewers, "Offer stored for replay and broadcast");
    }

    fn send_candidate(&self, candidate: &IceCandidate) {
        let Some(index) = candidate.sdp_mline_index else {
            warn!(
                candidate = %candidate.sdp,
                "Candidate has no media line index, not sending it to viewers"
            );
            return;
        };

        let msg = SignalingMessage::candidate(CandidatePayload {
            sdp: candidate.sdp.clone(),
            sdp_mline_index: i32::from(index),
            sdp_mid: candidate.sdp_mid.clone(),
        });
        let text = match msg.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize candidate: {e}");
                return;
            }
        };

        let mut hub = self.inner.hub.lock().unwrap_or_else(|e| e.into_inner());
        if !hub.running {
            debug!("WebSocket signaling server not running, candidate dropped");
            return;
        }
        hub.candidates.push(text.clone());
        let viewers = hub.broadcast(&text);
        debug!(
            viewers,
            stored = hub.candidates.len(),
            "Candidate stored for replay and broadcast"
        );
    }
}

impl Inner {
    /// Callers hold the hub lock. The observer only queues the state.
    fn set_state(&self, state: ServerState) {
        self.state_tx.send_replace(state.clone());
        if let Some(observer) = self.observer.upgrade() {
            observer.on_state_change(&state);
        }
    }

    /// Publish `state` unless the run tagged `epoch` has ended.
    fn set_state_if_current(&self, epoch: u64, state: ServerState) -> bool {
        let hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        if !hub.is_current(epoch) {
            return false;
        }
        self.set_state(state);
        true
    }

    /// Mark the run tagged `epoch` as failed, if it is still the current one.
    fn fail_if_current(&self, epoch: u64, reason: String) {
        let mut hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        if hub.is_current(epoch) {
            hub.running = false;
            hub.clear();
            self.set_state(ServerState::Failed(reason));
        }
    }

    async fn serve(
        self: Arc<Self>,
        epoch: u64,
        shutdown_rx: oneshot::Receiver<()>,
        previous: Option<JoinHandle<()>>,
    ) {
        if let Some(previous) = previous
            && tokio::time::timeout(PREVIOUS_RUN_WAIT, previous).await.is_err()
        {
            warn!("Previous WebSocket signaling server run is still shutting down");
        }

        let addr = format!("{}:{}", self.bind, self.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(%addr, "WebSocket signaling server failed to listen: {e}");
                self.fail_if_current(epoch, e.to_string());
                return;
            }
        };

        let port = listener
            .local_addr()
            .map(|local| local.port())
            .unwrap_or(self.port);
        if !self.set_state_if_current(epoch, ServerState::Listening(port)) {
            debug!("WebSocket signaling server stopped before it began listening");
            return;
        }
        info!(port, bind = %self.bind, "WebSocket signaling server listening");

        let app = Router::new()
            .route("/", get(ws_upgrade))
            .with_state(ConnectionCtx {
                inner: Arc::clone(&self),
                epoch,
            });

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await;

        if let Err(e) = result {
            error!("WebSocket signaling server error: {e}");
            self.fail_if_current(epoch, e.to_string());
        }
        debug!(port, "WebSocket signaling server task finished");
    }

    /// Decode one inbound frame and hand answers and candidates to the delegate.
    fn dispatch(&self, text: &str, addr: SocketAddr) {
        let signal = match SignalingMessage::from_json(text).and_then(SignalingMessage::into_signal)
        {
            Ok(signal) => signal,
            Err(e) => {
                warn!(%addr, "Ignoring invalid signaling frame: {e}");
                return;
            }
        };

        let Some(delegate) = self.delegate.upgrade() else {
            debug!(%addr, "No signaling delegate, inbound frame dropped");
            return;
        };

        match signal {
            Signal::Offer(_) => {
                warn!(%addr, "Ignoring offer from viewer, this side only offers");
            }
            Signal::Answer(sdp) => {
                info!(%addr, "Received answer");
                delegate.on_answer(sdp);
            }
            Signal::Candidate(payload) => {
                debug!(%addr, candidate = %payload.sdp, "Received candidate");
                delegate.on_candidate(IceCandidate {
                    sdp: payload.sdp,
                    sdp_mid: payload.sdp_mid,
                    sdp_mline_index: u16::try_from(payload.sdp_mline_index).ok(),
                });
            }
        }
    }
}

async fn ws_upgrade(
    State(ctx): State<ConnectionCtx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    debug!(%addr, "Viewer WebSocket upgrade");
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_viewer(socket, addr, ctx))
}

async fn handle_viewer(mut socket: WebSocket, addr: SocketAddr, ctx: ConnectionCtx) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Registration and the replay snapshot happen under one lock, so every
    // artifact is either in the snapshot or queued on `tx`, never both.
    let (id, replay) = {
        let mut hub = ctx.inner.hub.lock().unwrap_or_else(|e| e.into_inner());
        if !hub.is_current(ctx.epoch) {
            debug!(%addr, "Server stopped, refusing viewer");
            return;
        }
        let id = hub.next_connection;
        hub.next_connection += 1;
        hub.connections.insert(id, tx);
        ctx.inner.set_state(ServerState::ClientConnected(addr));
        (id, hub.replay())
    };

    info!(%addr, replayed = replay.len(), "Viewer connected");

    let mut open = true;
    for text in replay {
        if socket.send(Message::Text(text.into())).await.is_err() {
            debug!(%addr, "Replay send failed");
            open = false;
            break;
        }
    }

    while open {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        debug!(%addr, "Viewer WebSocket send failed");
                        break;
                    }
                }
                None => {
                    // Server stopped and dropped our sender.
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => ctx.inner.dispatch(&text, addr),
                Some(Ok(Message::Close(_))) | None => {
                    debug!(%addr, "Viewer closed the WebSocket");
                    break;
                }
                Some(Err(e)) => {
                    debug!(%addr, "Viewer WebSocket error: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    {
        let mut hub = ctx.inner.hub.lock().unwrap_or_else(|e| e.into_inner());
        hub.connections.remove(&id);
        if hub.is_current(ctx.epoch) {
            ctx.inner.set_state(ServerState::ClientDisconnected(addr));
        }
    }
    info!(%addr, "Viewer disconnected");
}
