mod cli;

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use vidcast::config::{SignalingModeKind, load_config};
use vidcast::peer::WebRtcEngine;
use vidcast::source::{AnnexBFileSource, ExternalFrameSource, FrameSource};
use vidcast::{IceCandidate, Publisher, SessionConfig, SignalingMode};
use vidcast_protocol::{CandidatePayload, Signal, SignalingMessage};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args()?;

    // Config is read before the global subscriber exists, so its own log lines
    // go through a temporary stderr subscriber.
    let load_subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .finish();
    let mut config =
        tracing::subscriber::with_default(load_subscriber, || load_config(&args.config_path))?;

    if let Some(port) = args.port {
        config.signaling.port = port;
    }
    if let Some(mode) = args.mode {
        config.signaling.mode = mode;
    }
    if let Some(fps) = args.fps {
        config.video.max_framerate_fps = fps;
    }

    // Stdout carries signaling in custom mode, so logs always go to stderr.
    let default_level = config.logging.level.clone();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let signaling = match config.signaling.mode {
        SignalingModeKind::Websocket => SignalingMode::LocalWebSocket,
        SignalingModeKind::Custom => SignalingMode::Custom,
        SignalingModeKind::Relay => anyhow::bail!(
            "Relay signaling needs a host-provided message relay and is only available through the library API"
        ),
    };
    let custom = matches!(signaling, SignalingMode::Custom);
    let session_config = SessionConfig::from_publisher_config(&config, signaling);
    let engine = Arc::new(WebRtcEngine::new(session_config.ice_servers.clone()));

    let source: Arc<dyn FrameSource> = match &args.input {
        Some(path) => Arc::new(AnnexBFileSource::open(path, session_config.max_framerate_fps)?),
        None => {
            tracing::warn!(
                "No --input given, publishing an external source that nothing feeds. Viewers will connect but see no video."
            );
            Arc::new(ExternalFrameSource::new())
        }
    };

    tracing::info!(
        mode = ?session_config.signaling,
        port = session_config.port,
        max_fps = session_config.max_framerate_fps,
        "vidcast v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let publisher = Publisher::new(session_config, engine, source);
    watch_status(&publisher);

    // Custom mode speaks newline-delimited SignalingMessage JSON on stdio.
    let (out_tx, out_rx) = mpsc::unbounded_channel::<SignalingMessage>();
    if custom {
        tokio::spawn(write_stdout(out_rx));
        forward_local_signals(&publisher, out_tx);
    } else {
        drop(out_rx);
    }

    publisher.start();

    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = custom;

    loop {
        tokio::select! {
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_stdin_line(&publisher, &line),
                Ok(None) => {
                    tracing::info!("Stdin closed, no more remote signaling will arrive");
                    stdin_open = false;
                }
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {e}");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    publisher.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn watch_status(publisher: &Publisher) {
    let mut state = publisher.state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            tracing::info!(state = ?current, "Session state changed");
        }
    });

    let mut last_error = publisher.last_error();
    tokio::spawn(async move {
        while last_error.changed().await.is_ok() {
            if let Some(err) = last_error.borrow_and_update().as_ref() {
                tracing::error!(kind = ?err.kind(), "Session error: {err}");
            }
        }
    });

    let mut server = publisher.server_status();
    tokio::spawn(async move {
        while server.changed().await.is_ok() {
            let status = server.borrow_and_update().clone();
            tracing::info!(status = ?status, "Signaling server status");
        }
    });
}

fn forward_local_signals(publisher: &Publisher, out: mpsc::UnboundedSender<SignalingMessage>) {
    let mut offer = publisher.local_offer();
    let offer_out = out.clone();
    tokio::spawn(async move {
        loop {
            let sdp = offer.borrow_and_update().clone();
            if let Some(sdp) = sdp
                && offer_out.send(SignalingMessage::offer(sdp)).is_err()
            {
                return;
            }
            if offer.changed().await.is_err() {
                return;
            }
        }
    });

    let Some(mut candidates) = publisher.candidates() else {
        return;
    };
    tokio::spawn(async move {
        loop {
            match candidates.recv().await {
                Ok(candidate) => {
                    let Some(index) = candidate.sdp_mline_index else {
                        tracing::warn!("Local candidate has no m-line index, not forwarding");
                        continue;
                    };
                    let msg = SignalingMessage::candidate(CandidatePayload {
                        sdp: candidate.sdp,
                        sdp_mline_index: i32::from(index),
                        sdp_mid: candidate.sdp_mid,
                    });
                    if out.send(msg).is_err() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {n} local candidate(s), stdout writer fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

async fn write_stdout(mut rx: mpsc::UnboundedReceiver<SignalingMessage>) {
    let mut stdout = tokio::io::stdout();
    while let Some(msg) = rx.recv().await {
        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Failed to encode signaling message: {e}");
                continue;
            }
        };
        let line = format!("{json}\n");
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            tracing::warn!("Failed to write to stdout: {e}");
            return;
        }
        let _ = stdout.flush().await;
    }
}

fn handle_stdin_line(publisher: &Publisher, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let signal = match SignalingMessage::from_json(line).and_then(|m| m.into_signal()) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::warn!("Ignoring stdin message: {e}");
            return;
        }
    };
    match signal {
        Signal::Answer(sdp) => publisher.apply_answer(sdp),
        Signal::Candidate(payload) => {
            let index = u16::try_from(payload.sdp_mline_index).ok();
            publisher.apply_candidate(IceCandidate::new(payload.sdp, payload.sdp_mid, index));
        }
        Signal::Offer(_) => tracing::warn!("Ignoring offer on stdin, this side is the offerer"),
    }
}
