//! Signaling through an external store-and-forward message relay, for
//! publishers that cannot accept inbound connections.
//!
//! Offers go out as [`SdpChunk`]s, candidates as a single
//! [`RelayCandidate`]. The host application feeds inbound relay events to
//! [`RelaySignalingChannel::handle_event`]; besides answers and candidates,
//! the remote peer may send control events that are surfaced as
//! [`RemoteCommand`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};
use uuid::Uuid;
use vidcast_protocol::{
    CameraEntry, CameraList, ChunkAssembler, MessageKind, RELAY_CHUNK_SIZE, RelayAnswer,
    RelayCandidate, RelayEvent, SdpChunk, chunk_sdp, relay_event,
};

use super::{SignalingChannel, SignalingDelegate};
use crate::engine::IceCandidate;
use crate::error::PublishError;
use crate::source::{CameraPosition, OpticalType};

/// Outbound half of the relay, supplied by the host application.
pub trait MessageRelay: Send + Sync {
    fn send(&self, event: RelayEvent) -> anyhow::Result<()>;
}

/// Control requests a remote peer can make over the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    Start,
    Stop,
    Facing(CameraPosition),
    SetMirrored(bool),
    SelectOpticalType(OpticalType),
}

pub trait RemoteCommandHandler: Send + Sync {
    fn on_remote_command(&self, command: RemoteCommand);
}

pub struct RelaySignalingChannel {
    relay: Arc<dyn MessageRelay>,
    active: AtomicBool,
    assembler: Mutex<ChunkAssembler>,
    delegate: Weak<dyn SignalingDelegate>,
    commands: Weak<dyn RemoteCommandHandler>,
}

impl RelaySignalingChannel {
    pub fn new(
        relay: Arc<dyn MessageRelay>,
        delegate: Weak<dyn SignalingDelegate>,
        commands: Weak<dyn RemoteCommandHandler>,
    ) -> Self {
        Self {
            relay,
            active: AtomicBool::new(false),
            assembler: Mutex::new(ChunkAssembler::new()),
            delegate,
            commands,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Tell the remote peer which back-camera optical types it may select.
    pub fn announce_back_cameras(&self, types: &[OpticalType]) {
        if !self.is_active() {
            debug!("Relay channel inactive, camera list not announced");
            return;
        }
        let list = CameraList {
            cameras: types
                .iter()
                .map(|t| CameraEntry {
                    kind: t.raw().to_string(),
                    name: t.name().to_string(),
                })
                .collect(),
        };
        match serde_json::to_string(&list) {
            Ok(args) => {
                info!(count = types.len(), "Announcing back camera types");
                self.deliver(RelayEvent::new(relay_event::BACK_CAMERA_ALL, args));
            }
            Err(e) => warn!("Failed to serialize camera list: {e}"),
        }
    }

    /// Process one inbound relay event. Answers and candidates are only
    /// accepted while the channel is started; control events always are.
    pub fn handle_event(&self, event: RelayEvent) {
        match event.name.as_str() {
            relay_event::ANSWER => {
                if !self.accepting(&event.name) {
                    return;
                }
                match serde_json::from_str::<RelayAnswer>(&event.args) {
                    Ok(answer) if answer.action == "answer" => self.answer(answer.sdp),
                    Ok(answer) => warn!(action = %answer.action, "Ignoring relay answer with unexpected action"),
                    Err(e) => warn!("Invalid relay answer: {e}"),
                }
            }
            relay_event::ANSWER_CHUNK => {
                if !self.accepting(&event.name) {
                    return;
                }
                let chunk = match serde_json::from_str::<SdpChunk>(&event.args) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("Invalid relay answer chunk: {e}");
                        return;
                    }
                };
                let assembled = self
                    .assembler
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(chunk);
                match assembled {
                    Ok(Some((MessageKind::Answer, sdp))) => self.answer(sdp),
                    Ok(Some((kind, _))) => warn!(?kind, "Ignoring chunked relay message that is not an answer"),
                    Ok(None) => {}
                    Err(e) => warn!("Dropping relay answer chunk: {e}"),
                }
            }
            relay_event::CANDIDATE => {
                if !self.accepting(&event.name) {
                    return;
                }
                match serde_json::from_str::<RelayCandidate>(&event.args) {
                    Ok(payload) => {
                        let candidate = IceCandidate {
                            sdp: payload.candidate,
                            sdp_mid: payload.sdp_mid,
                            sdp_mline_index: payload
                                .sdp_mline_index
                                .and_then(|i| u16::try_from(i).ok()),
                        };
                        match self.delegate.upgrade() {
                            Some(delegate) => delegate.on_candidate(candidate),
                            None => debug!("No signaling delegate, relay candidate dropped"),
                        }
                    }
                    Err(e) => warn!("Invalid relay candidate: {e}"),
                }
            }
            relay_event::BACK_CAMERA_ALL => {
                debug!("Ignoring inbound camera list, it is only ever sent");
            }
            name => match decode_command(name, event.args.trim()) {
                Some(command) => match self.commands.upgrade() {
                    Some(handler) => {
                        info!(?command, "Remote command received");
                        handler.on_remote_command(command);
                    }
                    None => debug!(?command, "No command handler, remote command dropped"),
                },
                None => debug!(event = name, args = %event.args, "Ignoring unrecognized relay event"),
            },
        }
    }

    fn accepting(&self, name: &str) -> bool {
        if self.is_active() {
            true
        } else {
            debug!(event = name, "Relay channel inactive, inbound event dropped");
            false
        }
    }

    fn answer(&self, sdp: String) {
        info!("Received answer over relay");
        match self.delegate.upgrade() {
            Some(delegate) => delegate.on_answer(sdp),
            None => debug!("No signaling delegate, relay answer dropped"),
        }
    }

    fn deliver(&self, event: RelayEvent) -> bool {
        match self.relay.send(event) {
            Ok(()) => true,
            Err(e) => {
                let err = PublishError::TransportFailed(format!("{e:#}"));
                warn!("{err}");
                false
            }
        }
    }
}

fn decode_command(name: &str, args: &str) -> Option<RemoteCommand> {
    match (name, args) {
        (relay_event::STATE, "1") => Some(RemoteCommand::Start),
        (relay_event::STATE, "0") => Some(RemoteCommand::Stop),
        (relay_event::CAMERA, "1") => Some(RemoteCommand::Facing(CameraPosition::Front)),
        (relay_event::CAMERA, "2") => Some(RemoteCommand::Facing(CameraPosition::Back)),
        (relay_event::MIRRORED, "1") => Some(RemoteCommand::SetMirrored(true)),
        (relay_event::MIRRORED, "0") => Some(RemoteCommand::SetMirrored(false)),
        (relay_event::BACK_CAMERA, raw) => {
            OpticalType::from_raw(raw).map(RemoteCommand::SelectOpticalType)
        }
        _ => None,
    }
}

impl SignalingChannel for RelaySignalingChannel {
    fn start(&self) {
        if !self.active.swap(true, Ordering::AcqRel) {
            info!("Relay signaling channel started");
        }
    }

    fn stop(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            *self.assembler.lock().unwrap_or_else(|e| e.into_inner()) = ChunkAssembler::new();
            info!("Relay signaling channel stopped");
        }
    }

    fn send_offer(&self, sdp: &str) {
        if !self.is_active() {
            debug!("Relay channel inactive, offer dropped");
            return;
        }
        let chunks = chunk_sdp(MessageKind::Offer, sdp, Uuid::new_v4(), RELAY_CHUNK_SIZE);
        let total = chunks.len();
        for chunk in chunks {
            let args = match serde_json::to_string(&chunk) {
                Ok(args) => args,
                Err(e) => {
                    warn!("Failed to serialize offer chunk: {e}");
                    return;
                }
            };
            if !self.deliver(RelayEvent::new(relay_event::OFFER_CHUNK, args)) {
                warn!(index = chunk.index, total, "Offer delivery over relay abandoned");
                return;
            }
        }
        debug!(chunks = total, bytes = sdp.len(), "Offer sent over relay");
    }

    fn send_candidate(&self, candidate: &IceCandidate) {
        if !self.is_active() {
            debug!("Relay channel inactive, candidate dropped");
            return;
        }
        let payload = RelayCandidate {
            kind: MessageKind::Candidate,
            candidate: candidate.sdp.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index.map(i32::from),
        };
        match serde_json::to_string(&payload) {
            Ok(args) => {
                self.deliver(RelayEvent::new(relay_event::CANDIDATE, args));
            }
            Err(e) => warn!("Failed to serialize candidate: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingRelay {
        sent: Mutex<Vec<RelayEvent>>,
        fail: AtomicBool,
    }

    impl MessageRelay for RecordingRelay {
        fn send(&self, event: RelayEvent) -> anyhow::Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                anyhow::bail!("relay offline");
            }
            self.sent.lock().unwrap().push(event);
            Ok(())
        }
    }

    impl RecordingRelay {
        fn sent(&self) -> Vec<RelayEvent> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct Inbox {
        answers: Mutex<Vec<String>>,
        candidates: Mutex<Vec<IceCandidate>>,
        commands: Mutex<Vec<RemoteCommand>>,
    }

    impl SignalingDelegate for Inbox {
        fn on_answer(&self, sdp: String) {
            self.answers.lock().unwrap().push(sdp);
        }
        fn on_candidate(&self, candidate: IceCandidate) {
            self.candidates.lock().unwrap().push(candidate);
        }
    }

    impl RemoteCommandHandler for Inbox {
        fn on_remote_command(&self, command: RemoteCommand) {
            self.commands.lock().unwrap().push(command);
        }
    }

    fn channel() -> (Arc<RecordingRelay>, Arc<Inbox>, RelaySignalingChannel) {
        let relay = Arc::new(RecordingRelay::default());
        let inbox = Arc::new(Inbox::default());
        let delegate: Arc<dyn SignalingDelegate> = inbox.clone();
        let handler: Arc<dyn RemoteCommandHandler> = inbox.clone();
        let channel = RelaySignalingChannel::new(
            relay.clone(),
            Arc::downgrade(&delegate),
            Arc::downgrade(&handler),
        );
        (relay, inbox, channel)
    }

    #[test]
    fn offer_is_chunked_under_one_message_id() {
        let (relay, _inbox, channel) = channel();
        channel.start();
        let sdp = "v=0\r\n".repeat(250); // 1250 bytes
        channel.send_offer(&sdp);

        let sent = relay.sent();
        assert_eq!(sent.len(), 3);
        let chunks: Vec<SdpChunk> = sent
            .iter()
            .map(|e| {
                assert_eq!(e.name, relay_event::OFFER_CHUNK);
                serde_json::from_str(&e.args).unwrap()
            })
            .collect();
        assert!(chunks.iter().all(|c| c.message_id == chunks[0].message_id));
        assert!(chunks.iter().all(|c| c.total == 3 && c.kind == MessageKind::Offer));
        let joined: String = chunks.iter().map(|c| c.data.as_str()).collect();
        assert_eq!(joined, sdp);
    }

    #[test]
    fn candidate_is_one_payload() {
        let (relay, _inbox, channel) = channel();
        channel.start();
        channel.send_candidate(&IceCandidate::new("candidate:1", Some("0".into()), Some(0)));
        let sent = relay.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].name, relay_event::CANDIDATE);
        let payload: RelayCandidate = serde_json::from_str(&sent[0].args).unwrap();
        assert_eq!(payload.candidate, "candidate:1");
        assert_eq!(payload.sdp_mline_index, Some(0));
    }

    #[test]
    fn nothing_is_sent_while_stopped() {
        let (relay, _inbox, channel) = channel();
        channel.send_offer("v=0");
        channel.send_candidate(&IceCandidate::new("c", None, Some(0)));
        channel.announce_back_cameras(&[OpticalType::WideAngle]);
        assert!(relay.sent().is_empty());
    }

    #[test]
    fn relay_failure_stops_offer_delivery() {
        let (relay, _inbox, channel) = channel();
        channel.start();
        relay.fail.store(true, Ordering::Relaxed);
        channel.send_offer(&"x".repeat(2000));
        assert!(relay.sent().is_empty());

        relay.fail.store(false, Ordering::Relaxed);
        channel.send_candidate(&IceCandidate::new("c", None, Some(0)));
        assert_eq!(relay.sent().len(), 1);
    }

    #[test]
    fn inbound_answer_and_candidate_reach_delegate() {
        let (_relay, inbox, channel) = channel();
        channel.start();
        channel.handle_event(RelayEvent::new(
            relay_event::ANSWER,
            r#"{"action":"answer","sdp":"v=0 answer"}"#,
        ));
        channel.handle_event(RelayEvent::new(
            relay_event::CANDIDATE,
            r#"{"type":"candidate","candidate":"candidate:9","sdpMid":"0","sdpMLineIndex":-1}"#,
        ));
        assert_eq!(*inbox.answers.lock().unwrap(), vec!["v=0 answer".to_string()]);
        let candidates = inbox.candidates.lock().unwrap().clone();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].sdp, "candidate:9");
        assert_eq!(candidates[0].sdp_mline_index, None);
    }

    #[test]
    fn chunked_answer_is_reassembled() {
        let (_relay, inbox, channel) = channel();
        channel.start();
        let sdp = "a=answer\r\n".repeat(120);
        let mut chunks = chunk_sdp(MessageKind::Answer, &sdp, Uuid::new_v4(), RELAY_CHUNK_SIZE);
        chunks.reverse();
        for chunk in chunks {
            channel.handle_event(RelayEvent::new(
                relay_event::ANSWER_CHUNK,
                serde_json::to_string(&chunk).unwrap(),
            ));
        }
        assert_eq!(*inbox.answers.lock().unwrap(), vec![sdp]);
    }

    #[test]
    fn inbound_signaling_ignored_while_stopped() {
        let (_relay, inbox, channel) = channel();
        channel.handle_event(RelayEvent::new(
            relay_event::ANSWER,
            r#"{"action":"answer","sdp":"late"}"#,
        ));
        assert!(inbox.answers.lock().unwrap().is_empty());
    }

    #[test]
    fn control_events_become_commands() {
        let (_relay, inbox, channel) = channel();
        for (name, args) in [
            (relay_event::STATE, "1"),
            (relay_event::CAMERA, "2"),
            (relay_event::MIRRORED, "1"),
            (relay_event::BACK_CAMERA, "telephoto"),
            (relay_event::BACK_CAMERA, "fisheye"),
            (relay_event::BACK_CAMERA_ALL, r#"{"cameras":[]}"#),
            (relay_event::STATE, "0"),
        ] {
            channel.handle_event(RelayEvent::new(name, args));
        }
        assert_eq!(
            *inbox.commands.lock().unwrap(),
            vec![
                RemoteCommand::Start,
                RemoteCommand::Facing(CameraPosition::Back),
                RemoteCommand::SetMirrored(true),
                RemoteCommand::SelectOpticalType(OpticalType::Telephoto),
                RemoteCommand::Stop,
            ]
        );
    }

    #[test]
    fn announce_lists_types_with_names() {
        let (relay, _inbox, channel) = channel();
        channel.start();
        channel.announce_back_cameras(&[OpticalType::WideAngle, OpticalType::UltraWide]);
        let sent = relay.sent();
        assert_eq!(sent[0].name, relay_event::BACK_CAMERA_ALL);
        let list: CameraList = serde_json::from_str(&sent[0].args).unwrap();
        assert_eq!(list.cameras.len(), 2);
        assert_eq!(list.cameras[1].kind, "ultra_wide");
    }
}
