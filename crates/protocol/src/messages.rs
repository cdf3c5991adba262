use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Byte size of one relay chunk. Relay transports cap individual payloads,
/// so session descriptions are split before sending.
pub const RELAY_CHUNK_SIZE: usize = 512;

/// Upper bound on the chunk count of a single relayed message.
pub const MAX_RELAY_CHUNKS: u32 = 1024;

/// Partially received relay messages kept before the oldest is evicted.
const MAX_PENDING_MESSAGES: usize = 16;

/// Kind tag of a signaling frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Offer,
    Answer,
    Candidate,
}

/// Candidate body of a `candidate` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub sdp: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: i32,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

/// One text frame on the WebSocket signaling socket.
///
/// Exactly one of `session_description` / `candidate` is populated, matching
/// `kind`. Use [`SignalingMessage::into_signal`] to get a checked view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidatePayload>,
}

/// Checked form of a [`SignalingMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(String),
    Answer(String),
    Candidate(CandidatePayload),
}

impl SignalingMessage {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Offer,
            session_description: Some(sdp.into()),
            candidate: None,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Answer,
            session_description: Some(sdp.into()),
            candidate: None,
        }
    }

    pub fn candidate(payload: CandidatePayload) -> Self {
        Self {
            kind: MessageKind::Candidate,
            session_description: None,
            candidate: Some(payload),
        }
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Validate that the populated field matches `kind`.
    pub fn into_signal(self) -> Result<Signal, MessageError> {
        let kind = self.kind;
        match (kind, self.session_description, self.candidate) {
            (MessageKind::Offer, Some(sdp), None) => Ok(Signal::Offer(sdp)),
            (MessageKind::Answer, Some(sdp), None) => Ok(Signal::Answer(sdp)),
            (MessageKind::Candidate, None, Some(payload)) => Ok(Signal::Candidate(payload)),
            (MessageKind::Candidate, Some(_), _) => Err(MessageError::UnexpectedField {
                kind,
                field: "sessionDescription",
            }),
            (MessageKind::Candidate, None, None) => Err(MessageError::MissingField {
                kind,
                field: "candidate",
            }),
            (_, _, Some(_)) => Err(MessageError::UnexpectedField {
                kind,
                field: "candidate",
            }),
            (_, None, None) => Err(MessageError::MissingField {
                kind,
                field: "sessionDescription",
            }),
        }
    }
}

impl From<Signal> for SignalingMessage {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Offer(sdp) => Self::offer(sdp),
            Signal::Answer(sdp) => Self::answer(sdp),
            Signal::Candidate(payload) => Self::candidate(payload),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind:?} message is missing its {field} field")]
    MissingField {
        kind: MessageKind,
        field: &'static str,
    },
    #[error("{kind:?} message carries an unexpected {field} field")]
    UnexpectedField {
        kind: MessageKind,
        field: &'static str,
    },
    #[error("chunk {index} is out of range for a {total}-chunk message")]
    ChunkOutOfRange { index: u32, total: u32 },
    #[error("chunk total changed from {expected} to {actual} within one message")]
    ChunkTotalMismatch { expected: u32, actual: u32 },
}

/// Event names understood on the message relay.
pub mod relay_event {
    /// Outbound offer chunk ([`super::SdpChunk`]).
    pub const OFFER_CHUNK: &str = "vidcast_sdp";
    /// Candidate in either direction ([`super::RelayCandidate`]).
    pub const CANDIDATE: &str = "vidcast_ice";
    /// Inbound answer in one piece ([`super::RelayAnswer`]).
    pub const ANSWER: &str = "answer";
    /// Inbound answer chunk ([`super::SdpChunk`]).
    pub const ANSWER_CHUNK: &str = "answer_chunk";
    /// Remote start/stop: `"1"` or `"0"`.
    pub const STATE: &str = "vidcast";
    /// Remote camera facing: `"1"` front, `"2"` back.
    pub const CAMERA: &str = "vidcast_camera";
    /// Remote mirroring: `"1"` or `"0"`.
    pub const MIRRORED: &str = "vidcast_mirrored";
    /// Remote back-camera optical type selection (raw type value).
    pub const BACK_CAMERA: &str = "vidcast_back_camera";
    /// Outbound list of available back-camera optical types ([`super::CameraList`]).
    pub const BACK_CAMERA_ALL: &str = "vidcast_back_camera_all";
}

/// A named event carried by the message relay. `args` is an opaque string,
/// JSON for structured payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEvent {
    pub name: String,
    pub args: String,
}

impl RelayEvent {
    pub fn new(name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: args.into(),
        }
    }
}

/// One fixed-size segment of a session description sent over the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpChunk {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub message_id: Uuid,
    pub index: u32,
    pub total: u32,
    pub data: String,
}

/// Candidate payload on the relay. The line index is optional here; peers
/// that cannot supply one omit it or send a negative value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCandidate {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<i32>,
}

/// Single-piece answer on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAnswer {
    pub action: String,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraList {
    pub cameras: Vec<CameraEntry>,
}

/// Split `sdp` into chunks of at most `chunk_size` bytes, never splitting a
/// UTF-8 sequence. An empty description still produces one (empty) chunk.
pub fn chunk_sdp(kind: MessageKind, sdp: &str, message_id: Uuid, chunk_size: usize) -> Vec<SdpChunk> {
    let chunk_size = chunk_size.max(4);
    let mut pieces = Vec::new();
    let mut rest = sdp;
    while !rest.is_empty() {
        let mut end = chunk_size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        pieces.push(&rest[..end]);
        rest = &rest[end..];
    }
    if pieces.is_empty() {
        pieces.push("");
    }

    let total = pieces.len() as u32;
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, data)| SdpChunk {
            kind,
            message_id,
            index: index as u32,
            total,
            data: data.to_string(),
        })
        .collect()
}

struct PendingMessage {
    kind: MessageKind,
    total: u32,
    parts: Vec<Option<String>>,
    received: u32,
}

/// Reassembles [`SdpChunk`]s keyed by message id. Chunks may arrive in any
/// order; duplicates overwrite without being counted twice.
#[derive(Default)]
pub struct ChunkAssembler {
    pending: HashMap<Uuid, PendingMessage>,
    order: VecDeque<Uuid>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the full description once every chunk of its
    /// message has arrived.
    pub fn push(&mut self, chunk: SdpChunk) -> Result<Option<(MessageKind, String)>, MessageError> {
        if chunk.total == 0 || chunk.total > MAX_RELAY_CHUNKS || chunk.index >= chunk.total {
            return Err(MessageError::ChunkOutOfRange {
                index: chunk.index,
                total: chunk.total,
            });
        }

        if !self.pending.contains_key(&chunk.message_id) {
            if self.order.len() >= MAX_PENDING_MESSAGES {
                if let Some(oldest) = self.order.pop_front() {
                    self.pending.remove(&oldest);
                }
            }
            self.order.push_back(chunk.message_id);
            self.pending.insert(
                chunk.message_id,
                PendingMessage {
                    kind: chunk.kind,
                    total: chunk.total,
                    parts: vec![None; chunk.total as usize],
                    received: 0,
                },
            );
        }

        let Some(entry) = self.pending.get_mut(&chunk.message_id) else {
            return Ok(None);
        };
        if entry.total != chunk.total {
            return Err(MessageError::ChunkTotalMismatch {
                expected: entry.total,
                actual: chunk.total,
            });
        }

        let slot = &mut entry.parts[chunk.index as usize];
        if slot.is_none() {
            entry.received += 1;
        }
        *slot = Some(chunk.data);

        if entry.received < entry.total {
            return Ok(None);
        }

        let kind = entry.kind;
        let sdp: String = entry.parts.iter().flatten().map(String::as_str).collect();
        self.pending.remove(&chunk.message_id);
        self.order.retain(|id| *id != chunk.message_id);
        Ok(Some((kind, sdp)))
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
