use serde::{Deserialize, Serialize};

/// Offer or answer side of a descriptor exchange
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Offer,
    Answer,
}

/// SDP-like session description with metadata
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    #[serde(rename = "type")]
    pub kind: DescriptorKind,
    #[serde(rename = "sdp")]
    pub body: String,
    #[serde(default)]
    pub ts: i64,
}

impl Descriptor {
    pub fn new(kind: DescriptorKind, body: impl Into<String>) -> Self {
        Self {
            kind,
            body: body.into(),
            ts: chrono::Utc::now().timestamp(),
        }
    }

    pub fn offer(body: impl Into<String>) -> Self {
        Self::new(DescriptorKind::Offer, body)
    }

    pub fn answer(body: impl Into<String>) -> Self {
        Self::new(DescriptorKind::Answer, body)
    }
}

/// ICE candidate in its browser-compatible JSON shape
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// `host`, `srflx`, `prflx` or `relay`, when the line carries one
    pub fn candidate_type(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        parts.by_ref().find(|p| *p == "typ")?;
        parts.next()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    Local,
    Remote,
}

/// A candidate as it passes through the queue. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRecord {
    pub origin: CandidateOrigin,
    pub payload: IceCandidate,
    pub sequence: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    AwaitingMedia,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Inputs that move a [`ConnectionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    MediaAcquired,
    LocalDescriptorReady,
    /// remote descriptor applied and the transport reports connectivity
    Connectivity,
    TransportDisconnected,
    TransportReconnected,
    GraceExpired,
    TransportFailed,
    Hangup,
}

impl ConnectionState {
    /// Next state for `input`, or `None` when the input does not apply here.
    pub fn apply(self, input: Transition) -> Option<ConnectionState> {
        use ConnectionState::*;
        use Transition::*;

        match (self, input) {
            (Idle, MediaAcquired) => Some(AwaitingMedia),
            (AwaitingMedia, LocalDescriptorReady) => Some(Negotiating),
            (Negotiating, Connectivity) => Some(Connected),
            (Connected, TransportDisconnected) => Some(Disconnected),
            (Disconnected, TransportReconnected) => Some(Connected),
            (Disconnected, GraceExpired) => Some(Failed),
            (Negotiating | Connected | Disconnected, TransportFailed) => Some(Failed),
            (Closed, Hangup) => None,
            (_, Hangup) => Some(Closed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}
