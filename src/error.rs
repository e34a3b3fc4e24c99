use thiserror::Error;

use crate::peer::types::{ConnectionState, DescriptorKind};

/// Top-level failure surfaced by [`crate::SessionNegotiator`].
#[derive(Debug, Error)]
pub enum CallError {
    #[error("local media unavailable: {0}")]
    MediaAcquisition(#[from] MediaError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("candidate rejected: {0}")]
    CandidateApplication(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("signaling store error: {0}")]
    Signaling(SignalingError),
    #[error("call was hung up while negotiating")]
    Cancelled,
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::NotFound(id) => CallError::SessionNotFound(id),
            other => CallError::Signaling(other),
        }
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        CallError::TransportFailure(err.to_string())
    }
}

/// Descriptor exchange driven out of its allowed order.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("{operation} is not allowed in state {state:?}")]
    OutOfOrder {
        operation: &'static str,
        state: ConnectionState,
    },
    #[error("remote descriptor already applied")]
    AlreadyNegotiated,
    #[error("local media has not been acquired")]
    MediaUnavailable,
    #[error("expected {expected:?} descriptor, got {actual:?}")]
    UnexpectedDescriptor {
        expected: DescriptorKind,
        actual: DescriptorKind,
    },
    #[error("connection is closed")]
    Closed,
    #[error("a session is already in progress")]
    SessionInProgress,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} already exists")]
    AlreadyExists(String),
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection setup failed: {0}")]
    Setup(String),
    #[error("descriptor rejected: {0}")]
    Descriptor(String),
    #[error("malformed candidate: {0}")]
    Candidate(String),
    #[error("track error: {0}")]
    Track(String),
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid ICE server entry: {0:?}")]
    InvalidIceServer(String),
    #[error("at least one ICE server is required")]
    NoIceServers,
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
}
