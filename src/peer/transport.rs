//! Capability traits over the real-time media engine.
//!
//! Transports never call back into the state machine. Everything they
//! observe is posted as a [`TransportEvent`] on the channel handed to
//! [`TransportFactory::create_connection`].

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::IceSettings;
use crate::error::TransportError;
use crate::peer::media::{LocalTrack, TrackKind};
use crate::peer::types::{Descriptor, IceCandidate};

/// Connectivity as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

pub enum TransportEvent {
    /// `None` marks the end of gathering
    LocalCandidate(Option<IceCandidate>),
    RemoteTrack(RemoteTrack),
    StateChanged(PeerState),
    DataChannel(Arc<dyn DataChannel>),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            TransportEvent::RemoteTrack(t) => f.debug_tuple("RemoteTrack").field(t).finish(),
            TransportEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            TransportEvent::DataChannel(dc) => {
                f.debug_tuple("DataChannel").field(&dc.label()).finish()
            }
        }
    }
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Closed,
}

/// Ordered, reliable auxiliary channel on the peer link.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn ready_state(&self) -> ChannelState;

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Inbound events. Handed out once; later calls return `None`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// One peer link.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_offer(&self) -> Result<Descriptor, TransportError>;

    async fn create_answer(&self) -> Result<Descriptor, TransportError>;

    async fn set_local_descriptor(&self, descriptor: &Descriptor) -> Result<(), TransportError>;

    async fn set_remote_descriptor(&self, descriptor: &Descriptor) -> Result<(), TransportError>;

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError>;

    /// Always `ordered: true`.
    async fn create_data_channel(&self, label: &str)
        -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_connection(
        &self,
        settings: &IceSettings,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
