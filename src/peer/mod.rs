pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod loopback;
pub mod media;
pub mod rtc;
pub mod tracks;
pub mod transport;
pub mod types;

pub use connection::ConnectionStateMachine;
pub use data_channel::{DataChannelMessage, DataChannelRelay};
pub use ice::{CandidateOutcome, CandidateQueue};
pub use loopback::LoopbackNetwork;
pub use media::{LocalMediaContext, MediaConstraints, MediaDevices, SyntheticMediaDevices};
pub use rtc::WebRtcTransportFactory;
pub use tracks::TrackController;
pub use transport::{DataChannel, Transport, TransportFactory};
pub use types::{ConnectionState, Descriptor, DescriptorKind, IceCandidate};
