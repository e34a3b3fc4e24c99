pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod negotiator;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::NegotiatorConfig;
pub use error::{CallError, NegotiationError, SignalingError, TransportError};
pub use events::{CallEvent, EndReason, EventSink};
pub use negotiator::SessionNegotiator;
pub use session::{Role, Session, SessionId, SessionPhase};
pub use signaling::{MemoryStore, SignalingStore};
