use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

use crate::peer::media::TrackKind;
use crate::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Hangup,
    TransportFailure,
    Error,
}

/// Notifications for whatever renders the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    SessionCreated { id: SessionId },
    SessionJoined { id: SessionId },
    Connected,
    ConnectionProblem,
    ConnectionRecovering,
    ConnectionRecovered,
    ConnectionFailed,
    Disconnected,
    RemoteTrack { kind: TrackKind },
    ChannelOpen,
    Transcript { text: String },
    MuteChanged { muted: bool },
    CallEnded { reason: EndReason },
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallEvent::SessionCreated { id } => write!(f, "Room created. Share ID: {}", id),
            CallEvent::SessionJoined { id } => write!(f, "Joined room {}", id),
            CallEvent::Connected => f.write_str("Connected to call"),
            CallEvent::ConnectionProblem => f.write_str("Connection problem detected"),
            CallEvent::ConnectionRecovering => f.write_str("Reconnecting..."),
            CallEvent::ConnectionRecovered => f.write_str("Connection restored"),
            CallEvent::ConnectionFailed => f.write_str("Connection lost"),
            CallEvent::Disconnected => f.write_str("Disconnected"),
            CallEvent::RemoteTrack { .. } => f.write_str("Connected to remote peer"),
            CallEvent::ChannelOpen => f.write_str("Transcript channel open"),
            CallEvent::Transcript { text } => write!(f, "Transcript: {}", text),
            CallEvent::MuteChanged { muted: true } => f.write_str("Microphone muted"),
            CallEvent::MuteChanged { muted: false } => f.write_str("Microphone unmuted"),
            CallEvent::CallEnded { .. } => f.write_str("Call ended"),
        }
    }
}

#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<CallEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(64).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CallEvent) {
        debug!(%event, "emit");
        // no subscriber is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_emitted_events() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        sink.emit(CallEvent::MuteChanged { muted: true });
        assert_eq!(rx.recv().await.unwrap(), CallEvent::MuteChanged { muted: true });
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        EventSink::new().emit(CallEvent::Connected);
    }

    #[test]
    fn status_lines() {
        let id = SessionId::from("abc123");
        assert_eq!(
            CallEvent::SessionCreated { id }.to_string(),
            "Room created. Share ID: abc123"
        );
        assert_eq!(
            CallEvent::CallEnded {
                reason: EndReason::Hangup
            }
            .to_string(),
            "Call ended"
        );
    }
}
