use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::events::{CallEvent, EventSink};
use crate::peer::connection::ConnectionStateMachine;
use crate::peer::transport::{ChannelEvent, ChannelState, DataChannel};
use crate::peer::types::ConnectionState;

/// The only payload carried on the auxiliary channel. `text` is always the
/// whole transcript so far.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataChannelMessage {
    Transcript { text: String },
}

impl DataChannelMessage {
    pub fn transcript(text: impl Into<String>) -> Self {
        DataChannelMessage::Transcript { text: text.into() }
    }

    /// `None` for malformed JSON or an unknown `type`
    pub fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Carries transcript updates over the link. Best effort: sends while the
/// channel is not open are dropped.
pub struct DataChannelRelay {
    label: String,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
    transcript: watch::Sender<String>,
    events: EventSink,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl DataChannelRelay {
    pub fn new(label: impl Into<String>, events: EventSink) -> Self {
        Self {
            label: label.into(),
            channel: Mutex::new(None),
            transcript: watch::Sender::new(String::new()),
            events,
            pumps: Mutex::new(Vec::new()),
        }
    }

    /// Offering side. Must run before the offer so the channel is part of it.
    pub async fn open_on(
        self: &Arc<Self>,
        connection: &ConnectionStateMachine,
    ) -> Result<(), NegotiationError> {
        match connection.state() {
            ConnectionState::AwaitingMedia if !connection.has_described() => {}
            ConnectionState::Idle => return Err(NegotiationError::MediaUnavailable),
            ConnectionState::Closed => return Err(NegotiationError::Closed),
            state => {
                return Err(NegotiationError::OutOfOrder {
                    operation: "create_data_channel",
                    state,
                })
            }
        }
        let channel = connection
            .transport()
            .create_data_channel(&self.label)
            .await?;

        // checked under the slot lock: teardown closes the connection before
        // it clears the relay
        {
            let mut slot = self.channel.lock();
            if connection.state() != ConnectionState::Closed {
                info!(label = %self.label, "data channel created");
                self.install(&mut slot, channel);
                return Ok(());
            }
        }
        debug!(label = %self.label, "connection closed while creating the channel");
        if let Err(err) = channel.close().await {
            debug!(error = %err, "data channel close failed");
        }
        Err(NegotiationError::Closed)
    }

    /// Answering side: adopt whatever channel the peer announces.
    pub fn accept_from(self: &Arc<Self>, connection: &ConnectionStateMachine) {
        let Some(mut incoming) = connection.take_incoming_channels() else {
            warn!("remote channels already taken");
            return;
        };
        let relay = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(channel) = incoming.recv().await {
                relay.attach(channel);
            }
        });
        self.pumps.lock().push(handle);
    }

    /// Replaces the current channel and starts reading from the new one
    pub fn attach(self: &Arc<Self>, channel: Arc<dyn DataChannel>) {
        let mut slot = self.channel.lock();
        self.install(&mut slot, channel);
    }

    fn install(
        self: &Arc<Self>,
        slot: &mut Option<Arc<dyn DataChannel>>,
        channel: Arc<dyn DataChannel>,
    ) {
        debug!(label = %channel.label(), "attaching data channel");
        let events = channel.take_events();
        *slot = Some(channel);

        let Some(mut events) = events else {
            warn!("data channel events already consumed");
            return;
        };
        let relay = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Open => {
                        info!("data channel open");
                        relay.events.emit(CallEvent::ChannelOpen);
                    }
                    ChannelEvent::Message(raw) => relay.receive(&raw),
                    ChannelEvent::Closed => {
                        info!("data channel closed");
                        break;
                    }
                }
            }
        });
        self.pumps.lock().push(handle);
    }

    pub fn is_open(&self) -> bool {
        self.channel
            .lock()
            .as_ref()
            .map(|c| c.ready_state() == ChannelState::Open)
            .unwrap_or(false)
    }

    /// Returns whether the message went out
    pub async fn send(&self, message: &DataChannelMessage) -> bool {
        if !self.is_open() {
            debug!("data channel not open, dropping message");
            return false;
        }
        let Some(channel) = self.channel.lock().clone() else {
            return false;
        };
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode data channel message");
                return false;
            }
        };
        match channel.send_text(payload).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "data channel send failed");
                false
            }
        }
    }

    pub async fn send_transcript(&self, text: impl Into<String>) -> bool {
        self.send(&DataChannelMessage::transcript(text)).await
    }

    /// Replaces the stored transcript with the incoming one
    pub fn receive(&self, raw: &str) {
        match DataChannelMessage::decode(raw) {
            Some(DataChannelMessage::Transcript { text }) => {
                self.transcript.send_replace(text.clone());
                self.events.emit(CallEvent::Transcript { text });
            }
            None => debug!(len = raw.len(), "ignoring unrecognised data channel payload"),
        }
    }

    pub fn transcript(&self) -> String {
        self.transcript.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.transcript.subscribe()
    }

    pub async fn close(&self) {
        for handle in self.pumps.lock().drain(..) {
            handle.abort();
        }
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                debug!(error = %err, "data channel close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceSettings;
    use crate::error::TransportError;
    use crate::peer::media::LocalTrack;
    use crate::peer::transport::{Transport, TransportEvents, TransportFactory};
    use crate::peer::types::{Descriptor, IceCandidate};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    struct FakeChannel {
        state: Mutex<ChannelState>,
        sent: Mutex<Vec<String>>,
        events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    }

    impl FakeChannel {
        fn new(state: ChannelState) -> (Arc<Self>, mpsc::UnboundedSender<ChannelEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let channel = Arc::new(Self {
                state: Mutex::new(state),
                sent: Mutex::new(Vec::new()),
                events: Mutex::new(Some(rx)),
            });
            (channel, tx)
        }
    }

    #[async_trait]
    impl DataChannel for FakeChannel {
        fn label(&self) -> String {
            "transcript".into()
        }

        fn ready_state(&self) -> ChannelState {
            *self.state.lock()
        }

        async fn send_text(&self, text: String) -> Result<(), TransportError> {
            self.sent.lock().push(text);
            Ok(())
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
            self.events.lock().take()
        }

        async fn close(&self) -> Result<(), TransportError> {
            *self.state.lock() = ChannelState::Closed;
            Ok(())
        }
    }

    #[test]
    fn wire_format() {
        let json = serde_json::to_string(&DataChannelMessage::transcript("hi")).unwrap();
        assert_eq!(json, r#"{"type":"transcript","text":"hi"}"#);
        assert_eq!(
            DataChannelMessage::decode(r#"{"type":"transcript","text":"ok"}"#),
            Some(DataChannelMessage::transcript("ok"))
        );
        assert_eq!(DataChannelMessage::decode(r#"{"type":"chat","text":"x"}"#), None);
        assert_eq!(DataChannelMessage::decode("not json"), None);
    }

    #[tokio::test]
    async fn receive_replaces_instead_of_appending() {
        let relay = DataChannelRelay::new("transcript", EventSink::new());
        relay.receive(r#"{"type":"transcript","text":"hello"}"#);
        relay.receive(r#"{"type":"transcript","text":"hello world"}"#);
        assert_eq!(relay.transcript(), "hello world");

        relay.receive(r#"{"type":"other","text":"ignored"}"#);
        relay.receive("{broken");
        assert_eq!(relay.transcript(), "hello world");
    }

    #[tokio::test]
    async fn send_is_dropped_until_open() {
        let relay = Arc::new(DataChannelRelay::new("transcript", EventSink::new()));
        assert!(!relay.send_transcript("nobody").await);

        let (channel, _tx) = FakeChannel::new(ChannelState::Connecting);
        relay.attach(channel.clone());
        assert!(!relay.send_transcript("too early").await);
        assert!(channel.sent.lock().is_empty());

        *channel.state.lock() = ChannelState::Open;
        assert!(relay.is_open());
        assert!(relay.send_transcript("now").await);
        assert_eq!(
            *channel.sent.lock(),
            vec![r#"{"type":"transcript","text":"now"}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn inbound_messages_notify_observers() {
        let relay = Arc::new(DataChannelRelay::new("transcript", EventSink::new()));
        let mut observed = relay.subscribe();
        let (channel, tx) = FakeChannel::new(ChannelState::Open);
        relay.attach(channel);

        tx.send(ChannelEvent::Message(
            r#"{"type":"transcript","text":"first"}"#.into(),
        ))
        .unwrap();
        observed.wait_for(|t| t == "first").await.unwrap();
        relay.close().await;
    }

    /// Transport whose channel creation waits for the test
    #[derive(Default)]
    struct SlowChannels {
        entered: Notify,
        gate: Notify,
        created: Mutex<Option<Arc<FakeChannel>>>,
    }

    #[async_trait]
    impl Transport for SlowChannels {
        async fn create_offer(&self) -> Result<Descriptor, TransportError> {
            Ok(Descriptor::offer("v=0"))
        }

        async fn create_answer(&self) -> Result<Descriptor, TransportError> {
            Ok(Descriptor::answer("v=0"))
        }

        async fn set_local_descriptor(&self, _: &Descriptor) -> Result<(), TransportError> {
            Ok(())
        }

        async fn set_remote_descriptor(&self, _: &Descriptor) -> Result<(), TransportError> {
            Ok(())
        }

        async fn add_track(&self, _: Arc<LocalTrack>) -> Result<(), TransportError> {
            Ok(())
        }

        async fn create_data_channel(
            &self,
            _: &str,
        ) -> Result<Arc<dyn DataChannel>, TransportError> {
            self.entered.notify_one();
            self.gate.notified().await;
            let (channel, _tx) = FakeChannel::new(ChannelState::Open);
            *self.created.lock() = Some(channel.clone());
            Ok(channel)
        }

        async fn add_ice_candidate(&self, _: &IceCandidate) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct SlowFactory(Arc<SlowChannels>);

    #[async_trait]
    impl TransportFactory for SlowFactory {
        async fn create_connection(
            &self,
            _: &IceSettings,
            _: TransportEvents,
        ) -> Result<Arc<dyn Transport>, TransportError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn channel_finished_after_close_is_discarded() {
        let transport = Arc::new(SlowChannels::default());
        let connection = Arc::new(
            ConnectionStateMachine::open(
                &SlowFactory(transport.clone()),
                &IceSettings::default(),
                Duration::from_secs(5),
                EventSink::new(),
            )
            .await
            .unwrap(),
        );
        connection.mark_media_acquired().unwrap();
        let relay = Arc::new(DataChannelRelay::new("transcript", EventSink::new()));

        let opening = tokio::spawn({
            let relay = relay.clone();
            let connection = connection.clone();
            async move { relay.open_on(&connection).await }
        });
        transport.entered.notified().await;
        connection.close().await;
        transport.gate.notify_one();

        let result = opening.await.unwrap();
        assert!(matches!(result, Err(NegotiationError::Closed)));
        assert!(!relay.is_open());
        assert!(!relay.send_transcript("late").await);
        let created = transport.created.lock().clone().unwrap();
        assert_eq!(created.ready_state(), ChannelState::Closed);
    }
}
