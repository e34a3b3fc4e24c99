use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::IceSettings;
use crate::error::{NegotiationError, TransportError};
use crate::events::{CallEvent, EventSink};
use crate::logger::analyze_candidates;
use crate::peer::ice::{CandidateOutcome, CandidateQueue, CandidateTarget};
use crate::peer::transport::{
    DataChannel, PeerState, Transport, TransportEvent, TransportFactory,
};
use crate::peer::types::{
    CandidateRecord, ConnectionState, Descriptor, DescriptorKind, IceCandidate, Transition,
};

struct TransportTarget(Arc<dyn Transport>);

#[async_trait]
impl CandidateTarget for TransportTarget {
    async fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.0.add_ice_candidate(candidate).await
    }
}

#[derive(Default)]
struct Core {
    local: Option<Descriptor>,
    remote: Option<Descriptor>,
    /// a local descriptor is being produced
    describing: bool,
    /// a remote descriptor is being applied
    applying_remote: bool,
    transport_connected: bool,
}

/// State touched from both the caller side and the event loop
struct Shared {
    core: Mutex<Core>,
    state: watch::Sender<ConnectionState>,
    candidates: Arc<CandidateQueue>,
    channels: mpsc::UnboundedSender<Arc<dyn DataChannel>>,
    events: EventSink,
}

enum Grace {
    Keep,
    Arm,
    Clear,
}

impl Shared {
    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Applies `input` if the table allows it. Callers hold the core lock so
    /// the check and the write cannot interleave with another transition.
    fn transition(&self, _core: &mut Core, input: Transition) -> Option<ConnectionState> {
        let prev = self.current();
        let next = prev.apply(input)?;
        self.state.send_replace(next);
        info!(?prev, ?next, ?input, "connection state changed");
        Some(next)
    }

    fn on_transport_state(&self, reported: PeerState) -> Grace {
        let mut core = self.core.lock();
        match reported {
            PeerState::Connected => {
                core.transport_connected = true;
                match self.current() {
                    ConnectionState::Negotiating if core.remote.is_some() => {
                        self.transition(&mut core, Transition::Connectivity);
                        self.events.emit(CallEvent::Connected);
                    }
                    ConnectionState::Disconnected => {
                        self.transition(&mut core, Transition::TransportReconnected);
                        self.events.emit(CallEvent::ConnectionRecovered);
                        self.events.emit(CallEvent::Connected);
                    }
                    state => debug!(?state, "transport connected, nothing to do yet"),
                }
                Grace::Clear
            }
            PeerState::Disconnected => {
                core.transport_connected = false;
                if self
                    .transition(&mut core, Transition::TransportDisconnected)
                    .is_some()
                {
                    self.events.emit(CallEvent::ConnectionProblem);
                    self.events.emit(CallEvent::ConnectionRecovering);
                    Grace::Arm
                } else {
                    Grace::Keep
                }
            }
            PeerState::Failed | PeerState::Closed => {
                core.transport_connected = false;
                if self
                    .transition(&mut core, Transition::TransportFailed)
                    .is_some()
                {
                    self.events.emit(CallEvent::ConnectionFailed);
                }
                Grace::Clear
            }
            PeerState::New | PeerState::Connecting => Grace::Keep,
        }
    }

    fn on_grace_expired(&self) {
        let mut core = self.core.lock();
        if self.transition(&mut core, Transition::GraceExpired).is_some() {
            warn!("grace period over without reconnection");
            self.events.emit(CallEvent::ConnectionFailed);
        }
    }
}

/// Owns one peer link and its lifecycle. Transport callbacks arrive as
/// [`TransportEvent`]s and are handled one at a time on a dedicated task.
pub struct ConnectionStateMachine {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    local_candidates: Mutex<Option<mpsc::UnboundedReceiver<CandidateRecord>>>,
    incoming_channels: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionStateMachine {
    pub async fn open(
        factory: &dyn TransportFactory,
        settings: &IceSettings,
        grace_period: Duration,
        events: EventSink,
    ) -> Result<Self, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = factory.create_connection(settings, events_tx).await?;

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let candidates = Arc::new(CandidateQueue::new(
            Arc::new(TransportTarget(transport.clone())),
            local_tx,
        ));
        let (channels_tx, channels_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            core: Mutex::new(Core::default()),
            state: watch::Sender::new(ConnectionState::Idle),
            candidates,
            channels: channels_tx,
            events,
        });
        let event_loop = tokio::spawn(run_events(shared.clone(), events_rx, grace_period));

        Ok(Self {
            transport,
            shared,
            local_candidates: Mutex::new(Some(local_rx)),
            incoming_channels: Mutex::new(Some(channels_rx)),
            event_loop: Mutex::new(Some(event_loop)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn candidates(&self) -> &Arc<CandidateQueue> {
        &self.shared.candidates
    }

    pub fn local_descriptor(&self) -> Option<Descriptor> {
        self.shared.core.lock().local.clone()
    }

    pub fn remote_descriptor(&self) -> Option<Descriptor> {
        self.shared.core.lock().remote.clone()
    }

    /// True once a local descriptor exists or is being produced
    pub fn has_described(&self) -> bool {
        let core = self.shared.core.lock();
        core.local.is_some() || core.describing
    }

    /// Local candidates for relay through the store. Handed out once.
    pub fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<CandidateRecord>> {
        self.local_candidates.lock().take()
    }

    /// Channels announced by the offering peer. Handed out once.
    pub fn take_incoming_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>> {
        self.incoming_channels.lock().take()
    }

    /// Idle -> AwaitingMedia
    pub fn mark_media_acquired(&self) -> Result<(), NegotiationError> {
        let mut core = self.shared.core.lock();
        let state = self.shared.current();
        self.shared
            .transition(&mut core, Transition::MediaAcquired)
            .map(|_| ())
            .ok_or(NegotiationError::OutOfOrder {
                operation: "acquire_local_media",
                state,
            })
    }

    pub async fn create_offer(&self) -> Result<Descriptor, NegotiationError> {
        self.describe(DescriptorKind::Offer).await
    }

    pub async fn create_answer(&self) -> Result<Descriptor, NegotiationError> {
        self.describe(DescriptorKind::Answer).await
    }

    async fn describe(&self, kind: DescriptorKind) -> Result<Descriptor, NegotiationError> {
        let operation = match kind {
            DescriptorKind::Offer => "create_offer",
            DescriptorKind::Answer => "create_answer",
        };
        {
            let mut core = self.shared.core.lock();
            match self.shared.current() {
                ConnectionState::Idle => return Err(NegotiationError::MediaUnavailable),
                ConnectionState::Closed => return Err(NegotiationError::Closed),
                ConnectionState::AwaitingMedia | ConnectionState::Negotiating => {}
                state => return Err(NegotiationError::OutOfOrder { operation, state }),
            }
            if core.local.is_some() || core.describing {
                return Err(NegotiationError::OutOfOrder {
                    operation,
                    state: self.shared.current(),
                });
            }
            let remote_kind = core.remote.as_ref().map(|d| d.kind);
            let ordered = match kind {
                DescriptorKind::Offer => remote_kind.is_none() && !core.applying_remote,
                DescriptorKind::Answer => remote_kind == Some(DescriptorKind::Offer),
            };
            if !ordered {
                return Err(NegotiationError::OutOfOrder {
                    operation,
                    state: self.shared.current(),
                });
            }
            core.describing = true;
        }

        let produced = match kind {
            DescriptorKind::Offer => self.transport.create_offer().await,
            DescriptorKind::Answer => self.transport.create_answer().await,
        };
        let descriptor = match produced {
            Ok(descriptor) => descriptor,
            Err(err) => {
                self.shared.core.lock().describing = false;
                return Err(err.into());
            }
        };
        if let Err(err) = self.transport.set_local_descriptor(&descriptor).await {
            self.shared.core.lock().describing = false;
            return Err(err.into());
        }

        let mut core = self.shared.core.lock();
        core.describing = false;
        if self.shared.current() == ConnectionState::Closed {
            return Err(NegotiationError::Closed);
        }
        core.local = Some(descriptor.clone());
        self.shared
            .transition(&mut core, Transition::LocalDescriptorReady);
        self.promote_if_connected(&mut core);
        debug!(?kind, "local descriptor set");
        Ok(descriptor)
    }

    /// Applies the peer's descriptor, then flushes candidates that arrived
    /// early. Only one remote descriptor is ever accepted.
    pub async fn set_remote_descriptor(&self, descriptor: Descriptor) -> Result<(), NegotiationError> {
        {
            let mut core = self.shared.core.lock();
            if core.remote.is_some() || core.applying_remote {
                return Err(NegotiationError::AlreadyNegotiated);
            }
            match self.shared.current() {
                ConnectionState::AwaitingMedia | ConnectionState::Negotiating => {}
                ConnectionState::Closed => return Err(NegotiationError::Closed),
                ConnectionState::Idle => return Err(NegotiationError::MediaUnavailable),
                state => {
                    return Err(NegotiationError::OutOfOrder {
                        operation: "set_remote_descriptor",
                        state,
                    })
                }
            }
            let expected = match core.local.as_ref().map(|d| d.kind) {
                Some(DescriptorKind::Offer) => DescriptorKind::Answer,
                _ => DescriptorKind::Offer,
            };
            if core.describing || descriptor.kind != expected {
                return Err(NegotiationError::UnexpectedDescriptor {
                    expected,
                    actual: descriptor.kind,
                });
            }
            core.applying_remote = true;
        }

        if let Err(err) = self.transport.set_remote_descriptor(&descriptor).await {
            self.shared.core.lock().applying_remote = false;
            return Err(err.into());
        }

        {
            let mut core = self.shared.core.lock();
            core.applying_remote = false;
            if self.shared.current() == ConnectionState::Closed {
                return Err(NegotiationError::Closed);
            }
            core.remote = Some(descriptor);
            self.promote_if_connected(&mut core);
        }
        info!("remote descriptor applied");

        self.shared.candidates.flush_buffered().await;
        Ok(())
    }

    fn promote_if_connected(&self, core: &mut Core) {
        if core.transport_connected
            && core.remote.is_some()
            && self
                .shared
                .transition(core, Transition::Connectivity)
                .is_some()
        {
            self.shared.events.emit(CallEvent::Connected);
        }
    }

    pub async fn add_remote_candidate(&self, sequence: u64, candidate: IceCandidate) -> CandidateOutcome {
        self.shared.candidates.enqueue_remote(sequence, candidate).await
    }

    /// Releases the transport. Safe from any state and more than once.
    pub async fn close(&self) {
        {
            let mut core = self.shared.core.lock();
            if self.shared.transition(&mut core, Transition::Hangup).is_none() {
                return;
            }
        }
        self.shared.candidates.close();
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
        if let Err(err) = self.transport.close().await {
            warn!(error = %err, "transport close failed");
        }
        self.shared.events.emit(CallEvent::Disconnected);
    }
}

impl Drop for ConnectionStateMachine {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
    }
}

async fn run_events(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    grace_period: Duration,
) {
    let mut grace_deadline: Option<Instant> = None;

    loop {
        let deadline = grace_deadline;
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    TransportEvent::LocalCandidate(Some(candidate)) => {
                        shared.candidates.enqueue_local(candidate);
                    }
                    TransportEvent::LocalCandidate(None) => {
                        debug!("ICE candidate gathering completed");
                        analyze_candidates(&shared.candidates.local_candidates());
                    }
                    TransportEvent::RemoteTrack(track) => {
                        info!(id = %track.id, kind = ?track.kind, "remote track");
                        shared.events.emit(CallEvent::RemoteTrack { kind: track.kind });
                    }
                    TransportEvent::DataChannel(channel) => {
                        debug!(label = %channel.label(), "remote data channel announced");
                        if shared.channels.send(channel).is_err() {
                            debug!("no relay listening for remote channels");
                        }
                    }
                    TransportEvent::StateChanged(reported) => {
                        debug!(?reported, "transport state");
                        match shared.on_transport_state(reported) {
                            Grace::Arm => {
                                info!(grace_ms = grace_period.as_millis() as u64, "grace period started");
                                grace_deadline = Some(Instant::now() + grace_period);
                            }
                            Grace::Clear => grace_deadline = None,
                            Grace::Keep => {}
                        }
                    }
                }
            }
            _ = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                grace_deadline = None;
                shared.on_grace_expired();
            }
        }
    }
    debug!("transport event loop finished");
}
