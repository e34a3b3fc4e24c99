use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

use peercall_lib::error::{MediaError, SignalingError};
use peercall_lib::peer::media::{LocalMediaContext, MediaConstraints, MediaDevices};
use peercall_lib::peer::types::{ConnectionState, Descriptor, IceCandidate};
use peercall_lib::peer::{LoopbackNetwork, SyntheticMediaDevices};
use peercall_lib::signaling::{
    CandidateDirection, CandidateEntry, CandidateWatch, DescriptorField, FieldWatch,
    SessionRecord,
};
use peercall_lib::{
    CallError, CallEvent, EndReason, MemoryStore, NegotiatorConfig, SessionId,
    SessionNegotiator, SessionPhase, SignalingStore,
};

const WAIT: Duration = Duration::from_secs(5);

struct Peer {
    negotiator: SessionNegotiator,
    devices: SyntheticMediaDevices,
}

struct Harness {
    store: MemoryStore,
    network: LoopbackNetwork,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            network: LoopbackNetwork::new(),
        }
    }

    async fn peer(&self, config: NegotiatorConfig) -> Peer {
        let devices = SyntheticMediaDevices::new();
        let negotiator = SessionNegotiator::new(
            config,
            Arc::new(self.store.clone()),
            Arc::new(self.network.clone()),
            Arc::new(devices.clone()),
        )
        .await
        .unwrap();
        Peer {
            negotiator,
            devices,
        }
    }

    /// Caller and callee with a connected call between them
    async fn connected(&self, config: NegotiatorConfig) -> (Peer, Peer, SessionId) {
        let caller = self.peer(config.clone()).await;
        let callee = self.peer(config).await;
        let id = caller.negotiator.start_session().await.unwrap();
        callee.negotiator.join_session(id.clone()).await.unwrap();
        wait_state(&caller.negotiator, ConnectionState::Connected).await;
        wait_state(&callee.negotiator, ConnectionState::Connected).await;
        (caller, callee, id)
    }
}

fn config() -> NegotiatorConfig {
    NegotiatorConfig {
        logging_enabled: false,
        ..NegotiatorConfig::default()
    }
}

fn short_grace() -> NegotiatorConfig {
    NegotiatorConfig {
        grace_period_ms: 100,
        ..config()
    }
}

async fn wait_state(negotiator: &SessionNegotiator, target: ConnectionState) {
    let mut states = negotiator.subscribe_state();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("never reached {target:?}"))
        .unwrap();
}

async fn wait_event(events: &mut broadcast::Receiver<CallEvent>, wanted: CallEvent) {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if event == wanted => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never saw {wanted:?}"));
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn caller_and_callee_connect_and_share_transcript() {
    let harness = Harness::new();
    let (caller, callee, id) = harness.connected(config()).await;

    assert_eq!(caller.negotiator.session_id(), Some(id.clone()));
    assert_eq!(callee.negotiator.session_id(), Some(id));
    eventually("remote media", || {
        caller.negotiator.participants() == 2 && callee.negotiator.participants() == 2
    })
    .await;

    let mut transcript = callee.negotiator.subscribe_transcript();
    assert!(caller.negotiator.send_transcript("hello").await);
    tokio::time::timeout(WAIT, transcript.wait_for(|t| t == "hello"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(callee.negotiator.transcript(), "hello");

    assert!(caller.negotiator.send_transcript("hello there").await);
    tokio::time::timeout(WAIT, transcript.wait_for(|t| t == "hello there"))
        .await
        .unwrap()
        .unwrap();

    let session = caller.negotiator.session().unwrap();
    assert_eq!(session.phase, SessionPhase::Active);
    assert!(session.local_descriptor.is_some());
}

#[tokio::test]
async fn callee_can_talk_back() {
    let harness = Harness::new();
    let (caller, callee, _) = harness.connected(config()).await;

    let mut transcript = caller.negotiator.subscribe_transcript();
    // the callee adopts the offered channel on its own task
    tokio::time::timeout(WAIT, async {
        while !callee.negotiator.send_transcript("from callee").await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::timeout(WAIT, transcript.wait_for(|t| t == "from callee"))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn joining_unknown_session_fails_and_stays_idle() {
    let harness = Harness::new();
    let callee = harness.peer(config()).await;

    let err = callee
        .negotiator
        .join_session("nonexistent-id")
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::SessionNotFound(_)));
    assert_eq!(callee.negotiator.connection_state(), ConnectionState::Idle);
    assert!(callee.negotiator.session().is_none());
    assert_eq!(callee.devices.total_acquired(), 0);
}

#[tokio::test]
async fn record_without_offer_counts_as_missing() {
    let harness = Harness::new();
    let id = harness.store.create_session_record(None).await.unwrap();
    let callee = harness.peer(config()).await;

    let err = callee.negotiator.join_session(id).await.unwrap_err();
    assert!(matches!(err, CallError::SessionNotFound(_)));
    assert_eq!(callee.negotiator.connection_state(), ConnectionState::Idle);
}

#[tokio::test]
async fn denied_media_is_reported() {
    let harness = Harness::new();
    let caller = harness.peer(config()).await;
    caller.devices.deny(true);

    let err = caller.negotiator.start_session().await.unwrap_err();
    assert!(matches!(err, CallError::MediaAcquisition(MediaError::PermissionDenied(_))));
    assert_eq!(caller.negotiator.connection_state(), ConnectionState::Idle);
    assert_eq!(harness.store.write_count(), 0);

    caller.devices.deny(false);
    caller.negotiator.start_session().await.unwrap();
}

#[tokio::test]
async fn mute_stays_local() {
    let harness = Harness::new();
    let (caller, _callee, _) = harness.connected(config()).await;
    let mut events = caller.negotiator.events();
    let writes = harness.store.write_count();

    caller.negotiator.set_muted(true);
    assert!(caller.negotiator.is_muted());
    wait_event(&mut events, CallEvent::MuteChanged { muted: true }).await;
    caller.negotiator.set_muted(false);
    assert!(!caller.negotiator.is_muted());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.store.write_count(), writes);
    assert_eq!(caller.negotiator.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn store_updates_after_hangup_are_ignored() {
    let harness = Harness::new();
    let caller = harness.peer(config()).await;
    let id = caller.negotiator.start_session().await.unwrap();

    caller.negotiator.hangup().await;
    assert!(caller.negotiator.session().is_none());
    eventually("watches cancelled", || harness.store.active_watches(&id) == 0).await;

    let applied = harness.network.applied_candidates();
    harness
        .store
        .write_field(&id, DescriptorField::Answer, &Descriptor::answer("v=0"))
        .await
        .unwrap();
    harness
        .store
        .append_candidate(
            &id,
            CandidateDirection::Answer,
            &IceCandidate::new(
                "candidate:1 1 udp 2130706431 127.0.0.1 40999 typ host",
            ),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.network.applied_candidates(), applied);
    assert_eq!(caller.negotiator.connection_state(), ConnectionState::Idle);
    assert!(caller.negotiator.session().is_none());
}

#[tokio::test]
async fn hangup_releases_media_and_allows_redial() {
    let harness = Harness::new();
    let (caller, callee, first) = harness.connected(config()).await;
    let mut events = caller.negotiator.events();

    caller.negotiator.hangup().await;
    wait_event(
        &mut events,
        CallEvent::CallEnded {
            reason: EndReason::Hangup,
        },
    )
    .await;
    assert_eq!(caller.devices.active_captures(), 0);
    assert_eq!(caller.negotiator.connection_state(), ConnectionState::Idle);
    assert_eq!(caller.negotiator.participants(), 1);

    callee.negotiator.hangup().await;
    assert_eq!(callee.devices.active_captures(), 0);
    // only the two freshly armed connections remain
    assert_eq!(harness.network.open_endpoints(), 2);
    assert_eq!(harness.network.known_endpoints(), 2);

    let second = caller.negotiator.start_session().await.unwrap();
    assert_ne!(first, second);
    callee.negotiator.join_session(second).await.unwrap();
    wait_state(&caller.negotiator, ConnectionState::Connected).await;
    assert_eq!(caller.devices.active_captures(), 1);
    assert_eq!(caller.devices.total_acquired(), 2);
}

#[tokio::test]
async fn without_redial_the_next_call_arms_on_demand() {
    let harness = Harness::new();
    let caller = harness
        .peer(NegotiatorConfig {
            redial: false,
            ..config()
        })
        .await;
    caller.negotiator.start_session().await.unwrap();
    caller.negotiator.hangup().await;
    assert_eq!(caller.negotiator.connection_state(), ConnectionState::Closed);

    caller.negotiator.start_session().await.unwrap();
    assert_eq!(
        caller.negotiator.connection_state(),
        ConnectionState::Negotiating
    );
}

#[tokio::test]
async fn caller_can_delete_its_record_on_hangup() {
    let harness = Harness::new();
    let caller = harness
        .peer(NegotiatorConfig {
            delete_session_on_hangup: true,
            ..config()
        })
        .await;
    let id = caller.negotiator.start_session().await.unwrap();
    assert!(harness.store.contains(&id));
    caller.negotiator.hangup().await;
    assert!(!harness.store.contains(&id));
}

#[tokio::test]
async fn short_outage_is_absorbed() {
    let harness = Harness::new();
    let (caller, callee, _) = harness.connected(config()).await;
    let mut events = caller.negotiator.events();

    harness.network.set_link(false);
    wait_state(&caller.negotiator, ConnectionState::Disconnected).await;
    harness.network.set_link(true);
    wait_event(&mut events, CallEvent::ConnectionRecovered).await;

    assert_eq!(caller.negotiator.connection_state(), ConnectionState::Connected);
    assert!(caller.negotiator.session().is_some());
    assert_eq!(caller.devices.active_captures(), 1);
    wait_state(&callee.negotiator, ConnectionState::Connected).await;
}

#[tokio::test]
async fn outage_past_grace_ends_the_call() {
    let harness = Harness::new();
    let (caller, callee, _) = harness.connected(short_grace()).await;
    let mut events = caller.negotiator.events();

    harness.network.set_link(false);
    wait_event(
        &mut events,
        CallEvent::CallEnded {
            reason: EndReason::TransportFailure,
        },
    )
    .await;
    assert!(caller.negotiator.session().is_none());
    assert_eq!(caller.devices.active_captures(), 0);
    eventually("callee teardown", || callee.devices.active_captures() == 0).await;
}

#[tokio::test]
async fn hard_failure_ends_the_call_at_once() {
    let harness = Harness::new();
    let (caller, _callee, _) = harness.connected(config()).await;
    let mut events = caller.negotiator.events();

    harness.network.fail_link();
    wait_event(
        &mut events,
        CallEvent::CallEnded {
            reason: EndReason::TransportFailure,
        },
    )
    .await;
    eventually("re-armed", || {
        caller.negotiator.connection_state() == ConnectionState::Idle
    })
    .await;
    assert_eq!(caller.devices.active_captures(), 0);
}

#[tokio::test]
async fn remote_hangup_ends_the_call_after_grace() {
    let harness = Harness::new();
    let (caller, callee, _) = harness.connected(short_grace()).await;
    let mut events = callee.negotiator.events();

    caller.negotiator.hangup().await;
    wait_event(&mut events, CallEvent::ConnectionProblem).await;
    wait_event(
        &mut events,
        CallEvent::CallEnded {
            reason: EndReason::TransportFailure,
        },
    )
    .await;
    assert_eq!(callee.devices.active_captures(), 0);
}

#[tokio::test]
async fn starting_twice_is_refused() {
    let harness = Harness::new();
    let caller = harness.peer(config()).await;
    caller.negotiator.start_session().await.unwrap();
    let err = caller.negotiator.start_session().await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Negotiation(peercall_lib::NegotiationError::SessionInProgress)
    ));
}

/// Capture that blocks until the test lets it through
#[derive(Clone)]
struct GatedDevices {
    inner: SyntheticMediaDevices,
    entered: Arc<Notify>,
    gate: Arc<Notify>,
}

#[async_trait]
impl MediaDevices for GatedDevices {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaContext, MediaError> {
        self.entered.notify_one();
        self.gate.notified().await;
        self.inner.acquire(constraints).await
    }
}

#[tokio::test]
async fn hangup_during_start_cancels_it() {
    let harness = Harness::new();
    let devices = GatedDevices {
        inner: SyntheticMediaDevices::new(),
        entered: Arc::new(Notify::new()),
        gate: Arc::new(Notify::new()),
    };
    let caller = SessionNegotiator::new(
        config(),
        Arc::new(harness.store.clone()),
        Arc::new(harness.network.clone()),
        Arc::new(devices.clone()),
    )
    .await
    .unwrap();

    let starting = tokio::spawn({
        let caller = caller.clone();
        async move { caller.start_session().await }
    });
    devices.entered.notified().await;
    caller.hangup().await;
    devices.gate.notify_one();

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(CallError::Cancelled)));
    assert_eq!(devices.inner.active_captures(), 0);
    assert!(caller.session().is_none());
    assert_eq!(caller.connection_state(), ConnectionState::Idle);
    assert_eq!(harness.store.write_count(), 0);
}

/// Store whose answer writes land at once but are acknowledged late
struct SlowAnswerAck {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl SignalingStore for SlowAnswerAck {
    async fn create_session_record(
        &self,
        requested: Option<&SessionId>,
    ) -> Result<SessionId, SignalingError> {
        self.inner.create_session_record(requested).await
    }

    async fn write_field(
        &self,
        id: &SessionId,
        field: DescriptorField,
        value: &Descriptor,
    ) -> Result<(), SignalingError> {
        self.inner.write_field(id, field, value).await?;
        if field == DescriptorField::Answer {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }

    async fn read_session_record(&self, id: &SessionId) -> Result<SessionRecord, SignalingError> {
        self.inner.read_session_record(id).await
    }

    async fn append_candidate(
        &self,
        id: &SessionId,
        direction: CandidateDirection,
        payload: &IceCandidate,
    ) -> Result<u64, SignalingError> {
        self.inner.append_candidate(id, direction, payload).await
    }

    async fn list_candidates(
        &self,
        id: &SessionId,
        direction: CandidateDirection,
    ) -> Result<Vec<CandidateEntry>, SignalingError> {
        self.inner.list_candidates(id, direction).await
    }

    async fn watch_field(
        &self,
        id: &SessionId,
        field: DescriptorField,
    ) -> Result<FieldWatch, SignalingError> {
        self.inner.watch_field(id, field).await
    }

    async fn watch_candidates(
        &self,
        id: &SessionId,
        direction: CandidateDirection,
    ) -> Result<CandidateWatch, SignalingError> {
        self.inner.watch_candidates(id, direction).await
    }

    async fn delete_session_record(&self, id: &SessionId) -> Result<(), SignalingError> {
        self.inner.delete_session_record(id).await
    }
}

#[tokio::test]
async fn slow_answer_ack_does_not_undo_active_phase() {
    let harness = Harness::new();
    let caller = harness.peer(config()).await;
    let callee = SessionNegotiator::new(
        config(),
        Arc::new(SlowAnswerAck {
            inner: harness.store.clone(),
            delay: Duration::from_millis(300),
        }),
        Arc::new(harness.network.clone()),
        Arc::new(SyntheticMediaDevices::new()),
    )
    .await
    .unwrap();

    let id = caller.negotiator.start_session().await.unwrap();
    let joining = tokio::spawn({
        let callee = callee.clone();
        async move { callee.join_session(id).await }
    });
    wait_state(&caller.negotiator, ConnectionState::Connected).await;
    wait_state(&callee, ConnectionState::Connected).await;

    joining.await.unwrap().unwrap();
    assert_eq!(callee.session().unwrap().phase, SessionPhase::Active);
    assert_eq!(
        caller.negotiator.session().unwrap().phase,
        SessionPhase::Active
    );
}
