//! Drives one call at a time through the signaling store: create or join,
//! offer/answer, candidate trickling both ways, hangup and redial.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NegotiatorConfig;
use crate::error::{CallError, NegotiationError};
use crate::events::{CallEvent, EndReason, EventSink};
use crate::peer::connection::ConnectionStateMachine;
use crate::peer::data_channel::DataChannelRelay;
use crate::peer::media::{LocalMediaContext, MediaDevices};
use crate::peer::tracks::TrackController;
use crate::peer::transport::TransportFactory;
use crate::peer::types::{ConnectionState, Descriptor};
use crate::session::{Role, Session, SessionId, SessionPhase};
use crate::signaling::{
    CandidateDirection, CandidateEntry, DescriptorField, SignalingStore,
};

/// Everything that belongs to one connection attempt. Replaced, never
/// reused, once the call ends.
struct CallSlot {
    connection: Arc<ConnectionStateMachine>,
    tracks: Arc<TrackController>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Clone)]
struct CallHandles {
    connection: Arc<ConnectionStateMachine>,
    tracks: Arc<TrackController>,
}

#[derive(Default)]
struct Current {
    /// bumped whenever a call starts or ends; stale work compares against it
    epoch: u64,
    session: Option<Session>,
    call: Option<CallSlot>,
}

struct Inner {
    config: NegotiatorConfig,
    store: Arc<dyn SignalingStore>,
    transports: Arc<dyn TransportFactory>,
    devices: Arc<dyn MediaDevices>,
    events: EventSink,
    relay: Arc<DataChannelRelay>,
    current: Mutex<Current>,
    state: watch::Sender<ConnectionState>,
    participants: AtomicUsize,
}

impl Inner {
    fn is_current(&self, epoch: u64) -> bool {
        self.current.lock().epoch == epoch
    }

    fn handles(&self) -> Option<CallHandles> {
        self.current.lock().call.as_ref().map(|c| CallHandles {
            connection: c.connection.clone(),
            tracks: c.tracks.clone(),
        })
    }

    fn update_session(&self, epoch: u64, f: impl FnOnce(&mut Session)) -> Result<(), CallError> {
        let mut current = self.current.lock();
        if current.epoch != epoch {
            return Err(CallError::Cancelled);
        }
        match current.session.as_mut() {
            Some(session) => {
                f(session);
                Ok(())
            }
            None => Err(CallError::Cancelled),
        }
    }

    /// Ties a task to the running call, or kills it if the call is gone
    fn register(&self, epoch: u64, task: JoinHandle<()>) -> Result<(), CallError> {
        let mut guard = self.current.lock();
        let current = &mut *guard;
        match current.call.as_mut() {
            Some(slot) if current.epoch == epoch => {
                slot.tasks.push(task);
                Ok(())
            }
            _ => {
                task.abort();
                Err(CallError::Cancelled)
            }
        }
    }
}

/// Cheap to clone; all clones drive the same call.
#[derive(Clone)]
pub struct SessionNegotiator {
    inner: Arc<Inner>,
}

impl SessionNegotiator {
    pub async fn new(
        config: NegotiatorConfig,
        store: Arc<dyn SignalingStore>,
        transports: Arc<dyn TransportFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Self, CallError> {
        let events = EventSink::new();
        let relay = Arc::new(DataChannelRelay::new(
            config.data_channel_label.clone(),
            events.clone(),
        ));
        let negotiator = Self {
            inner: Arc::new(Inner {
                config,
                store,
                transports,
                devices,
                events,
                relay,
                current: Mutex::new(Current::default()),
                state: watch::Sender::new(ConnectionState::Idle),
                participants: AtomicUsize::new(1),
            }),
        };
        negotiator.ensure_slot().await?;
        Ok(negotiator)
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.inner.config
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.current.lock().session.clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner
            .current
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.id.clone())
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self.inner.handles() {
            Some(call) => call.connection.state(),
            None => *self.inner.state.borrow(),
        }
    }

    /// Follows whichever connection is current, across redials
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// 1 until media from the remote peer arrives
    pub fn participants(&self) -> usize {
        self.inner.participants.load(Ordering::SeqCst)
    }

    pub fn set_muted(&self, muted: bool) {
        match self.inner.handles() {
            Some(call) => call.tracks.set_muted(muted),
            None => debug!("no call to mute"),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.inner
            .handles()
            .map(|c| c.tracks.is_muted())
            .unwrap_or(false)
    }

    /// Best effort; false when the channel is not open
    pub async fn send_transcript(&self, text: impl Into<String>) -> bool {
        self.inner.relay.send_transcript(text).await
    }

    pub fn transcript(&self) -> String {
        self.inner.relay.transcript()
    }

    pub fn subscribe_transcript(&self) -> watch::Receiver<String> {
        self.inner.relay.subscribe()
    }

    /// Caller side. Returns the id the callee has to join.
    pub async fn start_session(&self) -> Result<SessionId, CallError> {
        self.start(None).await
    }

    /// Caller side under a chosen id
    pub async fn start_session_with_id(
        &self,
        id: impl Into<SessionId>,
    ) -> Result<SessionId, CallError> {
        self.start(Some(id.into())).await
    }

    async fn start(&self, requested: Option<SessionId>) -> Result<SessionId, CallError> {
        let (epoch, call) = self.begin(Role::Caller).await?;
        let outcome = self.run_caller(epoch, &call, requested).await;
        self.settle(epoch, &call, outcome).await
    }

    /// Callee side
    pub async fn join_session(&self, id: impl Into<SessionId>) -> Result<(), CallError> {
        let id = id.into();
        let (epoch, call) = self.begin(Role::Callee).await?;
        let outcome = self.run_callee(epoch, &call, id).await;
        self.settle(epoch, &call, outcome).await
    }

    /// Ends the current call. Safe at any time, including while a start or
    /// join is still running; that call then fails with `Cancelled`.
    pub async fn hangup(&self) {
        if self.inner.current.lock().session.is_none() {
            debug!("hangup without a session");
            return;
        }
        self.end_call(None, EndReason::Hangup).await;
    }

    async fn begin(&self, role: Role) -> Result<(u64, CallHandles), CallError> {
        self.ensure_slot().await?;
        let mut current = self.inner.current.lock();
        if current.session.as_ref().is_some_and(Session::is_live) {
            return Err(NegotiationError::SessionInProgress.into());
        }
        let call = match current.call.as_ref() {
            Some(slot) => CallHandles {
                connection: slot.connection.clone(),
                tracks: slot.tracks.clone(),
            },
            None => return Err(NegotiationError::Closed.into()),
        };
        current.epoch += 1;
        current.session = Some(Session::new(role));
        self.inner.participants.store(1, Ordering::SeqCst);
        debug!(?role, epoch = current.epoch, "session begins");
        Ok((current.epoch, call))
    }

    async fn settle<T>(
        &self,
        epoch: u64,
        call: &CallHandles,
        outcome: Result<T, CallError>,
    ) -> Result<T, CallError> {
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(_) if !self.inner.is_current(epoch) => return Err(CallError::Cancelled),
            Err(err) => err,
        };
        warn!(error = %err, "session setup failed");

        let untouched = call.connection.state() == ConnectionState::Idle;
        if untouched {
            // nothing was acquired, the idle connection stays armed
            let mut current = self.inner.current.lock();
            if current.epoch == epoch {
                current.epoch += 1;
                current.session = None;
            }
        } else {
            self.end_call(Some(&call.connection), EndReason::Error).await;
        }
        Err(err)
    }

    async fn run_caller(
        &self,
        epoch: u64,
        call: &CallHandles,
        requested: Option<SessionId>,
    ) -> Result<SessionId, CallError> {
        let inner = &self.inner;
        let media = self.acquire_media(epoch, call).await?;
        call.tracks.attach_local_tracks(media, &call.connection).await?;
        if inner.config.data_channel {
            inner.relay.open_on(&call.connection).await?;
        }

        let id = inner.store.create_session_record(requested.as_ref()).await?;
        inner.update_session(epoch, |s| s.id = Some(id.clone()))?;
        info!(%id, "session record created");

        let answers = inner.store.watch_field(&id, DescriptorField::Answer).await?;
        self.follow_candidates(epoch, call, &id, Role::Caller).await?;
        self.relay_local_candidates(epoch, call, &id, Role::Caller)?;

        let offer = call.connection.create_offer().await?;
        inner.update_session(epoch, |s| {
            s.local_descriptor = Some(offer.clone());
            s.enter_negotiating();
        })?;
        inner
            .store
            .write_field(&id, DescriptorField::Offer, &offer)
            .await?;

        let task = tokio::spawn(apply_answer(
            Arc::downgrade(inner),
            epoch,
            call.connection.clone(),
            answers,
        ));
        inner.register(epoch, task)?;

        inner.events.emit(CallEvent::SessionCreated { id: id.clone() });
        Ok(id)
    }

    async fn run_callee(
        &self,
        epoch: u64,
        call: &CallHandles,
        id: SessionId,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        let record = inner.store.read_session_record(&id).await?;
        let offer = record
            .offer
            .ok_or_else(|| CallError::SessionNotFound(id.to_string()))?;
        inner.update_session(epoch, |s| s.id = Some(id.clone()))?;

        let media = self.acquire_media(epoch, call).await?;
        if let Err(err) = self.prepare_answer(epoch, call, &id, offer.clone()).await {
            media.release();
            return Err(err);
        }
        call.tracks.attach_local_tracks(media, &call.connection).await?;

        let answer = call.connection.create_answer().await?;
        inner.update_session(epoch, |s| {
            s.remote_descriptor = Some(offer);
            s.local_descriptor = Some(answer.clone());
            s.enter_negotiating();
        })?;
        inner
            .store
            .write_field(&id, DescriptorField::Answer, &answer)
            .await?;

        info!(%id, "joined session");
        inner.events.emit(CallEvent::SessionJoined { id });
        Ok(())
    }

    /// Callee steps between media and tracks: relay wiring and the offer
    async fn prepare_answer(
        &self,
        epoch: u64,
        call: &CallHandles,
        id: &SessionId,
        offer: Descriptor,
    ) -> Result<(), CallError> {
        self.inner.relay.accept_from(&call.connection);
        self.follow_candidates(epoch, call, id, Role::Callee).await?;
        self.relay_local_candidates(epoch, call, id, Role::Callee)?;
        call.connection.set_remote_descriptor(offer).await?;
        Ok(())
    }

    async fn acquire_media(
        &self,
        epoch: u64,
        call: &CallHandles,
    ) -> Result<LocalMediaContext, CallError> {
        let media = self.inner.devices.acquire(&self.inner.config.media).await?;
        if !self.inner.is_current(epoch) {
            media.release();
            return Err(CallError::Cancelled);
        }
        if let Err(err) = call.connection.mark_media_acquired() {
            media.release();
            return Err(err.into());
        }
        Ok(media)
    }

    /// Watches the peer's candidates and replays the ones already stored.
    /// Repeats are dropped by sequence in the candidate queue.
    async fn follow_candidates(
        &self,
        epoch: u64,
        call: &CallHandles,
        id: &SessionId,
        role: Role,
    ) -> Result<(), CallError> {
        let direction = CandidateDirection::read_by(role);
        let mut incoming = self.inner.store.watch_candidates(id, direction).await?;
        let backlog = self.inner.store.list_candidates(id, direction).await?;
        if !backlog.is_empty() {
            debug!(count = backlog.len(), ?direction, "replaying stored candidates");
        }

        let weak = Arc::downgrade(&self.inner);
        let connection = call.connection.clone();
        let task = tokio::spawn(async move {
            for entry in backlog {
                if !apply_candidate(&weak, epoch, &connection, entry).await {
                    return;
                }
            }
            while let Some(entry) = incoming.recv().await {
                if !apply_candidate(&weak, epoch, &connection, entry).await {
                    return;
                }
            }
            debug!(?direction, "candidate watch ended");
        });
        self.inner.register(epoch, task)
    }

    /// Appends every local candidate to our own direction in the store
    fn relay_local_candidates(
        &self,
        epoch: u64,
        call: &CallHandles,
        id: &SessionId,
        role: Role,
    ) -> Result<(), CallError> {
        let Some(mut local) = call.connection.take_local_candidates() else {
            warn!("local candidates already relayed");
            return Ok(());
        };
        let direction = CandidateDirection::written_by(role);
        let store = self.inner.store.clone();
        let id = id.clone();
        let task = tokio::spawn(async move {
            while let Some(record) = local.recv().await {
                match store.append_candidate(&id, direction, &record.payload).await {
                    Ok(sequence) => debug!(%id, ?direction, sequence, "local candidate stored"),
                    Err(err) => warn!(%id, error = %err, "could not store local candidate"),
                }
            }
        });
        self.inner.register(epoch, task)
    }

    /// Arms an idle connection when there is none
    async fn ensure_slot(&self) -> Result<(), CallError> {
        if self.inner.current.lock().call.is_some() {
            return Ok(());
        }
        let config = &self.inner.config;
        let connection = Arc::new(
            ConnectionStateMachine::open(
                self.inner.transports.as_ref(),
                &config.ice_settings(),
                config.grace_period(),
                self.inner.events.clone(),
            )
            .await?,
        );
        let tracks = Arc::new(TrackController::new(self.inner.events.clone()));

        let spare = {
            let mut current = self.inner.current.lock();
            if current.call.is_some() {
                Some(connection)
            } else {
                let tasks = vec![
                    tokio::spawn(monitor(Arc::downgrade(&self.inner), connection.clone())),
                    tokio::spawn(count_participants(
                        Arc::downgrade(&self.inner),
                        self.inner.events.subscribe(),
                    )),
                ];
                current.call = Some(CallSlot {
                    connection,
                    tracks,
                    tasks,
                });
                None
            }
        };
        match spare {
            // lost a race with another arm
            Some(connection) => connection.close().await,
            None => debug!("idle connection armed"),
        }
        Ok(())
    }

    /// Tears the current call down. With `expected`, only if that connection
    /// is still the current one. Boxed because the monitor it re-arms can
    /// call back into it.
    fn end_call<'a>(
        &'a self,
        expected: Option<&'a Arc<ConnectionStateMachine>>,
        reason: EndReason,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let (slot, session) = {
                let mut current = self.inner.current.lock();
                if let Some(expected) = expected {
                    let matches = current
                        .call
                        .as_ref()
                        .is_some_and(|c| Arc::ptr_eq(&c.connection, expected));
                    if !matches {
                        debug!("call already replaced, nothing to end");
                        return;
                    }
                }
                current.epoch += 1;
                (current.call.take(), current.session.take())
            };

            if let Some(slot) = slot {
                for task in &slot.tasks {
                    task.abort();
                }
                slot.connection.close().await;
                self.inner.relay.close().await;
                slot.tracks.release_local_media();
            }
            self.inner.state.send_replace(ConnectionState::Closed);
            self.inner.participants.store(1, Ordering::SeqCst);

            if let Some(mut session) = session {
                session.phase = SessionPhase::Ended;
                info!(id = ?session.id, ?reason, "call ended");
                if self.inner.config.delete_session_on_hangup && session.role == Role::Caller {
                    if let Some(id) = session.id.as_ref() {
                        if let Err(err) = self.inner.store.delete_session_record(id).await {
                            warn!(%id, error = %err, "could not delete session record");
                        }
                    }
                }
            }
            self.inner.events.emit(CallEvent::CallEnded { reason });

            if self.inner.config.redial {
                if let Err(err) = self.ensure_slot().await {
                    error!(error = %err, "could not re-arm connection");
                }
            }
        })
    }
}

async fn apply_candidate(
    inner: &Weak<Inner>,
    epoch: u64,
    connection: &ConnectionStateMachine,
    entry: CandidateEntry,
) -> bool {
    match inner.upgrade() {
        Some(inner) if inner.is_current(epoch) => {}
        _ => return false,
    }
    let outcome = connection.add_remote_candidate(entry.sequence, entry.payload).await;
    match outcome.rejection() {
        // never fatal, the rest of the candidates may still get through
        Some(err) => warn!(sequence = entry.sequence, error = %err, "remote candidate dropped"),
        None => debug!(sequence = entry.sequence, ?outcome, "remote candidate"),
    }
    true
}

/// Applies the first usable answer and stops watching
async fn apply_answer(
    inner: Weak<Inner>,
    epoch: u64,
    connection: Arc<ConnectionStateMachine>,
    mut answers: crate::signaling::FieldWatch,
) {
    while let Some(answer) = answers.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        if !inner.is_current(epoch) {
            return;
        }
        if connection.remote_descriptor().is_some() {
            debug!("answer already applied, ignoring update");
            return;
        }
        match connection.set_remote_descriptor(answer.clone()).await {
            Ok(()) => {
                let _ = inner.update_session(epoch, |s| s.remote_descriptor = Some(answer));
                info!("answer applied");
                return;
            }
            Err(NegotiationError::AlreadyNegotiated | NegotiationError::Closed) => return,
            Err(err) => warn!(error = %err, "stored answer rejected, waiting for another"),
        }
    }
}

/// Mirrors connection states and reacts to the terminal ones
async fn monitor(inner: Weak<Inner>, connection: Arc<ConnectionStateMachine>) {
    let mut states = connection.subscribe_state();
    loop {
        let state = *states.borrow_and_update();
        let Some(strong) = inner.upgrade() else { return };
        if state == ConnectionState::Connected {
            if let Some(session) = strong.current.lock().session.as_mut() {
                session.phase = SessionPhase::Active;
            }
        }
        strong.state.send_replace(state);
        match state {
            ConnectionState::Failed => {
                warn!("connection failed, ending call");
                let negotiator = SessionNegotiator { inner: strong };
                tokio::spawn(async move {
                    negotiator
                        .end_call(Some(&connection), EndReason::TransportFailure)
                        .await;
                });
                return;
            }
            state if state.is_terminal() => return,
            _ => {}
        }
        drop(strong);
        if states.changed().await.is_err() {
            return;
        }
    }
}

async fn count_participants(inner: Weak<Inner>, mut events: broadcast::Receiver<CallEvent>) {
    loop {
        match events.recv().await {
            Ok(CallEvent::RemoteTrack { .. }) => {
                let Some(inner) = inner.upgrade() else { return };
                inner.participants.store(2, Ordering::SeqCst);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "participant counter lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
