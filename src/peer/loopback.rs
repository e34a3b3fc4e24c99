//! In-process transport. Every connection created from one
//! [`LoopbackNetwork`] can reach the others; connectivity needs both
//! descriptors and one usable candidate in each direction, just like ICE.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::IceSettings;
use crate::error::TransportError;
use crate::peer::media::{LocalTrack, TrackKind};
use crate::peer::transport::{
    ChannelEvent, ChannelState, DataChannel, PeerState, RemoteTrack, Transport, TransportEvent,
    TransportEvents, TransportFactory,
};
use crate::peer::types::{Descriptor, DescriptorKind, IceCandidate};
use crate::utils::random_id;

const FIRST_PORT: u16 = 40000;
const UFRAG_ATTR: &str = "a=ice-ufrag:";

struct Endpoint {
    port: u16,
    events: TransportEvents,
    local: Option<Descriptor>,
    remote_ufrag: Option<String>,
    /// a candidate for the peer's address was applied
    verified: bool,
    tracks: Vec<(String, TrackKind)>,
    channels: Vec<Arc<LoopbackChannel>>,
    connected: bool,
    closed: bool,
}

impl Endpoint {
    fn notify(&self, event: TransportEvent) {
        if self.closed {
            return;
        }
        if self.events.send(event).is_err() {
            debug!(port = self.port, "endpoint no longer listening");
        }
    }

    fn ready(&self) -> bool {
        !self.closed && self.local.is_some() && self.remote_ufrag.is_some() && self.verified
    }
}

struct NetworkState {
    endpoints: HashMap<String, Endpoint>,
    next_port: u16,
    link_up: bool,
    offers_created: usize,
    applied_candidates: usize,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            next_port: FIRST_PORT,
            link_up: true,
            offers_created: 0,
            applied_candidates: 0,
        }
    }
}

impl NetworkState {
    /// Forgets a closed endpoint once no open endpoint still points at it
    fn prune(&mut self, ufrag: &str) {
        let closed = self.endpoints.get(ufrag).is_some_and(|e| e.closed);
        let referenced = self
            .endpoints
            .values()
            .any(|e| !e.closed && e.remote_ufrag.as_deref() == Some(ufrag));
        if closed && !referenced {
            self.endpoints.remove(ufrag);
            debug!(%ufrag, "loopback endpoint released");
        }
    }

    fn endpoint(&mut self, ufrag: &str) -> Result<&mut Endpoint, TransportError> {
        self.endpoints
            .get_mut(ufrag)
            .ok_or(TransportError::Closed)
            .and_then(|e| {
                if e.closed {
                    Err(TransportError::Closed)
                } else {
                    Ok(e)
                }
            })
    }

    /// Connects `ufrag` with its peer once both ends are ready
    fn try_connect(&mut self, ufrag: &str) {
        if !self.link_up {
            return;
        }
        let Some(peer) = self.endpoints.get(ufrag).and_then(|e| e.remote_ufrag.clone()) else {
            return;
        };
        let (Some(a), Some(b)) = (self.endpoints.get(ufrag), self.endpoints.get(&peer)) else {
            return;
        };
        let paired = a.remote_ufrag.as_deref() == Some(peer.as_str())
            && b.remote_ufrag.as_deref() == Some(ufrag);
        if !paired || !a.ready() || !b.ready() || a.connected || b.connected {
            return;
        }

        for (from, to) in [(ufrag, peer.as_str()), (peer.as_str(), ufrag)] {
            let (channels, tracks) = match self.endpoints.get(from) {
                Some(e) => (e.channels.clone(), e.tracks.clone()),
                None => return,
            };
            let Some(target) = self.endpoints.get_mut(to) else {
                return;
            };
            for local in channels.iter().filter(|c| c.peer.lock().upgrade().is_none()) {
                let remote = LoopbackChannel::new(local.label.clone());
                LoopbackChannel::link(local, &remote);
                target.channels.push(remote.clone());
                target.notify(TransportEvent::DataChannel(remote));
            }
            for (id, kind) in tracks {
                target.notify(TransportEvent::RemoteTrack(RemoteTrack { id, kind }));
            }
        }

        for side in [ufrag, peer.as_str()] {
            if let Some(endpoint) = self.endpoints.get_mut(side) {
                endpoint.connected = true;
                for channel in &endpoint.channels {
                    channel.open();
                }
                endpoint.notify(TransportEvent::StateChanged(PeerState::Connected));
            }
        }
        info!(a = %ufrag, b = %peer, "loopback peers connected");
    }
}

/// Shared medium for loopback connections
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every connected pair down or brings it back, like a cable
    /// being pulled and replugged.
    pub fn set_link(&self, up: bool) {
        let mut state = self.state.lock();
        if state.link_up == up {
            return;
        }
        state.link_up = up;
        let reported = if up {
            PeerState::Connected
        } else {
            PeerState::Disconnected
        };
        for endpoint in state.endpoints.values().filter(|e| e.connected) {
            endpoint.notify(TransportEvent::StateChanged(reported));
        }
        info!(up, "loopback link changed");
    }

    /// Reports a hard ICE failure on every connected endpoint
    pub fn fail_link(&self) {
        let mut state = self.state.lock();
        for endpoint in state.endpoints.values_mut().filter(|e| e.connected) {
            endpoint.connected = false;
            endpoint.notify(TransportEvent::StateChanged(PeerState::Failed));
        }
        warn!("loopback link failed");
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn applied_candidates(&self) -> usize {
        self.state.lock().applied_candidates
    }

    /// Endpoints not yet closed
    pub fn open_endpoints(&self) -> usize {
        self.state.lock().endpoints.values().filter(|e| !e.closed).count()
    }

    /// Endpoints still tracked, closed ones included
    pub fn known_endpoints(&self) -> usize {
        self.state.lock().endpoints.len()
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create_connection(
        &self,
        settings: &IceSettings,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let ufrag = random_id();
        let mut state = self.state.lock();
        let port = state.next_port;
        state.next_port = state.next_port.wrapping_add(1).max(FIRST_PORT);
        state.endpoints.insert(
            ufrag.clone(),
            Endpoint {
                port,
                events,
                local: None,
                remote_ufrag: None,
                verified: false,
                tracks: Vec::new(),
                channels: Vec::new(),
                connected: false,
                closed: false,
            },
        );
        debug!(%ufrag, port, servers = settings.ice_servers.len(), "loopback endpoint created");
        Ok(Arc::new(LoopbackTransport {
            network: self.clone(),
            ufrag,
        }))
    }
}

pub struct LoopbackTransport {
    network: LoopbackNetwork,
    ufrag: String,
}

impl LoopbackTransport {
    fn describe(&self, kind: DescriptorKind) -> Result<Descriptor, TransportError> {
        let mut state = self.network.state.lock();
        if kind == DescriptorKind::Offer {
            state.offers_created += 1;
        }
        let endpoint = state.endpoint(&self.ufrag)?;
        if kind == DescriptorKind::Answer && endpoint.remote_ufrag.is_none() {
            return Err(TransportError::Descriptor(
                "cannot answer without a remote offer".into(),
            ));
        }

        let mut body = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\n{}{}\r\n",
            chrono::Utc::now().timestamp_millis(),
            UFRAG_ATTR,
            self.ufrag
        );
        for (_, kind) in &endpoint.tracks {
            match kind {
                TrackKind::Audio => body.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"),
                TrackKind::Video => body.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n"),
            }
        }
        if !endpoint.channels.is_empty() {
            body.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        }
        Ok(Descriptor::new(kind, body))
    }
}

fn parse_ufrag(body: &str) -> Option<&str> {
    body.lines()
        .find_map(|line| line.trim().strip_prefix(UFRAG_ATTR))
        .map(str::trim)
        .filter(|u| !u.is_empty())
}

/// Port of a `candidate:` line, `None` when the line is not one
fn parse_candidate_port(candidate: &str) -> Option<u16> {
    let parts: Vec<&str> = candidate.split_whitespace().collect();
    if parts.len() < 8 || !parts[0].starts_with("candidate:") || parts[6] != "typ" {
        return None;
    }
    parts[5].parse().ok()
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn create_offer(&self) -> Result<Descriptor, TransportError> {
        self.describe(DescriptorKind::Offer)
    }

    async fn create_answer(&self) -> Result<Descriptor, TransportError> {
        self.describe(DescriptorKind::Answer)
    }

    async fn set_local_descriptor(&self, descriptor: &Descriptor) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        let endpoint = state.endpoint(&self.ufrag)?;
        let first = endpoint.local.is_none();
        endpoint.local = Some(descriptor.clone());
        if first {
            // gathering starts with the local description
            let candidate = IceCandidate::new(format!(
                "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
                endpoint.port
            ));
            endpoint.notify(TransportEvent::LocalCandidate(Some(candidate)));
            endpoint.notify(TransportEvent::LocalCandidate(None));
        }
        state.try_connect(&self.ufrag);
        Ok(())
    }

    async fn set_remote_descriptor(&self, descriptor: &Descriptor) -> Result<(), TransportError> {
        let peer = parse_ufrag(&descriptor.body)
            .ok_or_else(|| TransportError::Descriptor("missing ice-ufrag".into()))?
            .to_string();
        let mut state = self.network.state.lock();
        if peer == self.ufrag || !state.endpoints.contains_key(&peer) {
            return Err(TransportError::Descriptor(format!("unknown peer {peer}")));
        }
        let endpoint = state.endpoint(&self.ufrag)?;
        endpoint.remote_ufrag = Some(peer);
        state.try_connect(&self.ufrag);
        Ok(())
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        let endpoint = state.endpoint(&self.ufrag)?;
        endpoint.tracks.push((track.id().to_string(), track.kind()));
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let mut state = self.network.state.lock();
        let endpoint = state.endpoint(&self.ufrag)?;
        let channel = LoopbackChannel::new(label.to_string());
        endpoint.channels.push(channel.clone());
        Ok(channel)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let port = parse_candidate_port(&candidate.candidate)
            .ok_or_else(|| TransportError::Candidate(candidate.candidate.clone()))?;
        let mut state = self.network.state.lock();
        let endpoint = state.endpoint(&self.ufrag)?;
        let Some(peer) = endpoint.remote_ufrag.clone() else {
            return Err(TransportError::Candidate(
                "remote description not set".into(),
            ));
        };
        let peer_port = state.endpoints.get(&peer).map(|e| e.port);
        state.applied_candidates += 1;
        if peer_port == Some(port) {
            if let Ok(endpoint) = state.endpoint(&self.ufrag) {
                endpoint.verified = true;
            }
            state.try_connect(&self.ufrag);
        } else {
            debug!(port, "candidate does not reach the peer");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        let Some(endpoint) = state.endpoints.get_mut(&self.ufrag) else {
            return Ok(());
        };
        if endpoint.closed {
            return Ok(());
        }
        endpoint.closed = true;
        let was_connected = std::mem::replace(&mut endpoint.connected, false);
        let peer = endpoint.remote_ufrag.clone();
        for channel in endpoint.channels.drain(..) {
            channel.shutdown();
        }

        if let Some(endpoint) = peer.as_ref().and_then(|p| state.endpoints.get_mut(p)) {
            if endpoint.remote_ufrag.as_deref() == Some(self.ufrag.as_str()) && was_connected {
                endpoint.connected = false;
                endpoint.notify(TransportEvent::StateChanged(PeerState::Disconnected));
            }
        }
        debug!(ufrag = %self.ufrag, "loopback endpoint closed");

        state.prune(&self.ufrag);
        if let Some(peer) = peer {
            state.prune(&peer);
        }
        Ok(())
    }
}

/// One end of an in-process data channel pair
pub struct LoopbackChannel {
    label: String,
    state: Mutex<ChannelState>,
    inbox: mpsc::UnboundedSender<ChannelEvent>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    peer: Mutex<Weak<LoopbackChannel>>,
}

impl LoopbackChannel {
    fn new(label: String) -> Arc<Self> {
        let (inbox, events) = mpsc::unbounded_channel();
        Arc::new(Self {
            label,
            state: Mutex::new(ChannelState::Connecting),
            inbox,
            events: Mutex::new(Some(events)),
            peer: Mutex::new(Weak::new()),
        })
    }

    fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock() = Arc::downgrade(b);
        *b.peer.lock() = Arc::downgrade(a);
    }

    fn open(&self) {
        let mut state = self.state.lock();
        if *state == ChannelState::Connecting {
            *state = ChannelState::Open;
            let _ = self.inbox.send(ChannelEvent::Open);
        }
    }

    /// Closes this end and tells the other one
    fn shutdown(&self) {
        self.mark_closed();
        if let Some(peer) = self.peer.lock().upgrade() {
            peer.mark_closed();
        }
    }

    fn mark_closed(&self) {
        let mut state = self.state.lock();
        if *state != ChannelState::Closed {
            *state = ChannelState::Closed;
            let _ = self.inbox.send(ChannelEvent::Closed);
        }
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.ready_state() != ChannelState::Open {
            return Err(TransportError::Channel(format!(
                "{} is {:?}",
                self.label,
                self.ready_state()
            )));
        }
        let peer = self.peer.lock().upgrade().ok_or(TransportError::Closed)?;
        peer.inbox
            .send(ChannelEvent::Message(text))
            .map_err(|_| TransportError::Closed)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown();
        Ok(())
    }
}
