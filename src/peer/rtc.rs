//! Production transport on top of webrtc-rs.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage as RtcMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceSettings;
use crate::error::TransportError;
use crate::logger::dump_selected_pair;
use crate::peer::media::{LocalTrack, TrackKind};
use crate::peer::transport::{
    ChannelEvent, ChannelState, DataChannel, PeerState, RemoteTrack, Transport, TransportEvent,
    TransportEvents, TransportFactory,
};
use crate::peer::types::{Descriptor, DescriptorKind, IceCandidate};

const STREAM_ID: &str = "peercall";

fn rtc_config(settings: &IceSettings) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: settings.ice_servers.clone(),
            ..Default::default()
        }],
        ice_candidate_pool_size: settings.candidate_pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn setup_err(err: webrtc::Error) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PeerState::New,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

/// Builds `RTCPeerConnection`s with default codecs and interceptors
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcTransportFactory;

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create_connection(
        &self,
        settings: &IceSettings,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(RtcTransport::open(settings, events).await?))
    }
}

/// Every engine callback becomes one [`TransportEvent`]
fn wire_handlers(pc: &Arc<RTCPeerConnection>, events: TransportEvents) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand.map(|c| c.to_json()) {
            Some(Ok(init)) => {
                let _ = tx.send(TransportEvent::LocalCandidate(Some(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })));
            }
            Some(Err(err)) => warn!(error = %err, "could not serialise local candidate"),
            None => {
                let _ = tx.send(TransportEvent::LocalCandidate(None));
            }
        }
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!(?state, "ICE gathering state changed");
        Box::pin(async {})
    }));

    let tx = events.clone();
    let stats_pc: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        debug!(state = ?st, "peer connection state changed");
        if matches!(
            st,
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
        ) {
            if let Some(pc) = stats_pc.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }
        let _ = tx.send(TransportEvent::StateChanged(peer_state(st)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            let _ = tx.send(TransportEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                kind,
            }));
            Box::pin(async {})
        },
    ));

    let tx = events;
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let _ = tx.send(TransportEvent::DataChannel(RtcDataChannel::wrap(dc)));
        Box::pin(async {})
    }));
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    tracks: Mutex<Vec<(Arc<LocalTrack>, Arc<TrackLocalStaticSample>)>>,
}

impl RtcTransport {
    pub async fn open(
        settings: &IceSettings,
        events: TransportEvents,
    ) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(setup_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(settings))
                .await
                .map_err(setup_err)?,
        );
        wire_handlers(&pc, events);
        info!(
            servers = settings.ice_servers.len(),
            pool = settings.candidate_pool_size,
            "peer connection created"
        );

        Ok(Self {
            pc,
            tracks: Mutex::new(Vec::new()),
        })
    }

    /// Feeds one encoded frame into a local track. Frames of a disabled
    /// (muted) track are dropped; returns whether the frame was written.
    pub async fn write_sample(
        &self,
        track_id: &str,
        data: Bytes,
        duration: Duration,
    ) -> Result<bool, TransportError> {
        let entry = self
            .tracks
            .lock()
            .iter()
            .find(|(local, _)| local.id() == track_id)
            .cloned();
        let Some((local, rtc)) = entry else {
            return Err(TransportError::Track(format!("unknown track {track_id}")));
        };
        if !local.is_enabled() || !local.is_live() {
            return Ok(false);
        }
        rtc.write_sample(&Sample {
            data,
            duration,
            ..Default::default()
        })
        .await
        .map_err(|e| TransportError::Track(e.to_string()))?;
        Ok(true)
    }
}

#[async_trait]
impl Transport for RtcTransport {
    async fn create_offer(&self) -> Result<Descriptor, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Descriptor(e.to_string()))?;
        Ok(Descriptor::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<Descriptor, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Descriptor(e.to_string()))?;
        Ok(Descriptor::answer(answer.sdp))
    }

    async fn set_local_descriptor(&self, descriptor: &Descriptor) -> Result<(), TransportError> {
        let desc = to_rtc(descriptor)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| TransportError::Descriptor(e.to_string()))
    }

    async fn set_remote_descriptor(&self, descriptor: &Descriptor) -> Result<(), TransportError> {
        let desc = to_rtc(descriptor)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| TransportError::Descriptor(e.to_string()))
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            STREAM_ID.to_string(),
        ));
        self.pc
            .add_track(rtc.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Track(e.to_string()))?;
        self.tracks.lock().push((track, rtc));
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let dc = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        Ok(RtcDataChannel::wrap(dc))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))
    }
}

fn to_rtc(descriptor: &Descriptor) -> Result<RTCSessionDescription, TransportError> {
    let sdp = descriptor.body.clone();
    match descriptor.kind {
        DescriptorKind::Offer => RTCSessionDescription::offer(sdp),
        DescriptorKind::Answer => RTCSessionDescription::answer(sdp),
    }
    .map_err(|e| TransportError::Descriptor(e.to_string()))
}

/// `RTCDataChannel` with its callbacks turned into a [`ChannelEvent`] stream
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl RtcDataChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let open_tx = tx.clone();
        dc.on_open(Box::new(move || {
            let _ = open_tx.send(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let msg_tx = tx.clone();
        dc.on_message(Box::new(move |msg: RtcMessage| {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = msg_tx.send(ChannelEvent::Message(text));
                }
                Err(_) => debug!(len = msg.data.len(), "dropping binary data channel message"),
            }
            Box::pin(async {})
        }));

        let close_tx = tx.clone();
        dc.on_close(Box::new(move || {
            let _ = close_tx.send(ChannelEvent::Closed);
            Box::pin(async {})
        }));

        if dc.ready_state() == RTCDataChannelState::Open {
            let _ = tx.send(ChannelEvent::Open);
        }

        Arc::new(Self {
            dc,
            events: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn ready_state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Channel(e.to_string()))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc
            .close()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))
    }
}
