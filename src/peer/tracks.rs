use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::events::{CallEvent, EventSink};
use crate::peer::connection::ConnectionStateMachine;
use crate::peer::media::LocalMediaContext;
use crate::peer::types::ConnectionState;

#[derive(Default)]
struct Tracks {
    media: Option<LocalMediaContext>,
    muted: bool,
    /// no more media may be attached
    retired: bool,
}

/// Local media of one call: attach before describing, mute, release.
pub struct TrackController {
    inner: Mutex<Tracks>,
    events: EventSink,
}

impl TrackController {
    pub fn new(events: EventSink) -> Self {
        Self {
            inner: Mutex::new(Tracks::default()),
            events,
        }
    }

    /// Adds every track of `media` to the connection. Takes ownership of the
    /// context; on failure it is still held here and released with the rest.
    pub async fn attach_local_tracks(
        &self,
        media: LocalMediaContext,
        connection: &ConnectionStateMachine,
    ) -> Result<usize, NegotiationError> {
        if !media.is_live() {
            return Err(NegotiationError::MediaUnavailable);
        }
        match connection.state() {
            ConnectionState::AwaitingMedia if !connection.has_described() => {}
            ConnectionState::Idle => return Err(NegotiationError::MediaUnavailable),
            ConnectionState::Closed => return Err(NegotiationError::Closed),
            // no renegotiation: tracks must be in the first descriptor
            state => {
                return Err(NegotiationError::OutOfOrder {
                    operation: "attach_local_tracks",
                    state,
                })
            }
        }

        let tracks = media.tracks().to_vec();
        {
            let mut inner = self.inner.lock();
            if inner.retired {
                drop(inner);
                media.release();
                return Err(NegotiationError::Closed);
            }
            if let Some(previous) = inner.media.replace(media) {
                warn!("replacing attached local media");
                previous.release();
            }
            for track in &tracks {
                if track.kind() == crate::peer::media::TrackKind::Audio {
                    track.set_enabled(!inner.muted);
                }
            }
        }

        for track in &tracks {
            connection.transport().add_track(track.clone()).await?;
            debug!(id = track.id(), kind = ?track.kind(), "local track attached");
        }
        info!(count = tracks.len(), "local tracks attached");
        Ok(tracks.len())
    }

    /// Flips the enabled flag of local audio tracks. Nothing is signalled.
    pub fn set_muted(&self, muted: bool) {
        let mut inner = self.inner.lock();
        inner.muted = muted;
        if let Some(media) = inner.media.as_ref() {
            for track in media.audio_tracks() {
                track.set_enabled(!muted);
            }
        }
        drop(inner);
        self.events.emit(CallEvent::MuteChanged { muted });
    }

    pub fn is_muted(&self) -> bool {
        self.inner.lock().muted
    }

    pub fn has_media(&self) -> bool {
        self.inner.lock().media.is_some()
    }

    /// Stops every track and frees the capture device. Later attaches are
    /// refused. Returns whether anything was released.
    pub fn release_local_media(&self) -> bool {
        let media = {
            let mut inner = self.inner.lock();
            inner.retired = true;
            inner.media.take()
        };
        match media {
            Some(media) => {
                media.release();
                true
            }
            None => false,
        }
    }
}
