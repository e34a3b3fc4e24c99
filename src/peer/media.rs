use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::MediaError;
use crate::utils::random_id;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// One captured local track. The enabled flag is the mute switch.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: format!("{}-{}", kind_label(kind), random_id()),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

fn kind_label(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

/// Platform handle on a camera / microphone.
pub trait CaptureDevice: Send + Sync {
    fn release(&mut self);
}

/// Owns one capture handle and its tracks. Moved, never cloned: the
/// context is released exactly once, by [`LocalMediaContext::release`] or
/// on drop.
pub struct LocalMediaContext {
    tracks: Vec<Arc<LocalTrack>>,
    device: Option<Box<dyn CaptureDevice>>,
}

impl LocalMediaContext {
    pub fn new(tracks: Vec<Arc<LocalTrack>>, device: Box<dyn CaptureDevice>) -> Self {
        Self {
            tracks,
            device: Some(device),
        }
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn is_live(&self) -> bool {
        self.device.is_some() && self.tracks.iter().all(|t| t.is_live())
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(mut device) = self.device.take() {
            for track in &self.tracks {
                track.stop();
            }
            device.release();
            info!(tracks = self.tracks.len(), "local media released");
        }
    }
}

impl Drop for LocalMediaContext {
    fn drop(&mut self) {
        if self.device.is_some() {
            warn!("local media context dropped without release, releasing now");
            self.release_inner();
        }
    }
}

impl std::fmt::Debug for LocalMediaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaContext")
            .field("tracks", &self.tracks)
            .field("released", &self.device.is_none())
            .finish()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoConstraints {
                width: 640,
                height: 480,
            }),
        }
    }
}

/// Access to capture hardware.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints)
        -> Result<LocalMediaContext, MediaError>;
}

/// Test-pattern capture. Counts open handles so leaks are observable.
#[derive(Clone, Default)]
pub struct SyntheticMediaDevices {
    active: Arc<AtomicUsize>,
    acquired: Arc<AtomicUsize>,
    denied: Arc<AtomicBool>,
}

impl SyntheticMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following acquisition fail as if permission was refused.
    pub fn deny(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    pub fn active_captures(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total_acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

struct SyntheticCapture {
    active: Arc<AtomicUsize>,
}

impl CaptureDevice for SyntheticCapture {
    fn release(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaDevices for SyntheticMediaDevices {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaContext, MediaError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(
                "camera and microphone access refused".into(),
            ));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Audio)));
        }
        if constraints.video.is_some() {
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Video)));
        }
        if tracks.is_empty() {
            return Err(MediaError::Unavailable("no tracks requested".into()));
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        debug!(tracks = tracks.len(), "synthetic capture started");
        Ok(LocalMediaContext::new(
            tracks,
            Box::new(SyntheticCapture {
                active: self.active.clone(),
            }),
        ))
    }
}
