//! Local media acquisition and track lifecycle
//!
//! # Architecture
//!
//! The module provides a `MediaAcquirer` trait that abstracts the capture
//! devices:
//! - `SimulatedDevices` - in-process devices with scriptable permission and
//!   availability, used by the CLI and the tests
//!
//! Tracks are shared handles: the stream that owns a track and the transport
//! sender that forwards it observe the same `enabled` flag and lifecycle
//! state. Stopping is explicit and final. A `LocalStream` stops every track
//! it still holds when dropped, so no exit path can leak a live capture.

use crate::types::{MediaKind, StreamInfo, TrackInfo, TrackSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Media acquisition errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionError {
    /// The user (or platform policy) refused access
    #[error("Permission to access media devices was denied")]
    PermissionDenied,

    /// The requested device does not exist or is busy
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Processing hints requested with the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioHints {
    /// Echo cancellation
    pub echo_cancellation: bool,
    /// Noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
}

impl Default for AudioHints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// What to capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    /// Microphone with processing hints, if wanted
    pub audio: Option<AudioHints>,
    /// Video source, if wanted (`Camera` or `Screen`)
    pub video: Option<TrackSource>,
}

impl MediaRequest {
    /// Microphone and camera, as used to place or accept a call
    pub fn call(hints: AudioHints) -> Self {
        Self {
            audio: Some(hints),
            video: Some(TrackSource::Camera),
        }
    }

    /// A camera track alone
    pub fn camera() -> Self {
        Self {
            audio: None,
            video: Some(TrackSource::Camera),
        }
    }

    /// A display capture track alone
    pub fn screen() -> Self {
        Self {
            audio: None,
            video: Some(TrackSource::Screen),
        }
    }
}

/// Lifecycle state of a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackState {
    /// Capturing
    Live,
    /// Stopped by us
    Stopped,
    /// Capture ended underneath us (device unplugged, shared window closed)
    Ended,
}

struct TrackInner {
    id: String,
    source: TrackSource,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
}

/// Local capture track handle
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}

impl LocalTrack {
    /// Create a live, enabled track
    pub fn new(id: impl Into<String>, source: TrackSource) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                source,
                enabled: AtomicBool::new(true),
                state,
            }),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Media kind
    pub fn kind(&self) -> MediaKind {
        self.inner.source.kind()
    }

    /// Capture source
    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    /// Whether samples are forwarded
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable forwarding without stopping capture
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Current lifecycle state
    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    /// Still capturing
    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Stop capturing. Idempotent.
    pub fn stop(&self) {
        let stopped = self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = TrackState::Stopped;
                true
            } else {
                false
            }
        });
        if stopped {
            tracing::debug!(track_id = %self.inner.id, "Track stopped");
        }
    }

    /// Mark the capture as ended by its source rather than by us
    pub fn end_externally(&self) {
        let ended = self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = TrackState::Ended;
                true
            } else {
                false
            }
        });
        if ended {
            tracing::info!(track_id = %self.inner.id, "Track capture ended externally");
        }
    }

    /// Receiver for lifecycle changes; does not keep the track alive
    pub fn watch_state(&self) -> watch::Receiver<TrackState> {
        self.inner.state.subscribe()
    }

    /// Whether two handles refer to the same track
    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Snapshot for display
    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.inner.id.clone(),
            kind: self.kind(),
            source: Some(self.inner.source),
            enabled: self.is_enabled(),
            live: self.is_live(),
        }
    }
}

/// Tracks captured together and owned by one call
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    /// Create a stream from freshly captured tracks
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// First audio track
    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == MediaKind::Audio)
    }

    /// First video track
    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == MediaKind::Video)
    }

    /// Swap the video track, returning the previous one still live
    ///
    /// The caller decides when to stop the old track, after the transport
    /// sender has been switched over.
    pub fn replace_video(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        match self
            .tracks
            .iter()
            .position(|t| t.kind() == MediaKind::Video)
        {
            Some(pos) => Some(std::mem::replace(&mut self.tracks[pos], track)),
            None => {
                self.tracks.push(track);
                None
            }
        }
    }

    /// Move every track out without stopping them
    pub fn take_tracks(&mut self) -> Vec<LocalTrack> {
        std::mem::take(&mut self.tracks)
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Number of tracks still capturing
    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    /// Snapshot for display
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id.clone(),
            tracks: self.tracks.iter().map(LocalTrack::info).collect(),
        }
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Track received from the remote peer
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Media kind
    pub kind: MediaKind,
    live: bool,
}

impl RemoteTrack {
    /// Create a live remote track
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            live: true,
        }
    }

    /// Still receiving
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Stop playback of this track
    pub fn stop(&mut self) {
        self.live = false;
    }

    /// Snapshot for display
    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.id.clone(),
            kind: self.kind,
            source: None,
            enabled: true,
            live: self.live,
        }
    }
}

/// Remote media assembled from arriving tracks
#[derive(Debug, Default)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Add a track, ignoring duplicates. Returns true if it was new.
    pub fn add(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Stop and drop every track
    pub fn stop_all(&mut self) {
        for track in &mut self.tracks {
            track.stop();
        }
        self.tracks.clear();
    }

    /// Number of tracks still playing
    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    /// No tracks yet
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Snapshot for display
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: "remote".to_string(),
            tracks: self.tracks.iter().map(RemoteTrack::info).collect(),
        }
    }
}

/// Capture device abstraction
///
/// Implementations must allow a second acquisition while a stream is held
/// (e.g. display capture during a call) without touching existing tracks.
#[async_trait]
pub trait MediaAcquirer: Send + Sync {
    /// Capture the requested media
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` if access is refused and
    /// `DeviceUnavailable` if a requested device is missing.
    async fn acquire(&self, request: &MediaRequest) -> Result<LocalStream, AcquisitionError>;
}

/// Permission answer the simulated devices give
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    /// Access granted
    Granted,
    /// Access denied
    Denied,
}

struct DeviceState {
    permission: Permission,
    microphone: bool,
    camera: bool,
    display: bool,
    next_id: u64,
    acquisitions: u32,
    last_audio_hints: Option<AudioHints>,
    issued: Vec<LocalTrack>,
}

/// In-process capture devices
///
/// Keeps a handle to every track it issued so tests can assert that nothing
/// is left capturing. Tracks that are no longer live are forgotten on the
/// next acquisition.
pub struct SimulatedDevices {
    state: Mutex<DeviceState>,
    prompt_delay: Duration,
}

impl SimulatedDevices {
    /// All devices present, permission granted
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState {
                permission: Permission::Granted,
                microphone: true,
                camera: true,
                display: true,
                next_id: 0,
                acquisitions: 0,
                last_audio_hints: None,
                issued: Vec::new(),
            }),
            prompt_delay: Duration::ZERO,
        }
    }

    /// Delay every acquisition, modelling a permission prompt
    #[must_use]
    pub fn with_prompt_delay(mut self, delay: Duration) -> Self {
        self.prompt_delay = delay;
        self
    }

    /// Change the permission answer
    pub fn set_permission(&self, permission: Permission) {
        self.state.lock().permission = permission;
    }

    /// Plug or unplug the microphone
    pub fn set_microphone_available(&self, available: bool) {
        self.state.lock().microphone = available;
    }

    /// Plug or unplug the camera
    pub fn set_camera_available(&self, available: bool) {
        self.state.lock().camera = available;
    }

    /// Allow or forbid display capture
    pub fn set_display_available(&self, available: bool) {
        self.state.lock().display = available;
    }

    /// Successful acquisitions so far
    pub fn acquisition_count(&self) -> u32 {
        self.state.lock().acquisitions
    }

    /// Hints passed with the most recent microphone request
    pub fn last_audio_hints(&self) -> Option<AudioHints> {
        self.state.lock().last_audio_hints
    }

    /// Issued tracks still in the registry. Stopped ones drop out on the
    /// next acquisition.
    pub fn issued_tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().issued.clone()
    }

    /// Tracks issued and still capturing
    pub fn live_track_count(&self) -> usize {
        self.state
            .lock()
            .issued
            .iter()
            .filter(|t| t.is_live())
            .count()
    }

    /// End every live display capture, as if the shared window went away.
    /// Returns how many tracks were ended.
    pub fn end_display_capture(&self) -> usize {
        let state = self.state.lock();
        let mut ended = 0;
        for track in state
            .issued
            .iter()
            .filter(|t| t.source() == TrackSource::Screen && t.is_live())
        {
            track.end_externally();
            ended += 1;
        }
        ended
    }
}

impl Default for SimulatedDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaAcquirer for SimulatedDevices {
    #[tracing::instrument(skip(self), fields(audio = request.audio.is_some(), video = ?request.video))]
    async fn acquire(&self, request: &MediaRequest) -> Result<LocalStream, AcquisitionError> {
        if !self.prompt_delay.is_zero() {
            tokio::time::sleep(self.prompt_delay).await;
        }

        let mut state = self.state.lock();
        if state.permission == Permission::Denied {
            tracing::warn!("Media permission denied");
            return Err(AcquisitionError::PermissionDenied);
        }
        if request.audio.is_some() && !state.microphone {
            return Err(AcquisitionError::DeviceUnavailable("microphone".to_string()));
        }
        match request.video {
            Some(TrackSource::Camera) if !state.camera => {
                return Err(AcquisitionError::DeviceUnavailable("camera".to_string()));
            }
            Some(TrackSource::Screen) if !state.display => {
                return Err(AcquisitionError::DeviceUnavailable("display".to_string()));
            }
            Some(TrackSource::Microphone) => {
                return Err(AcquisitionError::DeviceUnavailable(
                    "microphone is not a video source".to_string(),
                ));
            }
            _ => {}
        }
        if request.audio.is_none() && request.video.is_none() {
            return Err(AcquisitionError::DeviceUnavailable(
                "no media requested".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if let Some(hints) = request.audio {
            state.last_audio_hints = Some(hints);
            tracks.push(Self::issue(&mut state, TrackSource::Microphone));
        }
        if let Some(source) = request.video {
            tracks.push(Self::issue(&mut state, source));
        }
        state.acquisitions += 1;

        let stream_id = format!("local-{}", state.acquisitions);
        tracing::debug!(stream_id = %stream_id, tracks = tracks.len(), "Media acquired");
        Ok(LocalStream::new(stream_id, tracks))
    }
}

impl SimulatedDevices {
    fn issue(state: &mut DeviceState, source: TrackSource) -> LocalTrack {
        let track = LocalTrack::new(format!("{}-{}", source.label(), state.next_id), source);
        state.next_id += 1;
        state.issued.retain(LocalTrack::is_live);
        state.issued.push(track.clone());
        track
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_call_media() {
        let devices = SimulatedDevices::new();
        let stream = devices
            .acquire(&MediaRequest::call(AudioHints::default()))
            .await
            .unwrap();

        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(
            stream.audio_track().map(LocalTrack::source),
            Some(TrackSource::Microphone)
        );
        assert_eq!(
            stream.video_track().map(LocalTrack::source),
            Some(TrackSource::Camera)
        );
        assert_eq!(devices.last_audio_hints(), Some(AudioHints::default()));
        assert_eq!(devices.live_track_count(), 2);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let devices = SimulatedDevices::new();
        devices.set_permission(Permission::Denied);
        let result = devices.acquire(&MediaRequest::camera()).await;
        assert_eq!(result.unwrap_err(), AcquisitionError::PermissionDenied);
        assert_eq!(devices.live_track_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_display() {
        let devices = SimulatedDevices::new();
        devices.set_display_available(false);
        let result = devices.acquire(&MediaRequest::screen()).await;
        assert!(matches!(result, Err(AcquisitionError::DeviceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_second_acquisition_leaves_existing_tracks() {
        let devices = SimulatedDevices::new();
        let call = devices
            .acquire(&MediaRequest::call(AudioHints::default()))
            .await
            .unwrap();
        let screen = devices.acquire(&MediaRequest::screen()).await.unwrap();

        assert_eq!(call.live_track_count(), 2);
        assert_eq!(screen.live_track_count(), 1);
        assert_eq!(devices.live_track_count(), 3);
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_tracks() {
        let devices = SimulatedDevices::new();
        let stream = devices
            .acquire(&MediaRequest::call(AudioHints::default()))
            .await
            .unwrap();
        drop(stream);
        assert_eq!(devices.live_track_count(), 0);
    }

    #[test]
    fn test_replace_video_keeps_old_track_live() {
        let camera = LocalTrack::new("camera-0", TrackSource::Camera);
        let mic = LocalTrack::new("microphone-1", TrackSource::Microphone);
        let mut stream = LocalStream::new("local", vec![mic, camera.clone()]);

        let screen = LocalTrack::new("screen-2", TrackSource::Screen);
        let old = stream.replace_video(screen).unwrap();

        assert!(old.same_track(&camera));
        assert!(old.is_live());
        assert_eq!(
            stream.video_track().map(LocalTrack::source),
            Some(TrackSource::Screen)
        );
    }

    #[test]
    fn test_stop_is_final() {
        let track = LocalTrack::new("camera-0", TrackSource::Camera);
        track.stop();
        track.end_externally();
        assert_eq!(track.state(), TrackState::Stopped);
    }

    #[tokio::test]
    async fn test_stopped_tracks_are_forgotten() {
        let devices = SimulatedDevices::new();
        for _ in 0..5 {
            let stream = devices
                .acquire(&MediaRequest::call(AudioHints::default()))
                .await
                .unwrap();
            stream.stop_all();
        }
        let held = devices.acquire(&MediaRequest::camera()).await.unwrap();

        let issued = devices.issued_tracks();
        assert_eq!(issued.len(), 1);
        assert!(issued[0].same_track(held.video_track().unwrap()));
        assert_eq!(devices.acquisition_count(), 6);
        assert_eq!(devices.live_track_count(), 1);
    }

    #[tokio::test]
    async fn test_end_display_capture() {
        let devices = SimulatedDevices::new();
        let screen = devices.acquire(&MediaRequest::screen()).await.unwrap();
        let mut watcher = screen.video_track().unwrap().watch_state();

        assert_eq!(devices.end_display_capture(), 1);
        let state = *watcher
            .wait_for(|s| *s != TrackState::Live)
            .await
            .unwrap();
        assert_eq!(state, TrackState::Ended);
    }

    #[test]
    fn test_remote_stream_dedup_and_stop() {
        let mut remote = RemoteStream::default();
        assert!(remote.add(RemoteTrack::new("a", MediaKind::Audio)));
        assert!(!remote.add(RemoteTrack::new("a", MediaKind::Audio)));
        assert!(remote.add(RemoteTrack::new("v", MediaKind::Video)));
        assert_eq!(remote.live_track_count(), 2);
        remote.stop_all();
        assert_eq!(remote.live_track_count(), 0);
        assert!(remote.is_empty());
    }
}
