//! Call types and data structures

use crate::identity::PeerIdentity;
use crate::media::AcquisitionError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the offer/answer exchange this client plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Creates the offer and the auxiliary channel
    Caller,
    /// Answers a remote offer and receives the auxiliary channel
    Callee,
}

/// Sub-states of an outgoing call before it is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingPhase {
    /// Waiting for microphone/camera
    Acquiring,
    /// Building the transport and the local offer
    Negotiating,
    /// Offer sent, waiting for the remote answer
    AwaitingAnswer,
    /// Answer applied, waiting for the transport to report connectivity
    Connecting,
}

/// Sub-states of an incoming call after the user accepted it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptPhase {
    /// Waiting for microphone/camera
    Acquiring,
    /// Building the transport and the local answer
    Negotiating,
    /// Answer sent, waiting for the transport to report connectivity
    Connecting,
}

/// Call state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No active call
    Idle,
    /// Outgoing call in progress
    Outgoing(OutgoingPhase),
    /// Incoming call waiting for the user
    Ringing,
    /// Incoming call accepted, still being set up
    Accepting(AcceptPhase),
    /// Transport confirmed the connection
    Connected,
    /// Terminal state, immediately followed by `Idle`
    Ended,
}

impl CallState {
    /// No session exists
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Waiting on media acquisition
    #[must_use]
    pub fn is_acquiring(&self) -> bool {
        matches!(
            self,
            Self::Outgoing(OutgoingPhase::Acquiring) | Self::Accepting(AcceptPhase::Acquiring)
        )
    }

    /// A transport exists (or is being built) but has not confirmed connectivity yet
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Outgoing(
                OutgoingPhase::Negotiating
                    | OutgoingPhase::AwaitingAnswer
                    | OutgoingPhase::Connecting
            ) | Self::Accepting(AcceptPhase::Negotiating | AcceptPhase::Connecting)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Outgoing(phase) => write!(f, "outgoing ({phase:?})"),
            Self::Ringing => f.write_str("ringing"),
            Self::Accepting(phase) => write!(f, "accepting ({phase:?})"),
            Self::Connected => f.write_str("connected"),
            Self::Ended => f.write_str("ended"),
        }
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// Where a local track's samples come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackSource {
    /// Microphone capture
    Microphone,
    /// Camera capture
    Camera,
    /// Display (screen) capture
    Screen,
}

impl TrackSource {
    /// Media kind produced by this source
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Microphone => MediaKind::Audio,
            Self::Camera | Self::Screen => MediaKind::Video,
        }
    }

    /// Label used for track naming
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Microphone => "microphone",
            Self::Camera => "camera",
            Self::Screen => "screen",
        }
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Peer connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing started yet
    New,
    /// Candidates are being checked
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost, may or may not recover
    Disconnected,
    /// Connectivity failed
    Failed,
    /// Closed locally
    Closed,
}

/// Offer/answer signaling state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingState {
    /// No negotiation outstanding
    Stable,
    /// Local offer set, waiting for the remote answer
    HaveLocalOffer,
    /// Remote offer set, local answer not yet created
    HaveRemoteOffer,
    /// Transport closed
    Closed,
}

/// Snapshot of a local or remote track for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Track identifier
    pub id: String,
    /// Media kind
    pub kind: MediaKind,
    /// Capture source (local tracks only)
    pub source: Option<TrackSource>,
    /// Whether samples are forwarded
    pub enabled: bool,
    /// Whether the track is still live
    pub live: bool,
}

/// Snapshot of a stream for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Stream identifier
    pub id: String,
    /// Tracks in the stream
    pub tracks: Vec<TrackInfo>,
}

impl StreamInfo {
    /// Current video source, if any
    #[must_use]
    pub fn video_source(&self) -> Option<TrackSource> {
        self.tracks
            .iter()
            .find(|t| t.kind == MediaKind::Video)
            .and_then(|t| t.source)
    }
}

/// Why the remote side did not take the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclineReason {
    /// Remote user declined
    Declined,
    /// Remote already in a call
    Busy,
}

/// Who ended a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    Local,
    /// Remote user hung up
    Remote,
}

/// Incoming call notification delivered by signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub struct IncomingCall<I: PeerIdentity> {
    /// Call identifier chosen by the caller
    pub call_id: CallId,
    /// Who is calling
    pub peer: I,
    /// The caller's offer
    pub offer: SessionDescription,
    /// When the notification arrived
    pub received_at: DateTime<Utc>,
}

impl<I: PeerIdentity> IncomingCall<I> {
    /// Create an incoming call notification
    pub fn new(peer: I, offer: SessionDescription) -> Self {
        Self {
            call_id: CallId::new(),
            peer,
            offer,
            received_at: Utc::now(),
        }
    }
}

/// Call event for notifications
#[derive(Debug, Clone)]
pub enum CallEvent<I: PeerIdentity> {
    /// State machine moved
    StateChanged(CallState),
    /// Incoming call is ringing
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        peer: I,
    },
    /// Local preview should show this stream
    LocalStreamReady(StreamInfo),
    /// Remote media arrived
    RemoteStreamReady(StreamInfo),
    /// Microphone/camera/display could not be obtained
    AcquisitionFailed(AcquisitionError),
    /// Offer/answer exchange failed, call torn down
    NegotiationFailed {
        /// Call identifier
        call_id: CallId,
        /// Error description
        error: String,
    },
    /// No connectivity within the negotiation timeout, call torn down
    NegotiationTimedOut {
        /// Call identifier
        call_id: CallId,
    },
    /// Transport disconnected or failed, call torn down
    ConnectionLost {
        /// Call identifier
        call_id: CallId,
    },
    /// Call ended normally
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Who hung up
        reason: EndReason,
    },
    /// Local user rejected the incoming call
    CallRejected {
        /// Call identifier
        call_id: CallId,
    },
    /// Remote user did not take the call
    RemoteDeclined {
        /// Call identifier
        call_id: CallId,
        /// Why
        reason: DeclineReason,
    },
    /// Microphone enabled flag flipped
    MicrophoneToggled {
        /// New value
        enabled: bool,
    },
    /// Camera enabled flag flipped
    CameraToggled {
        /// New value
        enabled: bool,
    },
    /// Remote playback mute flipped
    SpeakerToggled {
        /// New value
        muted: bool,
    },
    /// Outgoing video switched between camera and screen
    ScreenShareChanged {
        /// Whether the screen is now being sent
        sharing: bool,
    },
    /// Auxiliary channel is usable
    AuxChannelOpened {
        /// Call identifier
        call_id: CallId,
    },
    /// Message received on the auxiliary channel
    AuxMessage {
        /// Call identifier
        call_id: CallId,
        /// Payload
        data: Bytes,
    },
    /// Command ignored in the current state
    Warning(String),
}

/// Read-only view of the active call
#[derive(Debug, Clone)]
pub struct CallSnapshot<I: PeerIdentity> {
    /// Current state
    pub state: CallState,
    /// Active call, if any
    pub call_id: Option<CallId>,
    /// Our role in the active call
    pub role: Option<Role>,
    /// Remote party
    pub peer: Option<I>,
    /// Local stream
    pub local_stream: Option<StreamInfo>,
    /// Remote stream
    pub remote_stream: Option<StreamInfo>,
    /// Remote playback muted
    pub speaker_muted: bool,
    /// Auxiliary channel open
    pub aux_open: bool,
    /// Transport connection state
    pub connection_state: Option<ConnectionState>,
    /// Transport signaling state
    pub signaling_state: Option<SignalingState>,
    /// Offers and answers created on the current transport
    pub negotiation_count: u32,
    /// When the call was connected
    pub connected_at: Option<DateTime<Utc>>,
}

impl<I: PeerIdentity> CallSnapshot<I> {
    /// Snapshot of an idle manager
    #[must_use]
    pub fn idle() -> Self {
        Self {
            state: CallState::Idle,
            call_id: None,
            role: None,
            peer: None,
            local_stream: None,
            remote_stream: None,
            speaker_muted: false,
            aux_open: false,
            connection_state: None,
            signaling_state: None,
            negotiation_count: 0,
            connected_at: None,
        }
    }

    /// Call duration so far
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|start| Utc::now() - start)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_connecting_substates() {
        assert!(CallState::Outgoing(OutgoingPhase::AwaitingAnswer).is_connecting());
        assert!(CallState::Accepting(AcceptPhase::Connecting).is_connecting());
        assert!(!CallState::Outgoing(OutgoingPhase::Acquiring).is_connecting());
        assert!(CallState::Outgoing(OutgoingPhase::Acquiring).is_acquiring());
        assert!(!CallState::Connected.is_connecting());
        assert!(!CallState::Ringing.is_connecting());
    }

    #[test]
    fn test_track_source_kind() {
        assert_eq!(TrackSource::Microphone.kind(), MediaKind::Audio);
        assert_eq!(TrackSource::Screen.kind(), MediaKind::Video);
        assert_eq!(TrackSource::Camera.label(), "camera");
    }

    #[test]
    fn test_session_description_serialization() {
        let offer = SessionDescription::offer("v=0");
        let json = serde_json::to_string(&offer).unwrap();
        assert!(json.contains("\"offer\""));
        let back: SessionDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, offer);
    }

    #[test]
    fn test_stream_video_source() {
        let stream = StreamInfo {
            id: "local".to_string(),
            tracks: vec![TrackInfo {
                id: "camera-0".to_string(),
                kind: MediaKind::Video,
                source: Some(TrackSource::Camera),
                enabled: true,
                live: true,
            }],
        };
        assert_eq!(stream.video_source(), Some(TrackSource::Camera));
    }
}
