//! Negotiated peer transport
//!
//! `TransportSession` wraps one peer connection supplied by a `PeerBackend`
//! and is the only place offer/answer state is tracked. It refuses any
//! description that does not fit the current signaling state, so at most one
//! local negotiation can be outstanding.
//!
//! # Backends
//!
//! - `LoopbackPeer` - in-process stand-in for a remote peer
//! - `WebRtcPeer` - `RTCPeerConnection` from the webrtc crate (feature
//!   `webrtc-backend`)
//!
//! Backends report asynchronous happenings (connection state, candidates,
//! remote tracks, auxiliary channel traffic) through a `TransportEventSink`.
//! Connectivity is only ever learned from those events, never inferred from
//! which descriptions are set.

use crate::media::{LocalTrack, RemoteTrack};
use crate::types::{CallId, ConnectionState, MediaKind, Role, SdpKind, SessionDescription, SignalingState};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Negotiation and transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Operation not allowed in the current signaling state
    #[error("Cannot {operation} in signaling state {state:?}")]
    InvalidSignalingState {
        /// Attempted operation
        operation: &'static str,
        /// State at the time
        state: SignalingState,
    },

    /// No sender carries the given media kind
    #[error("No sender for {0:?} track")]
    MissingSender(MediaKind),

    /// Auxiliary channel not open
    #[error("Auxiliary channel is not open")]
    ChannelNotOpen,

    /// Transport already closed
    #[error("Transport closed")]
    Closed,

    /// Error reported by the underlying peer connection
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Asynchronous notification from a peer connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Remote media track arrived
    RemoteTrackArrived(RemoteTrack),
    /// Local ICE candidate discovered
    CandidateGathered(String),
    /// Peer connection state changed
    ConnectionStateChanged(ConnectionState),
    /// Auxiliary channel became usable
    AuxChannelOpened,
    /// Message received on the auxiliary channel
    AuxMessageReceived(Bytes),
}

/// Delivers backend events to the session owner, tagged with the call they belong to
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    call_id: CallId,
    tx: mpsc::UnboundedSender<(CallId, TransportEvent)>,
}

impl TransportEventSink {
    /// Create a sink for the given call
    pub fn new(call_id: CallId, tx: mpsc::UnboundedSender<(CallId, TransportEvent)>) -> Self {
        Self { call_id, tx }
    }

    /// A sink nobody listens to, for throwaway connections
    pub fn detached() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self {
            call_id: CallId::new(),
            tx,
        }
    }

    /// Call this sink reports for
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Forward an event. Returns false if the owner is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.call_id, event)).is_ok()
    }
}

/// Identifier of a track sender inside a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub usize);

/// Outgoing track attachment
#[derive(Debug, Clone)]
pub struct TrackSender {
    /// Backend sender identifier
    pub id: SenderId,
    /// Media kind this sender carries
    pub kind: MediaKind,
    /// Track currently being sent
    pub track: LocalTrack,
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Public STUN servers used when nothing else is configured
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: None,
        credential: None,
    }]
}

/// The provided peer-connection capability
///
/// Candidate gathering and connectivity checks happen inside the backend;
/// this crate only drives descriptions and observes the results.
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Create an offer for the attached tracks
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), NegotiationError>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), NegotiationError>;

    /// Attach a local track and return its sender
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, NegotiationError>;

    /// Swap the track on an existing sender without renegotiating
    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<(), NegotiationError>;

    /// Create the auxiliary message channel (caller side)
    async fn create_aux_channel(&self, label: &str) -> Result<(), NegotiationError>;

    /// Send on the auxiliary channel
    async fn send_aux(&self, data: Bytes) -> Result<(), NegotiationError>;

    /// Close the connection
    async fn close(&self) -> Result<(), NegotiationError>;

    /// Backend type name for logging
    fn backend_type(&self) -> &'static str;
}

/// Factory for peer connections
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Build a new peer connection reporting into `sink`
    async fn connect(
        &self,
        role: Role,
        sink: TransportEventSink,
    ) -> Result<Box<dyn PeerBackend>, NegotiationError>;
}

/// One negotiated peer connection owned by a call
pub struct TransportSession {
    call_id: CallId,
    role: Role,
    backend: Box<dyn PeerBackend>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    connection_state: ConnectionState,
    signaling_state: SignalingState,
    senders: Vec<TrackSender>,
    aux_open: bool,
    negotiation_count: u32,
    candidates: u32,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("call_id", &self.call_id)
            .field("role", &self.role)
            .field("backend", &self.backend.backend_type())
            .field("connection_state", &self.connection_state)
            .field("signaling_state", &self.signaling_state)
            .field("senders", &self.senders.len())
            .field("aux_open", &self.aux_open)
            .finish()
    }
}

impl TransportSession {
    /// Connect a new transport for `call_id`
    ///
    /// The caller side creates the auxiliary channel right away; the callee
    /// learns about it from an `AuxChannelOpened` event.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be created or refuses the channel
    #[tracing::instrument(skip(connector, sink), fields(call_id = %sink.call_id()))]
    pub async fn open(
        connector: &dyn PeerConnector,
        role: Role,
        sink: TransportEventSink,
        aux_label: &str,
    ) -> Result<Self, NegotiationError> {
        let call_id = sink.call_id();
        let backend = connector.connect(role, sink).await?;
        tracing::debug!(backend = backend.backend_type(), "Peer connection created");

        if role == Role::Caller {
            backend.create_aux_channel(aux_label).await?;
            tracing::debug!(label = aux_label, "Auxiliary channel created");
        }

        Ok(Self {
            call_id,
            role,
            backend,
            local_description: None,
            remote_description: None,
            connection_state: ConnectionState::New,
            signaling_state: SignalingState::Stable,
            senders: Vec::new(),
            aux_open: false,
            negotiation_count: 0,
            candidates: 0,
        })
    }

    /// Call this transport belongs to
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Our role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current peer connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    /// Current offer/answer state
    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    /// Applied local description
    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    /// Applied remote description
    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    /// Outgoing senders
    pub fn senders(&self) -> &[TrackSender] {
        &self.senders
    }

    /// Auxiliary channel open
    pub fn aux_open(&self) -> bool {
        self.aux_open
    }

    /// Offers and answers created so far
    pub fn negotiation_count(&self) -> u32 {
        self.negotiation_count
    }

    /// Local candidates reported so far
    pub fn candidate_count(&self) -> u32 {
        self.candidates
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.signaling_state == SignalingState::Closed {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    /// Attach a local track
    ///
    /// # Errors
    ///
    /// Returns error if closed or the backend refuses the track
    pub async fn add_track(&mut self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let id = self.backend.add_track(track).await?;
        tracing::debug!(call_id = %self.call_id, track_id = %track.id(), kind = ?track.kind(), "Track attached");
        self.senders.push(TrackSender {
            id,
            kind: track.kind(),
            track: track.clone(),
        });
        Ok(())
    }

    /// Create an offer; only legal when no negotiation is outstanding
    ///
    /// # Errors
    ///
    /// Returns error if the signaling state is not `Stable`
    pub async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if self.signaling_state != SignalingState::Stable {
            return Err(NegotiationError::InvalidSignalingState {
                operation: "create offer",
                state: self.signaling_state,
            });
        }
        let offer = self.backend.create_offer().await?;
        self.negotiation_count += 1;
        Ok(offer)
    }

    /// Create an answer to the applied remote offer
    ///
    /// # Errors
    ///
    /// Returns error if no remote offer is pending
    pub async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if self.signaling_state != SignalingState::HaveRemoteOffer {
            return Err(NegotiationError::InvalidSignalingState {
                operation: "create answer",
                state: self.signaling_state,
            });
        }
        let answer = self.backend.create_answer().await?;
        self.negotiation_count += 1;
        Ok(answer)
    }

    /// Apply a local description
    ///
    /// # Errors
    ///
    /// Returns error if the description does not fit the signaling state
    pub async fn set_local_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let next = match (desc.kind, self.signaling_state) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (_, state) => {
                return Err(NegotiationError::InvalidSignalingState {
                    operation: "set local description",
                    state,
                })
            }
        };
        self.backend.set_local_description(&desc).await?;
        self.transition_signaling(next);
        self.local_description = Some(desc);
        Ok(())
    }

    /// Apply a remote description
    ///
    /// # Errors
    ///
    /// Returns error if the description does not fit the signaling state
    pub async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let next = match (desc.kind, self.signaling_state) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (_, state) => {
                return Err(NegotiationError::InvalidSignalingState {
                    operation: "set remote description",
                    state,
                })
            }
        };
        self.backend.set_remote_description(&desc).await?;
        self.transition_signaling(next);
        self.remote_description = Some(desc);
        Ok(())
    }

    fn transition_signaling(&mut self, next: SignalingState) {
        tracing::debug!(
            call_id = %self.call_id,
            old_state = ?self.signaling_state,
            new_state = ?next,
            "Signaling state transition"
        );
        self.signaling_state = next;
    }

    /// Send a different track on the existing sender of the same kind
    ///
    /// No offer/answer takes place and the negotiation count is unchanged.
    ///
    /// # Errors
    ///
    /// Returns error if no sender carries that kind
    pub async fn replace_track(&mut self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let kind = track.kind();
        let sender = self
            .senders
            .iter_mut()
            .find(|s| s.kind == kind)
            .ok_or(NegotiationError::MissingSender(kind))?;
        self.backend.replace_track(sender.id, track).await?;
        tracing::debug!(
            call_id = %self.call_id,
            old_track = %sender.track.id(),
            new_track = %track.id(),
            "Sender track replaced"
        );
        sender.track = track.clone();
        Ok(())
    }

    /// Fold a backend event into the observed state
    pub fn apply_event(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::ConnectionStateChanged(state) => {
                if self.connection_state != ConnectionState::Closed {
                    self.connection_state = *state;
                }
            }
            TransportEvent::AuxChannelOpened => {
                self.aux_open = self.signaling_state != SignalingState::Closed;
            }
            TransportEvent::CandidateGathered(_) => {
                self.candidates += 1;
            }
            TransportEvent::RemoteTrackArrived(_) | TransportEvent::AuxMessageReceived(_) => {}
        }
    }

    /// Send on the auxiliary channel
    ///
    /// # Errors
    ///
    /// Returns error if the channel is not open
    pub async fn send_aux(&self, data: Bytes) -> Result<(), NegotiationError> {
        if !self.aux_open {
            return Err(NegotiationError::ChannelNotOpen);
        }
        self.backend.send_aux(data).await
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.signaling_state == SignalingState::Closed {
            return;
        }
        self.signaling_state = SignalingState::Closed;
        self.connection_state = ConnectionState::Closed;
        self.aux_open = false;
        if let Err(e) = self.backend.close().await {
            tracing::warn!(call_id = %self.call_id, "Failed to close peer connection: {}", e);
            // Continue cleanup even if close fails
        }
        tracing::debug!(call_id = %self.call_id, "Transport closed");
    }
}
