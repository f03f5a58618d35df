//! Huddle - call session manager for a peer-to-peer chat client
//!
//! This library drives one audio/video call at a time between the local user
//! and a remote peer. It features:
//!
//! - **Single-owner state machine**: one task owns the call; commands, transport
//!   events and signaling events are processed in order
//! - **Offer/answer negotiation**: over a pluggable peer connection backend
//! - **Track management**: microphone, camera and screen share swapped without
//!   renegotiation
//! - **Auxiliary channel**: a message channel riding alongside the media
//! - **Simulated peers**: loopback transport, simulated devices and a signaling
//!   simulator for offline use and tests
//!
//! # Examples
//!
//! ```rust,no_run
//! use huddle_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let connector = Arc::new(LoopbackConnector::new());
//! let directory = Arc::new(InMemoryDirectory::seeded());
//! let signaling = Arc::new(SignalingSimulator::<PeerIdentityString>::new(
//!     connector.clone(),
//!     directory,
//! ));
//!
//! let calls = CallSessionManager::builder(signaling)
//!     .with_connector(connector)
//!     .spawn();
//!
//! let call_id = calls.start(PeerIdentityString::new("Alex")).await?;
//! println!("Calling: {call_id}");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Peer identity abstraction
pub mod identity;

/// Local capture and remote media
pub mod media;

/// Peer connection abstraction and per-call transport session
pub mod transport;

/// In-process peer connection backend
pub mod loopback;

/// Peer connections backed by the webrtc crate (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_backend;

/// Signaling contract and simulator
pub mod signaling;

/// Chat directory contract
pub mod directory;

/// Call session manager
pub mod call;

// Re-export main types at crate root
pub use call::{
    CallError, CallHandle, CallManagerConfig, CallSessionManager, CallSessionManagerBuilder,
    CommandKind,
};
pub use directory::{Directory, DirectoryError, Friend, InMemoryDirectory, Presence, UserProfile};
pub use identity::{PeerIdentity, PeerIdentityString};
pub use loopback::{LoopbackConnector, LoopbackControl};
pub use media::{
    AcquisitionError, AudioHints, LocalStream, LocalTrack, MediaAcquirer, MediaRequest,
    Permission, RemoteStream, RemoteTrack, SimulatedDevices, TrackState,
};
pub use signaling::{
    RemoteBehavior, SentSignal, SignalingChannel, SignalingError, SignalingEvent, SignalingSink,
    SignalingSimulator,
};
pub use transport::{
    IceServer, NegotiationError, PeerBackend, PeerConnector, TransportEvent, TransportEventSink,
    TransportSession,
};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_backend::{WebRtcConnector, WebRtcPeer};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallHandle, CallManagerConfig, CallSessionManager};
    pub use crate::directory::{Directory, InMemoryDirectory};
    pub use crate::identity::{PeerIdentity, PeerIdentityString};
    pub use crate::loopback::LoopbackConnector;
    pub use crate::media::{MediaAcquirer, SimulatedDevices};
    pub use crate::signaling::{RemoteBehavior, SignalingChannel, SignalingSimulator};
    pub use crate::transport::PeerConnector;
    pub use crate::types::{CallEvent, CallId, CallSnapshot, CallState};
    #[cfg(feature = "webrtc-backend")]
    pub use crate::webrtc_backend::WebRtcConnector;
}
