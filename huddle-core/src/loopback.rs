//! In-process peer backend
//!
//! `LoopbackPeer` plays both ends of a connection: whatever we send, the
//! imaginary remote sends back. Once the description exchange completes it
//! reports a gathered candidate, the connecting/connected transitions, one
//! remote track per attached local track and an open auxiliary channel.
//! Auxiliary messages are echoed.
//!
//! `LoopbackControl` is shared by every peer a connector creates and lets
//! callers script failures.

use crate::media::{LocalTrack, RemoteTrack};
use crate::transport::{
    NegotiationError, PeerBackend, PeerConnector, SenderId, TransportEvent, TransportEventSink,
};
use crate::types::{ConnectionState, MediaKind, Role, SdpKind, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct ControlState {
    peers: Vec<Arc<PeerShared>>,
    next_peer: u64,
    fail_negotiation: bool,
    stall: bool,
    echo: bool,
    negotiation_delay: Duration,
    sent: Vec<Bytes>,
}

/// Script for every peer created by one connector
pub struct LoopbackControl {
    state: Mutex<ControlState>,
}

impl LoopbackControl {
    fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                peers: Vec::new(),
                next_peer: 0,
                fail_negotiation: false,
                stall: false,
                echo: true,
                negotiation_delay: Duration::ZERO,
                sent: Vec::new(),
            }),
        }
    }

    /// Make offer/answer creation fail
    pub fn set_fail_negotiation(&self, fail: bool) {
        self.state.lock().fail_negotiation = fail;
    }

    /// Never report connectivity after the exchange
    pub fn set_stall(&self, stall: bool) {
        self.state.lock().stall = stall;
    }

    /// Echo auxiliary messages back (on by default)
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().echo = echo;
    }

    /// Delay offer/answer creation
    pub fn set_negotiation_delay(&self, delay: Duration) {
        self.state.lock().negotiation_delay = delay;
    }

    /// Report `Disconnected` on every open peer
    pub fn disconnect(&self) {
        self.broadcast(TransportEvent::ConnectionStateChanged(
            ConnectionState::Disconnected,
        ));
    }

    /// Report `Failed` on every open peer
    pub fn fail(&self) {
        self.broadcast(TransportEvent::ConnectionStateChanged(ConnectionState::Failed));
    }

    /// Deliver an auxiliary message on every open peer
    pub fn inject_message(&self, data: Bytes) {
        self.broadcast(TransportEvent::AuxMessageReceived(data));
    }

    /// Report connectivity on every open peer, e.g. after a stall
    pub fn connect_stalled(&self) {
        for peer in self.open_peers() {
            peer.emit(TransportEvent::ConnectionStateChanged(
                ConnectionState::Connected,
            ));
        }
    }

    /// Peers created so far
    pub fn created_count(&self) -> u64 {
        self.state.lock().next_peer
    }

    /// Peers not yet closed
    pub fn open_count(&self) -> usize {
        self.open_peers().len()
    }

    /// Every auxiliary payload sent through any peer
    pub fn sent_messages(&self) -> Vec<Bytes> {
        self.state.lock().sent.clone()
    }

    fn open_peers(&self) -> Vec<Arc<PeerShared>> {
        self.state
            .lock()
            .peers
            .iter()
            .filter(|p| !p.is_closed())
            .cloned()
            .collect()
    }

    fn broadcast(&self, event: TransportEvent) {
        for peer in self.open_peers() {
            peer.emit(event.clone());
        }
    }
}

#[derive(Default)]
struct PeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<(SenderId, String, MediaKind)>,
    aux_label: Option<String>,
    established: bool,
}

struct PeerShared {
    id: u64,
    role: Role,
    sink: TransportEventSink,
    closed: AtomicBool,
    state: Mutex<PeerState>,
}

impl PeerShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: TransportEvent) {
        if !self.is_closed() {
            self.sink.emit(event);
        }
    }
}

/// Factory for loopback peers
#[derive(Clone)]
pub struct LoopbackConnector {
    control: Arc<LoopbackControl>,
}

impl LoopbackConnector {
    /// Create a connector with a fresh control
    #[must_use]
    pub fn new() -> Self {
        Self {
            control: Arc::new(LoopbackControl::new()),
        }
    }

    /// Shared failure script
    pub fn control(&self) -> Arc<LoopbackControl> {
        Arc::clone(&self.control)
    }
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(
        &self,
        role: Role,
        sink: TransportEventSink,
    ) -> Result<Box<dyn PeerBackend>, NegotiationError> {
        let shared = {
            let mut state = self.control.state.lock();
            let shared = Arc::new(PeerShared {
                id: state.next_peer,
                role,
                sink,
                closed: AtomicBool::new(false),
                state: Mutex::new(PeerState::default()),
            });
            state.next_peer += 1;
            state.peers.retain(|p| !p.is_closed());
            state.peers.push(Arc::clone(&shared));
            shared
        };
        tracing::debug!(peer = shared.id, role = ?role, "Loopback peer created");
        Ok(Box::new(LoopbackPeer {
            shared,
            control: Arc::clone(&self.control),
        }))
    }
}

/// In-process `PeerBackend`
pub struct LoopbackPeer {
    shared: Arc<PeerShared>,
    control: Arc<LoopbackControl>,
}

impl LoopbackPeer {
    async fn negotiation_gate(&self) -> Result<(), NegotiationError> {
        let (delay, fail) = {
            let state = self.control.state.lock();
            (state.negotiation_delay, state.fail_negotiation)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.shared.is_closed() {
            return Err(NegotiationError::Closed);
        }
        if fail {
            return Err(NegotiationError::Backend(
                "loopback negotiation failure".to_string(),
            ));
        }
        Ok(())
    }

    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let state = self.shared.state.lock();
        let mut sdp = format!(
            "v=0\r\no=huddle-loopback {} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.shared.id
        );
        for (_, track_id, kind) in &state.senders {
            let media = match kind {
                MediaKind::Audio => "audio",
                MediaKind::Video => "video",
            };
            sdp.push_str(&format!("m={media} 9 UDP/TLS/RTP/SAVPF 0\r\na=msid:{track_id}\r\n"));
        }
        if let Some(label) = &state.aux_label {
            sdp.push_str(&format!("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=label:{label}\r\n"));
        }
        SessionDescription { kind, sdp }
    }

    fn check_open(&self) -> Result<(), NegotiationError> {
        if self.shared.is_closed() {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    /// Runs once both descriptions are in place
    fn establish_if_complete(&self) {
        let (senders, stall) = {
            let mut state = self.shared.state.lock();
            let complete = match self.shared.role {
                Role::Caller => {
                    state.local.is_some()
                        && state.remote.as_ref().map(|d| d.kind) == Some(SdpKind::Answer)
                }
                Role::Callee => {
                    state.remote.is_some()
                        && state.local.as_ref().map(|d| d.kind) == Some(SdpKind::Answer)
                }
            };
            if !complete || state.established {
                return;
            }
            state.established = true;
            (state.senders.clone(), self.control.state.lock().stall)
        };

        let peer = &self.shared;
        peer.emit(TransportEvent::CandidateGathered(format!(
            "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
            50000 + peer.id
        )));
        peer.emit(TransportEvent::ConnectionStateChanged(
            ConnectionState::Connecting,
        ));
        if stall {
            tracing::debug!(peer = peer.id, "Loopback connectivity stalled");
            return;
        }
        peer.emit(TransportEvent::ConnectionStateChanged(
            ConnectionState::Connected,
        ));
        for (_, track_id, kind) in senders {
            peer.emit(TransportEvent::RemoteTrackArrived(RemoteTrack::new(
                format!("remote-{track_id}"),
                kind,
            )));
        }
        peer.emit(TransportEvent::AuxChannelOpened);
    }
}

#[async_trait]
impl PeerBackend for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.negotiation_gate().await?;
        Ok(self.describe(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.negotiation_gate().await?;
        Ok(self.describe(SdpKind::Answer))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), NegotiationError> {
        self.check_open()?;
        self.shared.state.lock().local = Some(desc.clone());
        self.establish_if_complete();
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), NegotiationError> {
        self.check_open()?;
        if desc.sdp.trim().is_empty() {
            return Err(NegotiationError::Backend("empty remote description".to_string()));
        }
        self.shared.state.lock().remote = Some(desc.clone());
        self.establish_if_complete();
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, NegotiationError> {
        self.check_open()?;
        let mut state = self.shared.state.lock();
        let id = SenderId(state.senders.len());
        state.senders.push((id, track.id().to_string(), track.kind()));
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.check_open()?;
        let mut state = self.shared.state.lock();
        let entry = state
            .senders
            .iter_mut()
            .find(|(id, _, _)| *id == sender)
            .ok_or(NegotiationError::MissingSender(track.kind()))?;
        if entry.2 != track.kind() {
            return Err(NegotiationError::MissingSender(track.kind()));
        }
        entry.1 = track.id().to_string();
        Ok(())
    }

    async fn create_aux_channel(&self, label: &str) -> Result<(), NegotiationError> {
        self.check_open()?;
        self.shared.state.lock().aux_label = Some(label.to_string());
        Ok(())
    }

    async fn send_aux(&self, data: Bytes) -> Result<(), NegotiationError> {
        self.check_open()?;
        let echo = {
            let mut state = self.control.state.lock();
            state.sent.push(data.clone());
            state.echo
        };
        if echo {
            self.shared.emit(TransportEvent::AuxMessageReceived(data));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(peer = self.shared.id, "Loopback peer closed");
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "LoopbackPeer"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CallId, TrackSource};
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<(CallId, TransportEvent)>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok((_, event)) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn caller_with_tracks(
        connector: &LoopbackConnector,
    ) -> (Box<dyn PeerBackend>, mpsc::UnboundedReceiver<(CallId, TransportEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = connector
            .connect(Role::Caller, TransportEventSink::new(CallId::new(), tx))
            .await
            .unwrap();
        peer.add_track(&LocalTrack::new("microphone-0", TrackSource::Microphone))
            .await
            .unwrap();
        peer.add_track(&LocalTrack::new("camera-1", TrackSource::Camera))
            .await
            .unwrap();
        peer.create_aux_channel("chat").await.unwrap();
        (peer, rx)
    }

    #[tokio::test]
    async fn test_offer_describes_senders() {
        let connector = LoopbackConnector::new();
        let (peer, _rx) = caller_with_tracks(&connector).await;
        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=label:chat"));
    }

    #[tokio::test]
    async fn test_connect_sequence_after_answer() {
        let connector = LoopbackConnector::new();
        let (peer, mut rx) = caller_with_tracks(&connector).await;
        let offer = peer.create_offer().await.unwrap();
        peer.set_local_description(&offer).await.unwrap();
        assert!(drain(&mut rx).is_empty());

        peer.set_remote_description(&SessionDescription::answer("v=0"))
            .await
            .unwrap();
        let events = drain(&mut rx);
        assert!(matches!(events[0], TransportEvent::CandidateGathered(_)));
        assert!(matches!(
            events[2],
            TransportEvent::ConnectionStateChanged(ConnectionState::Connected)
        ));
        let remote_tracks = events
            .iter()
            .filter(|e| matches!(e, TransportEvent::RemoteTrackArrived(_)))
            .count();
        assert_eq!(remote_tracks, 2);
        assert!(matches!(events.last(), Some(TransportEvent::AuxChannelOpened)));
    }

    #[tokio::test]
    async fn test_stall_stops_at_connecting() {
        let connector = LoopbackConnector::new();
        connector.control().set_stall(true);
        let (peer, mut rx) = caller_with_tracks(&connector).await;
        let offer = peer.create_offer().await.unwrap();
        peer.set_local_description(&offer).await.unwrap();
        peer.set_remote_description(&SessionDescription::answer("v=0"))
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            TransportEvent::ConnectionStateChanged(ConnectionState::Connecting)
        ));
    }

    #[tokio::test]
    async fn test_echo_and_closed_peer_is_silent() {
        let connector = LoopbackConnector::new();
        let control = connector.control();
        let (peer, mut rx) = caller_with_tracks(&connector).await;

        peer.send_aux(Bytes::from_static(b"ping")).await.unwrap();
        let events = drain(&mut rx);
        assert!(matches!(&events[0], TransportEvent::AuxMessageReceived(d) if d.as_ref() == b"ping"));
        assert_eq!(control.sent_messages().len(), 1);

        peer.close().await.unwrap();
        control.disconnect();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(control.open_count(), 0);
        assert_eq!(peer.create_offer().await, Err(NegotiationError::Closed));
    }

    #[tokio::test]
    async fn test_scripted_negotiation_failure() {
        let connector = LoopbackConnector::new();
        connector.control().set_fail_negotiation(true);
        let (peer, _rx) = caller_with_tracks(&connector).await;
        assert!(matches!(
            peer.create_offer().await,
            Err(NegotiationError::Backend(_))
        ));
    }
}
