//! `PeerBackend` over the webrtc crate
//!
//! Each `WebRtcPeer` owns one `RTCPeerConnection` built with the default
//! codecs and interceptors. Callbacks registered on the connection and on
//! the data channel forward into the `TransportEventSink`, so the call
//! manager observes this backend exactly like the loopback one.
//!
//! Local tracks are attached as `TrackLocalStaticSample`s. Pumping captured
//! samples into them belongs to the capture pipeline, not to this module.

use crate::media::{LocalTrack, RemoteTrack};
use crate::transport::{
    default_ice_servers, IceServer, NegotiationError, PeerBackend, PeerConnector, SenderId,
    TransportEvent, TransportEventSink,
};
use crate::types::{ConnectionState, MediaKind, Role, SdpKind, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn backend_err(context: &str, e: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Backend(format!("{context}: {e}"))
}

/// Factory for `RTCPeerConnection`-backed peers
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<IceServer>,
}

impl WebRtcConnector {
    /// Use the given STUN/TURN servers
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

impl Default for WebRtcConnector {
    fn default() -> Self {
        Self::new(default_ice_servers())
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    #[tracing::instrument(skip(self, sink), fields(call_id = %sink.call_id()))]
    async fn connect(
        &self,
        role: Role,
        sink: TransportEventSink,
    ) -> Result<Box<dyn PeerBackend>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| backend_err("failed to register codecs", e))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| backend_err("failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|e| backend_err("failed to create peer connection", e))?;

        let peer = WebRtcPeer {
            pc: Arc::new(pc),
            sink,
            senders: Mutex::new(Vec::new()),
            data_channel: Arc::new(Mutex::new(None)),
        };
        peer.register_handlers();
        tracing::debug!(role = ?role, "RTCPeerConnection created");

        Ok(Box::new(peer))
    }
}

/// `RTCPeerConnection` wrapped as a `PeerBackend`
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    sink: TransportEventSink,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
}

impl WebRtcPeer {
    fn register_handlers(&self) {
        let sink = self.sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };
                    tracing::debug!(call_id = %sink.call_id(), state = ?state, "Peer connection state");
                    sink.emit(TransportEvent::ConnectionStateChanged(state));
                })
            }));

        let sink = self.sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                Box::pin(async move {
                    if let Some(c) = candidate {
                        let candidate = c.to_json().map(|j| j.candidate).unwrap_or_default();
                        sink.emit(TransportEvent::CandidateGathered(candidate));
                    }
                })
            }));

        let sink = self.sink.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        _ => return,
                    };
                    tracing::debug!(track_id = %track.id(), kind = ?kind, "Remote track arrived");
                    sink.emit(TransportEvent::RemoteTrackArrived(RemoteTrack::new(
                        track.id(),
                        kind,
                    )));
                })
            },
        ));

        let sink = self.sink.clone();
        let slot = Arc::clone(&self.data_channel);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let sink = sink.clone();
                let slot = Arc::clone(&slot);
                Box::pin(async move {
                    tracing::debug!(label = %dc.label(), "Remote data channel announced");
                    wire_data_channel(dc, sink, slot);
                })
            }));
    }

    fn sender(&self, id: SenderId) -> Option<Arc<RTCRtpSender>> {
        self.senders.lock().get(id.0).cloned()
    }

    async fn apply_local(&self, desc: RTCSessionDescription) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| backend_err("failed to set local description", e))
    }
}

/// Report open/message on `dc` and remember it for sending
fn wire_data_channel(
    dc: Arc<RTCDataChannel>,
    sink: TransportEventSink,
    slot: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
) {
    let open_sink = sink.clone();
    let open_dc = Arc::clone(&dc);
    dc.on_open(Box::new(move || {
        *slot.lock() = Some(open_dc);
        Box::pin(async move {
            open_sink.emit(TransportEvent::AuxChannelOpened);
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(TransportEvent::AuxMessageReceived(msg.data));
        })
    }));
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    }
    .map_err(|e| backend_err("invalid session description", e))
}

fn codec_for(track: &LocalTrack) -> RTCRtpCodecCapability {
    match track.kind() {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn rtc_track(track: &LocalTrack) -> Arc<dyn TrackLocal + Send + Sync> {
    Arc::new(TrackLocalStaticSample::new(
        codec_for(track),
        track.id().to_string(),
        "huddle".to_string(),
    ))
}

#[async_trait]
impl PeerBackend for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| backend_err("failed to create offer", e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| backend_err("failed to create answer", e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), NegotiationError> {
        self.apply_local(to_rtc(desc)?).await
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| backend_err("failed to set remote description", e))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, NegotiationError> {
        let sender = self
            .pc
            .add_track(rtc_track(track))
            .await
            .map_err(|e| backend_err("failed to add track", e))?;
        let mut senders = self.senders.lock();
        senders.push(sender);
        Ok(SenderId(senders.len() - 1))
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<(), NegotiationError> {
        let rtp_sender = self
            .sender(sender)
            .ok_or(NegotiationError::MissingSender(track.kind()))?;
        rtp_sender
            .replace_track(Some(rtc_track(track)))
            .await
            .map_err(|e| backend_err("failed to replace track", e))
    }

    async fn create_aux_channel(&self, label: &str) -> Result<(), NegotiationError> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| backend_err("failed to create data channel", e))?;
        wire_data_channel(dc, self.sink.clone(), Arc::clone(&self.data_channel));
        Ok(())
    }

    async fn send_aux(&self, data: Bytes) -> Result<(), NegotiationError> {
        let dc = self
            .data_channel
            .lock()
            .clone()
            .ok_or(NegotiationError::ChannelNotOpen)?;
        dc.send(&data)
            .await
            .map_err(|e| backend_err("failed to send on data channel", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.data_channel.lock().take();
        self.pc
            .close()
            .await
            .map_err(|e| backend_err("failed to close peer connection", e))
    }

    fn backend_type(&self) -> &'static str {
        "WebRtcPeer"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CallId, TrackSource};
    use tokio::sync::mpsc;

    #[test]
    fn test_ice_servers_mapped() {
        let connector = WebRtcConnector::default();
        let config = connector.rtc_configuration();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(
            config.ice_servers[0].urls,
            vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string()
            ]
        );
    }

    #[test]
    fn test_codec_selection() {
        let mic = LocalTrack::new("microphone-0", TrackSource::Microphone);
        let screen = LocalTrack::new("screen-1", TrackSource::Screen);
        assert_eq!(codec_for(&mic).mime_type, MIME_TYPE_OPUS);
        assert_eq!(codec_for(&screen).mime_type, MIME_TYPE_VP8);
    }

    #[tokio::test]
    async fn test_offer_contains_media_sections() {
        let connector = WebRtcConnector::new(Vec::new());
        let (tx, _rx) = mpsc::unbounded_channel();
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

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=application"));

        let screen = LocalTrack::new("screen-2", TrackSource::Screen);
        peer.replace_track(SenderId(1), &screen).await.unwrap();
        peer.close().await.unwrap();
    }
}
