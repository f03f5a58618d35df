//! Call session management
//!
//! One `CallSessionManager` task owns the (single) active call. Everything
//! that can change it arrives as a message: commands from `CallHandle`s,
//! transport events tagged with their call id, signaling events, and the
//! results of work the manager spawned (media acquisition, transport
//! negotiation, display capture, timers). Messages are processed one at a
//! time, so no locks guard the session.
//!
//! Spawned work always reports back with the `CallId` it was started for.
//! A result for a call that has since ended, or that arrives in the wrong
//! phase, is released (tracks stopped, transport closed) and dropped.
//!
//! ```text
//!                 start                          incoming call
//!   Idle ──────────────────► Outgoing(Acquiring)      Idle ──────► Ringing
//!                                  │ media                          │ accept
//!                                  ▼                                ▼
//!                          Outgoing(Negotiating)          Accepting(Acquiring)
//!                                  │ offer set                      │ media
//!                                  ▼                                ▼
//!                         Outgoing(AwaitingAnswer)        Accepting(Negotiating)
//!                                  │ answer applied                 │ answer set
//!                                  ▼                                ▼
//!                          Outgoing(Connecting)           Accepting(Connecting)
//!                                  │                                │
//!                                  └──────────► Connected ◄─────────┘
//!                                                   │ end / failure
//!                                                   ▼
//!                                          Ended ──► Idle
//! ```

use crate::directory::Directory;
use crate::identity::PeerIdentity;
use crate::loopback::LoopbackConnector;
use crate::media::{
    AcquisitionError, AudioHints, LocalStream, LocalTrack, MediaAcquirer, MediaRequest,
    RemoteStream, SimulatedDevices, TrackState,
};
use crate::signaling::{
    RemoteBehavior, SignalingChannel, SignalingError, SignalingEvent, SignalingSimulator,
    SignalingSink,
};
use crate::transport::{
    default_ice_servers, IceServer, NegotiationError, PeerConnector, TransportEvent,
    TransportEventSink, TransportSession,
};
use crate::types::{
    AcceptPhase, CallEvent, CallId, CallSnapshot, CallState, ConnectionState, DeclineReason,
    EndReason, IncomingCall, OutgoingPhase, Role, SdpKind, SessionDescription, SignalingState,
    TrackSource,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A call is already in progress
    #[error("A call is already in progress")]
    AlreadyActive,

    /// Command not available in the current state
    #[error("Cannot {command} while {state}")]
    InvalidTransition {
        /// Rejected command
        command: CommandKind,
        /// State at the time
        state: CallState,
    },

    /// Media could not be acquired
    #[error("Media acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),

    /// Offer/answer exchange failed
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Signaling failed
    #[error("Signaling failed: {0}")]
    Signaling(#[from] SignalingError),

    /// Auxiliary channel is not open
    #[error("Auxiliary channel is not open")]
    AuxChannelClosed,

    /// The call ended before the command completed
    #[error("Call ended before the operation completed")]
    Cancelled,

    /// The manager task is gone
    #[error("Call manager is not running")]
    ManagerClosed,
}

/// Commands accepted by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Place a call
    Start,
    /// Deliver an incoming call
    IncomingCall,
    /// Accept the ringing call
    Accept,
    /// Reject the ringing call
    Reject,
    /// Hang up
    End,
    /// Mute/unmute the microphone
    ToggleMic,
    /// Enable/disable the camera
    ToggleCamera,
    /// Mute/unmute remote playback
    ToggleSpeakerMute,
    /// Switch between camera and screen
    ToggleScreenShare,
    /// Send on the auxiliary channel
    SendMessage,
    /// Ask signaling for a simulated incoming call
    SimulateIncomingCall,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start a call",
            Self::IncomingCall => "take an incoming call",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::End => "end the call",
            Self::ToggleMic => "toggle the microphone",
            Self::ToggleCamera => "toggle the camera",
            Self::ToggleSpeakerMute => "toggle the speaker",
            Self::ToggleScreenShare => "toggle screen sharing",
            Self::SendMessage => "send a message",
            Self::SimulateIncomingCall => "simulate an incoming call",
        };
        f.write_str(name)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Call manager configuration
///
/// Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// Delay before the simulated remote reacts to an offer
    #[serde(rename = "answer_delay_ms", with = "duration_ms")]
    pub answer_delay: Duration,
    /// Give up if a call is not connected this long after our description was sent
    #[serde(rename = "negotiation_timeout_ms", with = "option_duration_ms")]
    pub negotiation_timeout: Option<Duration>,
    /// Label of the auxiliary message channel
    pub aux_channel_label: String,
    /// Microphone processing hints
    pub audio_hints: AudioHints,
    /// STUN/TURN servers for real peer connections
    pub ice_servers: Vec<IceServer>,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    /// Simulated remote reaction to our offers
    pub remote_behavior: RemoteBehavior,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            answer_delay: Duration::from_secs(2),
            negotiation_timeout: Some(Duration::from_secs(30)),
            aux_channel_label: "chat".to_string(),
            audio_hints: AudioHints::default(),
            ice_servers: default_ice_servers(),
            event_capacity: 256,
            remote_behavior: RemoteBehavior::Answer,
        }
    }
}

impl CallManagerConfig {
    /// Signaling simulator matching this configuration
    #[must_use]
    pub fn simulator<I: PeerIdentity>(
        &self,
        connector: Arc<dyn PeerConnector>,
        directory: Arc<dyn Directory>,
    ) -> SignalingSimulator<I> {
        SignalingSimulator::new(connector, directory)
            .with_answer_delay(self.answer_delay)
            .with_aux_label(self.aux_channel_label.clone())
            .with_behavior(self.remote_behavior)
    }
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command<I: PeerIdentity> {
    Start { peer: I, reply: Reply<CallId> },
    IncomingCall { call: IncomingCall<I>, reply: Reply<()> },
    Accept { reply: Reply<()> },
    Reject { reply: Reply<()> },
    End { reply: Reply<()> },
    ToggleMic { reply: Reply<bool> },
    ToggleCamera { reply: Reply<bool> },
    ToggleSpeakerMute { reply: Reply<bool> },
    ToggleScreenShare { reply: Reply<bool> },
    SendMessage { data: Bytes, reply: Reply<()> },
    SimulateIncomingCall { reply: Reply<()> },
    State { reply: oneshot::Sender<CallState> },
    Snapshot { reply: oneshot::Sender<CallSnapshot<I>> },
    Shutdown { reply: oneshot::Sender<()> },
}

enum Internal {
    MediaAcquired {
        call_id: CallId,
        result: Result<LocalStream, AcquisitionError>,
    },
    Negotiated {
        call_id: CallId,
        result: Result<TransportSession, NegotiationError>,
    },
    VideoCaptured {
        call_id: CallId,
        result: Result<LocalStream, AcquisitionError>,
    },
    CaptureEnded {
        call_id: CallId,
        track_id: String,
    },
    NegotiationDeadline {
        call_id: CallId,
    },
    SignalingFailed {
        call_id: CallId,
        error: SignalingError,
    },
}

/// How a call came to an end
#[derive(Debug, Clone)]
enum Outcome {
    Ended(EndReason),
    ConnectionLost,
    NegotiationFailed(String),
    TimedOut,
    RemoteDeclined(DeclineReason),
}

impl Outcome {
    /// Whether the remote still needs to hear that the call is over
    fn notify_remote(&self) -> bool {
        !matches!(self, Self::Ended(EndReason::Remote) | Self::RemoteDeclined(_))
    }
}

struct Notifier<I: PeerIdentity> {
    tx: broadcast::Sender<CallEvent<I>>,
}

impl<I: PeerIdentity> Notifier<I> {
    fn emit(&self, event: CallEvent<I>) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    fn warn(&self, message: String) {
        self.emit(CallEvent::Warning(message));
    }
}

struct CallSession<I: PeerIdentity> {
    id: CallId,
    role: Role,
    peer: I,
    state: CallState,
    connected_at: Option<DateTime<Utc>>,
    local_stream: Option<LocalStream>,
    remote_stream: RemoteStream,
    transport: Option<TransportSession>,
    remote_offer: Option<SessionDescription>,
    speaker_muted: bool,
    sharing_screen: bool,
    swap_in_flight: bool,
    swap_reply: Option<Reply<bool>>,
    start_reply: Option<Reply<CallId>>,
    accept_reply: Option<Reply<()>>,
    early_events: Vec<TransportEvent>,
    timers: Vec<JoinHandle<()>>,
}

impl<I: PeerIdentity> CallSession<I> {
    fn new(id: CallId, role: Role, peer: I, state: CallState) -> Self {
        Self {
            id,
            role,
            peer,
            state,
            connected_at: None,
            local_stream: None,
            remote_stream: RemoteStream::default(),
            transport: None,
            remote_offer: None,
            speaker_muted: false,
            sharing_screen: false,
            swap_in_flight: false,
            swap_reply: None,
            start_reply: None,
            accept_reply: None,
            early_events: Vec::new(),
            timers: Vec::new(),
        }
    }

    fn transition(&mut self, next: CallState, notify: &Notifier<I>) {
        if self.state == next {
            return;
        }
        tracing::debug!(
            call_id = %self.id,
            old_state = %self.state,
            new_state = %next,
            "Call state transition"
        );
        self.state = next;
        notify.emit(CallEvent::StateChanged(next));
    }

    fn fail_pending(&mut self, error: &CallError) {
        if let Some(reply) = self.start_reply.take() {
            let _ = reply.send(Err(error.clone()));
        }
        if let Some(reply) = self.accept_reply.take() {
            let _ = reply.send(Err(error.clone()));
        }
        if let Some(reply) = self.swap_reply.take() {
            let _ = reply.send(Err(error.clone()));
        }
    }

    /// Stop every track, close the transport and cancel timers
    async fn release(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        if let Some(stream) = self.local_stream.take() {
            stream.stop_all();
        }
        self.remote_stream.stop_all();
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.early_events.clear();
        self.swap_in_flight = false;
    }

    fn snapshot(&self) -> CallSnapshot<I> {
        CallSnapshot {
            state: self.state,
            call_id: Some(self.id),
            role: Some(self.role),
            peer: Some(self.peer.clone()),
            local_stream: self.local_stream.as_ref().map(LocalStream::info),
            remote_stream: (!self.remote_stream.is_empty()).then(|| self.remote_stream.info()),
            speaker_muted: self.speaker_muted,
            aux_open: self.transport.as_ref().is_some_and(TransportSession::aux_open),
            connection_state: self.transport.as_ref().map(TransportSession::connection_state),
            signaling_state: self.transport.as_ref().map(TransportSession::signaling_state),
            negotiation_count: self
                .transport
                .as_ref()
                .map_or(0, TransportSession::negotiation_count),
            connected_at: self.connected_at,
        }
    }
}

/// Entry point for building a call manager
pub struct CallSessionManager;

impl CallSessionManager {
    /// Create a builder around a signaling channel
    #[must_use]
    pub fn builder<I: PeerIdentity>(
        signaling: Arc<dyn SignalingChannel<I>>,
    ) -> CallSessionManagerBuilder<I> {
        CallSessionManagerBuilder::new(signaling)
    }
}

/// Call manager builder
pub struct CallSessionManagerBuilder<I: PeerIdentity> {
    signaling: Arc<dyn SignalingChannel<I>>,
    config: CallManagerConfig,
    media: Option<Arc<dyn MediaAcquirer>>,
    connector: Option<Arc<dyn PeerConnector>>,
}

impl<I: PeerIdentity> CallSessionManagerBuilder<I> {
    /// Create new builder
    #[must_use]
    pub fn new(signaling: Arc<dyn SignalingChannel<I>>) -> Self {
        Self {
            signaling,
            config: CallManagerConfig::default(),
            media: None,
            connector: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the capture devices (default: `SimulatedDevices`)
    #[must_use]
    pub fn with_media(mut self, media: Arc<dyn MediaAcquirer>) -> Self {
        self.media = Some(media);
        self
    }

    /// Set the peer connection factory (default: `LoopbackConnector`)
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Start the manager task on the current tokio runtime
    pub fn spawn(self) -> CallHandle<I> {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, _) = broadcast::channel(self.config.event_capacity.max(1));
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        self.signaling.attach(SignalingSink::new(signaling_tx));

        let actor = Actor {
            config: self.config,
            media: self
                .media
                .unwrap_or_else(|| Arc::new(SimulatedDevices::new())),
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(LoopbackConnector::new())),
            signaling: self.signaling,
            notify: Notifier {
                tx: event_tx.clone(),
            },
            session: None,
            transport_tx,
            internal_tx,
        };

        tokio::spawn(actor.run(command_rx, transport_rx, signaling_rx, internal_rx));
        tracing::info!("Call session manager started");

        CallHandle {
            commands: command_tx,
            events: event_tx,
        }
    }
}

/// Command surface of a running call manager
///
/// Cheap to clone. Every command resolves once the manager has processed it;
/// `start`, `accept` and `toggle_screen_share` wait for the work they kick
/// off and resolve with `CallError::Cancelled` if the call ends first.
pub struct CallHandle<I: PeerIdentity> {
    commands: mpsc::Sender<Command<I>>,
    events: broadcast::Sender<CallEvent<I>>,
}

impl<I: PeerIdentity> Clone for CallHandle<I> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            events: self.events.clone(),
        }
    }
}

impl<I: PeerIdentity> CallHandle<I> {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command<I>,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CallError::ManagerClosed)?;
        rx.await.map_err(|_| CallError::ManagerClosed)
    }

    /// Subscribe to call events
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent<I>> {
        self.events.subscribe()
    }

    /// Place a call; resolves once the offer is out
    ///
    /// # Errors
    ///
    /// Returns `AlreadyActive` if a call exists, or the acquisition or
    /// negotiation error that aborted the attempt
    #[tracing::instrument(skip(self, peer), fields(peer = %peer))]
    pub async fn start(&self, peer: I) -> Result<CallId, CallError> {
        self.request(|reply| Command::Start { peer, reply }).await?
    }

    /// Deliver an incoming call notification
    ///
    /// # Errors
    ///
    /// Returns `AlreadyActive` if a call exists; the caller is told busy
    #[tracing::instrument(skip(self, call), fields(call_id = %call.call_id, peer = %call.peer))]
    pub async fn incoming_call(&self, call: IncomingCall<I>) -> Result<(), CallError> {
        self.request(|reply| Command::IncomingCall { call, reply })
            .await?
    }

    /// Accept the ringing call; resolves once the answer is out
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing or the answer could not be made
    #[tracing::instrument(skip(self))]
    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await?
    }

    /// Reject the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing
    #[tracing::instrument(skip(self))]
    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await?
    }

    /// Hang up. A no-op when idle.
    ///
    /// # Errors
    ///
    /// Returns error only if the manager is gone
    #[tracing::instrument(skip(self))]
    pub async fn end(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await?
    }

    /// Flip the microphone; returns whether it is now enabled
    ///
    /// # Errors
    ///
    /// Returns error if not connected
    pub async fn toggle_mic(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMic { reply }).await?
    }

    /// Flip the outgoing video; returns whether it is now enabled
    ///
    /// # Errors
    ///
    /// Returns error if not connected
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleCamera { reply }).await?
    }

    /// Flip remote playback mute; returns whether it is now muted
    ///
    /// # Errors
    ///
    /// Returns error if not connected
    pub async fn toggle_speaker_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleSpeakerMute { reply })
            .await?
    }

    /// Swap camera and screen; returns whether the screen is now shared
    ///
    /// # Errors
    ///
    /// Returns error if not connected, a swap is already running, or the
    /// new source could not be captured
    #[tracing::instrument(skip(self))]
    pub async fn toggle_screen_share(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleScreenShare { reply })
            .await?
    }

    /// Send bytes on the auxiliary channel
    ///
    /// # Errors
    ///
    /// Returns `AuxChannelClosed` if the channel is not open
    pub async fn send_message(&self, data: impl Into<Bytes>) -> Result<(), CallError> {
        let data = data.into();
        self.request(|reply| Command::SendMessage { data, reply })
            .await?
    }

    /// Have the signaling channel fabricate an incoming call
    ///
    /// # Errors
    ///
    /// Returns error if a call exists or signaling cannot simulate one
    #[tracing::instrument(skip(self))]
    pub async fn simulate_incoming_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::SimulateIncomingCall { reply })
            .await?
    }

    /// Current state
    ///
    /// # Errors
    ///
    /// Returns error if the manager is gone
    pub async fn state(&self) -> Result<CallState, CallError> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Read-only view of the active call
    ///
    /// # Errors
    ///
    /// Returns error if the manager is gone
    pub async fn snapshot(&self) -> Result<CallSnapshot<I>, CallError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// End any call and stop the manager
    ///
    /// # Errors
    ///
    /// Returns error if the manager is already gone
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct Actor<I: PeerIdentity> {
    config: CallManagerConfig,
    media: Arc<dyn MediaAcquirer>,
    connector: Arc<dyn PeerConnector>,
    signaling: Arc<dyn SignalingChannel<I>>,
    notify: Notifier<I>,
    session: Option<CallSession<I>>,
    transport_tx: mpsc::UnboundedSender<(CallId, TransportEvent)>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl<I: PeerIdentity> Actor<I> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command<I>>,
        mut transport_rx: mpsc::UnboundedReceiver<(CallId, TransportEvent)>,
        mut signaling_rx: mpsc::UnboundedReceiver<SignalingEvent<I>>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown(Outcome::Ended(EndReason::Local)).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown(Outcome::Ended(EndReason::Local)).await;
                        break;
                    }
                },
                Some((call_id, event)) = transport_rx.recv() => {
                    self.handle_transport_event(call_id, event).await;
                }
                Some(event) = signaling_rx.recv() => {
                    self.handle_signaling_event(event).await;
                }
                Some(message) = internal_rx.recv() => {
                    self.handle_internal(message).await;
                }
            }
        }
        tracing::info!("Call session manager stopped");
    }

    fn state(&self) -> CallState {
        self.session.as_ref().map_or(CallState::Idle, |s| s.state)
    }

    /// Active session if it is `call_id`
    fn session_for(&mut self, call_id: CallId) -> Option<&mut CallSession<I>> {
        self.session.as_mut().filter(|s| s.id == call_id)
    }

    fn reject_command<T>(&self, command: CommandKind, reply: Reply<T>) {
        let state = self.state();
        tracing::warn!(command = ?command, state = %state, "Command not valid in current state");
        self.notify
            .warn(format!("Cannot {command} while {state}"));
        let _ = reply.send(Err(CallError::InvalidTransition { command, state }));
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn handle_command(&mut self, command: Command<I>) {
        match command {
            Command::Start { peer, reply } => self.start(peer, reply),
            Command::IncomingCall { call, reply } => {
                let _ = reply.send(self.ring(call));
            }
            Command::Accept { reply } => self.accept(reply),
            Command::Reject { reply } => self.reject(reply).await,
            Command::End { reply } => {
                self.teardown(Outcome::Ended(EndReason::Local)).await;
                let _ = reply.send(Ok(()));
            }
            Command::ToggleMic { reply } => self.toggle_mic(reply),
            Command::ToggleCamera { reply } => self.toggle_camera(reply),
            Command::ToggleSpeakerMute { reply } => self.toggle_speaker(reply),
            Command::ToggleScreenShare { reply } => self.toggle_screen_share(reply),
            Command::SendMessage { data, reply } => self.send_message(data, reply).await,
            Command::SimulateIncomingCall { reply } => self.simulate_incoming_call(reply),
            Command::State { reply } => {
                let _ = reply.send(self.state());
            }
            Command::Snapshot { reply } => {
                let snapshot = self
                    .session
                    .as_ref()
                    .map_or_else(CallSnapshot::idle, CallSession::snapshot);
                let _ = reply.send(snapshot);
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self, peer: I, reply: Reply<CallId>) {
        if self.session.is_some() {
            tracing::warn!(peer = %peer, "Call already in progress");
            self.notify
                .warn("A call is already in progress".to_string());
            let _ = reply.send(Err(CallError::AlreadyActive));
            return;
        }

        let call_id = CallId::new();
        tracing::info!(call_id = %call_id, peer = %peer, "Starting call");
        let mut session = CallSession::new(call_id, Role::Caller, peer, CallState::Idle);
        session.start_reply = Some(reply);
        session.transition(CallState::Outgoing(OutgoingPhase::Acquiring), &self.notify);
        self.session = Some(session);

        self.spawn_acquisition(call_id);
    }

    fn ring(&mut self, call: IncomingCall<I>) -> Result<(), CallError> {
        if self.session.is_some() {
            tracing::info!(call_id = %call.call_id, peer = %call.peer, "Busy, declining incoming call");
            self.notify
                .warn(format!("Missed call from {} while busy", call.peer));
            self.send_decline(call.call_id, call.peer, DeclineReason::Busy);
            return Err(CallError::AlreadyActive);
        }

        tracing::info!(call_id = %call.call_id, peer = %call.peer, "Incoming call");
        let mut session = CallSession::new(call.call_id, Role::Callee, call.peer.clone(), CallState::Idle);
        session.remote_offer = Some(call.offer);
        session.transition(CallState::Ringing, &self.notify);
        self.session = Some(session);
        self.notify.emit(CallEvent::IncomingCall {
            call_id: call.call_id,
            peer: call.peer,
        });
        Ok(())
    }

    fn accept(&mut self, reply: Reply<()>) {
        let Some(session) = self.session.as_mut().filter(|s| s.state == CallState::Ringing) else {
            self.reject_command(CommandKind::Accept, reply);
            return;
        };

        session.accept_reply = Some(reply);
        session.transition(CallState::Accepting(AcceptPhase::Acquiring), &self.notify);
        let call_id = session.id;

        if session.local_stream.is_some() {
            session.transition(CallState::Accepting(AcceptPhase::Negotiating), &self.notify);
            self.spawn_negotiation();
        } else {
            self.spawn_acquisition(call_id);
        }
    }

    async fn reject(&mut self, reply: Reply<()>) {
        let rejectable = matches!(
            self.state(),
            CallState::Ringing | CallState::Accepting(AcceptPhase::Acquiring)
        );
        if !rejectable {
            self.reject_command(CommandKind::Reject, reply);
            return;
        }
        let Some(mut session) = self.session.take() else {
            return;
        };

        session.release().await;
        session.fail_pending(&CallError::Cancelled);
        tracing::info!(call_id = %session.id, "Incoming call rejected");
        self.send_decline(session.id, session.peer.clone(), DeclineReason::Declined);
        self.notify
            .emit(CallEvent::CallRejected { call_id: session.id });
        session.transition(CallState::Idle, &self.notify);
        let _ = reply.send(Ok(()));
    }

    fn toggle_mic(&mut self, reply: Reply<bool>) {
        let track = self.connected_track(LocalStream::audio_track);
        let Some(track) = track else {
            self.reject_command(CommandKind::ToggleMic, reply);
            return;
        };
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!(enabled, "Microphone toggled");
        self.notify.emit(CallEvent::MicrophoneToggled { enabled });
        let _ = reply.send(Ok(enabled));
    }

    fn toggle_camera(&mut self, reply: Reply<bool>) {
        let track = self.connected_track(LocalStream::video_track);
        let Some(track) = track else {
            self.reject_command(CommandKind::ToggleCamera, reply);
            return;
        };
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!(enabled, "Camera toggled");
        self.notify.emit(CallEvent::CameraToggled { enabled });
        let _ = reply.send(Ok(enabled));
    }

    fn connected_track(&self, pick: impl Fn(&LocalStream) -> Option<&LocalTrack>) -> Option<LocalTrack> {
        self.session
            .as_ref()
            .filter(|s| s.state == CallState::Connected)
            .and_then(|s| s.local_stream.as_ref())
            .and_then(pick)
            .cloned()
    }

    fn toggle_speaker(&mut self, reply: Reply<bool>) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.state == CallState::Connected)
        else {
            self.reject_command(CommandKind::ToggleSpeakerMute, reply);
            return;
        };
        session.speaker_muted = !session.speaker_muted;
        let muted = session.speaker_muted;
        tracing::debug!(muted, "Speaker toggled");
        self.notify.emit(CallEvent::SpeakerToggled { muted });
        let _ = reply.send(Ok(muted));
    }

    fn toggle_screen_share(&mut self, reply: Reply<bool>) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.state == CallState::Connected && !s.swap_in_flight)
        else {
            self.reject_command(CommandKind::ToggleScreenShare, reply);
            return;
        };
        session.swap_reply = Some(reply);
        self.begin_swap();
    }

    async fn send_message(&mut self, data: Bytes, reply: Reply<()>) {
        let Some(transport) = self
            .session
            .as_ref()
            .and_then(|s| s.transport.as_ref())
            .filter(|t| t.aux_open())
        else {
            let _ = reply.send(Err(CallError::AuxChannelClosed));
            return;
        };
        let result = transport.send_aux(data).await.map_err(|e| match e {
            NegotiationError::ChannelNotOpen => CallError::AuxChannelClosed,
            other => CallError::Negotiation(other),
        });
        let _ = reply.send(result);
    }

    fn simulate_incoming_call(&mut self, reply: Reply<()>) {
        if self.session.is_some() {
            self.reject_command(CommandKind::SimulateIncomingCall, reply);
            return;
        }
        let signaling = Arc::clone(&self.signaling);
        tokio::spawn(async move {
            let result = signaling
                .simulate_incoming_call()
                .await
                .map_err(CallError::Signaling);
            let _ = reply.send(result);
        });
    }

    // ========================================================================
    // Spawned work
    // ========================================================================

    fn spawn_acquisition(&self, call_id: CallId) {
        let media = Arc::clone(&self.media);
        let request = MediaRequest::call(self.config.audio_hints);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = media.acquire(&request).await;
            let _ = internal.send(Internal::MediaAcquired { call_id, result });
        });
    }

    fn spawn_negotiation(&self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let call_id = session.id;
        let role = session.role;
        let remote_offer = session.remote_offer.clone();
        let tracks: Vec<LocalTrack> = session
            .local_stream
            .as_ref()
            .map(|s| s.tracks().to_vec())
            .unwrap_or_default();
        let sink = TransportEventSink::new(call_id, self.transport_tx.clone());
        let connector = Arc::clone(&self.connector);
        let label = self.config.aux_channel_label.clone();
        let internal = self.internal_tx.clone();

        tokio::spawn(async move {
            let result = negotiate(connector.as_ref(), role, sink, &label, &tracks, remote_offer).await;
            let _ = internal.send(Internal::Negotiated { call_id, result });
        });
    }

    fn begin_swap(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.swap_in_flight = true;
        let call_id = session.id;
        let request = if session.sharing_screen {
            MediaRequest::camera()
        } else {
            MediaRequest::screen()
        };
        tracing::debug!(call_id = %call_id, video = ?request.video, "Switching outgoing video");

        let media = Arc::clone(&self.media);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = media.acquire(&request).await;
            let _ = internal.send(Internal::VideoCaptured { call_id, result });
        });
    }

    fn arm_deadline(&mut self) {
        let Some(timeout) = self.config.negotiation_timeout else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let call_id = session.id;
        let internal = self.internal_tx.clone();
        session.timers.push(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal.send(Internal::NegotiationDeadline { call_id });
        }));
    }

    fn watch_capture(&mut self, track: &LocalTrack) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let call_id = session.id;
        let track_id = track.id().to_string();
        let mut state = track.watch_state();
        let internal = self.internal_tx.clone();
        session.timers.push(tokio::spawn(async move {
            let ended = matches!(
                state.wait_for(|s| *s != TrackState::Live).await.map(|s| *s),
                Ok(TrackState::Ended)
            );
            if ended {
                let _ = internal.send(Internal::CaptureEnded { call_id, track_id });
            }
        }));
    }

    fn send_offer(&self, call_id: CallId, peer: I, offer: SessionDescription) {
        let signaling = Arc::clone(&self.signaling);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Err(error) = signaling.send_offer(call_id, &peer, offer).await {
                let _ = internal.send(Internal::SignalingFailed { call_id, error });
            }
        });
    }

    fn send_answer(&self, call_id: CallId, peer: I, answer: SessionDescription) {
        let signaling = Arc::clone(&self.signaling);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Err(error) = signaling.send_answer(call_id, &peer, answer).await {
                let _ = internal.send(Internal::SignalingFailed { call_id, error });
            }
        });
    }

    fn send_decline(&self, call_id: CallId, peer: I, reason: DeclineReason) {
        let signaling = Arc::clone(&self.signaling);
        tokio::spawn(async move {
            if let Err(e) = signaling.decline(call_id, &peer, reason).await {
                tracing::warn!(call_id = %call_id, "Failed to send decline: {}", e);
            }
        });
    }

    fn send_hang_up(&self, call_id: CallId, peer: I) {
        let signaling = Arc::clone(&self.signaling);
        tokio::spawn(async move {
            if let Err(e) = signaling.hang_up(call_id, &peer).await {
                tracing::warn!(call_id = %call_id, "Failed to send hang-up: {}", e);
            }
        });
    }

    // ========================================================================
    // Completions
    // ========================================================================

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::MediaAcquired { call_id, result } => self.on_media_acquired(call_id, result),
            Internal::Negotiated { call_id, result } => self.on_negotiated(call_id, result).await,
            Internal::VideoCaptured { call_id, result } => {
                self.on_video_captured(call_id, result).await;
            }
            Internal::CaptureEnded { call_id, track_id } => self.on_capture_ended(call_id, &track_id),
            Internal::NegotiationDeadline { call_id } => {
                let expired = self
                    .session_for(call_id)
                    .is_some_and(|s| s.state.is_connecting());
                if expired {
                    tracing::warn!(call_id = %call_id, "Negotiation timed out");
                    self.teardown(Outcome::TimedOut).await;
                }
            }
            Internal::SignalingFailed { call_id, error } => {
                if self.session_for(call_id).is_some() {
                    tracing::warn!(call_id = %call_id, "Signaling failed: {}", error);
                    self.teardown(Outcome::NegotiationFailed(error.to_string()))
                        .await;
                }
            }
        }
    }

    fn on_media_acquired(&mut self, call_id: CallId, result: Result<LocalStream, AcquisitionError>) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.id == call_id && s.state.is_acquiring())
        else {
            tracing::debug!(call_id = %call_id, "Discarding stale media acquisition");
            if let Ok(stream) = result {
                stream.stop_all();
            }
            return;
        };

        match (session.state, result) {
            (CallState::Outgoing(_), Err(error)) => {
                tracing::warn!(call_id = %call_id, "Media acquisition failed: {}", error);
                if let Some(reply) = session.start_reply.take() {
                    let _ = reply.send(Err(CallError::Acquisition(error.clone())));
                }
                self.notify.emit(CallEvent::AcquisitionFailed(error));
                if let Some(mut session) = self.session.take() {
                    session.transition(CallState::Idle, &self.notify);
                }
            }
            (_, Err(error)) => {
                tracing::warn!(call_id = %call_id, "Media acquisition failed: {}", error);
                if let Some(reply) = session.accept_reply.take() {
                    let _ = reply.send(Err(CallError::Acquisition(error.clone())));
                }
                session.transition(CallState::Ringing, &self.notify);
                self.notify.emit(CallEvent::AcquisitionFailed(error));
            }
            (state, Ok(stream)) => {
                self.notify.emit(CallEvent::LocalStreamReady(stream.info()));
                session.local_stream = Some(stream);
                let next = match state {
                    CallState::Outgoing(_) => CallState::Outgoing(OutgoingPhase::Negotiating),
                    _ => CallState::Accepting(AcceptPhase::Negotiating),
                };
                session.transition(next, &self.notify);
                self.spawn_negotiation();
            }
        }
    }

    async fn on_negotiated(
        &mut self,
        call_id: CallId,
        result: Result<TransportSession, NegotiationError>,
    ) {
        let Some(session) = self.session.as_mut().filter(|s| {
            s.id == call_id
                && matches!(
                    s.state,
                    CallState::Outgoing(OutgoingPhase::Negotiating)
                        | CallState::Accepting(AcceptPhase::Negotiating)
                )
        }) else {
            tracing::debug!(call_id = %call_id, "Discarding stale negotiation result");
            if let Ok(mut transport) = result {
                transport.close().await;
            }
            return;
        };

        let transport = match result {
            Ok(transport) => transport,
            Err(error) => {
                tracing::warn!(call_id = %call_id, "Negotiation failed: {}", error);
                let outcome = Outcome::NegotiationFailed(error.to_string());
                self.teardown_with(outcome, CallError::Negotiation(error))
                    .await;
                return;
            }
        };

        let Some(description) = transport.local_description().cloned() else {
            let mut transport = transport;
            transport.close().await;
            self.teardown_with(
                Outcome::NegotiationFailed("no local description".to_string()),
                CallError::Negotiation(NegotiationError::Closed),
            )
            .await;
            return;
        };

        session.transport = Some(transport);
        let peer = session.peer.clone();
        match session.role {
            Role::Caller => {
                session.transition(CallState::Outgoing(OutgoingPhase::AwaitingAnswer), &self.notify);
                if let Some(reply) = session.start_reply.take() {
                    let _ = reply.send(Ok(call_id));
                }
                self.send_offer(call_id, peer, description);
            }
            Role::Callee => {
                session.transition(CallState::Accepting(AcceptPhase::Connecting), &self.notify);
                if let Some(reply) = session.accept_reply.take() {
                    let _ = reply.send(Ok(()));
                }
                self.send_answer(call_id, peer, description);
            }
        }
        self.arm_deadline();

        let early = self
            .session
            .as_mut()
            .map(|s| std::mem::take(&mut s.early_events))
            .unwrap_or_default();
        for event in early {
            self.apply_transport_event(call_id, event).await;
        }
    }

    async fn on_video_captured(
        &mut self,
        call_id: CallId,
        result: Result<LocalStream, AcquisitionError>,
    ) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.id == call_id && s.state == CallState::Connected && s.swap_in_flight)
        else {
            tracing::debug!(call_id = %call_id, "Discarding stale video capture");
            if let Ok(stream) = result {
                stream.stop_all();
            }
            return;
        };
        session.swap_in_flight = false;

        let mut captured = match result {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(call_id = %call_id, "Video source switch failed: {}", error);
                if let Some(reply) = session.swap_reply.take() {
                    let _ = reply.send(Err(CallError::Acquisition(error.clone())));
                }
                let video_down = session
                    .local_stream
                    .as_ref()
                    .and_then(LocalStream::video_track)
                    .is_some_and(|t| !t.is_live());
                self.notify.emit(CallEvent::AcquisitionFailed(error));
                if video_down {
                    self.notify.warn(
                        "Outgoing video stopped. Toggle screen share to switch back to the camera"
                            .to_string(),
                    );
                }
                return;
            }
        };

        let mut tracks = captured.take_tracks();
        let Some(pos) = tracks.iter().position(|t| t.source() != TrackSource::Microphone) else {
            for track in &tracks {
                track.stop();
            }
            if let Some(reply) = session.swap_reply.take() {
                let _ = reply.send(Err(CallError::Acquisition(
                    AcquisitionError::DeviceUnavailable("no video track captured".to_string()),
                )));
            }
            return;
        };
        let new_track = tracks.swap_remove(pos);
        for extra in &tracks {
            extra.stop();
        }

        let was_enabled = session
            .local_stream
            .as_ref()
            .and_then(LocalStream::video_track)
            .map_or(true, LocalTrack::is_enabled);
        new_track.set_enabled(was_enabled);

        let replaced = match session.transport.as_mut() {
            Some(transport) => transport.replace_track(&new_track).await,
            None => Err(NegotiationError::Closed),
        };
        if let Err(error) = replaced {
            tracing::warn!(call_id = %call_id, "Failed to replace video track: {}", error);
            new_track.stop();
            if let Some(reply) = session.swap_reply.take() {
                let _ = reply.send(Err(CallError::Negotiation(error.clone())));
            }
            self.notify
                .warn(format!("Could not switch video source: {error}"));
            return;
        }

        let Some(local) = session.local_stream.as_mut() else {
            new_track.stop();
            return;
        };
        if let Some(old) = local.replace_video(new_track.clone()) {
            old.stop();
        }
        session.sharing_screen = new_track.source() == TrackSource::Screen;
        let sharing = session.sharing_screen;
        let info = local.info();
        if let Some(reply) = session.swap_reply.take() {
            let _ = reply.send(Ok(sharing));
        }

        tracing::info!(call_id = %call_id, sharing, "Outgoing video switched");
        self.notify.emit(CallEvent::LocalStreamReady(info));
        self.notify
            .emit(CallEvent::ScreenShareChanged { sharing });
        if sharing {
            self.watch_capture(&new_track);
        }
    }

    fn on_capture_ended(&mut self, call_id: CallId, track_id: &str) {
        let current = self.session_for(call_id).is_some_and(|s| {
            s.state == CallState::Connected
                && s.sharing_screen
                && !s.swap_in_flight
                && s
                    .local_stream
                    .as_ref()
                    .and_then(LocalStream::video_track)
                    .is_some_and(|t| t.id() == track_id)
        });
        if current {
            tracing::info!(call_id = %call_id, track_id, "Screen capture ended, returning to camera");
            self.begin_swap();
        }
    }

    // ========================================================================
    // Transport and signaling events
    // ========================================================================

    async fn handle_transport_event(&mut self, call_id: CallId, event: TransportEvent) {
        let Some(session) = self.session_for(call_id) else {
            tracing::trace!(call_id = %call_id, "Dropping transport event for inactive call");
            return;
        };
        if session.transport.is_none() {
            session.early_events.push(event);
            return;
        }
        self.apply_transport_event(call_id, event).await;
    }

    async fn apply_transport_event(&mut self, call_id: CallId, event: TransportEvent) {
        let Some(session) = self.session.as_mut().filter(|s| s.id == call_id) else {
            return;
        };
        let Some(transport) = session.transport.as_mut() else {
            return;
        };
        transport.apply_event(&event);

        match event {
            TransportEvent::ConnectionStateChanged(ConnectionState::Connected) => {
                if session.state.is_connecting() {
                    session.connected_at = Some(Utc::now());
                    tracing::info!(call_id = %call_id, "Call connected");
                    session.transition(CallState::Connected, &self.notify);
                }
            }
            TransportEvent::ConnectionStateChanged(
                state @ (ConnectionState::Disconnected | ConnectionState::Failed),
            ) => {
                if session.state.is_connecting() || session.state == CallState::Connected {
                    tracing::warn!(call_id = %call_id, state = ?state, "Connection lost");
                    self.teardown(Outcome::ConnectionLost).await;
                }
            }
            TransportEvent::ConnectionStateChanged(state) => {
                tracing::debug!(call_id = %call_id, state = ?state, "Connection state");
            }
            TransportEvent::RemoteTrackArrived(track) => {
                if session.remote_stream.add(track) {
                    self.notify
                        .emit(CallEvent::RemoteStreamReady(session.remote_stream.info()));
                }
            }
            TransportEvent::CandidateGathered(candidate) => {
                tracing::trace!(call_id = %call_id, candidate = %candidate, "Local candidate");
            }
            TransportEvent::AuxChannelOpened => {
                tracing::debug!(call_id = %call_id, "Auxiliary channel open");
                self.notify.emit(CallEvent::AuxChannelOpened { call_id });
            }
            TransportEvent::AuxMessageReceived(data) => {
                self.notify.emit(CallEvent::AuxMessage { call_id, data });
            }
        }
    }

    async fn handle_signaling_event(&mut self, event: SignalingEvent<I>) {
        match event {
            SignalingEvent::IncomingCall(call) => {
                let _ = self.ring(call);
            }
            SignalingEvent::RemoteDescription {
                call_id,
                description,
            } => self.on_remote_description(call_id, description).await,
            SignalingEvent::RemoteDeclined { call_id, reason } => {
                let outgoing = self
                    .session_for(call_id)
                    .is_some_and(|s| s.role == Role::Caller && !s.state.is_idle());
                if outgoing {
                    tracing::info!(call_id = %call_id, reason = ?reason, "Remote declined");
                    self.teardown(Outcome::RemoteDeclined(reason)).await;
                }
            }
            SignalingEvent::RemoteHangUp { call_id } => {
                if self.session_for(call_id).is_some() {
                    tracing::info!(call_id = %call_id, "Remote hung up");
                    self.teardown(Outcome::Ended(EndReason::Remote)).await;
                }
            }
        }
    }

    async fn on_remote_description(&mut self, call_id: CallId, description: SessionDescription) {
        let Some(session) = self.session.as_mut().filter(|s| s.id == call_id) else {
            tracing::debug!(call_id = %call_id, "Ignoring description for inactive call");
            return;
        };
        let awaiting = session.state == CallState::Outgoing(OutgoingPhase::AwaitingAnswer)
            && description.kind == SdpKind::Answer;
        let Some(transport) = session
            .transport
            .as_mut()
            .filter(|t| awaiting && t.signaling_state() == SignalingState::HaveLocalOffer)
        else {
            tracing::debug!(call_id = %call_id, state = %session.state, "Ignoring late remote description");
            return;
        };

        match transport.set_remote_description(description).await {
            Ok(()) => {
                session.transition(CallState::Outgoing(OutgoingPhase::Connecting), &self.notify);
            }
            Err(error) => {
                tracing::warn!(call_id = %call_id, "Failed to apply remote answer: {}", error);
                self.teardown(Outcome::NegotiationFailed(error.to_string()))
                    .await;
            }
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Release the active call and report how it ended
    ///
    /// Resources are released before any event goes out.
    async fn teardown(&mut self, outcome: Outcome) {
        self.teardown_with(outcome, CallError::Cancelled).await;
    }

    /// [`Actor::teardown`], failing pending replies with `pending`
    async fn teardown_with(&mut self, outcome: Outcome, pending: CallError) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let call_id = session.id;

        session.release().await;
        session.fail_pending(&pending);
        if outcome.notify_remote() {
            self.send_hang_up(call_id, session.peer.clone());
        }
        tracing::info!(call_id = %call_id, outcome = ?outcome, "Call ended");

        session.transition(CallState::Ended, &self.notify);
        self.notify.emit(match outcome {
            Outcome::Ended(reason) => CallEvent::CallEnded { call_id, reason },
            Outcome::ConnectionLost => CallEvent::ConnectionLost { call_id },
            Outcome::NegotiationFailed(error) => CallEvent::NegotiationFailed { call_id, error },
            Outcome::TimedOut => CallEvent::NegotiationTimedOut { call_id },
            Outcome::RemoteDeclined(reason) => CallEvent::RemoteDeclined { call_id, reason },
        });
        session.transition(CallState::Idle, &self.notify);
    }
}

/// Build a transport and run our half of the offer/answer exchange
async fn negotiate(
    connector: &dyn PeerConnector,
    role: Role,
    sink: TransportEventSink,
    aux_label: &str,
    tracks: &[LocalTrack],
    remote_offer: Option<SessionDescription>,
) -> Result<TransportSession, NegotiationError> {
    let mut transport = TransportSession::open(connector, role, sink, aux_label).await?;
    match exchange(&mut transport, role, tracks, remote_offer).await {
        Ok(()) => Ok(transport),
        Err(error) => {
            transport.close().await;
            Err(error)
        }
    }
}

async fn exchange(
    transport: &mut TransportSession,
    role: Role,
    tracks: &[LocalTrack],
    remote_offer: Option<SessionDescription>,
) -> Result<(), NegotiationError> {
    for track in tracks {
        transport.add_track(track).await?;
    }
    match role {
        Role::Caller => {
            let offer = transport.create_offer().await?;
            transport.set_local_description(offer).await
        }
        Role::Callee => {
            let offer = remote_offer
                .ok_or_else(|| NegotiationError::Backend("no remote offer to answer".to_string()))?;
            transport.set_remote_description(offer).await?;
            let answer = transport.create_answer().await?;
            transport.set_local_description(answer).await
        }
    }
}
