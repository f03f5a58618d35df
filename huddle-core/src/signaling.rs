//! Call signaling
//!
//! Offers, answers and call control travel over a `SignalingChannel`. A
//! networked chat client implements the trait over its own server; the
//! `SignalingSimulator` here fakes the remote side locally so a single
//! process can exercise every call path.
//!
//! Inbound traffic is delivered as `SignalingEvent`s through the
//! `SignalingSink` the call manager attaches.

use crate::directory::Directory;
use crate::identity::PeerIdentity;
use crate::transport::{NegotiationError, PeerConnector, TransportEventSink};
use crate::types::{CallId, DeclineReason, IncomingCall, Role, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// No call manager attached to receive events
    #[error("Signaling channel not attached")]
    NotAttached,

    /// Nobody to simulate a call from
    #[error("No friends to call from")]
    NoFriends,

    /// Operation not offered by this channel
    #[error("Operation not supported by this signaling channel")]
    Unsupported,

    /// A description could not be fabricated
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Inbound signaling traffic
#[derive(Debug, Clone)]
pub enum SignalingEvent<I: PeerIdentity> {
    /// Remote answer (or renegotiation offer) for a call
    RemoteDescription {
        /// Call identifier
        call_id: CallId,
        /// Remote description
        description: SessionDescription,
    },
    /// Somebody is calling
    IncomingCall(IncomingCall<I>),
    /// Remote did not take our call
    RemoteDeclined {
        /// Call identifier
        call_id: CallId,
        /// Why
        reason: DeclineReason,
    },
    /// Remote hung up
    RemoteHangUp {
        /// Call identifier
        call_id: CallId,
    },
}

/// Where a signaling channel delivers inbound traffic
#[derive(Debug, Clone)]
pub struct SignalingSink<I: PeerIdentity> {
    tx: mpsc::UnboundedSender<SignalingEvent<I>>,
}

impl<I: PeerIdentity> SignalingSink<I> {
    /// Wrap a channel sender
    pub fn new(tx: mpsc::UnboundedSender<SignalingEvent<I>>) -> Self {
        Self { tx }
    }

    /// Deliver an event. Returns false if nobody is listening any more.
    pub fn emit(&self, event: SignalingEvent<I>) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Outbound signaling seam
///
/// Implement this for your chat server. Methods must return promptly; any
/// remote reaction arrives later through the attached sink.
#[async_trait]
pub trait SignalingChannel<I: PeerIdentity>: Send + Sync {
    /// Register the sink for inbound events
    fn attach(&self, sink: SignalingSink<I>);

    /// Send our offer for a new call
    async fn send_offer(
        &self,
        call_id: CallId,
        peer: &I,
        offer: SessionDescription,
    ) -> Result<(), SignalingError>;

    /// Send our answer to an incoming call
    async fn send_answer(
        &self,
        call_id: CallId,
        peer: &I,
        answer: SessionDescription,
    ) -> Result<(), SignalingError>;

    /// Tell the caller we will not take the call
    async fn decline(
        &self,
        call_id: CallId,
        peer: &I,
        reason: DeclineReason,
    ) -> Result<(), SignalingError>;

    /// Tell the peer we hung up
    async fn hang_up(&self, call_id: CallId, peer: &I) -> Result<(), SignalingError>;

    /// Make a remote party call us (simulation only)
    async fn simulate_incoming_call(&self) -> Result<(), SignalingError> {
        Err(SignalingError::Unsupported)
    }
}

/// How the simulated remote reacts to our offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBehavior {
    /// Answer after the delay
    #[default]
    Answer,
    /// Decline after the delay
    Decline,
    /// Report busy after the delay
    Busy,
    /// Never react
    Silent,
}

/// Outbound message recorded by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentSignal {
    /// Offer sent
    Offer(CallId),
    /// Answer sent
    Answer(CallId),
    /// Decline sent
    Decline(CallId, DeclineReason),
    /// Hang-up sent
    HangUp(CallId),
}

/// Local stand-in for the remote party and the signaling server
pub struct SignalingSimulator<I: PeerIdentity> {
    connector: Arc<dyn PeerConnector>,
    directory: Arc<dyn Directory>,
    answer_delay: Duration,
    aux_label: String,
    behavior: Mutex<RemoteBehavior>,
    sink: Mutex<Option<SignalingSink<I>>>,
    sent: Mutex<Vec<SentSignal>>,
}

impl<I: PeerIdentity> SignalingSimulator<I> {
    /// Create a simulator that answers after two seconds
    pub fn new(connector: Arc<dyn PeerConnector>, directory: Arc<dyn Directory>) -> Self {
        Self {
            connector,
            directory,
            answer_delay: Duration::from_secs(2),
            aux_label: "chat".to_string(),
            behavior: Mutex::new(RemoteBehavior::Answer),
            sink: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Set the delay before the remote reacts
    #[must_use]
    pub fn with_answer_delay(mut self, delay: Duration) -> Self {
        self.answer_delay = delay;
        self
    }

    /// Set the auxiliary channel label used in fabricated offers
    #[must_use]
    pub fn with_aux_label(mut self, label: impl Into<String>) -> Self {
        self.aux_label = label.into();
        self
    }

    /// Set the initial remote behavior
    #[must_use]
    pub fn with_behavior(self, behavior: RemoteBehavior) -> Self {
        *self.behavior.lock() = behavior;
        self
    }

    /// Change how the remote reacts to future offers
    pub fn set_behavior(&self, behavior: RemoteBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<SentSignal> {
        self.sent.lock().clone()
    }

    /// Deliver a remote hang-up for `call_id` right away
    ///
    /// # Errors
    ///
    /// Returns error if no sink is attached
    pub fn remote_hang_up(&self, call_id: CallId) -> Result<(), SignalingError> {
        let sink = self.sink()?;
        sink.emit(SignalingEvent::RemoteHangUp { call_id });
        Ok(())
    }

    fn sink(&self) -> Result<SignalingSink<I>, SignalingError> {
        self.sink.lock().clone().ok_or(SignalingError::NotAttached)
    }

    fn record(&self, signal: SentSignal) {
        tracing::debug!(signal = ?signal, "Signaling message sent");
        self.sent.lock().push(signal);
    }
}

/// Answer `offer` with a throwaway callee connection
async fn fabricate_answer(
    connector: &dyn PeerConnector,
    offer: &SessionDescription,
) -> Result<SessionDescription, NegotiationError> {
    let backend = connector
        .connect(Role::Callee, TransportEventSink::detached())
        .await?;
    let result: Result<SessionDescription, NegotiationError> = async {
        backend.set_remote_description(offer).await?;
        let answer = backend.create_answer().await?;
        backend.set_local_description(&answer).await?;
        Ok(answer)
    }
    .await;
    if let Err(e) = backend.close().await {
        tracing::debug!("Failed to close throwaway connection: {}", e);
    }
    result
}

/// Produce an offer with a throwaway caller connection
async fn fabricate_offer(
    connector: &dyn PeerConnector,
    aux_label: &str,
) -> Result<SessionDescription, NegotiationError> {
    let backend = connector
        .connect(Role::Caller, TransportEventSink::detached())
        .await?;
    let result: Result<SessionDescription, NegotiationError> = async {
        backend.create_aux_channel(aux_label).await?;
        let offer = backend.create_offer().await?;
        backend.set_local_description(&offer).await?;
        Ok(offer)
    }
    .await;
    if let Err(e) = backend.close().await {
        tracing::debug!("Failed to close throwaway connection: {}", e);
    }
    result
}

#[async_trait]
impl<I: PeerIdentity> SignalingChannel<I> for SignalingSimulator<I> {
    fn attach(&self, sink: SignalingSink<I>) {
        *self.sink.lock() = Some(sink);
    }

    #[tracing::instrument(skip(self, offer), fields(call_id = %call_id, peer = %peer))]
    async fn send_offer(
        &self,
        call_id: CallId,
        peer: &I,
        offer: SessionDescription,
    ) -> Result<(), SignalingError> {
        let sink = self.sink()?;
        self.record(SentSignal::Offer(call_id));

        let behavior = *self.behavior.lock();
        let delay = self.answer_delay;
        let connector = Arc::clone(&self.connector);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let event = match behavior {
                RemoteBehavior::Silent => return,
                RemoteBehavior::Decline => SignalingEvent::RemoteDeclined {
                    call_id,
                    reason: DeclineReason::Declined,
                },
                RemoteBehavior::Busy => SignalingEvent::RemoteDeclined {
                    call_id,
                    reason: DeclineReason::Busy,
                },
                RemoteBehavior::Answer => match fabricate_answer(connector.as_ref(), &offer).await {
                    Ok(description) => SignalingEvent::RemoteDescription {
                        call_id,
                        description,
                    },
                    Err(e) => {
                        tracing::warn!(call_id = %call_id, "Simulated remote could not answer: {}", e);
                        return;
                    }
                },
            };
            tracing::debug!(call_id = %call_id, behavior = ?behavior, "Simulated remote reacted");
            sink.emit(event);
        });

        Ok(())
    }

    async fn send_answer(
        &self,
        call_id: CallId,
        _peer: &I,
        _answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.record(SentSignal::Answer(call_id));
        Ok(())
    }

    async fn decline(
        &self,
        call_id: CallId,
        _peer: &I,
        reason: DeclineReason,
    ) -> Result<(), SignalingError> {
        self.record(SentSignal::Decline(call_id, reason));
        Ok(())
    }

    async fn hang_up(&self, call_id: CallId, _peer: &I) -> Result<(), SignalingError> {
        self.record(SentSignal::HangUp(call_id));
        Ok(())
    }

    async fn simulate_incoming_call(&self) -> Result<(), SignalingError> {
        let sink = self.sink()?;
        let friend = self
            .directory
            .list_friends()
            .into_iter()
            .find(|f| !f.blocked)
            .ok_or(SignalingError::NoFriends)?;
        let peer = I::from_string_repr(&friend.username)
            .map_err(|e| SignalingError::TransportError(e.to_string()))?;

        let offer = fabricate_offer(self.connector.as_ref(), &self.aux_label).await?;
        let call = IncomingCall::new(peer, offer);
        tracing::info!(call_id = %call.call_id, peer = %call.peer, "Simulated incoming call");
        sink.emit(SignalingEvent::IncomingCall(call));
        Ok(())
    }
}
