//! Shared harness for call manager integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use huddle_core::{
    CallEvent, CallHandle, CallId, CallManagerConfig, CallSessionManager, CallState,
    InMemoryDirectory, LoopbackConnector, LoopbackControl, PeerIdentityString, SentSignal,
    SignalingSimulator, SimulatedDevices,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

pub type Event = CallEvent<PeerIdentityString>;

const WAIT: Duration = Duration::from_secs(5);

/// Fast timings so tests don't sit around
pub fn test_config() -> CallManagerConfig {
    CallManagerConfig {
        answer_delay: Duration::from_millis(10),
        negotiation_timeout: Some(Duration::from_secs(3)),
        event_capacity: 4096,
        ..CallManagerConfig::default()
    }
}

pub struct Harness {
    pub calls: CallHandle<PeerIdentityString>,
    pub events: broadcast::Receiver<Event>,
    pub devices: Arc<SimulatedDevices>,
    pub control: Arc<LoopbackControl>,
    pub signaling: Arc<SignalingSimulator<PeerIdentityString>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(test_config(), SimulatedDevices::new())
    }

    pub fn with_config(config: CallManagerConfig) -> Self {
        Self::build(config, SimulatedDevices::new())
    }

    pub fn with_devices(devices: SimulatedDevices) -> Self {
        Self::build(test_config(), devices)
    }

    pub fn build(config: CallManagerConfig, devices: SimulatedDevices) -> Self {
        let connector = Arc::new(LoopbackConnector::new());
        let control = connector.control();
        let devices = Arc::new(devices);
        let signaling: Arc<SignalingSimulator<PeerIdentityString>> = Arc::new(
            config.simulator(connector.clone(), Arc::new(InMemoryDirectory::seeded())),
        );

        let calls = CallSessionManager::builder(signaling.clone())
            .with_config(config)
            .with_media(devices.clone())
            .with_connector(connector)
            .spawn();
        let events = calls.subscribe();

        Self {
            calls,
            events,
            devices,
            control,
            signaling,
        }
    }

    /// Next event matching `pred`, skipping the rest
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&Event) -> bool) -> Event {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    pub async fn wait_for_state(&mut self, state: CallState) {
        self.wait_for(|e| matches!(e, CallEvent::StateChanged(s) if *s == state))
            .await;
    }

    /// States visited until (and including) `last`
    pub async fn states_until(&mut self, last: CallState) -> Vec<CallState> {
        let mut seen = Vec::new();
        tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(CallEvent::StateChanged(state)) = self.events.recv().await {
                    seen.push(state);
                    if state == last {
                        return;
                    }
                }
            }
        })
        .await
        .expect("timed out collecting states");
        seen
    }

    /// Everything received so far without waiting
    pub fn drain(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Outgoing call that reached `Connected` with the aux channel open
    pub async fn connected_call(&mut self) -> CallId {
        let call_id = self
            .calls
            .start(PeerIdentityString::new("Alex"))
            .await
            .unwrap();
        self.wait_for_state(CallState::Connected).await;
        self.wait_for(|e| matches!(e, CallEvent::AuxChannelOpened { .. }))
            .await;
        call_id
    }

    /// Incoming call that is ringing
    pub async fn ringing_call(&mut self) -> CallId {
        self.calls.simulate_incoming_call().await.unwrap();
        match self
            .wait_for(|e| matches!(e, CallEvent::IncomingCall { .. }))
            .await
        {
            CallEvent::IncomingCall { call_id, .. } => call_id,
            _ => unreachable!(),
        }
    }

    /// Wait until the simulator recorded `signal`
    pub async fn wait_for_signal(&self, signal: SentSignal) {
        wait_until(|| self.signaling.sent().contains(&signal)).await;
    }
}

/// Poll `cond` until it holds
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
