//! Call state machine tests
//!
//! Drives the manager through the loopback transport, simulated devices and
//! the signaling simulator.

mod common;

use bytes::Bytes;
use common::{test_config, wait_until, Harness};
use huddle_core::{
    AcceptPhase, AcquisitionError, CallError, CallEvent, CallManagerConfig, CallState,
    CommandKind, DeclineReason, EndReason, IncomingCall, NegotiationError, OutgoingPhase,
    PeerIdentityString, Permission, RemoteBehavior, Role, SentSignal, SessionDescription,
    SignalingState, SimulatedDevices,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test]
async fn outgoing_call_walks_every_phase() {
    let mut h = Harness::new();
    let call_id = h.calls.start(PeerIdentityString::new("Alex")).await.unwrap();

    let states = h.states_until(CallState::Connected).await;
    assert_eq!(
        states,
        vec![
            CallState::Outgoing(OutgoingPhase::Acquiring),
            CallState::Outgoing(OutgoingPhase::Negotiating),
            CallState::Outgoing(OutgoingPhase::AwaitingAnswer),
            CallState::Outgoing(OutgoingPhase::Connecting),
            CallState::Connected,
        ]
    );
    h.wait_for(|e| matches!(e, CallEvent::AuxChannelOpened { .. }))
        .await;

    let snapshot = h.calls.snapshot().await.unwrap();
    assert_eq!(snapshot.call_id, Some(call_id));
    assert_eq!(snapshot.role, Some(Role::Caller));
    assert_eq!(snapshot.peer, Some(PeerIdentityString::new("Alex")));
    assert_eq!(snapshot.negotiation_count, 1);
    assert_eq!(snapshot.signaling_state, Some(SignalingState::Stable));
    assert!(snapshot.aux_open);
    assert!(snapshot.connected_at.is_some());
    assert_eq!(snapshot.local_stream.unwrap().tracks.len(), 2);
    assert_eq!(snapshot.remote_stream.unwrap().tracks.len(), 2);
    assert_eq!(h.signaling.sent(), vec![SentSignal::Offer(call_id)]);
}

#[tokio::test]
async fn audio_hints_reach_the_microphone_request() {
    let mut h = Harness::new();
    h.connected_call().await;
    let hints = h.devices.last_audio_hints().unwrap();
    assert!(hints.echo_cancellation);
    assert!(hints.noise_suppression);
    assert!(hints.auto_gain_control);
}

#[tokio::test]
async fn start_while_active_is_rejected_with_warning() {
    let mut h = Harness::new();
    h.connected_call().await;

    let err = h.calls.start(PeerIdentityString::new("Maria")).await;
    assert_eq!(err, Err(CallError::AlreadyActive));
    h.wait_for(|e| matches!(e, CallEvent::Warning(_))).await;
    assert_eq!(h.calls.state().await.unwrap(), CallState::Connected);
}

#[tokio::test]
async fn incoming_call_accept_flow() {
    let mut h = Harness::new();
    let call_id = h.ringing_call().await;
    assert_eq!(h.calls.state().await.unwrap(), CallState::Ringing);

    h.calls.accept().await.unwrap();
    let states = h.states_until(CallState::Connected).await;
    assert_eq!(
        states,
        vec![
            CallState::Accepting(AcceptPhase::Acquiring),
            CallState::Accepting(AcceptPhase::Negotiating),
            CallState::Accepting(AcceptPhase::Connecting),
            CallState::Connected,
        ]
    );

    let snapshot = h.calls.snapshot().await.unwrap();
    assert_eq!(snapshot.role, Some(Role::Callee));
    assert_eq!(snapshot.peer, Some(PeerIdentityString::new("Alex")));
    h.wait_for_signal(SentSignal::Answer(call_id)).await;
}

#[tokio::test]
async fn reject_returns_to_idle_and_declines() {
    let mut h = Harness::new();
    let call_id = h.ringing_call().await;

    let ringing = h.calls.snapshot().await.unwrap();
    assert_eq!(ringing.state, CallState::Ringing);
    assert_eq!(ringing.role, Some(Role::Callee));
    assert_eq!(
        ringing.peer.as_ref().map(PeerIdentityString::as_str),
        Some("Alex")
    );
    // Media is only requested on accept
    assert_eq!(h.devices.acquisition_count(), 0);

    h.calls.reject().await.unwrap();
    h.wait_for(|e| matches!(e, CallEvent::CallRejected { call_id: id } if *id == call_id))
        .await;
    h.wait_for_state(CallState::Idle).await;
    h.wait_for_signal(SentSignal::Decline(call_id, DeclineReason::Declined))
        .await;
    assert_eq!(h.devices.acquisition_count(), 0);
    assert_eq!(h.devices.live_track_count(), 0);
}

#[tokio::test]
async fn reject_outside_ringing_is_invalid() {
    let h = Harness::new();
    let err = h.calls.reject().await;
    assert_eq!(
        err,
        Err(CallError::InvalidTransition {
            command: CommandKind::Reject,
            state: CallState::Idle,
        })
    );
}

#[tokio::test]
async fn busy_incoming_call_leaves_active_call_alone() {
    let mut h = Harness::new();
    h.connected_call().await;

    let intruder = IncomingCall::new(
        PeerIdentityString::new("Maria"),
        SessionDescription::offer("v=0\r\n"),
    );
    let intruder_id = intruder.call_id;
    let err = h.calls.incoming_call(intruder).await;
    assert_eq!(err, Err(CallError::AlreadyActive));

    h.wait_for_signal(SentSignal::Decline(intruder_id, DeclineReason::Busy))
        .await;
    assert_eq!(h.calls.state().await.unwrap(), CallState::Connected);
}

#[tokio::test]
async fn end_is_idempotent_and_releases_everything() {
    let mut h = Harness::new();
    h.calls.end().await.unwrap();

    let call_id = h.connected_call().await;
    assert_eq!(h.devices.live_track_count(), 2);
    assert_eq!(h.control.open_count(), 1);

    h.calls.end().await.unwrap();
    h.wait_for_state(CallState::Ended).await;
    let ended = h
        .wait_for(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
    assert!(matches!(
        ended,
        CallEvent::CallEnded { call_id: id, reason: EndReason::Local } if id == call_id
    ));
    h.wait_for_state(CallState::Idle).await;

    assert_eq!(h.devices.live_track_count(), 0);
    assert_eq!(h.control.open_count(), 0);
    h.wait_for_signal(SentSignal::HangUp(call_id)).await;

    h.calls.end().await.unwrap();
    assert_eq!(h.calls.state().await.unwrap(), CallState::Idle);
}

#[tokio::test]
async fn remote_hang_up_ends_call() {
    let mut h = Harness::new();
    let call_id = h.connected_call().await;

    h.signaling.remote_hang_up(call_id).unwrap();
    let ended = h
        .wait_for(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
    assert!(matches!(
        ended,
        CallEvent::CallEnded { reason: EndReason::Remote, .. }
    ));
    h.wait_for_state(CallState::Idle).await;
    assert!(!h.signaling.sent().contains(&SentSignal::HangUp(call_id)));
}

#[tokio::test]
async fn remote_decline_and_busy() {
    for (behavior, expected) in [
        (RemoteBehavior::Decline, DeclineReason::Declined),
        (RemoteBehavior::Busy, DeclineReason::Busy),
    ] {
        let mut h = Harness::new();
        h.signaling.set_behavior(behavior);
        let call_id = h.calls.start(PeerIdentityString::new("Alex")).await.unwrap();

        let event = h
            .wait_for(|e| matches!(e, CallEvent::RemoteDeclined { .. }))
            .await;
        assert!(matches!(
            event,
            CallEvent::RemoteDeclined { call_id: id, reason } if id == call_id && reason == expected
        ));
        h.wait_for_state(CallState::Idle).await;
        assert_eq!(h.devices.live_track_count(), 0);
    }
}

#[tokio::test]
async fn silent_remote_times_out() {
    let mut h = Harness::with_config(CallManagerConfig {
        negotiation_timeout: Some(Duration::from_millis(100)),
        remote_behavior: RemoteBehavior::Silent,
        ..test_config()
    });
    let call_id = h.calls.start(PeerIdentityString::new("Alex")).await.unwrap();

    let event = h
        .wait_for(|e| matches!(e, CallEvent::NegotiationTimedOut { .. }))
        .await;
    assert!(matches!(event, CallEvent::NegotiationTimedOut { call_id: id } if id == call_id));
    h.wait_for_state(CallState::Idle).await;
    assert_eq!(h.devices.live_track_count(), 0);
    assert_eq!(h.control.open_count(), 0);
}

#[tokio::test]
async fn stalled_connectivity_times_out() {
    let mut h = Harness::with_config(CallManagerConfig {
        negotiation_timeout: Some(Duration::from_millis(150)),
        ..test_config()
    });
    h.control.set_stall(true);
    h.calls.start(PeerIdentityString::new("Alex")).await.unwrap();

    h.wait_for_state(CallState::Outgoing(OutgoingPhase::Connecting))
        .await;
    h.wait_for(|e| matches!(e, CallEvent::NegotiationTimedOut { .. }))
        .await;
    assert_eq!(h.calls.state().await.unwrap(), CallState::Idle);
}

#[tokio::test]
async fn connection_loss_tears_down() {
    let mut h = Harness::new();
    let call_id = h.connected_call().await;

    h.control.disconnect();
    let event = h
        .wait_for(|e| matches!(e, CallEvent::ConnectionLost { .. }))
        .await;
    assert!(matches!(event, CallEvent::ConnectionLost { call_id: id } if id == call_id));
    h.wait_for_state(CallState::Idle).await;
    assert_eq!(h.devices.live_track_count(), 0);
    assert_eq!(h.control.open_count(), 0);
}

#[tokio::test]
async fn transport_failure_tears_down() {
    let mut h = Harness::new();
    h.connected_call().await;

    h.control.fail();
    h.wait_for(|e| matches!(e, CallEvent::ConnectionLost { .. }))
        .await;
    assert_eq!(h.calls.state().await.unwrap(), CallState::Idle);
}

#[tokio::test]
async fn outgoing_acquisition_failure_returns_to_idle() {
    let mut h = Harness::new();
    h.devices.set_permission(Permission::Denied);

    let err = h.calls.start(PeerIdentityString::new("Alex")).await;
    assert_eq!(
        err,
        Err(CallError::Acquisition(AcquisitionError::PermissionDenied))
    );
    h.wait_for(|e| matches!(e, CallEvent::AcquisitionFailed(AcquisitionError::PermissionDenied)))
        .await;
    assert_eq!(h.calls.state().await.unwrap(), CallState::Idle);
    assert!(h.signaling.sent().is_empty());
}

#[tokio::test]
async fn accept_acquisition_failure_keeps_ringing() {
    let mut h = Harness::new();
    h.ringing_call().await;
    h.devices.set_camera_available(false);

    let err = h.calls.accept().await;
    assert!(matches!(
        err,
        Err(CallError::Acquisition(AcquisitionError::DeviceUnavailable(_)))
    ));
    assert_eq!(h.calls.state().await.unwrap(), CallState::Ringing);

    h.devices.set_camera_available(true);
    h.calls.accept().await.unwrap();
    h.wait_for_state(CallState::Connected).await;
}

#[tokio::test]
async fn negotiation_failure_reports_and_cleans_up() {
    let mut h = Harness::new();
    h.control.set_fail_negotiation(true);

    let err = h.calls.start(PeerIdentityString::new("Alex")).await;
    assert!(matches!(
        err,
        Err(CallError::Negotiation(NegotiationError::Backend(_)))
    ));
    // Released before the caller hears about the failure
    assert_eq!(h.devices.live_track_count(), 0);
    assert_eq!(h.control.open_count(), 0);

    h.wait_for(|e| matches!(e, CallEvent::NegotiationFailed { .. }))
        .await;
    h.wait_for_state(CallState::Idle).await;
}

#[tokio::test]
async fn accept_negotiation_failure_releases_before_reply() {
    let mut h = Harness::new();
    h.ringing_call().await;
    h.control.set_fail_negotiation(true);

    let err = h.calls.accept().await;
    assert!(matches!(
        err,
        Err(CallError::Negotiation(NegotiationError::Backend(_)))
    ));
    assert_eq!(h.devices.live_track_count(), 0);
    assert_eq!(h.control.open_count(), 0);
    assert_eq!(h.calls.state().await.unwrap(), CallState::Idle);
    h.wait_for(|e| matches!(e, CallEvent::NegotiationFailed { .. }))
        .await;
}

#[tokio::test]
async fn end_during_acquisition_cancels_start() {
    let mut h = Harness::with_devices(
        SimulatedDevices::new().with_prompt_delay(Duration::from_millis(100)),
    );
    let calls = h.calls.clone();
    let start = tokio::spawn(async move { calls.start(PeerIdentityString::new("Alex")).await });

    h.wait_for_state(CallState::Outgoing(OutgoingPhase::Acquiring))
        .await;
    h.calls.end().await.unwrap();

    assert_eq!(start.await.unwrap(), Err(CallError::Cancelled));
    h.wait_for_state(CallState::Idle).await;

    // The capture still completes, then gets released
    wait_until(|| h.devices.acquisition_count() == 1).await;
    wait_until(|| h.devices.live_track_count() == 0).await;
    assert_eq!(h.calls.state().await.unwrap(), CallState::Idle);
}

#[tokio::test]
async fn answer_for_ended_call_is_ignored() {
    let mut h = Harness::with_config(CallManagerConfig {
        answer_delay: Duration::from_millis(80),
        ..test_config()
    });
    h.calls.start(PeerIdentityString::new("Alex")).await.unwrap();
    h.calls.end().await.unwrap();
    h.wait_for_state(CallState::Idle).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let late = h.drain();
    assert!(!late
        .iter()
        .any(|e| matches!(e, CallEvent::StateChanged(CallState::Connected))));
    assert_eq!(h.calls.state().await.unwrap(), CallState::Idle);
    assert_eq!(h.control.open_count(), 0);
}

#[tokio::test]
async fn toggles_flip_and_report() {
    let mut h = Harness::new();
    h.connected_call().await;

    assert!(!h.calls.toggle_mic().await.unwrap());
    h.wait_for(|e| matches!(e, CallEvent::MicrophoneToggled { enabled: false }))
        .await;
    assert!(h.calls.toggle_mic().await.unwrap());

    assert!(!h.calls.toggle_camera().await.unwrap());
    h.wait_for(|e| matches!(e, CallEvent::CameraToggled { enabled: false }))
        .await;

    assert!(h.calls.toggle_speaker_mute().await.unwrap());
    h.wait_for(|e| matches!(e, CallEvent::SpeakerToggled { muted: true }))
        .await;
    assert!(h.calls.snapshot().await.unwrap().speaker_muted);

    let video = h
        .calls
        .snapshot()
        .await
        .unwrap()
        .local_stream
        .unwrap()
        .tracks
        .into_iter()
        .find(|t| t.kind == huddle_core::MediaKind::Video)
        .unwrap();
    assert!(!video.enabled);
    assert!(video.live);
}

#[tokio::test]
async fn toggles_require_connected_call() {
    let mut h = Harness::new();
    for (result, command) in [
        (h.calls.toggle_mic().await, CommandKind::ToggleMic),
        (h.calls.toggle_camera().await, CommandKind::ToggleCamera),
        (h.calls.toggle_speaker_mute().await, CommandKind::ToggleSpeakerMute),
        (h.calls.toggle_screen_share().await, CommandKind::ToggleScreenShare),
    ] {
        assert_eq!(
            result,
            Err(CallError::InvalidTransition {
                command,
                state: CallState::Idle,
            })
        );
    }
    let warnings = h
        .drain()
        .into_iter()
        .filter(|e| matches!(e, CallEvent::Warning(_)))
        .count();
    assert_eq!(warnings, 4);
}

#[tokio::test]
async fn aux_channel_round_trip() {
    let mut h = Harness::new();
    assert_eq!(
        h.calls.send_message("too early").await,
        Err(CallError::AuxChannelClosed)
    );

    h.connected_call().await;
    h.calls.send_message("hello").await.unwrap();
    let echoed = h
        .wait_for(|e| matches!(e, CallEvent::AuxMessage { .. }))
        .await;
    assert!(matches!(echoed, CallEvent::AuxMessage { data, .. } if data == Bytes::from("hello")));
    assert_eq!(h.control.sent_messages(), vec![Bytes::from("hello")]);

    h.control.inject_message(Bytes::from_static(b"from remote"));
    h.wait_for(|e| {
        matches!(e, CallEvent::AuxMessage { data, .. } if *data == Bytes::from_static(b"from remote"))
    })
    .await;
}

#[tokio::test]
async fn callee_receives_aux_channel() {
    let mut h = Harness::new();
    h.ringing_call().await;
    h.calls.accept().await.unwrap();
    h.wait_for(|e| matches!(e, CallEvent::AuxChannelOpened { .. }))
        .await;
    assert!(h.calls.snapshot().await.unwrap().aux_open);
    h.calls.send_message(Bytes::from_static(b"hi")).await.unwrap();
}

#[tokio::test]
async fn simulate_incoming_call_requires_idle() {
    let mut h = Harness::new();
    h.connected_call().await;
    let err = h.calls.simulate_incoming_call().await;
    assert!(matches!(
        err,
        Err(CallError::InvalidTransition {
            command: CommandKind::SimulateIncomingCall,
            ..
        })
    ));
}

#[tokio::test]
async fn shutdown_ends_call_and_closes_handle() {
    let mut h = Harness::new();
    h.connected_call().await;

    h.calls.shutdown().await.unwrap();
    assert_eq!(h.devices.live_track_count(), 0);
    assert_eq!(h.calls.state().await, Err(CallError::ManagerClosed));
    assert_eq!(
        h.calls.start(PeerIdentityString::new("Alex")).await,
        Err(CallError::ManagerClosed)
    );
}

#[tokio::test]
async fn second_call_after_first_ends() {
    let mut h = Harness::new();
    let first = h.connected_call().await;
    h.calls.end().await.unwrap();
    h.wait_for_state(CallState::Idle).await;

    let second = h.connected_call().await;
    assert_ne!(first, second);
    assert_eq!(h.devices.live_track_count(), 2);
}
