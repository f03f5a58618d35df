//! Console rendering of call events

use huddle_core::{
    AcquisitionError, CallEvent, CallSnapshot, CallState, DeclineReason, EndReason, PeerIdentity,
    StreamInfo, TrackSource,
};

/// One line for an event, or `None` for events not worth showing
pub fn describe<I: PeerIdentity>(event: &CallEvent<I>) -> Option<String> {
    let line = match event {
        CallEvent::StateChanged(state) => match state {
            CallState::Connected => "✅ Connected".to_string(),
            CallState::Ringing => "🔔 Ringing".to_string(),
            CallState::Idle | CallState::Ended => return None,
            other => format!("⏳ {other}"),
        },
        CallEvent::IncomingCall { peer, .. } => {
            format!("📞 Incoming call from {} [{}]", peer, peer.initial())
        }
        CallEvent::LocalStreamReady(stream) => format!("🎥 Local: {}", stream_summary(stream)),
        CallEvent::RemoteStreamReady(stream) => format!("🖥️  Remote: {}", stream_summary(stream)),
        CallEvent::AcquisitionFailed(AcquisitionError::PermissionDenied) => {
            "🚫 Permission to use camera/microphone was denied".to_string()
        }
        CallEvent::AcquisitionFailed(AcquisitionError::DeviceUnavailable(device)) => {
            format!("🚫 Device unavailable: {device}")
        }
        CallEvent::NegotiationFailed { error, .. } => format!("❌ Negotiation failed: {error}"),
        CallEvent::NegotiationTimedOut { .. } => "⌛ No answer, giving up".to_string(),
        CallEvent::ConnectionLost { .. } => "📡 Connection lost".to_string(),
        CallEvent::CallEnded { reason, .. } => match reason {
            EndReason::Local => "📴 Call ended".to_string(),
            EndReason::Remote => "📴 Remote hung up".to_string(),
        },
        CallEvent::CallRejected { .. } => "❌ Call rejected".to_string(),
        CallEvent::RemoteDeclined { reason, .. } => match reason {
            DeclineReason::Declined => "❌ Call declined".to_string(),
            DeclineReason::Busy => "⛔ Remote is busy".to_string(),
        },
        CallEvent::MicrophoneToggled { enabled } => {
            format!("🎙️  Microphone {}", if *enabled { "on" } else { "muted" })
        }
        CallEvent::CameraToggled { enabled } => {
            format!("📷 Camera {}", if *enabled { "on" } else { "off" })
        }
        CallEvent::SpeakerToggled { muted } => {
            format!("🔈 Speaker {}", if *muted { "muted" } else { "on" })
        }
        CallEvent::ScreenShareChanged { sharing } => {
            if *sharing {
                "🖥️  Sharing screen".to_string()
            } else {
                "📷 Back to camera".to_string()
            }
        }
        CallEvent::AuxChannelOpened { .. } => "💬 Chat channel open".to_string(),
        CallEvent::AuxMessage { data, .. } => {
            format!("💬 {}", String::from_utf8_lossy(data))
        }
        CallEvent::Warning(message) => format!("⚠️  {message}"),
    };
    Some(line)
}

fn stream_summary(stream: &StreamInfo) -> String {
    let video = match stream.video_source() {
        Some(TrackSource::Screen) => "screen",
        Some(_) => "camera",
        None if stream.tracks.iter().any(|t| t.source.is_none()) => "remote",
        None => "none",
    };
    format!("{} track(s), video: {}", stream.tracks.len(), video)
}

/// Multi-line status block for a snapshot
pub fn summary<I: PeerIdentity>(snapshot: &CallSnapshot<I>) -> Vec<String> {
    let mut lines = vec![format!("State: {}", snapshot.state)];
    if let Some(peer) = &snapshot.peer {
        lines.push(format!("Peer: {peer}"));
    }
    if let Some(duration) = snapshot.duration() {
        let secs = duration.num_seconds().max(0);
        lines.push(format!("Duration: {:02}:{:02}", secs / 60, secs % 60));
    }
    if let Some(local) = &snapshot.local_stream {
        lines.push(format!("Local: {}", stream_summary(local)));
    }
    lines.push(format!(
        "Negotiations: {} | Chat: {} | Speaker: {}",
        snapshot.negotiation_count,
        if snapshot.aux_open { "open" } else { "closed" },
        if snapshot.speaker_muted { "muted" } else { "on" }
    ));
    lines
}
