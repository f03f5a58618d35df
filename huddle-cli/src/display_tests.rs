//! Tests for event rendering

#[cfg(test)]
mod tests {
    use super::super::display::*;
    use bytes::Bytes;
    use huddle_core::{
        CallEvent, CallId, CallSnapshot, CallState, DeclineReason, EndReason, MediaKind,
        PeerIdentityString, StreamInfo, TrackInfo, TrackSource,
    };

    type Event = CallEvent<PeerIdentityString>;

    fn track(kind: MediaKind, source: TrackSource) -> TrackInfo {
        TrackInfo {
            id: format!("{}-0", source.label()),
            kind,
            source: Some(source),
            enabled: true,
            live: true,
        }
    }

    #[test]
    fn test_idle_and_ended_states_are_quiet() {
        assert!(describe(&Event::StateChanged(CallState::Idle)).is_none());
        assert!(describe(&Event::StateChanged(CallState::Ended)).is_none());
        assert_eq!(
            describe(&Event::StateChanged(CallState::Connected)).as_deref(),
            Some("✅ Connected")
        );
    }

    #[test]
    fn test_incoming_call_shows_initial() {
        let line = describe(&Event::IncomingCall {
            call_id: CallId::new(),
            peer: PeerIdentityString::new("maria"),
        })
        .unwrap_or_default();
        assert!(line.contains("maria"));
        assert!(line.contains("[M]"));
    }

    #[test]
    fn test_end_reasons() {
        let call_id = CallId::new();
        let local = describe(&Event::CallEnded {
            call_id,
            reason: EndReason::Local,
        });
        let busy = describe(&Event::RemoteDeclined {
            call_id,
            reason: DeclineReason::Busy,
        });
        assert_eq!(local.as_deref(), Some("📴 Call ended"));
        assert_eq!(busy.as_deref(), Some("⛔ Remote is busy"));
    }

    #[test]
    fn test_stream_summary_names_video_source() {
        let stream = StreamInfo {
            id: "local-1".to_string(),
            tracks: vec![
                track(MediaKind::Audio, TrackSource::Microphone),
                track(MediaKind::Video, TrackSource::Screen),
            ],
        };
        let line = describe(&Event::LocalStreamReady(stream)).unwrap_or_default();
        assert!(line.contains("2 track(s)"));
        assert!(line.contains("screen"));
    }

    #[test]
    fn test_aux_message_is_lossy_utf8() {
        let line = describe(&Event::AuxMessage {
            call_id: CallId::new(),
            data: Bytes::from_static(b"hi \xff"),
        })
        .unwrap_or_default();
        assert!(line.starts_with("💬 hi "));
    }

    #[test]
    fn test_idle_summary() {
        let lines = summary(&CallSnapshot::<PeerIdentityString>::idle());
        assert_eq!(lines[0], "State: idle");
        assert!(lines[1].contains("Negotiations: 0"));
    }
}
