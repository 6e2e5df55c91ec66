use serde::{Deserialize, Serialize};

/// Reason why playback of the current item ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of stream/file.
    Eof,
    /// Demuxer or decoder error interrupted playback.
    Error,
    /// Playback was explicitly stopped by a command.
    Stopped,
}

/// Lifecycle state of a player item as driven by the sync controller.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    /// Nothing has been requested yet.
    #[default]
    Idle,
    /// Source is being opened and the first frames decoded.
    Preparing,
    /// Queues ran dry; waiting for more buffered media.
    Loading,
    /// Enough media is buffered to present.
    Playable,
    /// A seek is in flight.
    Seeking,
    /// End of media (or a fatal error) was reached.
    Finished,
    /// Playback was stopped and resources released.
    Stopped,
}

impl PlayerState {
    /// Whether the state is terminal for the current item.
    pub fn is_terminal(self) -> bool {
        matches!(self, PlayerState::Finished | PlayerState::Stopped)
    }

    /// Whether the item is still filling its buffers.
    pub fn is_buffering(self) -> bool {
        matches!(
            self,
            PlayerState::Preparing | PlayerState::Loading | PlayerState::Seeking
        )
    }
}

/// Buffering snapshot computed from queue occupancy.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadingState {
    /// No frame has been presented since the item was opened.
    pub is_first: bool,
    /// A seek completed and no post-seek frame has been reported playable yet.
    pub is_seek: bool,
    /// Buffered media satisfies the forward-buffer policy.
    pub is_playable: bool,
    /// The demuxer reported end of input.
    pub is_end_of_file: bool,
    /// Decoded frames waiting in the active audio/video queues.
    pub frame_count: usize,
    /// Coded packets waiting in the active audio/video queues.
    pub packet_count: usize,
    /// Seconds of media buffered ahead of the playhead.
    pub loaded_time: f64,
    /// Raw buffering progress in percent; may be NaN or infinite.
    pub progress: f64,
}

impl LoadingState {
    /// Progress in whole percent, safe to show to a user.
    pub fn buffering_percent(&self) -> u8 {
        buffering_percent(self.progress)
    }
}

/// Clamp a raw progress value to `0..=100`.
///
/// Positive infinity maps to 100 and NaN maps to 0.
pub fn buffering_percent(progress: f64) -> u8 {
    if progress.is_nan() {
        0
    } else if progress.is_infinite() {
        if progress > 0.0 { 100 } else { 0 }
    } else {
        progress.clamp(0.0, 100.0) as u8
    }
}

/// Published playback status of a sync controller.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerStatus {
    /// Current lifecycle state.
    pub state: PlayerState,
    /// Whether playback was requested (independent of buffering).
    pub playing: bool,
    /// Current playhead in seconds.
    pub current_time: f64,
    /// Furthest media time that can be presented without further loading.
    pub playable_time: f64,
    /// Total duration in seconds; `0.0` for live sources.
    pub duration: f64,
    /// Effective playback rate.
    pub rate: f64,
    /// Last published buffering progress in percent.
    pub buffering_progress: u8,
    /// Completed loop iterations when loop play is enabled.
    pub loop_count: u32,
    /// Video frames dropped because they were late at render time.
    pub dropped_video_frames: u64,
    /// Terminal reason for the current item.
    pub end_reason: Option<PlaybackEndReason>,
    /// Error message when the item finished with an error.
    pub error: Option<String>,
}

/// Outward notification emitted by the sync controller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// The item opened and its first frames are buffered.
    ReadyToPlay { duration: f64 },
    LoadingStateChanged { loading: LoadingState },
    StateChanged { from: PlayerState, to: PlayerState },
    /// Playback ended; `error` is set when it ended because of a failure.
    Finished { error: Option<String> },
    BufferingProgress { percent: u8 },
    BitrateChanged { old: u64, new: u64 },
    LoopCompleted { count: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffering_percent_clamps_non_finite_values() {
        assert_eq!(buffering_percent(f64::INFINITY), 100);
        assert_eq!(buffering_percent(f64::NAN), 0);
        assert_eq!(buffering_percent(f64::NEG_INFINITY), 0);
        assert_eq!(buffering_percent(-5.0), 0);
        assert_eq!(buffering_percent(42.9), 42);
        assert_eq!(buffering_percent(250.0), 100);
    }

    #[test]
    fn player_state_serializes_snake_case() {
        let json = serde_json::to_string(&PlayerState::Playable).unwrap();
        assert_eq!(json, "\"playable\"");
        let state: PlayerState = serde_json::from_str("\"seeking\"").unwrap();
        assert_eq!(state, PlayerState::Seeking);
    }

    #[test]
    fn player_event_is_tagged_by_kind() {
        let json = serde_json::to_value(&PlayerEvent::StateChanged {
            from: PlayerState::Loading,
            to: PlayerState::Playable,
        })
        .unwrap();
        assert_eq!(json["kind"], "state_changed");
        assert_eq!(json["to"], "playable");

        let event: PlayerEvent =
            serde_json::from_str(r#"{"kind":"finished","error":"decoder: corrupt"}"#).unwrap();
        assert_eq!(
            event,
            PlayerEvent::Finished {
                error: Some("decoder: corrupt".into())
            }
        );
    }

    #[test]
    fn terminal_and_buffering_states() {
        assert!(PlayerState::Finished.is_terminal());
        assert!(PlayerState::Stopped.is_terminal());
        assert!(!PlayerState::Playable.is_terminal());
        assert!(PlayerState::Seeking.is_buffering());
        assert!(!PlayerState::Idle.is_buffering());
    }
}
