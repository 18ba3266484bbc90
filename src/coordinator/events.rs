use serde::{Deserialize, Serialize};

use crate::core::source::SharedSource;
use crate::core::state::ProcessState;

/// Raw happenings on one child process, forwarded by the I/O pump tasks.
#[derive(Debug)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    /// The in-flight command line was fully delivered to the child.
    WroteLine,
    Exited(Option<i32>),
}

/// Inbound method calls a callback-channel child makes into us,
/// line-delimited JSON on its side channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallbackEvent {
    /// First contact; carries the backend's config blob when it has one.
    Started { config: Option<String> },
    Playing,
    Finished,
    MoviePosition { position: u64 },
    MovieParams {
        length: u64,
        width: u32,
        height: u32,
        aspect: f32,
    },
    LoadingProgress { percent: u32 },
    ErrorMessage { code: i32, message: String },
}

/// Outbound method calls to a callback-channel child.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum BackendCall {
    SetUrl { url: String },
    SetSubtitleUrl { url: String },
    Frequency { khz: u32 },
    Play { repeat: u32 },
    Pause,
    Stop,
    Quit,
    Seek { position: u64, absolute: bool },
    Volume { value: i32, absolute: bool },
    Saturation { value: i32, absolute: bool },
    Hue { value: i32, absolute: bool },
    Contrast { value: i32, absolute: bool },
    Brightness { value: i32, absolute: bool },
    SetConfig { data: String },
}

impl BackendCall {
    /// Serialized wire form, newline terminated.
    pub fn to_line(&self) -> String {
        // The enums only contain plain fields; serialization cannot fail.
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }

    /// Wire prefix used to find queued calls of the same kind, e.g. for
    /// seek coalescing.
    pub fn wire_prefix(kind: &str) -> String {
        format!("{{\"call\":\"{}\"", kind)
    }
}

/// High-level playback intents issued by UI or automation collaborators.
#[derive(Debug)]
pub enum Intent {
    OpenSource(SharedSource),
    Play,
    Pause,
    Unpause,
    Stop,
    Seek { position: u64, absolute: bool },
    Volume { value: i32, absolute: bool },
    Saturation { value: i32, absolute: bool },
    Hue { value: i32, absolute: bool },
    Contrast { value: i32, absolute: bool },
    Brightness { value: i32, absolute: bool },
    /// Force a backend for a source kind for this session (and remember
    /// the choice).
    ForceBackend { kind: String, backend: String },
    /// Ask the callback backend for its config blob (probe spawn).
    ProbeConfig,
    /// Push a changed config blob to the callback backend.
    PushConfig { data: String },
    /// Leave the event loop.
    Shutdown,
}

/// Everything the coordinator's event loop reacts to. All state changes
/// travel through this queue, which is what makes transitions observable
/// strictly after the call that caused them returned.
#[derive(Debug)]
pub enum EngineEvent {
    Intent(Intent),
    StateChanged {
        backend: &'static str,
        old: ProcessState,
        new: ProcessState,
    },
    Process {
        backend: &'static str,
        event: ProcessEvent,
    },
    Callback {
        backend: &'static str,
        event: CallbackEvent,
    },
    /// The side-channel socket got its connection.
    CallbackConnected { backend: &'static str },
    /// No connection arrived within the configured expectation.
    CallbackConnectFailed { backend: &'static str },
    /// A call line was fully delivered on the side channel.
    CallbackSent { backend: &'static str },
    /// A command-queue watchdog fired.
    CommandTimeout { backend: &'static str },
    /// A recorded seek target is due to be written out. Posted once per
    /// burst so rapid requests melt into a single command.
    SeekFlush { backend: &'static str },
    /// Kill escalation ran out of stages with the process still alive.
    ShutdownGaveUp { backend: &'static str },
    /// Deferred source activation, posted by `set_source`.
    ActivateSource,
}

/// Notifications published back to UI/automation collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StateChanged {
        backend: &'static str,
        old: ProcessState,
        new: ProcessState,
    },
    PositionChanged(u64),
    LengthChanged(u64),
    LoadingChanged(u32),
    DimensionsChanged {
        width: u32,
        height: u32,
        aspect: f32,
    },
    StartedPlaying,
    StoppedPlaying,
    SourceChanged,
    /// A callback backend delivered its config blob.
    ConfigAvailable { backend: &'static str },
    /// Unrecognized backend output, forwarded verbatim.
    Console(String),
    Error { code: i32, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_call_wire_prefix_matches_serialization() {
        let call = BackendCall::Seek {
            position: 1200,
            absolute: true,
        };
        let line = call.to_line();
        assert!(line.starts_with(&BackendCall::wire_prefix("seek")));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_callback_event_roundtrip() {
        let line = r#"{"event":"movie_params","length":12345,"width":720,"height":480,"aspect":1.5}"#;
        let event: CallbackEvent = serde_json::from_str(line).expect("parse event");
        assert_eq!(
            event,
            CallbackEvent::MovieParams {
                length: 12345,
                width: 720,
                height: 480,
                aspect: 1.5
            }
        );
    }
}
