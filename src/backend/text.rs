use std::time::Duration;

use regex::Regex;

use crate::backend::{Backend, BackendContext};
use crate::coordinator::events::{EngineEvent, Notification, ProcessEvent};
use crate::core::error::PlayerError;
use crate::core::settings::OutputPatterns;
use crate::core::source::{SharedSource, KIND_DVD, KIND_PIPE, KIND_TV, KIND_VCD};
use crate::core::state::{ProcessState, StateMachine};
use crate::process::escalation::{escalate, EscalationOutcome};
use crate::process::handle::ChildProcessHandle;
use crate::process::queue::{CommandQueue, QueueAction};

pub const NAME: &str = "mplayer";

/// Watchdog for rapid repeatable commands (seeks, color nudges). When it
/// fires, queued repeats that were never written are dropped.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Output scanners compiled from the user-adjustable pattern strings. A
/// broken pattern disables that one scanner instead of the backend.
struct CompiledPatterns {
    movie_size: Option<Regex>,
    cache_fill: Option<Regex>,
    movie_position: Option<Regex>,
    movie_length: Option<Regex>,
    reference_url: Option<Regex>,
    reference_file: Option<Regex>,
    start_playing: Option<Regex>,
}

impl CompiledPatterns {
    fn compile(patterns: &OutputPatterns) -> Self {
        fn one(name: &str, pattern: &str) -> Option<Regex> {
            match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    log::warn!("pattern {} ({}) does not compile: {}", name, pattern, e);
                    None
                }
            }
        }
        Self {
            movie_size: one("movie_size", &patterns.movie_size),
            cache_fill: one("cache_fill", &patterns.cache_fill),
            movie_position: one("movie_position", &patterns.movie_position),
            movie_length: one("movie_length", &patterns.movie_length),
            reference_url: one("reference_url", &patterns.reference_url),
            reference_file: one("reference_file", &patterns.reference_file),
            start_playing: one("start_playing", &patterns.start_playing),
        }
    }
}

/// Drives a slave-protocol player (mplayer) over stdin/stdout: commands
/// are plain text lines in, progress is scraped out of the console
/// output with the configured patterns.
pub struct TextBackend {
    ctx: BackendContext,
    source: Option<SharedSource>,
    machine: StateMachine,
    handle: Option<ChildProcessHandle>,
    queue: CommandQueue,
    patterns: CompiledPatterns,
    /// Last requested seek target, cleared by the next position report.
    pending_seek: Option<u64>,
    /// Target waiting to be written out on the next loop turn; a burst
    /// of requests collapses into whatever this holds at flush time.
    seek_request: Option<(u64, bool)>,
    /// Last alternate url scraped from the output.
    scraped_url: Option<String>,
    quitting: bool,
    /// Whether playback was ever confirmed this session.
    played: bool,
}

impl TextBackend {
    pub fn create(ctx: &BackendContext) -> Box<dyn Backend> {
        let patterns = ctx
            .settings
            .lock()
            .map(|s| CompiledPatterns::compile(&s.patterns))
            .unwrap_or_else(|_| CompiledPatterns::compile(&OutputPatterns::default()));
        Box::new(Self {
            ctx: ctx.clone(),
            source: None,
            machine: StateMachine::new(),
            handle: None,
            queue: CommandQueue::new(),
            patterns,
            pending_seek: None,
            seek_request: None,
            scraped_url: None,
            quitting: false,
            played: false,
        })
    }

    fn set_state(&mut self, new: ProcessState) {
        if let Some((old, new)) = self.machine.set_state(new) {
            self.ctx.post(EngineEvent::StateChanged {
                backend: NAME,
                old,
                new,
            });
        }
    }

    fn apply(&mut self, action: QueueAction) {
        match action {
            QueueAction::Write(line) => {
                if let Some(handle) = &self.handle {
                    if handle.write_line(line).is_err() {
                        log::debug!("player stdin gone, dropping command");
                        self.queue.on_process_exit();
                    }
                }
            }
            // The stdin pipe exists from spawn on, so the queue is
            // marked connected before anything is enqueued.
            QueueAction::Connect | QueueAction::None => {}
        }
    }

    fn send(&mut self, line: impl Into<String>) {
        if self.handle.is_none() {
            log::debug!("no player process, ignoring command");
            return;
        }
        let mut line = line.into();
        line.push('\n');
        let action = self.queue.enqueue(line);
        self.apply(action);
    }

    fn send_with_watchdog(&mut self, line: impl Into<String>) {
        if self.handle.is_none() {
            return;
        }
        let mut line = line.into();
        line.push('\n');
        let action = self.queue.enqueue_with_timeout(line, COMMAND_TIMEOUT);
        self.apply(action);
        if let Some(timeout) = self.queue.watchdog() {
            let events = self.ctx.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events.send(EngineEvent::CommandTimeout { backend: NAME });
            });
        }
    }

    fn start_escalation(&self, polite_sent: bool) {
        let Some(handle) = &self.handle else {
            return;
        };
        let ctl = handle.control();
        let policy = self
            .ctx
            .settings
            .lock()
            .map(|s| s.escalation.clone())
            .unwrap_or_default();
        let events = self.ctx.events.clone();
        tokio::spawn(async move {
            if escalate(&policy, &ctl, polite_sent).await == EscalationOutcome::GaveUp {
                let _ = events.send(EngineEvent::ShutdownGaveUp { backend: NAME });
            }
        });
    }

    fn build_args(&self) -> Vec<String> {
        let mut args = vec!["-slave".to_string(), "-identify".to_string()];
        let Some(source) = &self.source else {
            return args;
        };
        let Ok(source) = source.lock() else {
            return args;
        };
        let (cache_kb, extra) = match self.ctx.settings.lock() {
            Ok(s) => {
                if s.frame_drop {
                    args.push("-framedrop".to_string());
                }
                if s.auto_adjust_colors {
                    args.push("-contrast".to_string());
                    args.push(s.contrast.to_string());
                    args.push("-brightness".to_string());
                    args.push(s.brightness.to_string());
                    args.push("-hue".to_string());
                    args.push(s.hue.to_string());
                    args.push("-saturation".to_string());
                    args.push(s.saturation.to_string());
                }
                if s.loop_playback {
                    args.push("-loop".to_string());
                    args.push("0".to_string());
                }
                (s.cache_size_kb, s.additional_arguments.clone())
            }
            Err(_) => (0, String::new()),
        };
        // Caching makes no sense for devices the player reads directly.
        let device_kind =
            matches!(source.kind.as_str(), KIND_DVD | KIND_VCD | KIND_TV);
        if cache_kb > 3 && !device_kind {
            args.push("-cache".to_string());
            args.push(cache_kb.to_string());
        }
        if let Some(sub) = &source.sub_url {
            args.push("-sub".to_string());
            args.push(sub.clone());
        }
        if source.kind == KIND_TV {
            let mut tv = String::from("driver=v4l2");
            if let Some(device) = &source.video_device {
                tv.push_str(&format!(":device={}", device));
            }
            if let Some(device) = &source.audio_device {
                tv.push_str(&format!(":adevice={}", device));
            }
            if let Some(norm) = &source.norm {
                tv.push_str(&format!(":norm={}", norm));
            }
            if source.frequency > 0 {
                tv.push_str(&format!(":freq={}", source.frequency));
            }
            args.push("-tv".to_string());
            args.push(tv);
        }
        args.extend(source.options().split_whitespace().map(str::to_string));
        args.extend(extra.split_whitespace().map(str::to_string));
        if source.kind == KIND_PIPE {
            // A producer command feeds the player through stdin.
            args.push("-".to_string());
        } else {
            args.push(source.url());
        }
        args
    }

    fn scan_line(&mut self, line: &str) {
        if let Some(pos) = self
            .patterns
            .movie_position
            .as_ref()
            .and_then(|re| capture_f64(re, line))
        {
            let pos = (pos * 10.0) as u64;
            if let Some(source) = &self.source {
                if let Ok(mut s) = source.lock() {
                    s.set_position(pos);
                }
            }
            self.pending_seek = None;
            self.ctx.notify(Notification::PositionChanged(pos));
            return;
        }
        if let Some(percent) = self
            .patterns
            .cache_fill
            .as_ref()
            .and_then(|re| capture_f64(re, line))
        {
            self.ctx
                .notify(Notification::LoadingChanged(percent as u32));
            return;
        }
        if let Some(length) = self
            .patterns
            .movie_length
            .as_ref()
            .and_then(|re| capture_f64(re, line))
        {
            let length = (length * 10.0) as u64;
            if let Some(source) = &self.source {
                if let Ok(mut s) = source.lock() {
                    s.set_length(length);
                }
            }
            self.ctx.notify(Notification::LengthChanged(length));
            return;
        }
        if let Some((width, height)) = self
            .patterns
            .movie_size
            .as_ref()
            .and_then(|re| capture_size(re, line))
        {
            let aspect = if height > 0 {
                width as f32 / height as f32
            } else {
                0.0
            };
            let keep_aspect = self
                .ctx
                .settings
                .lock()
                .map(|s| s.keep_aspect)
                .unwrap_or(true);
            if let Some(source) = &self.source {
                if let Ok(mut s) = source.lock() {
                    s.set_dimensions(width, height);
                    if keep_aspect {
                        s.set_aspect(aspect);
                    }
                }
            }
            self.ctx.notify(Notification::DimensionsChanged {
                width,
                height,
                aspect,
            });
            return;
        }
        if self
            .patterns
            .start_playing
            .as_ref()
            .map(|re| re.is_match(line))
            .unwrap_or(false)
        {
            self.played = true;
            self.set_state(ProcessState::Playing);
            return;
        }
        if self
            .patterns
            .reference_file
            .as_ref()
            .map(|re| re.is_match(line))
            .unwrap_or(false)
        {
            log::debug!("player is reading a reference media file");
            return;
        }
        if let Some(url) = self
            .patterns
            .reference_url
            .as_ref()
            .and_then(|re| re.captures(line))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        {
            // Streams can redirect to the real media url; remember it as
            // an alternate right after the current item.
            let current = self
                .source
                .as_ref()
                .and_then(|s| s.lock().ok().map(|s| s.url()))
                .unwrap_or_default();
            if url != current && self.scraped_url.as_deref() != Some(url.as_str()) {
                if let Some(source) = &self.source {
                    if let Ok(mut s) = source.lock() {
                        s.insert_url(url.clone());
                    }
                }
                self.scraped_url = Some(url);
            }
            return;
        }
        self.ctx.notify(Notification::Console(line.to_string()));
    }
}

impl Backend for TextBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> ProcessState {
        self.machine.state()
    }

    fn bind(&mut self, source: SharedSource) {
        self.source = Some(source);
    }

    fn ready(&mut self) -> Result<(), PlayerError> {
        // The slave player is spawned per item; nothing to prepare.
        self.set_state(ProcessState::Ready);
        Ok(())
    }

    fn play(&mut self) -> Result<(), PlayerError> {
        if self.handle.is_some() {
            log::debug!("already playing, restart goes through stop first");
            return Ok(());
        }
        let args = self.build_args();
        let program = self
            .ctx
            .settings
            .lock()
            .map(|s| s.player_program())
            .unwrap_or_else(|_| "mplayer".to_string());
        let producer = self
            .source
            .as_ref()
            .and_then(|s| s.lock().ok().and_then(|s| s.pipe_cmd.clone()));
        let handle = match producer {
            // Pipe sources run through a shell so the producer's output
            // lands on the player's stdin. Slave input is lost then.
            Some(producer) => {
                let shell_line = format!("{} | {} {}", producer, program, args.join(" "));
                ChildProcessHandle::spawn(
                    NAME,
                    "sh",
                    &["-c".to_string(), shell_line],
                    self.ctx.events.clone(),
                )?
            }
            None => ChildProcessHandle::spawn(NAME, &program, &args, self.ctx.events.clone())?,
        };
        log::debug!("player running as pid {}", handle.pid());
        self.handle = Some(handle);
        let action = self.queue.on_connected();
        self.apply(action);
        self.pending_seek = None;
        self.scraped_url = None;
        self.quitting = false;
        self.played = false;
        self.set_state(ProcessState::Buffering);
        Ok(())
    }

    fn stop(&mut self) {
        if self.handle.is_none() || self.quitting {
            return;
        }
        self.quitting = true;
        self.send("quit");
        self.start_escalation(true);
    }

    fn quit(&mut self) {
        if self.handle.is_none() {
            // Parked without a process; quitting is just bookkeeping.
            self.set_state(ProcessState::NotRunning);
            return;
        }
        self.stop();
    }

    fn pause(&mut self) {
        // Slave-protocol pause is a toggle.
        self.send("pause");
    }

    fn unpause(&mut self) {
        self.send("pause");
    }

    fn seek(&mut self, position: u64, absolute: bool) -> bool {
        let seekable = self
            .source
            .as_ref()
            .and_then(|s| s.lock().ok().map(|s| (s.is_seekable(), s.has_length(), s.position())));
        let Some((seekable, has_length, current)) = seekable else {
            return false;
        };
        // Without a known length there is nothing to seek within.
        if !seekable || !has_length || self.handle.is_none() {
            return false;
        }
        if absolute && position == current {
            return false;
        }
        // Only the newest target matters. The command goes out on the
        // next loop turn, so a burst of requests becomes one line.
        let flush_posted = self.seek_request.is_some();
        self.seek_request = Some((position, absolute));
        if !flush_posted {
            self.ctx.post(EngineEvent::SeekFlush { backend: NAME });
        }
        true
    }

    fn volume(&mut self, value: i32, absolute: bool) -> bool {
        self.send(format!("volume {} {}", value, absolute as u8));
        true
    }

    fn saturation(&mut self, value: i32, absolute: bool) -> bool {
        self.send_with_watchdog(format!("saturation {} {}", value, absolute as u8));
        true
    }

    fn hue(&mut self, value: i32, absolute: bool) -> bool {
        self.send_with_watchdog(format!("hue {} {}", value, absolute as u8));
        true
    }

    fn contrast(&mut self, value: i32, absolute: bool) -> bool {
        self.send_with_watchdog(format!("contrast {} {}", value, absolute as u8));
        true
    }

    fn brightness(&mut self, value: i32, absolute: bool) -> bool {
        self.send_with_watchdog(format!("brightness {} {}", value, absolute as u8));
        true
    }

    fn on_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) => {
                self.scan_line(&line);
            }
            ProcessEvent::WroteLine => {
                let action = self.queue.on_write_complete();
                self.apply(action);
            }
            ProcessEvent::Exited(code) => {
                self.queue.on_process_exit();
                self.handle = None;
                self.pending_seek = None;
                self.seek_request = None;
                if self.quitting {
                    self.quitting = false;
                    self.set_state(ProcessState::NotRunning);
                } else if self.machine.state() == ProcessState::Buffering && !self.played {
                    let err = PlayerError::Protocol(format!(
                        "player exited before playback started (status {:?})",
                        code
                    ));
                    self.ctx.notify(Notification::Error {
                        code: err.code(),
                        message: err.to_string(),
                    });
                    self.set_state(ProcessState::NotRunning);
                } else {
                    // End of the item; the player stays available.
                    self.set_state(ProcessState::Ready);
                }
            }
        }
    }

    fn on_command_timeout(&mut self) {
        self.queue.on_watchdog_fired();
    }

    fn on_seek_flush(&mut self) {
        let Some((position, absolute)) = self.seek_request.take() else {
            return;
        };
        if self.pending_seek.is_some() {
            self.queue.remove_queued("seek ");
        }
        self.pending_seek = Some(position);
        let secs = position as f64 / 10.0;
        let mode = if absolute { 2 } else { 0 };
        self.send_with_watchdog(format!("seek {:.1} {}", secs, mode));
    }
}

fn capture_f64(re: &Regex, line: &str) -> Option<f64> {
    re.captures(line)?.get(1)?.as_str().parse().ok()
}

fn capture_size(re: &Regex, line: &str) -> Option<(u32, u32)> {
    let caps = re.captures(line)?;
    let width = caps.get(1)?.as_str().parse().ok()?;
    let height = caps.get(2)?.as_str().parse().ok()?;
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::core::settings::{EscalationPolicy, Settings};
    use crate::core::source::{Source, KIND_URL};

    fn backend() -> (
        Box<dyn Backend>,
        mpsc::UnboundedReceiver<EngineEvent>,
        mpsc::UnboundedReceiver<Notification>,
        SharedSource,
    ) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (notify, notify_rx) = mpsc::unbounded_channel();
        let ctx = BackendContext {
            events,
            notify,
            settings: Settings::default().shared(),
        };
        let mut backend = TextBackend::create(&ctx);
        let source = Source::new(KIND_URL, "http://host/movie.avi").shared();
        backend.bind(source.clone());
        (backend, events_rx, notify_rx, source)
    }

    fn notifications(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn test_position_report_updates_source_in_deciseconds() {
        let (mut backend, _events, mut notify, source) = backend();
        backend.on_process_event(ProcessEvent::Stdout("A:   3.2 V:  12.5 A-V: 0.0".into()));
        assert_eq!(source.lock().unwrap().position(), 125);
        assert!(notifications(&mut notify).contains(&Notification::PositionChanged(125)));
    }

    #[tokio::test]
    async fn test_length_cache_and_size_reports() {
        let (mut backend, _events, mut notify, source) = backend();
        backend.on_process_event(ProcessEvent::Stdout("ID_LENGTH=120.5".into()));
        backend.on_process_event(ProcessEvent::Stdout("Cache fill:  17.50% (123 bytes)".into()));
        backend.on_process_event(ProcessEvent::Stdout("VO: [xv] 640x480 => 640x480".into()));
        let notes = notifications(&mut notify);
        assert!(notes.contains(&Notification::LengthChanged(1205)));
        assert!(notes.contains(&Notification::LoadingChanged(17)));
        assert!(notes.iter().any(|n| matches!(
            n,
            Notification::DimensionsChanged { width: 640, height: 480, .. }
        )));
        assert_eq!(source.lock().unwrap().length(), 1205);
        assert_eq!(source.lock().unwrap().dimensions(), (640, 480));
    }

    #[tokio::test]
    async fn test_unrecognized_output_is_forwarded_to_console() {
        let (mut backend, _events, mut notify, _source) = backend();
        backend.on_process_event(ProcessEvent::Stdout("Opening audio decoder".into()));
        assert_eq!(
            notifications(&mut notify),
            vec![Notification::Console("Opening audio decoder".into())]
        );
    }

    #[tokio::test]
    async fn test_start_playing_posts_state_change() {
        let (mut backend, mut events, _notify, _source) = backend();
        backend.on_process_event(ProcessEvent::Stdout("Starting playback...".into()));
        assert_eq!(backend.state(), ProcessState::Playing);
        match events.try_recv() {
            Ok(EngineEvent::StateChanged { old, new, .. }) => {
                assert_eq!(old, ProcessState::NotRunning);
                assert_eq!(new, ProcessState::Playing);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_alternate_url_is_scraped_once() {
        let (mut backend, _events, _notify, source) = backend();
        backend.on_process_event(ProcessEvent::Stdout(
            "Playing http://host/real-stream.avi".into(),
        ));
        backend.on_process_event(ProcessEvent::Stdout(
            "Playing http://host/real-stream.avi".into(),
        ));
        let mut source = source.lock().unwrap();
        assert!(source.next_item());
        assert_eq!(source.url(), "http://host/real-stream.avi");
    }

    /// Backend with a live `cat` child standing in for the player, so
    /// written command lines come back as stdout events.
    #[cfg(unix)]
    fn running_backend() -> (
        TextBackend,
        mpsc::UnboundedReceiver<EngineEvent>,
        SharedSource,
    ) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (notify, _notify_rx) = mpsc::unbounded_channel();
        let mut settings = Settings::default();
        settings.escalation = EscalationPolicy {
            quit_grace_ms: 50,
            term_wait_ms: 20,
            kill_wait_ms: 20,
        };
        let ctx = BackendContext {
            events,
            notify,
            settings: settings.shared(),
        };
        let handle =
            ChildProcessHandle::spawn(NAME, "cat", &[], ctx.events.clone()).expect("spawn cat");
        let source = Source::new(KIND_URL, "http://host/movie.avi").shared();
        let mut backend = TextBackend {
            ctx,
            source: Some(source.clone()),
            machine: StateMachine::new(),
            handle: Some(handle),
            queue: CommandQueue::new(),
            patterns: CompiledPatterns::compile(&OutputPatterns::default()),
            pending_seek: None,
            seek_request: None,
            scraped_url: None,
            quitting: false,
            played: false,
        };
        let drained = backend.queue.on_connected();
        backend.apply(drained);
        (backend, events_rx, source)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_seek_rejected_without_length_or_at_same_position() {
        let (mut backend, _events, source) = running_backend();
        assert!(!backend.seek(100, true));
        assert!(!backend.seek(50, false));
        {
            let mut source = source.lock().unwrap();
            source.set_length(1000);
            source.set_position(100);
        }
        assert!(!backend.seek(100, true));
        assert!(backend.seek(50, false));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rapid_seeks_collapse_into_the_newest_target() {
        let (mut backend, mut events, source) = running_backend();
        {
            let mut source = source.lock().unwrap();
            source.set_length(1000);
            source.set_position(100);
        }
        assert!(backend.seek(150, true));
        assert!(backend.seek(200, true));
        assert_eq!(backend.seek_request, Some((200, true)));
        backend.on_seek_flush();
        assert_eq!(backend.pending_seek, Some(200));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut seeks = Vec::new();
        let mut flushes = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::Process {
                    event: ProcessEvent::Stdout(line),
                    ..
                } if line.starts_with("seek") => seeks.push(line),
                EngineEvent::SeekFlush { .. } => flushes += 1,
                _ => {}
            }
        }
        assert_eq!(seeks, vec!["seek 20.0 2"]);
        assert_eq!(flushes, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_repeated_stop_sends_one_quit_line() {
        let (mut backend, mut events, _source) = running_backend();
        backend.stop();
        backend.stop();
        assert!(backend.quitting);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut quits = 0;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Process {
                event: ProcessEvent::Stdout(line),
                ..
            } = event
            {
                if line == "quit" {
                    quits += 1;
                }
            }
        }
        assert_eq!(quits, 1);
    }

    #[tokio::test]
    async fn test_exit_after_playing_parks_at_ready() {
        let (mut backend, mut events, _notify, _source) = backend();
        backend.on_process_event(ProcessEvent::Stdout("Starting playback...".into()));
        while events.try_recv().is_ok() {}

        backend.on_process_event(ProcessEvent::Exited(Some(0)));
        assert_eq!(backend.state(), ProcessState::Ready);
        match events.try_recv() {
            Ok(EngineEvent::StateChanged { old, new, .. }) => {
                assert_eq!(old, ProcessState::Playing);
                assert_eq!(new, ProcessState::Ready);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
