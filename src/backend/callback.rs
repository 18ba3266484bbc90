use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;

use crate::backend::{Backend, BackendContext};
use crate::coordinator::events::{
    BackendCall, CallbackEvent, EngineEvent, Notification, ProcessEvent,
};
use crate::core::error::PlayerError;
use crate::core::source::SharedSource;
use crate::core::state::{ProcessState, StateMachine};
use crate::process::escalation::{escalate, EscalationOutcome};
use crate::process::handle::ChildProcessHandle;
use crate::process::queue::{CommandQueue, QueueAction};

pub const NAME: &str = "xine";

const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Where the probed configuration description stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigState {
    Unknown,
    /// A probe spawn is under way only to fetch the description.
    Probing,
    Received,
    Unavailable,
}

struct Session {
    handle: ChildProcessHandle,
    writer: mpsc::UnboundedSender<String>,
    socket_path: PathBuf,
}

/// Drives a player that dials back over a unix socket and exchanges
/// line-delimited JSON: our calls out, its events in. Unlike the text
/// backend, one process serves many items; it parks at Ready between
/// them and only leaves on quit or error.
pub struct CallbackBackend {
    ctx: BackendContext,
    source: Option<SharedSource>,
    machine: StateMachine,
    session: Option<Session>,
    queue: CommandQueue,
    config_state: ConfigState,
    config: Option<String>,
    /// Config blob to deliver on the next `started` handshake.
    pending_config: Option<String>,
    /// Respawn after the expected exit (config push, connect retry).
    respawn: bool,
    resume_play: bool,
    retry_done: bool,
    pending_seek: Option<u64>,
    /// Target waiting to be written out on the next loop turn.
    seek_request: Option<(u64, bool)>,
    /// A `setConfig` exchange is under way; the player acknowledges it
    /// with a code-0 error message.
    pushing_config: bool,
    quitting: bool,
}

impl CallbackBackend {
    pub fn create(ctx: &BackendContext) -> Box<dyn Backend> {
        Box::new(Self {
            ctx: ctx.clone(),
            source: None,
            machine: StateMachine::new(),
            session: None,
            queue: CommandQueue::new(),
            config_state: ConfigState::Unknown,
            config: None,
            pending_config: None,
            respawn: false,
            resume_play: false,
            retry_done: false,
            pending_seek: None,
            seek_request: None,
            pushing_config: false,
            quitting: false,
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

    fn spawn_session(&mut self) -> Result<(), PlayerError> {
        let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        let socket_path = std::env::temp_dir().join(format!(
            "procplay-{}-{}-{}.sock",
            NAME,
            std::process::id(),
            seq
        ));
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| PlayerError::Connection(format!("cannot bind callback socket: {}", e)))?;

        let (program, limit) = match self.ctx.settings.lock() {
            Ok(s) => (
                s.callback_player_program(),
                Duration::from_secs(s.callback_connect_timeout_secs),
            ),
            Err(_) => ("xineplayer".to_string(), Duration::from_secs(10)),
        };

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(channel_task(
            listener,
            writer_rx,
            self.ctx.events.clone(),
            limit,
        ));

        let args = vec!["-cb".to_string(), socket_path.display().to_string()];
        let handle = match ChildProcessHandle::spawn(NAME, &program, &args, self.ctx.events.clone())
        {
            Ok(handle) => handle,
            Err(e) => {
                let _ = std::fs::remove_file(&socket_path);
                return Err(e);
            }
        };
        self.session = Some(Session {
            handle,
            writer: writer_tx,
            socket_path,
        });
        Ok(())
    }

    fn apply(&mut self, action: QueueAction) -> Result<(), PlayerError> {
        match action {
            QueueAction::Connect => {
                if self.session.is_none() {
                    if let Err(e) = self.spawn_session() {
                        self.queue.on_connect_failed();
                        return Err(e);
                    }
                }
                Ok(())
            }
            QueueAction::Write(line) => {
                if let Some(session) = &self.session {
                    if session.writer.send(line).is_err() {
                        log::debug!("callback channel gone, dropping call");
                    }
                }
                Ok(())
            }
            QueueAction::None => Ok(()),
        }
    }

    fn call(&mut self, call: BackendCall) -> Result<(), PlayerError> {
        let action = self.queue.enqueue(call.to_line());
        self.apply(action)
    }

    fn call_logged(&mut self, call: BackendCall) {
        if let Err(e) = self.call(call) {
            log::warn!("callback call failed: {}", e);
            self.ctx.notify(Notification::Error {
                code: e.code(),
                message: e.to_string(),
            });
        }
    }

    fn call_with_watchdog(&mut self, call: BackendCall) {
        let action = self
            .queue
            .enqueue_with_timeout(call.to_line(), COMMAND_TIMEOUT);
        if let Err(e) = self.apply(action) {
            log::warn!("callback call failed: {}", e);
            return;
        }
        if let Some(timeout) = self.queue.watchdog() {
            let events = self.ctx.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events.send(EngineEvent::CommandTimeout { backend: NAME });
            });
        }
    }

    fn start_escalation(&self, polite_sent: bool) {
        let Some(session) = &self.session else {
            return;
        };
        let ctl = session.handle.control();
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

    fn apply_color_settings(&mut self) {
        let colors = self.ctx.settings.lock().ok().and_then(|s| {
            s.auto_adjust_colors
                .then(|| (s.saturation, s.hue, s.contrast, s.brightness))
        });
        if let Some((saturation, hue, contrast, brightness)) = colors {
            self.call_logged(BackendCall::Saturation {
                value: saturation,
                absolute: true,
            });
            self.call_logged(BackendCall::Hue {
                value: hue,
                absolute: true,
            });
            self.call_logged(BackendCall::Contrast {
                value: contrast,
                absolute: true,
            });
            self.call_logged(BackendCall::Brightness {
                value: brightness,
                absolute: true,
            });
        }
    }

    fn on_started(&mut self, config: Option<String>) {
        self.retry_done = false;
        if let Some(blob) = config {
            self.config = Some(blob);
            if self.config_state != ConfigState::Probing {
                self.config_state = ConfigState::Received;
            }
        }
        if self.config_state == ConfigState::Probing {
            // The probe spawn only exists to fetch the description.
            self.config_state = if self.config.is_some() {
                self.ctx.notify(Notification::ConfigAvailable { backend: NAME });
                ConfigState::Received
            } else {
                ConfigState::Unavailable
            };
            let drained = self.queue.on_connected();
            if self.apply(drained).is_err() {
                log::debug!("probe drain failed");
            }
            self.quit();
            return;
        }
        if let Some(data) = self.pending_config.take() {
            self.pushing_config = true;
            self.call_logged(BackendCall::SetConfig { data });
        }
        let drained = self.queue.on_connected();
        if self.apply(drained).is_err() {
            log::debug!("post-handshake drain failed");
        }
        self.apply_color_settings();
        if self.machine.state() < ProcessState::Ready {
            self.set_state(ProcessState::Ready);
        }
        if self.resume_play {
            self.resume_play = false;
            if let Err(e) = self.play() {
                self.ctx.notify(Notification::Error {
                    code: e.code(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn cleanup_session(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = std::fs::remove_file(&session.socket_path);
        }
        self.queue.on_process_exit();
        self.pending_seek = None;
        self.seek_request = None;
    }
}

impl Backend for CallbackBackend {
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
        if self.session.is_some() {
            if self.quitting {
                // The old process is on its way out; dial a fresh one
                // once it is gone.
                self.respawn = true;
            }
            return Ok(());
        }
        // Ready is only reached once the child dialed back and sent its
        // `started` handshake.
        self.spawn_session()
    }

    fn play(&mut self) -> Result<(), PlayerError> {
        let info = self.source.as_ref().and_then(|s| {
            s.lock()
                .ok()
                .map(|s| (s.url(), s.sub_url.clone(), s.frequency))
        });
        let Some((url, sub_url, frequency)) = info else {
            return Err(PlayerError::Protocol("no source bound".to_string()));
        };
        let repeat = self
            .ctx
            .settings
            .lock()
            .map(|s| if s.loop_playback { u32::MAX } else { 0 })
            .unwrap_or(0);
        self.call(BackendCall::SetUrl { url })?;
        if let Some(url) = sub_url {
            self.call(BackendCall::SetSubtitleUrl { url })?;
        }
        if frequency > 0 {
            self.call(BackendCall::Frequency { khz: frequency })?;
        }
        self.call(BackendCall::Play { repeat })?;
        self.set_state(ProcessState::Buffering);
        Ok(())
    }

    fn stop(&mut self) {
        if self.session.is_none() || self.quitting {
            return;
        }
        if self.machine.state() > ProcessState::Ready {
            // The player reports `finished` and exits on its own; the
            // ladder only acts if it does not.
            self.quitting = true;
            self.call_logged(BackendCall::Stop);
            self.start_escalation(true);
        } else {
            self.quit();
        }
    }

    fn quit(&mut self) {
        if self.session.is_none() || self.quitting {
            return;
        }
        self.quitting = true;
        self.call_logged(BackendCall::Quit);
        self.start_escalation(true);
    }

    fn pause(&mut self) {
        self.call_logged(BackendCall::Pause);
    }

    fn unpause(&mut self) {
        self.call_logged(BackendCall::Pause);
    }

    fn seek(&mut self, position: u64, absolute: bool) -> bool {
        let info = self.source.as_ref().and_then(|s| {
            s.lock()
                .ok()
                .map(|s| (s.is_seekable(), s.has_length(), s.position()))
        });
        let Some((seekable, has_length, current)) = info else {
            return false;
        };
        // Without a known length there is nothing to seek within.
        if !seekable || !has_length || self.session.is_none() {
            return false;
        }
        if absolute && position == current {
            return false;
        }
        // The call goes out on the next loop turn; a burst of requests
        // becomes one call carrying the newest target.
        let flush_posted = self.seek_request.is_some();
        self.seek_request = Some((position, absolute));
        if !flush_posted {
            self.ctx.post(EngineEvent::SeekFlush { backend: NAME });
        }
        true
    }

    fn volume(&mut self, value: i32, absolute: bool) -> bool {
        self.call_logged(BackendCall::Volume { value, absolute });
        true
    }

    fn saturation(&mut self, value: i32, absolute: bool) -> bool {
        self.call_with_watchdog(BackendCall::Saturation { value, absolute });
        true
    }

    fn hue(&mut self, value: i32, absolute: bool) -> bool {
        self.call_with_watchdog(BackendCall::Hue { value, absolute });
        true
    }

    fn contrast(&mut self, value: i32, absolute: bool) -> bool {
        self.call_with_watchdog(BackendCall::Contrast { value, absolute });
        true
    }

    fn brightness(&mut self, value: i32, absolute: bool) -> bool {
        self.call_with_watchdog(BackendCall::Brightness { value, absolute });
        true
    }

    fn on_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) => {
                self.ctx.notify(Notification::Console(line));
            }
            // Control travels over the socket, not stdin.
            ProcessEvent::WroteLine => {}
            ProcessEvent::Exited(code) => {
                let expected = self.quitting;
                self.cleanup_session();
                self.quitting = false;
                if !expected && self.machine.state() > ProcessState::Ready {
                    let err = PlayerError::Protocol(format!(
                        "player left unexpectedly (status {:?})",
                        code
                    ));
                    self.ctx.notify(Notification::Error {
                        code: err.code(),
                        message: err.to_string(),
                    });
                }
                self.set_state(ProcessState::NotRunning);
                if self.respawn {
                    self.respawn = false;
                    if let Err(e) = self.ready() {
                        self.resume_play = false;
                        self.ctx.notify(Notification::Error {
                            code: e.code(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    fn on_callback_event(&mut self, event: CallbackEvent) {
        match event {
            CallbackEvent::Started { config } => self.on_started(config),
            CallbackEvent::Playing => self.set_state(ProcessState::Playing),
            CallbackEvent::Finished => {
                // The player exits by itself after reporting this. Arm
                // the ladder unless a stop or quit already did.
                if !self.quitting {
                    self.quitting = true;
                    self.start_escalation(true);
                }
                self.set_state(ProcessState::NotRunning);
            }
            CallbackEvent::MoviePosition { position } => {
                if let Some(source) = &self.source {
                    if let Ok(mut s) = source.lock() {
                        s.set_position(position);
                    }
                }
                self.pending_seek = None;
                self.ctx.notify(Notification::PositionChanged(position));
            }
            CallbackEvent::MovieParams {
                length,
                width,
                height,
                aspect,
            } => {
                let keep_aspect = self
                    .ctx
                    .settings
                    .lock()
                    .map(|s| s.keep_aspect)
                    .unwrap_or(true);
                if let Some(source) = &self.source {
                    if let Ok(mut s) = source.lock() {
                        s.set_length(length);
                        s.set_dimensions(width, height);
                        if keep_aspect {
                            s.set_aspect(aspect);
                        }
                    }
                }
                self.ctx.notify(Notification::LengthChanged(length));
                self.ctx.notify(Notification::DimensionsChanged {
                    width,
                    height,
                    aspect,
                });
            }
            CallbackEvent::LoadingProgress { percent } => {
                self.ctx.notify(Notification::LoadingChanged(percent));
            }
            CallbackEvent::ErrorMessage { code, message } => {
                if code == 0 && self.pushing_config {
                    // The player acknowledges the config exchange with a
                    // code-0 message; that finalizes it.
                    self.pushing_config = false;
                    self.ctx.notify(Notification::Console(message));
                } else {
                    self.pushing_config = false;
                    self.ctx.notify(Notification::Error { code, message });
                }
            }
        }
    }

    fn on_callback_connected(&mut self) {
        // Transport is up; the queue drains on the `started` handshake.
        log::debug!("callback channel connected");
    }

    fn on_callback_connect_failed(&mut self) {
        if !self.retry_done && self.session.is_some() {
            self.retry_done = true;
            log::warn!("no callback connection from the player, restarting it once");
            self.respawn = true;
            self.start_escalation(false);
            return;
        }
        self.queue.on_connect_failed();
        let err = PlayerError::Connection("player never called back".to_string());
        self.ctx.notify(Notification::Error {
            code: err.code(),
            message: err.to_string(),
        });
        self.quitting = true;
        self.start_escalation(false);
    }

    fn on_callback_sent(&mut self) {
        let action = self.queue.on_write_complete();
        if self.apply(action).is_err() {
            log::debug!("write-complete drain failed");
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
            self.queue.remove_queued(&BackendCall::wire_prefix("seek"));
        }
        self.pending_seek = Some(position);
        self.call_with_watchdog(BackendCall::Seek { position, absolute });
    }

    fn probe_config(&mut self) -> bool {
        if self.config_state == ConfigState::Received {
            self.ctx.notify(Notification::ConfigAvailable { backend: NAME });
            return true;
        }
        if self.is_running() {
            // A live session will already have delivered the blob when
            // the player supports one.
            return self.config.is_some();
        }
        self.config_state = ConfigState::Probing;
        if let Err(e) = self.ready() {
            self.config_state = ConfigState::Unknown;
            let err = PlayerError::ConfigExchange(e.to_string());
            self.ctx.notify(Notification::Error {
                code: err.code(),
                message: err.to_string(),
            });
            return false;
        }
        true
    }

    fn push_config(&mut self, data: String) {
        if self.machine.state() > ProcessState::Ready {
            // Applying config mid-playback needs a fresh process; play
            // resumes once the new one has dialed back.
            self.pending_config = Some(data);
            self.respawn = true;
            self.resume_play = true;
            self.quit();
        } else if self.session.is_some() && self.queue.is_connected() {
            self.pushing_config = true;
            self.call_logged(BackendCall::SetConfig { data });
        } else {
            // No live channel yet; dial a session so the handshake
            // delivers the blob.
            self.pending_config = Some(data);
            if self.session.is_none() {
                if let Err(e) = self.ready() {
                    self.ctx.notify(Notification::Error {
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

async fn channel_task(
    listener: UnixListener,
    mut writer_rx: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<EngineEvent>,
    limit: Duration,
) {
    let stream = match tokio::time::timeout(limit, listener.accept()).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            log::warn!("callback accept failed: {}", e);
            let _ = events.send(EngineEvent::CallbackConnectFailed { backend: NAME });
            return;
        }
        Err(_) => {
            let _ = events.send(EngineEvent::CallbackConnectFailed { backend: NAME });
            return;
        }
    };
    let _ = events.send(EngineEvent::CallbackConnected { backend: NAME });

    let (read_half, mut write_half) = stream.into_split();
    let reader_events = events.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<CallbackEvent>(&line) {
                Ok(event) => {
                    if reader_events
                        .send(EngineEvent::Callback {
                            backend: NAME,
                            event,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => log::warn!("unparseable callback line {:?}: {}", line, e),
            }
        }
    });

    while let Some(line) = writer_rx.recv().await {
        if write_half.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
        if events.send(EngineEvent::CallbackSent { backend: NAME }).is_err() {
            break;
        }
    }
}
