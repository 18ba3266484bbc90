use tokio::sync::mpsc;

use crate::backend::{Backend, BackendContext, BackendRegistry, BackendSelector};
use crate::coordinator::events::{EngineEvent, Intent, Notification};
use crate::core::error::PlayerError;
use crate::core::settings::SharedSettings;
use crate::core::source::{SharedSource, SourceItem};
use crate::core::state::ProcessState;

/// Owns the active backend and serializes everything that can touch it.
/// All control paths, child I/O and timers funnel into one event queue;
/// the loop below is the only place backend methods are called from.
pub struct PlaybackCoordinator {
    settings: SharedSettings,
    registry: BackendRegistry,
    selector: BackendSelector,
    backend: Option<Box<dyn Backend>>,
    source: Option<SharedSource>,
    /// Deferred play target, served when the backend reaches a state
    /// that can accept it.
    back_request: Option<SourceItem>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    notify: mpsc::UnboundedSender<Notification>,
    shutting_down: bool,
}

impl PlaybackCoordinator {
    pub fn new(
        settings: SharedSettings,
        registry: BackendRegistry,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
        notify: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        Self {
            settings,
            registry,
            selector: BackendSelector::new(),
            backend: None,
            source: None,
            back_request: None,
            events_tx,
            notify,
            shutting_down: false,
        }
    }

    pub async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = events_rx.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        log::info!("playback coordinator finished");
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notify.send(notification);
    }

    fn notify_error(&self, error: &PlayerError) {
        self.notify(Notification::Error {
            code: error.code(),
            message: error.to_string(),
        });
    }

    /// Processes one event; returns false when the loop should end.
    /// Public so tests can drive the coordinator synchronously.
    pub fn handle(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Intent(intent) => return self.handle_intent(intent),
            EngineEvent::StateChanged { backend, old, new } => {
                if self.backend_matches(backend) {
                    return self.handle_state_change(backend, old, new);
                }
                log::debug!("stale state change from {}", backend);
            }
            EngineEvent::Process { backend, event } => {
                if self.backend_matches(backend) {
                    if let Some(b) = &mut self.backend {
                        b.on_process_event(event);
                    }
                } else {
                    log::debug!("stale process event from {}: {:?}", backend, event);
                }
            }
            EngineEvent::Callback { backend, event } => {
                if self.backend_matches(backend) {
                    if let Some(b) = &mut self.backend {
                        b.on_callback_event(event);
                    }
                }
            }
            EngineEvent::CallbackConnected { backend } => {
                if self.backend_matches(backend) {
                    if let Some(b) = &mut self.backend {
                        b.on_callback_connected();
                    }
                }
            }
            EngineEvent::CallbackConnectFailed { backend } => {
                if self.backend_matches(backend) {
                    if let Some(b) = &mut self.backend {
                        b.on_callback_connect_failed();
                    }
                }
            }
            EngineEvent::CallbackSent { backend } => {
                if self.backend_matches(backend) {
                    if let Some(b) = &mut self.backend {
                        b.on_callback_sent();
                    }
                }
            }
            EngineEvent::CommandTimeout { backend } => {
                if self.backend_matches(backend) {
                    if let Some(b) = &mut self.backend {
                        b.on_command_timeout();
                    }
                }
            }
            EngineEvent::SeekFlush { backend } => {
                if self.backend_matches(backend) {
                    if let Some(b) = &mut self.backend {
                        b.on_seek_flush();
                    }
                }
            }
            EngineEvent::ShutdownGaveUp { backend } => {
                let err = PlayerError::Shutdown;
                log::error!("{}: {}", backend, err);
                self.notify_error(&err);
                if self.shutting_down {
                    return false;
                }
            }
            EngineEvent::ActivateSource => self.activate_source(),
        }
        true
    }

    fn backend_matches(&self, name: &str) -> bool {
        self.backend.as_ref().map(|b| b.name()) == Some(name)
    }

    fn handle_intent(&mut self, intent: Intent) -> bool {
        match intent {
            Intent::OpenSource(source) => self.set_source(source),
            Intent::Play => self.intent_play(),
            Intent::Pause => {
                if let Some(b) = &mut self.backend {
                    b.pause();
                }
            }
            Intent::Unpause => {
                if let Some(b) = &mut self.backend {
                    b.unpause();
                }
            }
            Intent::Stop => {
                self.back_request = None;
                if let Some(b) = &mut self.backend {
                    b.stop();
                }
            }
            Intent::Seek { position, absolute } => {
                if let Some(b) = &mut self.backend {
                    b.seek(position, absolute);
                }
            }
            Intent::Volume { value, absolute } => {
                if let Some(b) = &mut self.backend {
                    b.volume(value, absolute);
                }
            }
            Intent::Saturation { value, absolute } => {
                if let Some(b) = &mut self.backend {
                    b.saturation(value, absolute);
                }
            }
            Intent::Hue { value, absolute } => {
                if let Some(b) = &mut self.backend {
                    b.hue(value, absolute);
                }
            }
            Intent::Contrast { value, absolute } => {
                if let Some(b) = &mut self.backend {
                    b.contrast(value, absolute);
                }
            }
            Intent::Brightness { value, absolute } => {
                if let Some(b) = &mut self.backend {
                    b.brightness(value, absolute);
                }
            }
            Intent::ForceBackend { kind, backend } => {
                match self.settings.lock() {
                    Ok(mut settings) => {
                        self.selector.force(kind, backend, &mut settings);
                        if let Err(e) = settings.save() {
                            log::warn!("could not persist backend choice: {}", e);
                        }
                    }
                    Err(_) => log::warn!("settings unavailable, backend choice not saved"),
                }
            }
            Intent::ProbeConfig => {
                let probed = self
                    .backend
                    .as_mut()
                    .map(|b| b.probe_config())
                    .unwrap_or(false);
                if !probed {
                    self.notify(Notification::Console(
                        "backend has no configuration channel".to_string(),
                    ));
                }
            }
            Intent::PushConfig { data } => {
                if let Some(b) = &mut self.backend {
                    b.push_config(data);
                }
            }
            Intent::Shutdown => {
                self.shutting_down = true;
                match &mut self.backend {
                    Some(b) if b.is_running() => {
                        b.quit();
                    }
                    _ => return false,
                }
            }
        }
        true
    }

    /// Replaces the played source. The new source is activated through a
    /// posted event so its owner sees the swap before playback begins.
    fn set_source(&mut self, source: SharedSource) {
        if let Some(old) = &self.source {
            if let Ok(mut old) = old.lock() {
                old.deactivate();
            }
        }
        if let Some(b) = &mut self.backend {
            b.quit();
        }
        self.back_request = None;
        self.source = Some(source);
        self.rebind_backend();
        self.notify(Notification::SourceChanged);
        let _ = self.events_tx.send(EngineEvent::ActivateSource);
    }

    /// Ensures the bound backend is the one the selector picks for the
    /// current source; swaps it out when it is not.
    fn rebind_backend(&mut self) {
        let Some(source) = &self.source else {
            return;
        };
        let (kind, mime) = match source.lock() {
            Ok(s) => (s.kind.clone(), s.mime_type.clone()),
            Err(_) => return,
        };
        let current = self.backend.as_ref().map(|b| b.name());
        let descriptor = match self.settings.lock() {
            Ok(settings) => self
                .selector
                .resolve(&self.registry, &settings, &kind, mime.as_deref(), current)
                .map(|d| (d.name, d.create)),
            Err(_) => None,
        };
        let Some((name, create)) = descriptor else {
            log::error!("no backend supports source kind {}", kind);
            return;
        };
        if current != Some(name) {
            log::info!("switching backend to {}", name);
            let ctx = BackendContext {
                events: self.events_tx.clone(),
                notify: self.notify.clone(),
                settings: self.settings.clone(),
            };
            self.backend = Some(create(&ctx));
        }
        if let (Some(b), Some(source)) = (&mut self.backend, &self.source) {
            b.bind(source.clone());
        }
    }

    fn activate_source(&mut self) {
        let Some(source) = &self.source else {
            return;
        };
        if let Ok(mut s) = source.lock() {
            if s.is_active() {
                return;
            }
            s.activate();
        }
        let autoplay = self
            .settings
            .lock()
            .map(|s| s.autoplay)
            .unwrap_or(true);
        if autoplay {
            self.intent_play();
        } else if let Some(b) = &mut self.backend {
            if let Err(e) = b.ready() {
                self.notify_error(&e);
            }
        }
    }

    fn current_item(&self) -> Option<SourceItem> {
        self.source
            .as_ref()
            .and_then(|s| s.lock().ok())
            .and_then(|s| s.current_item().cloned())
    }

    /// A play request lands wherever the backend currently is: an idle
    /// backend plays right away, anything else records the target and
    /// walks the backend towards it.
    fn intent_play(&mut self) {
        let Some(item) = self.current_item() else {
            log::warn!("play requested without a playable item");
            return;
        };
        let Some(backend) = &mut self.backend else {
            log::warn!("play requested without a backend");
            return;
        };
        match backend.state() {
            ProcessState::NotRunning => {
                self.back_request = Some(item);
                if let Err(e) = backend.ready() {
                    self.back_request = None;
                    self.notify_error(&e);
                }
            }
            ProcessState::Ready => {
                if let Some(requested) = self.back_request.take() {
                    if let Some(source) = &self.source {
                        if let Ok(mut s) = source.lock() {
                            s.select_item(&requested);
                        }
                    }
                }
                if let Err(e) = backend.play() {
                    self.notify_error(&e);
                }
            }
            // Busy with an item: remember the newest target and wind the
            // current one down first.
            ProcessState::Buffering | ProcessState::Playing => {
                self.back_request = Some(item);
                backend.stop();
            }
        }
    }

    fn handle_state_change(
        &mut self,
        backend_name: &'static str,
        old: ProcessState,
        new: ProcessState,
    ) -> bool {
        log::info!("{}: {} -> {}", backend_name, old.label(), new.label());
        self.notify(Notification::StateChanged {
            backend: backend_name,
            old,
            new,
        });

        if old > ProcessState::Ready && new <= ProcessState::Ready {
            // The item ended. A stream without a known length gets one
            // now, from how far playback came.
            if let Some(source) = &self.source {
                let mut learned = None;
                if let Ok(mut s) = source.lock() {
                    let final_position = s.position();
                    if !s.has_length() && final_position > 0 {
                        s.set_length(final_position);
                        learned = Some(s.length());
                    }
                    s.set_position(0);
                }
                if let Some(length) = learned {
                    self.notify(Notification::LengthChanged(length));
                }
            }
            if self.back_request.is_none() && !self.shutting_down {
                // Streams can queue alternates behind the current item;
                // those play next before giving up.
                let advanced = self
                    .source
                    .as_ref()
                    .and_then(|s| s.lock().ok())
                    .map(|mut s| s.next_item())
                    .unwrap_or(false);
                if advanced {
                    self.back_request = self.current_item();
                } else {
                    self.notify(Notification::StoppedPlaying);
                }
            }
        }

        match new {
            ProcessState::NotRunning => {
                if self.shutting_down {
                    return false;
                }
                if self.back_request.is_some() {
                    if let Some(b) = &mut self.backend {
                        if let Err(e) = b.ready() {
                            self.back_request = None;
                            self.notify_error(&e);
                        }
                    }
                }
            }
            ProcessState::Ready => {
                if self.shutting_down {
                    if let Some(b) = &mut self.backend {
                        b.quit();
                    }
                } else if let Some(requested) = self.back_request.take() {
                    if let Some(source) = &self.source {
                        if let Ok(mut s) = source.lock() {
                            s.select_item(&requested);
                        }
                    }
                    if let Some(b) = &mut self.backend {
                        if let Err(e) = b.play() {
                            self.notify_error(&e);
                        }
                    }
                }
            }
            ProcessState::Buffering => {}
            ProcessState::Playing => {
                self.notify(Notification::StartedPlaying);
                self.notify(Notification::LoadingChanged(100));
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::backend::BackendRegistry;
    use crate::coordinator::events::ProcessEvent;
    use crate::core::settings::Settings;
    use crate::core::source::{Source, KIND_URL};

    const FAKE: &str = "fake";

    struct FakeBackend {
        state: Arc<Mutex<ProcessState>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeBackend {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    impl Backend for FakeBackend {
        fn name(&self) -> &'static str {
            FAKE
        }

        fn state(&self) -> ProcessState {
            *self.state.lock().unwrap()
        }

        fn bind(&mut self, _source: SharedSource) {}

        fn ready(&mut self) -> Result<(), PlayerError> {
            self.record("ready");
            Ok(())
        }

        fn play(&mut self) -> Result<(), PlayerError> {
            self.record("play");
            Ok(())
        }

        fn stop(&mut self) {
            self.record("stop");
        }

        fn quit(&mut self) {
            self.record("quit");
        }

        fn pause(&mut self) {
            self.record("pause");
        }

        fn unpause(&mut self) {
            self.record("unpause");
        }

        fn seek(&mut self, _position: u64, _absolute: bool) -> bool {
            self.record("seek");
            true
        }

        fn volume(&mut self, _value: i32, _absolute: bool) -> bool {
            true
        }

        fn saturation(&mut self, _value: i32, _absolute: bool) -> bool {
            true
        }

        fn hue(&mut self, _value: i32, _absolute: bool) -> bool {
            true
        }

        fn contrast(&mut self, _value: i32, _absolute: bool) -> bool {
            true
        }

        fn brightness(&mut self, _value: i32, _absolute: bool) -> bool {
            true
        }

        fn on_process_event(&mut self, _event: ProcessEvent) {
            self.record("process_event");
        }
    }

    struct Fixture {
        coordinator: PlaybackCoordinator,
        state: Arc<Mutex<ProcessState>>,
        calls: Arc<Mutex<Vec<String>>>,
        notify_rx: tokio::sync::mpsc::UnboundedReceiver<Notification>,
        source: SharedSource,
    }

    fn fixture() -> Fixture {
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = tokio::sync::mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ProcessState::NotRunning));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let source = Source::new(KIND_URL, "http://host/a.avi").shared();
        let mut coordinator = PlaybackCoordinator::new(
            Settings::default().shared(),
            BackendRegistry::new(),
            events_tx,
            notify_tx,
        );
        coordinator.backend = Some(Box::new(FakeBackend {
            state: state.clone(),
            calls: calls.clone(),
        }));
        coordinator.source = Some(source.clone());
        Fixture {
            coordinator,
            state,
            calls,
            notify_rx,
            source,
        }
    }

    fn calls(fx: &Fixture) -> Vec<String> {
        fx.calls.lock().unwrap().clone()
    }

    fn notifications(fx: &mut Fixture) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = fx.notify_rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[test]
    fn test_play_from_not_running_defers_and_readies() {
        let mut fx = fixture();
        fx.coordinator.handle(EngineEvent::Intent(Intent::Play));
        assert_eq!(calls(&fx), vec!["ready"]);
        assert!(fx.coordinator.back_request.is_some());

        // The backend reports Ready; the deferred item plays.
        *fx.state.lock().unwrap() = ProcessState::Ready;
        fx.coordinator.handle(EngineEvent::StateChanged {
            backend: FAKE,
            old: ProcessState::NotRunning,
            new: ProcessState::Ready,
        });
        assert_eq!(calls(&fx), vec!["ready", "play"]);
        assert!(fx.coordinator.back_request.is_none());
    }

    #[test]
    fn test_play_while_playing_stops_first_and_newest_target_wins() {
        let mut fx = fixture();
        *fx.state.lock().unwrap() = ProcessState::Playing;
        fx.coordinator.handle(EngineEvent::Intent(Intent::Play));
        assert_eq!(calls(&fx), vec!["stop"]);
        assert_eq!(
            fx.coordinator.back_request.as_ref().map(|i| i.url.as_str()),
            Some("http://host/a.avi")
        );

        // A second request for a different item overwrites the pending one.
        {
            let mut source = fx.source.lock().unwrap();
            source.insert_url("http://host/b.avi");
            let item = SourceItem::new("http://host/b.avi");
            source.select_item(&item);
        }
        fx.coordinator.handle(EngineEvent::Intent(Intent::Play));
        assert_eq!(
            fx.coordinator.back_request.as_ref().map(|i| i.url.as_str()),
            Some("http://host/b.avi")
        );
    }

    #[test]
    fn test_item_end_learns_length_and_reports_stopped() {
        let mut fx = fixture();
        {
            let mut source = fx.source.lock().unwrap();
            source.set_position(500);
        }
        *fx.state.lock().unwrap() = ProcessState::Ready;
        fx.coordinator.handle(EngineEvent::StateChanged {
            backend: FAKE,
            old: ProcessState::Playing,
            new: ProcessState::Ready,
        });
        let notes = notifications(&mut fx);
        assert!(notes.contains(&Notification::LengthChanged(500)));
        assert!(notes.contains(&Notification::StoppedPlaying));
        let source = fx.source.lock().unwrap();
        assert_eq!(source.length(), 500);
        assert_eq!(source.position(), 0);
    }

    #[test]
    fn test_playing_transition_reports_started_and_full_cache() {
        let mut fx = fixture();
        *fx.state.lock().unwrap() = ProcessState::Playing;
        fx.coordinator.handle(EngineEvent::StateChanged {
            backend: FAKE,
            old: ProcessState::Buffering,
            new: ProcessState::Playing,
        });
        let notes = notifications(&mut fx);
        assert!(notes.contains(&Notification::StartedPlaying));
        assert!(notes.contains(&Notification::LoadingChanged(100)));
    }

    #[test]
    fn test_stop_clears_pending_request_and_repeats_harmlessly() {
        let mut fx = fixture();
        *fx.state.lock().unwrap() = ProcessState::Playing;
        fx.coordinator.handle(EngineEvent::Intent(Intent::Play));
        assert!(fx.coordinator.back_request.is_some());
        fx.coordinator.handle(EngineEvent::Intent(Intent::Stop));
        assert!(fx.coordinator.back_request.is_none());
        assert!(fx.coordinator.handle(EngineEvent::Intent(Intent::Stop)));
        assert_eq!(calls(&fx), vec!["stop", "stop", "stop"]);
    }

    #[test]
    fn test_stale_events_from_replaced_backend_are_dropped() {
        let mut fx = fixture();
        fx.coordinator.handle(EngineEvent::Process {
            backend: "mplayer",
            event: ProcessEvent::Exited(Some(0)),
        });
        assert!(calls(&fx).is_empty());
        assert!(fx.coordinator.handle(EngineEvent::StateChanged {
            backend: "mplayer",
            old: ProcessState::Playing,
            new: ProcessState::NotRunning,
        }));
        assert!(notifications(&mut fx).is_empty());
    }

    #[test]
    fn test_shutdown_with_idle_backend_ends_the_loop() {
        let mut fx = fixture();
        assert!(!fx.coordinator.handle(EngineEvent::Intent(Intent::Shutdown)));
    }

    #[test]
    fn test_shutdown_while_running_quits_then_ends() {
        let mut fx = fixture();
        *fx.state.lock().unwrap() = ProcessState::Playing;
        assert!(fx.coordinator.handle(EngineEvent::Intent(Intent::Shutdown)));
        assert_eq!(calls(&fx), vec!["quit"]);
        *fx.state.lock().unwrap() = ProcessState::NotRunning;
        assert!(!fx.coordinator.handle(EngineEvent::StateChanged {
            backend: FAKE,
            old: ProcessState::Playing,
            new: ProcessState::NotRunning,
        }));
    }
}
