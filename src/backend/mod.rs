#[cfg(unix)]
pub mod callback;
pub mod dump;
pub mod selector;
pub mod text;


pub use selector::*;

use tokio::sync::mpsc;

use crate::coordinator::events::{CallbackEvent, EngineEvent, Notification, ProcessEvent};
use crate::core::error::PlayerError;
use crate::core::settings::SharedSettings;
use crate::core::source::SharedSource;
use crate::core::state::ProcessState;

/// Everything a backend needs from its host: the event queue it posts
/// to, the notification fan-out, and the shared settings.
#[derive(Clone)]
pub struct BackendContext {
    pub events: mpsc::UnboundedSender<EngineEvent>,
    pub notify: mpsc::UnboundedSender<Notification>,
    pub settings: SharedSettings,
}

impl BackendContext {
    pub fn post(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub fn notify(&self, notification: Notification) {
        let _ = self.notify.send(notification);
    }
}

/// One player integration. Implementations are owned by the coordinator
/// and only ever called from its event loop; the async work they start
/// (spawns, pumps, timers) reports back through the event queue.
pub trait Backend: Send {
    fn name(&self) -> &'static str;
    fn state(&self) -> ProcessState;

    /// Binds the backend to the source it will play. Replaces any
    /// previous binding.
    fn bind(&mut self, source: SharedSource);

    /// Brings the backend to the point where `play` can be issued.
    fn ready(&mut self) -> Result<(), PlayerError>;

    /// Starts playback of the bound source's current item.
    fn play(&mut self) -> Result<(), PlayerError>;

    /// Stops playback, escalating if the player will not leave.
    fn stop(&mut self);

    /// Ends the player entirely, escalating if needed.
    fn quit(&mut self);

    fn pause(&mut self);
    fn unpause(&mut self);

    /// Requests a seek; returns whether one was issued or updated.
    fn seek(&mut self, position: u64, absolute: bool) -> bool;

    fn volume(&mut self, value: i32, absolute: bool) -> bool;
    fn saturation(&mut self, value: i32, absolute: bool) -> bool;
    fn hue(&mut self, value: i32, absolute: bool) -> bool;
    fn contrast(&mut self, value: i32, absolute: bool) -> bool;
    fn brightness(&mut self, value: i32, absolute: bool) -> bool;

    fn on_process_event(&mut self, event: ProcessEvent);

    fn on_callback_event(&mut self, _event: CallbackEvent) {}
    fn on_callback_connected(&mut self) {}
    fn on_callback_connect_failed(&mut self) {}
    fn on_callback_sent(&mut self) {}
    fn on_command_timeout(&mut self) {}

    /// Writes out the seek target recorded by `seek`, if it is still
    /// wanted.
    fn on_seek_flush(&mut self) {}

    /// Asks a callback-capable backend to fetch its config blob.
    /// Returns false when the backend has no config channel.
    fn probe_config(&mut self) -> bool {
        false
    }

    /// Pushes a changed config blob to a callback-capable backend.
    fn push_config(&mut self, _data: String) {}

    fn is_running(&self) -> bool {
        self.state() > ProcessState::NotRunning
    }
}

/// Static description of a registerable backend.
pub struct BackendDescriptor {
    pub name: &'static str,
    pub label: &'static str,
    /// Source kinds this backend can play.
    pub supports: &'static [&'static str],
    pub create: fn(&BackendContext) -> Box<dyn Backend>,
}

/// Ordered set of available backends; registration order is the
/// fallback preference.
#[derive(Default)]
pub struct BackendRegistry {
    descriptors: Vec<BackendDescriptor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: BackendDescriptor) {
        if self.find(descriptor.name).is_some() {
            log::warn!("backend {} registered twice, ignoring", descriptor.name);
            return;
        }
        self.descriptors.push(descriptor);
    }

    pub fn find(&self, name: &str) -> Option<&BackendDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn first_supporting(&self, kind: &str) -> Option<&BackendDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.supports.contains(&kind))
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.descriptors.iter()
    }
}
