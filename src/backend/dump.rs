use crate::backend::{Backend, BackendContext};
use crate::coordinator::events::{EngineEvent, Notification, ProcessEvent};
use crate::core::error::PlayerError;
use crate::core::source::SharedSource;
use crate::core::state::{ProcessState, StateMachine};
use crate::process::escalation::{escalate, EscalationOutcome};
use crate::process::handle::ChildProcessHandle;

pub const NAME: &str = "mplayerdumpstream";

/// Records the bound source to a file by running the player in dump
/// mode. No playback control exists: the process runs until the stream
/// ends or it is stopped.
pub struct DumpBackend {
    ctx: BackendContext,
    source: Option<SharedSource>,
    machine: StateMachine,
    handle: Option<ChildProcessHandle>,
    quitting: bool,
}

impl DumpBackend {
    pub fn create(ctx: &BackendContext) -> Box<dyn Backend> {
        Box::new(Self {
            ctx: ctx.clone(),
            source: None,
            machine: StateMachine::new(),
            handle: None,
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

    fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let Some(source) = &self.source else {
            return args;
        };
        let Ok(source) = source.lock() else {
            return args;
        };
        args.extend(
            source
                .record_options()
                .split_whitespace()
                .map(str::to_string),
        );
        args.push("-dumpstream".to_string());
        args.push("-dumpfile".to_string());
        let target = source
            .record_file
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dump.stream".to_string());
        args.push(target);
        args.push(source.url());
        args
    }

    fn start_escalation(&self) {
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
            // Dump mode reads no commands, so the ladder starts with
            // SIGTERM right away.
            if escalate(&policy, &ctl, false).await == EscalationOutcome::GaveUp {
                let _ = events.send(EngineEvent::ShutdownGaveUp { backend: NAME });
            }
        });
    }
}

impl Backend for DumpBackend {
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
        self.set_state(ProcessState::Ready);
        Ok(())
    }

    fn play(&mut self) -> Result<(), PlayerError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let args = self.build_args();
        let program = self
            .ctx
            .settings
            .lock()
            .map(|s| s.player_program())
            .unwrap_or_else(|_| "mplayer".to_string());
        let handle =
            ChildProcessHandle::spawn(NAME, &program, &args, self.ctx.events.clone())?;
        self.handle = Some(handle);
        self.quitting = false;
        self.set_state(ProcessState::Playing);
        Ok(())
    }

    fn stop(&mut self) {
        if self.handle.is_none() || self.quitting {
            return;
        }
        self.quitting = true;
        self.start_escalation();
    }

    fn quit(&mut self) {
        if self.handle.is_none() {
            self.set_state(ProcessState::NotRunning);
            return;
        }
        self.stop();
    }

    fn pause(&mut self) {}

    fn unpause(&mut self) {}

    fn seek(&mut self, _position: u64, _absolute: bool) -> bool {
        false
    }

    fn volume(&mut self, _value: i32, _absolute: bool) -> bool {
        false
    }

    fn saturation(&mut self, _value: i32, _absolute: bool) -> bool {
        false
    }

    fn hue(&mut self, _value: i32, _absolute: bool) -> bool {
        false
    }

    fn contrast(&mut self, _value: i32, _absolute: bool) -> bool {
        false
    }

    fn brightness(&mut self, _value: i32, _absolute: bool) -> bool {
        false
    }

    fn on_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) => {
                self.ctx.notify(Notification::Console(line));
            }
            ProcessEvent::WroteLine => {}
            ProcessEvent::Exited(_) => {
                self.handle = None;
                if self.quitting {
                    self.quitting = false;
                    self.set_state(ProcessState::NotRunning);
                } else {
                    self.set_state(ProcessState::Ready);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::core::settings::Settings;
    use crate::core::source::{Source, KIND_URL};

    #[test]
    fn test_record_args_use_record_options_and_target() {
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (notify, _notify_rx) = mpsc::unbounded_channel();
        let ctx = BackendContext {
            events,
            notify,
            settings: Settings::default().shared(),
        };
        let dir = tempfile::tempdir().expect("temp dir");
        let target = dir.path().join("live.dump");
        let mut source = Source::new(KIND_URL, "mms://host/live");
        source.set_record_options("-v");
        source.record_file = Some(target.clone());
        let backend = DumpBackend {
            ctx,
            source: Some(source.shared()),
            machine: StateMachine::new(),
            handle: None,
            quitting: false,
        };
        assert_eq!(
            backend.build_args(),
            vec![
                "-v".to_string(),
                "-dumpstream".to_string(),
                "-dumpfile".to_string(),
                target.to_string_lossy().into_owned(),
                "mms://host/live".to_string()
            ]
        );
    }
}
