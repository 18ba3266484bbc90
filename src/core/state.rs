/// Lifecycle states shared by every backend process.
///
/// The ordering is meaningful: `state > ProcessState::Ready` means the
/// process is busy with an item (buffering or playing), which several
/// callers use to decide whether a stop/park is needed before the next
/// action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcessState {
    NotRunning,
    Ready,
    Buffering,
    Playing,
}

impl ProcessState {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessState::NotRunning => "Not Running",
            ProcessState::Ready => "Ready",
            ProcessState::Buffering => "Buffering",
            ProcessState::Playing => "Playing",
        }
    }
}

/// Tracks the current and previous state of one backend process.
///
/// `set_state` returns the transition to publish when the state actually
/// changed, so callers cannot forget to notify the coordinator.
#[derive(Debug)]
pub struct StateMachine {
    state: ProcessState,
    old_state: ProcessState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ProcessState::NotRunning,
            old_state: ProcessState::NotRunning,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn set_state(
        &mut self,
        new_state: ProcessState,
    ) -> Option<(ProcessState, ProcessState)> {
        if self.state == new_state {
            return None;
        }
        self.old_state = self.state;
        self.state = new_state;
        Some((self.old_state, self.state))
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(ProcessState::NotRunning < ProcessState::Ready);
        assert!(ProcessState::Ready < ProcessState::Buffering);
        assert!(ProcessState::Buffering < ProcessState::Playing);
        assert!(ProcessState::Playing > ProcessState::Ready);
    }

    #[test]
    fn test_transition_reported_once() {
        let mut machine = StateMachine::new();
        assert_eq!(
            machine.set_state(ProcessState::Ready),
            Some((ProcessState::NotRunning, ProcessState::Ready))
        );
        // Setting the same state again is not a transition
        assert_eq!(machine.set_state(ProcessState::Ready), None);
        assert_eq!(
            machine.set_state(ProcessState::Playing),
            Some((ProcessState::Ready, ProcessState::Playing))
        );
        assert_eq!(machine.state(), ProcessState::Playing);
    }
}
