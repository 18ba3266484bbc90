use std::collections::VecDeque;
use std::time::Duration;

/// One pending control entry for a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Synthetic entry asking the owner to establish the connection (or
    /// spawn the process) before any real command can be written.
    Connect,
    Line(String),
}

/// What the owner has to do right now as the result of a queue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueAction {
    None,
    /// Start connecting; the synthetic connect stays in flight until
    /// `on_connected` or `on_connect_failed`.
    Connect,
    /// Write this line to the backend's control channel.
    Write(String),
}

/// FIFO of pending commands for backends that accept one command at a
/// time. At most one entry is "in flight" (handed to the transport but
/// not yet acknowledged); the rest wait in order.
#[derive(Debug)]
pub struct CommandQueue {
    pending: VecDeque<Command>,
    in_flight: Option<Command>,
    connected: bool,
    watchdog: Option<Duration>,
}

/// Callers are expected to throttle; bursts beyond this only log.
const SOFT_CAP: usize = 10;

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            connected: false,
            watchdog: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn in_flight(&self) -> Option<&Command> {
        self.in_flight.as_ref()
    }

    /// Queued entries, not counting the in-flight one.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }

    /// Appends `line` to the tail. If nothing is in flight it is handed
    /// out for writing immediately; if the backend is not connected yet,
    /// a synthetic connect is put in flight ahead of it.
    pub fn enqueue(&mut self, line: impl Into<String>) -> QueueAction {
        let line = line.into();
        if self.pending.len() >= SOFT_CAP {
            log::warn!(
                "command queue at {} pending entries, caller should throttle",
                self.pending.len()
            );
        }
        if !self.connected {
            self.pending.push_back(Command::Line(line));
            if self.in_flight.is_none() {
                self.in_flight = Some(Command::Connect);
                return QueueAction::Connect;
            }
            return QueueAction::None;
        }
        if self.in_flight.is_none() {
            self.in_flight = Some(Command::Line(line.clone()));
            return QueueAction::Write(line);
        }
        self.pending.push_back(Command::Line(line));
        QueueAction::None
    }

    /// `enqueue` plus (re)arming the watchdog used for rapid repeatable
    /// actions. The caller reads [`CommandQueue::watchdog`] to schedule
    /// the timer.
    pub fn enqueue_with_timeout(
        &mut self,
        line: impl Into<String>,
        timeout: Duration,
    ) -> QueueAction {
        self.watchdog = Some(timeout);
        self.enqueue(line)
    }

    /// Duration the watchdog should be (re)armed with, if any.
    pub fn watchdog(&self) -> Option<Duration> {
        self.watchdog
    }

    /// The transport confirmed the in-flight line was fully delivered.
    pub fn on_write_complete(&mut self) -> QueueAction {
        self.in_flight = None;
        self.pop_next()
    }

    /// The connection the synthetic connect asked for is up.
    pub fn on_connected(&mut self) -> QueueAction {
        self.connected = true;
        if matches!(self.in_flight, Some(Command::Connect)) {
            self.in_flight = None;
        }
        if self.in_flight.is_some() {
            return QueueAction::None;
        }
        self.pop_next()
    }

    /// Connecting failed; unacknowledged commands are discarded.
    pub fn on_connect_failed(&mut self) {
        self.clear();
    }

    /// Process exit silently discards everything, including the
    /// in-flight command and the watchdog.
    pub fn on_process_exit(&mut self) {
        self.clear();
    }

    /// Watchdog fired: drop queued repeats, keep the in-flight command.
    pub fn on_watchdog_fired(&mut self) {
        if !self.pending.is_empty() {
            log::debug!(
                "command watchdog fired, dropping {} queued commands",
                self.pending.len()
            );
            self.pending.clear();
        }
        self.watchdog = None;
    }

    /// Removes the first queued (not in-flight) line starting with
    /// `prefix`. Returns whether one was removed. Used for seek
    /// coalescing.
    pub fn remove_queued(&mut self, prefix: &str) -> bool {
        if let Some(idx) = self.pending.iter().position(
            |c| matches!(c, Command::Line(l) if l.starts_with(prefix)),
        ) {
            self.pending.remove(idx);
            return true;
        }
        false
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.in_flight = None;
        self.connected = false;
        self.watchdog = None;
    }

    fn pop_next(&mut self) -> QueueAction {
        match self.pending.pop_front() {
            Some(Command::Line(line)) => {
                self.in_flight = Some(Command::Line(line.clone()));
                QueueAction::Write(line)
            }
            Some(Command::Connect) => {
                self.in_flight = Some(Command::Connect);
                QueueAction::Connect
            }
            None => QueueAction::None,
        }
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
