use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::core::error::PlayerError;
use crate::coordinator::events::{EngineEvent, ProcessEvent};
use crate::process::escalation::ProcessControl;

/// A spawned player child with its I/O pump tasks. The tasks never touch
/// backend state; everything they observe is posted as [`EngineEvent`]s
/// so the owning backend reacts on the coordinator task.
pub struct ChildProcessHandle {
    pid: u32,
    stdin_tx: mpsc::UnboundedSender<String>,
    alive: Arc<AtomicBool>,
}

impl ChildProcessHandle {
    /// Spawns `program` with `args`, wiring stdin/stdout/stderr pumps
    /// that report to `events` under the `backend` tag.
    pub fn spawn(
        backend: &'static str,
        program: &str,
        args: &[String],
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Self, PlayerError> {
        log::info!("spawning {} {}", program, args.join(" "));
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Children must not re-register with the session manager.
            .env("SESSION_MANAGER", "")
            .spawn()
            .map_err(|e| PlayerError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        let pid = child.id().ok_or_else(|| PlayerError::Spawn {
            program: program.to_string(),
            reason: "process exited before a pid was assigned".to_string(),
        })?;

        let alive = Arc::new(AtomicBool::new(true));

        let stdin = child.stdin.take().ok_or_else(|| PlayerError::Spawn {
            program: program.to_string(),
            reason: "stdin pipe missing".to_string(),
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_pump(backend, stdin, stdin_rx, events.clone()));
        if let Some(out) = stdout {
            tokio::spawn(reader_pump(backend, out, events.clone(), false));
        }
        if let Some(err) = stderr {
            tokio::spawn(reader_pump(backend, err, events.clone(), true));
        }

        let alive_flag = alive.clone();
        let exit_events = events;
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    log::warn!("waiting on child failed: {}", e);
                    None
                }
            };
            alive_flag.store(false, Ordering::SeqCst);
            let _ = exit_events.send(EngineEvent::Process {
                backend,
                event: ProcessEvent::Exited(code),
            });
        });

        Ok(Self {
            pid,
            stdin_tx,
            alive,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Hands `line` to the writer pump. `WroteLine` arrives once it has
    /// been flushed.
    pub fn write_line(&self, line: String) -> Result<(), PlayerError> {
        self.stdin_tx
            .send(line)
            .map_err(|_| PlayerError::Connection("player stdin closed".to_string()))
    }

    /// Cheap signal-based control for the shutdown ladder, usable from a
    /// spawned task after the handle itself is gone.
    pub fn control(&self) -> PidControl {
        PidControl {
            pid: self.pid,
            alive: self.alive.clone(),
        }
    }
}

/// Signals a child by pid; aliveness comes from the wait task's flag
/// rather than from the kernel.
#[derive(Clone)]
pub struct PidControl {
    pid: u32,
    alive: Arc<AtomicBool>,
}

impl ProcessControl for PidControl {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    #[cfg(unix)]
    fn terminate(&self) {
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
        }
    }

    #[cfg(unix)]
    fn force_kill(&self) {
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {
        log::warn!("terminate is only implemented for unix targets");
    }

    #[cfg(not(unix))]
    fn force_kill(&self) {
        log::warn!("force_kill is only implemented for unix targets");
    }
}

async fn writer_pump(
    backend: &'static str,
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            log::debug!("write to player stdin failed: {}", e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            log::debug!("flush to player stdin failed: {}", e);
            break;
        }
        if events
            .send(EngineEvent::Process {
                backend,
                event: ProcessEvent::WroteLine,
            })
            .is_err()
        {
            break;
        }
    }
}

/// Reads raw chunks and emits one event per line. Players redraw status
/// lines with bare carriage returns, so '\r' terminates a line too.
async fn reader_pump<R: tokio::io::AsyncRead + Unpin>(
    backend: &'static str,
    mut reader: R,
    events: mpsc::UnboundedSender<EngineEvent>,
    is_stderr: bool,
) {
    let mut buf = [0u8; 4096];
    let mut partial = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !partial.is_empty() {
                    let line = String::from_utf8_lossy(&partial).into_owned();
                    partial.clear();
                    let event = if is_stderr {
                        ProcessEvent::Stderr(line)
                    } else {
                        ProcessEvent::Stdout(line)
                    };
                    if events.send(EngineEvent::Process { backend, event }).is_err() {
                        return;
                    }
                }
            } else {
                partial.push(byte);
            }
        }
    }
    if !partial.is_empty() {
        let line = String::from_utf8_lossy(&partial).into_owned();
        let event = if is_stderr {
            ProcessEvent::Stderr(line)
        } else {
            ProcessEvent::Stdout(line)
        };
        let _ = events.send(EngineEvent::Process { backend, event });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_pump_splits_on_cr_and_lf() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let data: &[u8] = b"A: 1.0\rA: 1.1\rStarting playback...\nID_LENGTH=42.0\n";
        reader_pump("mplayer", data, tx, false).await;

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Process {
                event: ProcessEvent::Stdout(line),
                ..
            } = event
            {
                lines.push(line);
            }
        }
        assert_eq!(
            lines,
            vec!["A: 1.0", "A: 1.1", "Starting playback...", "ID_LENGTH=42.0"]
        );
    }

    #[tokio::test]
    async fn test_reader_pump_flushes_trailing_partial_line() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let data: &[u8] = b"no newline at end";
        reader_pump("mplayer", data, tx, true).await;

        match rx.try_recv() {
            Ok(EngineEvent::Process {
                event: ProcessEvent::Stderr(line),
                ..
            }) => assert_eq!(line, "no newline at end"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
