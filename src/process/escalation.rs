use std::time::Duration;

use crate::core::settings::EscalationPolicy;

/// Minimal view of a child process the shutdown ladder needs. The real
/// implementation signals a pid; tests script one.
pub trait ProcessControl: Send + Sync {
    fn is_alive(&self) -> bool;
    fn terminate(&self);
    fn force_kill(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// The process went away during the polite grace period.
    ExitedGracefully,
    /// SIGTERM did it.
    Terminated,
    /// SIGKILL did it.
    Killed,
    /// Still alive after the last stage. The caller reports and moves on.
    GaveUp,
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

async fn wait_for_exit(ctl: &dyn ProcessControl, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if !ctl.is_alive() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL.min(limit)).await;
    }
}

/// Runs the staged shutdown: wait out the polite quit (when one was
/// sent), then SIGTERM, wait, then SIGKILL, wait. Each stage is skipped
/// as soon as the process is gone.
pub async fn escalate(
    policy: &EscalationPolicy,
    ctl: &dyn ProcessControl,
    polite_sent: bool,
) -> EscalationOutcome {
    if !ctl.is_alive() {
        return EscalationOutcome::ExitedGracefully;
    }
    if polite_sent && wait_for_exit(ctl, policy.quit_grace()).await {
        return EscalationOutcome::ExitedGracefully;
    }

    log::debug!("process still alive, sending SIGTERM");
    ctl.terminate();
    if wait_for_exit(ctl, policy.term_wait()).await {
        return EscalationOutcome::Terminated;
    }

    log::warn!("process ignored SIGTERM, sending SIGKILL");
    ctl.force_kill();
    if wait_for_exit(ctl, policy.kill_wait()).await {
        return EscalationOutcome::Killed;
    }

    log::error!("failed to end player process");
    EscalationOutcome::GaveUp
}
