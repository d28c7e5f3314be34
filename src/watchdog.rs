/// Termination of the login process group.
///
/// The login process is spawned as the leader of its own process group,
/// so SIGTERM/SIGKILL reach anything it forked. SIGTERM goes first; if the
/// group leader is still alive after the grace period the whole group gets
/// SIGKILL.
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::process::Child;

/// How a termination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited before any signal was sent.
    AlreadyExited { exit_code: Option<i32> },
    /// The process exited within the grace period after SIGTERM.
    Graceful { exit_code: Option<i32> },
    /// The grace period elapsed and the group was sent SIGKILL.
    Killed,
}

/// Send SIGTERM to the process group, wait up to `grace`, then SIGKILL.
pub async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> Termination {
    if let Ok(Some(status)) = child.try_wait() {
        return Termination::AlreadyExited {
            exit_code: status.code(),
        };
    }

    let pgid = Pid::from_raw(pid as i32);
    tracing::info!(pid, grace_secs = grace.as_secs_f64(), "sending SIGTERM to login process group");
    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "SIGTERM to process group failed");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Termination::Graceful {
            exit_code: status.code(),
        },
        Ok(Err(e)) => {
            tracing::warn!(pid, error = %e, "failed to wait for login process, killing");
            kill_group(child, pgid).await;
            Termination::Killed
        }
        Err(_) => {
            tracing::warn!(pid, "login process ignored SIGTERM, sending SIGKILL");
            kill_group(child, pgid).await;
            Termination::Killed
        }
    }
}

async fn kill_group(child: &mut Child, pgid: Pid) {
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        tracing::debug!(error = %e, "SIGKILL to process group failed");
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "kill of group leader failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Instant;
    use tokio::process::Command;

    fn spawn_sh(script: &str) -> (Child, u32) {
        let child = Command::new("sh")
            .args(["-c", script])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        (child, pid)
    }

    #[tokio::test]
    async fn test_graceful_termination() {
        let (mut child, pid) = spawn_sh("sleep 30");
        let outcome = terminate(&mut child, pid, Duration::from_secs(5)).await;
        // Killed by SIGTERM: no exit code
        assert_eq!(outcome, Termination::Graceful { exit_code: None });
    }

    #[tokio::test]
    async fn test_escalates_to_sigkill_when_sigterm_ignored() {
        let (mut child, pid) = spawn_sh("trap '' TERM; sleep 30");
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = Instant::now();
        let outcome = terminate(&mut child, pid, Duration::from_millis(300)).await;
        assert_eq!(outcome, Termination::Killed);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_already_exited_process() {
        let (mut child, pid) = spawn_sh("exit 3");
        child.wait().await.unwrap();
        let outcome = terminate(&mut child, pid, Duration::from_secs(1)).await;
        assert_eq!(outcome, Termination::AlreadyExited { exit_code: Some(3) });
    }
}
