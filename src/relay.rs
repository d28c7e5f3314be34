/// One relay run: prepare the working directory, provision the CLI, run its
/// login flow under the watcher and mail the device prompt while the login
/// process waits for the user.
use crate::config::{RelayConfig, TunnelConfig};
use crate::notify::{Notifier, NotifyError};
use crate::prompt::{DevicePrompt, PatternError, PromptPatterns};
use crate::provision::{ProvisionError, Provisioner};
use crate::transcript::Transcript;
use crate::watcher::{
    CancelReason, LaunchError, LoginWatcher, WatchOptions, WatchOutcome, WatchStatus,
};
use crate::workdir::{WorkDir, WorkdirError};
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;

/// Summary of a successful login.
#[derive(Debug)]
pub struct RelayReport {
    pub prompt: DevicePrompt,
    /// Name of the notifier that delivered the prompt.
    pub delivered_via: String,
    pub exit_code: Option<i32>,
    pub lines: usize,
    pub duration: Duration,
}

/// Every way a relay run can fail. All of them end in a non-zero exit.
#[derive(Debug)]
pub enum RelayError {
    Pattern(PatternError),
    Workdir(WorkdirError),
    Provision(ProvisionError),
    Launch(LaunchError),
    /// Reading the login output failed mid-stream.
    Io(std::io::Error),
    Cancelled(CancelReason),
    /// The login process exited without ever printing a device prompt.
    NoPrompt {
        exit_code: Option<i32>,
        tail: Vec<String>,
    },
    /// The prompt was captured but could not be delivered.
    Notify {
        prompt: DevicePrompt,
        source: NotifyError,
    },
    /// The prompt was delivered but the login process reported failure.
    LoginFailed { exit_code: Option<i32> },
}

fn describe_exit(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_string(),
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Pattern(e) => write!(f, "{e}"),
            RelayError::Workdir(e) => write!(f, "{e}"),
            RelayError::Provision(e) => write!(f, "provisioning failed: {e}"),
            RelayError::Launch(e) => write!(f, "{e}"),
            RelayError::Io(e) => write!(f, "lost the login output stream: {e}"),
            RelayError::Cancelled(reason) => write!(f, "login {reason}"),
            RelayError::NoPrompt { exit_code, tail } => {
                write!(
                    f,
                    "login process ended ({}) before printing a device code",
                    describe_exit(*exit_code)
                )?;
                if !tail.is_empty() {
                    write!(f, "; last output:")?;
                    for line in tail {
                        write!(f, "\n  {line}")?;
                    }
                }
                Ok(())
            }
            RelayError::Notify { prompt, source } => {
                write!(
                    f,
                    "failed to deliver device code {} ({source}); it was passed to the fallback notifier instead",
                    prompt.code
                )
            }
            RelayError::LoginFailed { exit_code } => {
                write!(
                    f,
                    "login process failed after the device code was sent ({})",
                    describe_exit(*exit_code)
                )
            }
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Pattern(e) => Some(e),
            RelayError::Workdir(e) => Some(e),
            RelayError::Provision(e) => Some(e),
            RelayError::Launch(e) => Some(e),
            RelayError::Io(e) => Some(e),
            RelayError::Notify { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Build the login arguments, substituting `{provider}` and `{tunnel_name}`
/// and appending any extra arguments.
pub fn build_args(tunnel: &TunnelConfig) -> Vec<String> {
    tunnel
        .args
        .iter()
        .map(|arg| {
            arg.replace("{provider}", tunnel.provider.as_str())
                .replace("{tunnel_name}", &tunnel.name)
        })
        .chain(tunnel.extra_args.iter().cloned())
        .collect()
}

pub fn prompt_subject(tunnel_name: &str) -> String {
    format!("[{tunnel_name}] Device login code")
}

pub fn prompt_body(tunnel_name: &str, prompt: &DevicePrompt) -> String {
    let mut body = format!("Device code: {}\n", prompt.code);
    if let Some(url) = &prompt.url {
        body.push_str(&format!("Verification URL: {url}\n"));
    }
    body.push_str(&format!(
        "\nOpen the verification page in a browser and enter the code to sign in tunnel \"{tunnel_name}\".\n\
         The code is only valid for a few minutes.\n"
    ));
    body
}

/// Run the whole relay. `cancel` completing (e.g. on Ctrl-C) stops the login.
///
/// `fallback` receives anything `notifier` fails to deliver, and takes over
/// for the rest of the run when the start-up notice fails.
pub async fn run<C>(
    config: &RelayConfig,
    notifier: &dyn Notifier,
    fallback: &dyn Notifier,
    provisioner: &dyn Provisioner,
    cancel: C,
) -> Result<RelayReport, RelayError>
where
    C: Future<Output = ()>,
{
    let patterns = PromptPatterns::compile(&config.patterns).map_err(RelayError::Pattern)?;
    let workdir = WorkDir::prepare(&config.tunnel.working_dir).map_err(RelayError::Workdir)?;
    let tunnel_name = config.tunnel.name.as_str();

    let mut notifier = notifier;
    if config.smtp.notify_on_start {
        let subject = format!("[{tunnel_name}] Relay started");
        let body = format!(
            "Tunnel login relay started for \"{tunnel_name}\" in {}.\n\
             The device code will follow once the login prompt appears.\n",
            workdir.root().display()
        );
        if let Err(e) = notifier.send(&subject, &body).await {
            tracing::error!(
                notifier = notifier.name(),
                error = %e,
                fallback = fallback.name(),
                "start-up notice failed, switching to the fallback notifier"
            );
            notifier = fallback;
        }
    }

    let executable = provisioner
        .ensure(workdir.root())
        .await
        .map_err(RelayError::Provision)?;
    let args = build_args(&config.tunnel);

    let mut watcher = LoginWatcher::new(patterns, WatchOptions::from(&config.watch));
    let transcript_path = config.transcript_path(workdir.root());
    match Transcript::open(&transcript_path, config.watch.log_append) {
        Ok(transcript) => {
            tracing::info!(path = %transcript.path().display(), "writing login transcript");
            watcher = watcher.with_transcript(transcript);
        }
        Err(e) => {
            tracing::warn!(path = %transcript_path.display(), error = %e, "transcript disabled");
        }
    }

    let mut session = watcher
        .start(&executable, &args, workdir.root())
        .map_err(RelayError::Launch)?;
    tracing::debug!(
        pid = session.pid(),
        executable = %session.executable().display(),
        args = ?session.args(),
        cwd = %session.working_dir().display(),
        started_at = %session.started_at(),
        "login session running"
    );

    let (tx, rx) = oneshot::channel::<DevicePrompt>();
    let watch = watcher.watch(
        &mut session,
        move |prompt| {
            let _ = tx.send(prompt);
        },
        cancel,
    );
    let deliver = async {
        let prompt = rx.await.ok()?;
        let result = deliver_prompt(notifier, fallback, tunnel_name, &prompt).await;
        Some((prompt, result))
    };
    let (outcome, delivery) = tokio::join!(watch, deliver);
    tracing::debug!(state = ?session.state(), "login session ended");

    if let Some((prompt, Err(source))) = delivery {
        return Err(RelayError::Notify { prompt, source });
    }

    if outcome.prompt.is_none() && config.smtp.send_output_on_miss {
        send_output_report(notifier, fallback, tunnel_name, &outcome).await;
    }

    match outcome.status {
        WatchStatus::IoError {
            source,
            termination,
        } => {
            tracing::warn!(?termination, "login process stopped after output read failure");
            Err(RelayError::Io(source))
        }
        WatchStatus::Cancelled {
            reason,
            termination,
        } => {
            tracing::warn!(%reason, ?termination, "login process stopped");
            Err(RelayError::Cancelled(reason))
        }
        WatchStatus::Exited { exit_code } => {
            let Some(prompt) = outcome.prompt else {
                return Err(RelayError::NoPrompt {
                    exit_code,
                    tail: outcome.tail,
                });
            };
            if exit_code != Some(0) {
                return Err(RelayError::LoginFailed { exit_code });
            }
            tracing::info!(duration_secs = outcome.duration.as_secs(), "tunnel login completed");
            Ok(RelayReport {
                prompt,
                delivered_via: notifier.name().to_string(),
                exit_code,
                lines: outcome.lines,
                duration: outcome.duration,
            })
        }
    }
}

pub fn output_report_subject(tunnel_name: &str) -> String {
    format!("[{tunnel_name}] Login output (no device code found)")
}

/// Body for a session that ended without a recognised prompt: how it ended
/// and the last lines it printed, so the code can be read by eye when the
/// CLI's wording no longer matches the patterns.
pub fn output_report_body(outcome: &WatchOutcome) -> String {
    let ending = match &outcome.status {
        WatchStatus::Exited { exit_code } => describe_exit(*exit_code),
        WatchStatus::Cancelled { reason, .. } => reason.to_string(),
        WatchStatus::IoError { source, .. } => format!("output read failed: {source}"),
    };
    let mut body = format!(
        "No device code was recognised in the login output ({ending}).\n\
         Last {} of {} lines:\n\n",
        outcome.tail.len(),
        outcome.lines
    );
    if outcome.tail.is_empty() {
        body.push_str("(no output)\n");
    }
    for line in &outcome.tail {
        body.push_str(line);
        body.push('\n');
    }
    body
}

/// Mail the output tail once. Failures are logged and never change the
/// outcome of the run.
async fn send_output_report(
    notifier: &dyn Notifier,
    fallback: &dyn Notifier,
    tunnel_name: &str,
    outcome: &WatchOutcome,
) {
    let subject = output_report_subject(tunnel_name);
    let body = output_report_body(outcome);
    match send_with_fallback(notifier, fallback, &subject, &body).await {
        Ok(()) => tracing::info!(notifier = notifier.name(), "login output report sent"),
        Err(e) => tracing::error!(error = %e, "failed to send login output report"),
    }
}

/// Send the prompt once. On failure hand it to `fallback` so the code is not lost.
async fn deliver_prompt(
    notifier: &dyn Notifier,
    fallback: &dyn Notifier,
    tunnel_name: &str,
    prompt: &DevicePrompt,
) -> Result<(), NotifyError> {
    let subject = prompt_subject(tunnel_name);
    let body = prompt_body(tunnel_name, prompt);

    let result = send_with_fallback(notifier, fallback, &subject, &body).await;
    match &result {
        Ok(()) => tracing::info!(notifier = notifier.name(), "device code delivered"),
        Err(e) => tracing::error!(code = %prompt.code, error = %e, "failed to deliver device code"),
    }
    result
}

/// One attempt through `notifier`; on failure the same message goes to
/// `fallback`. The primary error is returned either way.
async fn send_with_fallback(
    notifier: &dyn Notifier,
    fallback: &dyn Notifier,
    subject: &str,
    body: &str,
) -> Result<(), NotifyError> {
    let result = notifier.send(subject, body).await;
    if let Err(e) = &result {
        tracing::warn!(notifier = notifier.name(), error = %e, subject, "delivery failed");
        // Already the fallback after a failed start-up notice
        if std::ptr::addr_eq(notifier, fallback) {
            return result;
        }
        if let Err(e) = fallback.send(subject, body).await {
            tracing::error!(
                fallback = fallback.name(),
                error = %e,
                subject,
                "fallback delivery failed too"
            );
        }
    }
    result
}
