/// Out-of-band delivery of the device prompt.
///
/// `SmtpNotifier` mails it through an authenticated SMTP relay;
/// `ConsoleNotifier` prints it to stdout for `--print-only` runs and as the
/// fallback when mail delivery fails.
use crate::config::SmtpConfig;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::io::Write;
use std::time::Duration;

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors produced while building or delivering a notification.
#[derive(Debug)]
pub enum NotifyError {
    /// An address in the configuration could not be parsed.
    Address {
        address: String,
        source: lettre::address::AddressError,
    },
    /// The message could not be assembled.
    Build(lettre::error::Error),
    /// The SMTP exchange failed (connect, TLS, auth or send).
    Smtp(lettre::transport::smtp::Error),
    /// Writing to the local console failed.
    Io(std::io::Error),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Address { address, source } => {
                write!(f, "invalid email address {address:?}: {source}")
            }
            NotifyError::Build(e) => write!(f, "failed to build email: {e}"),
            NotifyError::Smtp(e) => write!(f, "SMTP delivery failed: {e}"),
            NotifyError::Io(e) => write!(f, "failed to write notification: {e}"),
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifyError::Address { source, .. } => Some(source),
            NotifyError::Build(e) => Some(e),
            NotifyError::Smtp(e) => Some(e),
            NotifyError::Io(e) => Some(e),
        }
    }
}

/// Delivers a subject and plain-text body to a human.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short name for logs (e.g. "smtp", "console").
    fn name(&self) -> &str;

    /// Deliver one message. A single attempt; callers decide what to do on failure.
    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// A password that never shows up in Debug output or logs.
#[derive(Clone, Default)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Read the secret from an environment variable; unset means empty.
    pub fn from_env(var: &str) -> Self {
        Self::new(std::env::var(var).unwrap_or_default())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[redacted]")
    }
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    /// TLS from the first byte (SMTPS, usually port 465).
    ImplicitTls,
    /// Plain connection upgraded with STARTTLS (usually port 587).
    StartTls,
    /// No encryption.
    Plaintext,
}

impl TransportSecurity {
    pub fn from_config(config: &SmtpConfig) -> Self {
        if config.use_ssl {
            TransportSecurity::ImplicitTls
        } else if config.starttls {
            TransportSecurity::StartTls
        } else {
            TransportSecurity::Plaintext
        }
    }
}

/// Sends mail through an authenticated SMTP relay.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
    subject_prefix: String,
}

impl SmtpNotifier {
    /// Build the notifier. `from_addr` falls back to `username` when empty.
    pub fn new(config: &SmtpConfig, password: Secret) -> Result<Self, NotifyError> {
        let from_addr = if config.from_addr.is_empty() {
            &config.username
        } else {
            &config.from_addr
        };
        let from = parse_mailbox(from_addr)?;
        let to = config
            .to_addrs
            .iter()
            .map(|a| parse_mailbox(a))
            .collect::<Result<Vec<_>, _>>()?;

        if password.is_empty() {
            tracing::warn!(
                env = %config.password_env,
                "SMTP password is empty; authentication will likely fail"
            );
        }

        let security = TransportSecurity::from_config(config);
        let builder = match security {
            TransportSecurity::ImplicitTls => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host).map_err(NotifyError::Smtp)?
            }
            TransportSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                    .map_err(NotifyError::Smtp)?
            }
            TransportSecurity::Plaintext => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            }
        };
        let transport = builder
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                password.expose().to_string(),
            ))
            .timeout(Some(SMTP_TIMEOUT))
            .build();

        tracing::debug!(
            host = %config.host,
            port = config.port,
            security = ?security,
            recipients = to.len(),
            "SMTP notifier configured"
        );

        Ok(Self {
            transport,
            from,
            to,
            subject_prefix: config.subject_prefix.clone(),
        })
    }

    fn build_message(&self, subject: &str, body: &str) -> Result<Message, NotifyError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(format!("{}{}", self.subject_prefix, subject))
            .header(ContentType::TEXT_PLAIN);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        builder.body(body.to_string()).map_err(NotifyError::Build)
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        let message = self.build_message(subject, body)?;
        self.transport
            .send(message)
            .await
            .map_err(NotifyError::Smtp)?;
        tracing::info!(subject, recipients = self.to.len(), "email sent");
        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address.parse().map_err(|e| NotifyError::Address {
        address: address.to_string(),
        source: e,
    })
}

/// Prints notifications to stdout.
pub struct ConsoleNotifier {
    subject_prefix: String,
}

impl ConsoleNotifier {
    pub fn new(subject_prefix: impl Into<String>) -> Self {
        Self {
            subject_prefix: subject_prefix.into(),
        }
    }

    /// Render a notification the way it is printed.
    pub fn render(&self, subject: &str, body: &str) -> String {
        format!(
            "==== {}{} ====\n{}\n====\n",
            self.subject_prefix, subject, body
        )
    }
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        let text = self.render(subject, body);
        let mut out = std::io::stdout().lock();
        out.write_all(text.as_bytes()).map_err(NotifyError::Io)?;
        out.flush().map_err(NotifyError::Io)
    }
}
